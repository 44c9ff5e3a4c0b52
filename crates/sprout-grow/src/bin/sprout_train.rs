//! Growth training CLI for Sprout.
//!
//! Trains a growable MLP on a JSON dataset, adding neurons and layers where
//! the curvature says they pay off.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release -p sprout-grow --bin sprout-train -- \
//!   --config experiments/moons.json \
//!   --data data/moons.json \
//!   --metrics runs/moons.jsonl
//! ```
//!
//! The config format is documented in `sprout_grow::config`; the dataset
//! format in `sprout_grow::data`.

use std::path::PathBuf;
use std::time::Instant;

use sprout_core::{MetricsSink, RecordingSink, TracingSink};
use sprout_grow::{architecture_report, Dataset, ExperimentConfig, Trainer};

/// Records every scalar and also forwards it to `tracing`.
#[derive(Default)]
struct TeeSink {
    recording: RecordingSink,
    tracing: TracingSink,
}

impl MetricsSink for TeeSink {
    fn scalar(&mut self, name: &str, value: f64) {
        self.recording.scalar(name, value);
        self.tracing.scalar(name, value);
    }

    fn set_step(&mut self, step: u64) {
        self.recording.set_step(step);
        self.tracing.set_step(step);
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let cli = parse_args(&args);

    let config = ExperimentConfig::from_file(&cli.config).unwrap_or_else(|e| {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    });
    let dataset = Dataset::from_file(&cli.data).unwrap_or_else(|e| {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    });

    eprintln!("=== Sprout Growth Training ===");
    eprintln!("Run:        {}", config.meta.name);
    eprintln!("Task:       {}", config.task.kind.label());
    eprintln!("Data:       {}", cli.data.display());
    eprintln!("Train/test: {}/{}", dataset.train.len(), dataset.test.len());
    eprintln!("Epochs:     {}", config.opt.max_epochs);
    eprintln!("LR:         {}", config.opt.lr);
    eprintln!();

    let mut trainer = Trainer::new(config, dataset).unwrap_or_else(|e| {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    });

    eprintln!("Initial architecture:");
    eprintln!("{}", architecture_report(trainer.solver().template()));
    eprintln!();

    let mut sink = TeeSink::default();
    let start = Instant::now();
    let summary = match trainer.run(&mut sink) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("ERROR: training failed: {e}");
            write_metrics(&cli, &sink.recording);
            std::process::exit(1);
        }
    };

    let elapsed = start.elapsed().as_secs_f32();
    eprintln!("=== Training Complete ===");
    eprintln!("Epochs:     {}", summary.epochs_run);
    eprintln!("Train loss: {:.6}", summary.final_train_loss);
    eprintln!("Test loss:  {:.6}", summary.final_test_loss);
    eprintln!("Time:       {elapsed:.1}s");
    eprintln!();

    if !summary.events.is_empty() {
        eprintln!("Growth History:");
        for ev in &summary.events {
            eprintln!(
                "  Epoch {:4}: {} at site {}  ratio={:.4}  loss {:.4} -> {:.4}{}",
                ev.epoch,
                ev.kind,
                ev.site,
                ev.ratio,
                ev.loss_before,
                ev.loss_after,
                if ev.rolled_back { "  (rolled back)" } else { "" }
            );
        }
        eprintln!();
    }

    eprintln!("Final architecture:");
    eprintln!("{}", architecture_report(trainer.solver().template()));
    let delta = summary.final_params as i64 - summary.initial_params as i64;
    eprintln!(
        "Parameters: {} -> {} ({delta:+}, {:+.1}%)",
        summary.initial_params,
        summary.final_params,
        100.0 * delta as f64 / summary.initial_params.max(1) as f64
    );

    write_metrics(&cli, &sink.recording);
}

fn write_metrics(cli: &CliConfig, recording: &RecordingSink) {
    let Some(path) = &cli.metrics else {
        return;
    };
    if let Some(dir) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("ERROR: cannot create {}: {e}", dir.display());
            std::process::exit(1);
        }
    }
    let lines = match recording.to_json_lines() {
        Ok(lines) => lines,
        Err(e) => {
            eprintln!("ERROR: cannot serialise metrics: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = std::fs::write(path, lines) {
        eprintln!("ERROR: cannot write metrics to {}: {e}", path.display());
        std::process::exit(1);
    }
    eprintln!("Metrics written to {}", path.display());
}

struct CliConfig {
    config: PathBuf,
    data: PathBuf,
    metrics: Option<PathBuf>,
}

fn parse_args(args: &[String]) -> CliConfig {
    let mut config = CliConfig {
        config: PathBuf::from("experiment.json"),
        data: PathBuf::from("data.json"),
        metrics: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "--data" | "--metrics" if i + 1 >= args.len() => {
                eprintln!("ERROR: {} needs a value", args[i]);
                std::process::exit(1);
            }
            "--config" => {
                i += 1;
                config.config = PathBuf::from(&args[i]);
            }
            "--data" => {
                i += 1;
                config.data = PathBuf::from(&args[i]);
            }
            "--metrics" => {
                i += 1;
                config.metrics = Some(PathBuf::from(&args[i]));
            }
            "--help" | "-h" => {
                eprintln!("Usage: sprout-train [options]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --config PATH      Experiment config (default: experiment.json)");
                eprintln!("  --data PATH        Dataset file (default: data.json)");
                eprintln!("  --metrics PATH     Write metrics as JSON lines");
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!("Use --help for usage information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}
