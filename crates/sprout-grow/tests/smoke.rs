//! End-to-end: a short classification run that grows, checkpoints and
//! resumes.

use sprout_core::{NullSink, RecordingSink};
use sprout_grow::config::{CheckpointConfig, MetaConfig, NetConfig, OptConfig, TaskConfig};
use sprout_grow::proposer::verify_state;
use sprout_grow::{Batch, Dataset, ExperimentConfig, GrowthConfig, TaskKind, TrainState, Trainer};
use sprout_net::{Labels, Mat};

fn rings(n: usize, phase: f64) -> Batch {
    let inputs = Mat::from_fn(n, 2, |i, j| {
        let radius = if i % 2 == 0 { 0.5 } else { 1.5 };
        let angle = i as f64 * 0.7 + phase;
        if j == 0 {
            radius * angle.cos()
        } else {
            radius * angle.sin()
        }
    });
    Batch::new(inputs, Labels::Classes((0..n).map(|i| i % 2).collect())).unwrap()
}

fn dataset() -> Dataset {
    Dataset {
        train: rings(40, 0.0),
        test: rings(10, 0.3),
    }
}

fn config(dir: &std::path::Path, max_epochs: usize, restore: bool) -> ExperimentConfig {
    ExperimentConfig {
        meta: MetaConfig {
            name: "rings".to_string(),
            seed: 4,
            propseed: 9,
        },
        task: TaskConfig {
            kind: TaskKind::Classification,
        },
        net: NetConfig {
            capacities: vec![4, 4],
            contents: vec![Some(2), None],
        },
        opt: OptConfig {
            lr: 0.05,
            batch_size: Some(10),
            max_epochs,
            weight_decay: 0.0,
        },
        evo: GrowthConfig {
            cooldown: 2,
            thresh: -1.0,
            abs_thresh: -1.0,
            layer_abs_thresh: -1.0,
            proposals_per_site: 3,
            layer_proposals_per_site: 3,
            steps: 3,
            mala_steps_per_burst: 3,
            depth_tolerance: 10.0,
            width_tolerance: 10.0,
            ..GrowthConfig::default()
        },
        checkpointing: CheckpointConfig {
            enable: true,
            restore,
            directory: dir.to_path_buf(),
            cooldown: 2,
        },
    }
}

#[test]
fn run_grows_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = Trainer::new(config(dir.path(), 6, false), dataset()).unwrap();
    let mut sink = RecordingSink::default();

    let summary = trainer.run(&mut sink).unwrap();

    assert_eq!(summary.epochs_run, 6);
    assert_eq!(summary.initial_contents, vec![Some(2), None, Some(2)]);
    assert!(!summary.events.is_empty());
    assert!(summary.final_params > summary.initial_params);
    assert_eq!(summary.final_contents.last(), Some(&Some(2)));
    assert!(summary.final_train_loss.is_finite());
    assert!(summary.final_test_loss.is_finite());
    verify_state(trainer.solver().template(), trainer.solver().network()).unwrap();

    assert!(sink.count("validation_loss") == 6);
    assert!(sink.count("validation_accuracy") == 6);
    assert!(sink.count("training_accuracy") == 6);
    assert!(sink.get("features").is_some());

    let path = dir.path().join("rings.json");
    let state = TrainState::load(&path).unwrap();
    assert_eq!(state.epoch, 5);
}

#[test]
fn restore_resumes_from_saved_epoch() {
    let dir = tempfile::tempdir().unwrap();
    Trainer::new(config(dir.path(), 6, false), dataset())
        .unwrap()
        .run(&mut NullSink)
        .unwrap();
    let saved = TrainState::load(&dir.path().join("rings.json")).unwrap();

    let mut resumed = Trainer::new(config(dir.path(), 8, true), dataset()).unwrap();
    assert_eq!(resumed.start_epoch(), saved.epoch);
    assert_eq!(resumed.solver().template().contents(), saved.contents.as_slice());
    assert_eq!(resumed.solver().network(), &saved.network);

    let summary = resumed.run(&mut NullSink).unwrap();
    assert_eq!(summary.epochs_run, 8 - saved.epoch);
}

#[test]
fn identical_seeds_give_identical_runs() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let first = Trainer::new(config(a.path(), 3, false), dataset())
        .unwrap()
        .run(&mut NullSink)
        .unwrap();
    let second = Trainer::new(config(b.path(), 3, false), dataset())
        .unwrap()
        .run(&mut NullSink)
        .unwrap();
    assert_eq!(first, second);
}
