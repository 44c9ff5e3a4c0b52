//! Named scalar metrics.
//!
//! Components that report progress take a `&mut dyn MetricsSink` and emit
//! `name -> value` pairs. The engine never depends on a concrete sink.

use serde::Serialize;

/// Receiver for named scalar metrics.
pub trait MetricsSink {
    /// Records one scalar.
    fn scalar(&mut self, name: &str, value: f64);

    /// Advances the global step attached to later scalars.
    fn set_step(&mut self, _step: u64) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn scalar(&mut self, _name: &str, _value: f64) {}
}

/// Keeps every scalar in memory, in emission order.
///
/// # Example
///
/// ```
/// use sprout_core::{MetricsSink, RecordingSink};
///
/// let mut sink = RecordingSink::default();
/// sink.scalar("loss", 1.0);
/// sink.scalar("loss", 0.5);
/// assert_eq!(sink.get("loss"), Some(0.5));
/// assert_eq!(sink.count("loss"), 2);
/// ```
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    /// `(step, name, value)` triples.
    pub records: Vec<(u64, String, f64)>,
    step: u64,
}

impl RecordingSink {
    /// Most recent value recorded under `name`.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.records
            .iter()
            .rev()
            .find(|(_, n, _)| n == name)
            .map(|(_, _, v)| *v)
    }

    /// Number of values recorded under `name`.
    pub fn count(&self, name: &str) -> usize {
        self.records.iter().filter(|(_, n, _)| n == name).count()
    }

    /// Serialises the records as JSON lines: `{"step":..,"name":..,"value":..}`.
    ///
    /// Non-finite values are written as `null`.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error if a record fails to serialise.
    pub fn to_json_lines(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for (step, name, value) in &self.records {
            let record = MetricRecord {
                step: *step,
                name,
                value: value.is_finite().then_some(*value),
            };
            out.push_str(&serde_json::to_string(&record)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[derive(Serialize)]
struct MetricRecord<'a> {
    step: u64,
    name: &'a str,
    value: Option<f64>,
}

impl MetricsSink for RecordingSink {
    fn scalar(&mut self, name: &str, value: f64) {
        self.records.push((self.step, name.to_string(), value));
    }

    fn set_step(&mut self, step: u64) {
        self.step = step;
    }
}

/// Forwards every scalar to `tracing` at debug level under the `metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink {
    step: u64,
}

impl MetricsSink for TracingSink {
    fn scalar(&mut self, name: &str, value: f64) {
        tracing::debug!(target: "metrics", step = self.step, name, value);
    }

    fn set_step(&mut self, step: u64) {
        self.step = step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_tracks_steps() {
        let mut sink = RecordingSink::default();
        sink.scalar("a", 1.0);
        sink.set_step(4);
        sink.scalar("a", 2.0);
        assert_eq!(sink.records[1].0, 4);
        assert_eq!(sink.get("missing"), None);
    }

    #[test]
    fn json_lines_are_parseable() {
        let mut sink = RecordingSink::default();
        sink.scalar("best_local_ratio_0", 3.5);
        sink.scalar("bad", f64::NAN);
        let text = sink.to_json_lines().unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["value"], 3.5);
        assert!(lines[1]["value"].is_null());
    }

    #[test]
    fn json_lines_escape_control_characters() {
        let mut sink = RecordingSink::default();
        sink.set_step(2);
        sink.scalar("a\u{1}b\n\"c\"", 1.0);
        let text = sink.to_json_lines().unwrap();
        assert_eq!(text.lines().count(), 1);
        let v: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(v["name"], "a\u{1}b\n\"c\"");
        assert_eq!(v["step"], 2);
    }

    #[test]
    fn null_sink_accepts_anything() {
        let mut sink = NullSink;
        let dyn_sink: &mut dyn MetricsSink = &mut sink;
        dyn_sink.scalar("x", 1.0);
        dyn_sink.set_step(3);
    }
}
