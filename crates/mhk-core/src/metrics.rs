use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// Where command execution metrics go (Prometheus, statsd...).
pub trait MetricsSink: Send + Sync {
    fn observe_duration(&self, name: &str, duration: Duration);
    fn increment_count(&self, name: &str, outcome: Outcome);
}

/// Records the elapsed time for one command when dropped.
pub struct CommandTimer {
    sink: Arc<dyn MetricsSink>,
    name: String,
    started: Instant,
}

impl CommandTimer {
    pub fn start(sink: Arc<dyn MetricsSink>, name: impl Into<String>) -> Self {
        Self {
            sink,
            name: name.into(),
            started: Instant::now(),
        }
    }
}

impl Drop for CommandTimer {
    fn drop(&mut self) {
        self.sink
            .observe_duration(&self.name, self.started.elapsed());
    }
}

#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn observe_duration(&self, _name: &str, _duration: Duration) {}
    fn increment_count(&self, _name: &str, _outcome: Outcome) {}
}

/// Keeps every observation in memory. Handy for `/health` style reporting and tests.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    durations: Mutex<HashMap<String, Vec<Duration>>>,
    counts: Mutex<HashMap<(String, Outcome), u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn durations(&self, name: &str) -> Vec<Duration> {
        self.durations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, name: &str, outcome: Outcome) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(name.to_string(), outcome))
            .copied()
            .unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn observe_duration(&self, name: &str, duration: Duration) {
        self.durations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(name.to_string())
            .or_default()
            .push(duration);
    }

    fn increment_count(&self, name: &str, outcome: Outcome) {
        tracing::trace!(command = name, outcome = outcome.as_str(), "command result");
        *self
            .counts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry((name.to_string(), outcome))
            .or_insert(0) += 1;
    }
}
