use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::pipeline::RunState;

#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub state: RunState,
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub contexts_launched: u64,
    pub contexts_released: u64,
    pub cleanup_warnings: u64,
    pub stage_failures: u64,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            stages: BTreeMap::new(),
            total_duration_ms: 0.0,
            contexts_launched: 0,
            contexts_released: 0,
            cleanup_warnings: 0,
            stage_failures: 0,
        }
    }
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_state(&self, state: &RunState) {
        self.update(|snapshot| snapshot.state = state.clone());
    }

    pub fn record_total_duration(&self, duration: Duration) {
        self.update(|snapshot| snapshot.total_duration_ms = duration.as_secs_f64() * 1_000.0);
    }

    pub fn record_context_launched(&self) {
        self.update(|snapshot| snapshot.contexts_launched += 1);
    }

    pub fn record_context_released(&self) {
        self.update(|snapshot| snapshot.contexts_released += 1);
    }

    pub fn record_cleanup_warning(&self) {
        self.update(|snapshot| snapshot.cleanup_warnings += 1);
    }

    pub fn record_stage_failure(&self) {
        self.update(|snapshot| snapshot.stage_failures += 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        self.update(|snapshot| *snapshot = MetricsSnapshot::default());
    }

    fn update(&self, apply: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut guard) = self.inner.lock() {
            apply(&mut guard);
        }
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            let duration_ms = duration.as_secs_f64() * 1_000.0;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms = duration.as_secs_f64() * 1_000.0,
            "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        state = snapshot.state.label(),
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        contexts_launched = snapshot.contexts_launched,
        contexts_released = snapshot.contexts_released,
        cleanup_warnings = snapshot.cleanup_warnings,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let counters = [
            (
                "nbpipe_contexts_launched_total",
                "Execution contexts launched",
                self.contexts_launched,
            ),
            (
                "nbpipe_contexts_released_total",
                "Execution contexts torn down",
                self.contexts_released,
            ),
            (
                "nbpipe_cleanup_warnings_total",
                "Contexts that were not fully released",
                self.cleanup_warnings,
            ),
            (
                "nbpipe_stage_failures_total",
                "Stages that ended the run with an error",
                self.stage_failures,
            ),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} counter\n"));
            output.push_str(&format!("{name} {value}\n"));
        }
        output.push_str("# HELP nbpipe_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE nbpipe_stage_calls_total counter\n");
        output.push_str(
            "# HELP nbpipe_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE nbpipe_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP nbpipe_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE nbpipe_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "nbpipe_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, metrics.calls
            ));
            output.push_str(&format!(
                "nbpipe_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "nbpipe_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP nbpipe_pipeline_duration_seconds Total pipeline duration\n");
        output.push_str("# TYPE nbpipe_pipeline_duration_seconds gauge\n");
        output.push_str(&format!(
            "nbpipe_pipeline_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output.push_str("# HELP nbpipe_pipeline_state Current pipeline state\n");
        output.push_str("# TYPE nbpipe_pipeline_state gauge\n");
        output.push_str(&format!(
            "nbpipe_pipeline_state{{state=\"{}\"}} 1\n",
            self.state.label()
        ));
        output
    }
}
