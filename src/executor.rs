use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{PipelineError, ResourceCleanupWarning};
use crate::observability::MetricsCollector;
use crate::pipeline::StageDescriptor;

/// Isolated runtime that executes exactly one stage.
pub trait ExecutionContext: Send {
    /// Inject the stage parameters and run the notebook to completion.
    fn run(&mut self, stage: &StageDescriptor) -> anyhow::Result<()>;

    /// Release every handle the context holds.
    ///
    /// Returns only once the underlying worker is gone.
    fn teardown(self: Box<Self>) -> anyhow::Result<TeardownAck>;
}

/// Creates one fresh [`ExecutionContext`] per stage invocation.
pub trait ContextLauncher: Send + Sync {
    fn launch(&self, stage: &StageDescriptor) -> anyhow::Result<Box<dyn ExecutionContext>>;
}

/// Acknowledgment that a context has been torn down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownAck {
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// The worker was still alive and had to be killed.
    pub forced: bool,
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: String,
    pub output_path: PathBuf,
    pub duration: Duration,
    pub teardown: Option<TeardownAck>,
    pub missing_outputs: Vec<PathBuf>,
}

/// Pause applied after an acknowledged teardown, before the next stage starts.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuiescenceBarrier {
    delay: Duration,
}

impl QuiescenceBarrier {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn settle(&self, stage: &str, ack: Option<&TeardownAck>) {
        debug!(
            stage,
            acknowledged = ack.is_some(),
            forced = ack.map(|a| a.forced).unwrap_or(false),
            delay_ms = self.delay.as_millis() as u64,
            "Quiescence barrier"
        );
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
    }
}

pub struct StageExecutor {
    launcher: Arc<dyn ContextLauncher>,
    metrics: MetricsCollector,
}

impl StageExecutor {
    pub fn new(launcher: Arc<dyn ContextLauncher>, metrics: MetricsCollector) -> Self {
        Self { launcher, metrics }
    }

    /// Run one stage in a fresh context and release it afterwards.
    ///
    /// Missing inputs fail before any context is launched. Once launched, the
    /// context is torn down exactly once whatever the stage result.
    pub fn execute(&self, stage: &StageDescriptor) -> Result<StageOutcome, PipelineError> {
        let started_at = Instant::now();

        if let Some(missing) = stage.declared_inputs().find(|path| !path.exists()) {
            return Err(PipelineError::MissingInputArtifact {
                stage: stage.name.clone(),
                path: missing.to_path_buf(),
            });
        }

        if let Some(parent) = stage.output_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| PipelineError::ArtifactIo {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let _timer = self.metrics.start_stage(&stage.name);
        let context = self.launcher.launch(stage).map_err(|cause| {
            PipelineError::stage_execution(
                &stage.name,
                cause.context("Failed to launch execution context"),
            )
        })?;
        self.metrics.record_context_launched();

        let mut guard = ContextGuard::new(&stage.name, context, &self.metrics);
        let result = guard.run(stage);
        let teardown = guard.release();
        drop(guard);

        result.map_err(|cause| PipelineError::stage_execution(&stage.name, cause))?;

        if !stage.output_path.exists() {
            return Err(PipelineError::stage_execution(
                &stage.name,
                anyhow!(
                    "engine reported success but no executed record was written to {}",
                    stage.output_path.display()
                ),
            ));
        }

        let missing_outputs: Vec<PathBuf> = stage
            .produces
            .iter()
            .filter(|path| !path.exists())
            .cloned()
            .collect();
        for path in &missing_outputs {
            warn!(stage = stage.name.as_str(), artifact = %path.display(), "Declared artifact was not produced");
        }

        Ok(StageOutcome {
            stage: stage.name.clone(),
            output_path: stage.output_path.clone(),
            duration: started_at.elapsed(),
            teardown,
            missing_outputs,
        })
    }
}

/// Owns a live context and guarantees a single teardown, including on unwind.
struct ContextGuard<'a> {
    stage: &'a str,
    context: Option<Box<dyn ExecutionContext>>,
    metrics: &'a MetricsCollector,
}

impl<'a> ContextGuard<'a> {
    fn new(stage: &'a str, context: Box<dyn ExecutionContext>, metrics: &'a MetricsCollector) -> Self {
        Self {
            stage,
            context: Some(context),
            metrics,
        }
    }

    fn run(&mut self, descriptor: &StageDescriptor) -> anyhow::Result<()> {
        match self.context.as_mut() {
            Some(context) => context.run(descriptor),
            None => Err(anyhow!("execution context was already released")),
        }
    }

    fn release(&mut self) -> Option<TeardownAck> {
        let context = self.context.take()?;
        self.metrics.record_context_released();
        match context.teardown() {
            Ok(ack) => {
                debug!(stage = self.stage, ?ack, "Execution context released");
                Some(ack)
            }
            Err(err) => {
                let warning = ResourceCleanupWarning {
                    stage: self.stage.to_string(),
                    reason: format!("{err:#}"),
                };
                warn!("{warning}");
                self.metrics.record_cleanup_warning();
                None
            }
        }
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
