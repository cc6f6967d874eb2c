use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors raised while running a pipeline.
///
/// Every variant halts the run. Nothing is retried at this level.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Stage '{stage}' cannot start: input artifact '{}' does not exist", .path.display())]
    MissingInputArtifact { stage: String, path: PathBuf },

    #[error("Stage '{stage}' failed: {cause:#}")]
    StageExecution {
        stage: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("Stage '{stage}' input '{}' is not satisfied: {reason}", .path.display())]
    BrokenChain {
        stage: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Pipeline runner already finished ({state}); start a new run")]
    RunnerFinished { state: String },

    #[error("Failed to prepare artifact location '{}'", .path.display())]
    ArtifactIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn stage_execution(stage: impl Into<String>, cause: anyhow::Error) -> Self {
        PipelineError::StageExecution {
            stage: stage.into(),
            cause,
        }
    }

    /// Name of the stage the error is attributed to, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            PipelineError::MissingInputArtifact { stage, .. }
            | PipelineError::StageExecution { stage, .. }
            | PipelineError::BrokenChain { stage, .. } => Some(stage),
            PipelineError::RunnerFinished { .. } | PipelineError::ArtifactIo { .. } => None,
        }
    }
}

/// Non-fatal failure to fully release an execution context.
///
/// Logged and counted, never propagated.
#[derive(Error, Debug)]
#[error("Execution context for stage '{stage}' was not fully released: {reason}")]
pub struct ResourceCleanupWarning {
    pub stage: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_execution_message_includes_cause_chain() {
        let cause = anyhow::anyhow!("kernel died").context("papermill exited with status 1");
        let err = PipelineError::stage_execution("regression", cause);
        let message = err.to_string();
        assert!(message.contains("regression"));
        assert!(message.contains("papermill exited with status 1"));
        assert!(message.contains("kernel died"));
        assert_eq!(err.stage(), Some("regression"));
    }
}
