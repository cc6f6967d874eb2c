use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument};

use crate::error::PipelineError;
use crate::executor::{ContextLauncher, QuiescenceBarrier, StageExecutor, StageOutcome};
use crate::kernel::PapermillLauncher;
use crate::observability::MetricsCollector;
use crate::recipe::{Recipe, RuntimeConfig};

pub type StageParameters = Map<String, Value>;

/// One notebook run in the pipeline and its artifact contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub name: String,
    pub notebook: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_path: Option<PathBuf>,
    pub output_path: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub produces: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: StageParameters,
}

impl StageDescriptor {
    /// Files that must exist before the stage may start.
    pub fn declared_inputs(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.notebook.as_path()).chain(self.input_path.as_deref())
    }

    /// Files the stage writes: the executed record first, then data artifacts.
    pub fn declared_outputs(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.output_path.as_path()).chain(self.produces.iter().map(PathBuf::as_path))
    }

    /// Copy of the descriptor with every relative path joined onto `root`.
    pub fn resolved(&self, root: &Path) -> StageDescriptor {
        let join = |path: &Path| {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                root.join(path)
            }
        };
        StageDescriptor {
            name: self.name.clone(),
            notebook: join(&self.notebook),
            input_path: self.input_path.as_deref().map(join),
            output_path: join(&self.output_path),
            produces: self.produces.iter().map(|p| join(p.as_path())).collect(),
            params: self.params.clone(),
        }
    }
}

/// Ordered, append-only list of stages.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    stages: Vec<StageDescriptor>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = StageDescriptor>) -> Result<Self> {
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    /// Append a stage. Names are unique and every path has a single writer.
    pub fn register(&mut self, descriptor: StageDescriptor) -> Result<()> {
        if descriptor.name.trim().is_empty() {
            bail!("Stage names cannot be empty");
        }
        if self.get(&descriptor.name).is_some() {
            bail!("Stage '{}' is already registered", descriptor.name);
        }
        for path in descriptor.declared_outputs() {
            if let Some(owner) = self.writer_of(path) {
                bail!(
                    "Stage '{}' writes '{}', which stage '{}' already writes",
                    descriptor.name,
                    path.display(),
                    owner.name
                );
            }
        }
        self.stages.push(descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn known_stages(&self) -> Vec<String> {
        self.stages.iter().map(|stage| stage.name.clone()).collect()
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Checks that every declared input is produced upstream or already on disk.
    pub fn check_chain(&self) -> Result<(), PipelineError> {
        match chain_issues(&self.stages).into_iter().next() {
            Some(issue) => Err(issue),
            None => Ok(()),
        }
    }

    fn writer_of(&self, path: &Path) -> Option<&StageDescriptor> {
        self.stages
            .iter()
            .find(|stage| stage.declared_outputs().any(|out| out == path))
    }
}

/// Every unsatisfied `input_path` in a stage list, in stage order.
pub fn chain_issues(stages: &[StageDescriptor]) -> Vec<PipelineError> {
    let mut producers: HashMap<&Path, usize> = HashMap::new();
    for (idx, stage) in stages.iter().enumerate() {
        for path in stage.declared_outputs() {
            producers.entry(path).or_insert(idx);
        }
    }

    let mut issues = Vec::new();
    for (idx, stage) in stages.iter().enumerate() {
        let Some(input) = stage.input_path.as_deref() else {
            continue;
        };
        let reason = match producers.get(input) {
            Some(&producer) if producer < idx => continue,
            Some(&producer) if producer == idx => "the stage consumes its own output".to_string(),
            Some(&producer) => format!(
                "it is produced later by stage '{}'",
                stages[producer].name
            ),
            None if input.exists() => continue,
            None => "no earlier stage produces it and it does not exist on disk".to_string(),
        };
        issues.push(PipelineError::BrokenChain {
            stage: stage.name.clone(),
            path: input.to_path_buf(),
            reason,
        });
    }
    issues
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running { index: usize, stage: String },
    Failed { stage: Option<String> },
    Completed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Failed { .. } | RunState::Completed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running { .. } => "running",
            RunState::Failed { .. } => "failed",
            RunState::Completed => "completed",
        }
    }
}

#[derive(Debug)]
pub enum StagePhase<'a> {
    Starting,
    Completed(&'a StageOutcome),
    Failed(&'a PipelineError),
}

pub struct StageProgress<'a> {
    pub stage_index: usize,
    pub total_stages: usize,
    pub stage: &'a StageDescriptor,
    pub phase: StagePhase<'a>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcomes: Vec<StageOutcome>,
    pub total_duration: Duration,
}

/// Drives the registry through the executor, one stage at a time.
pub struct PipelineRunner {
    registry: StageRegistry,
    executor: StageExecutor,
    barrier: QuiescenceBarrier,
    metrics: MetricsCollector,
    state: RunState,
}

impl PipelineRunner {
    /// Runner backed by the papermill engine described in `runtime`.
    pub fn new(registry: StageRegistry, runtime: &RuntimeConfig) -> Self {
        let launcher = Arc::new(PapermillLauncher::new(runtime.clone()));
        Self::with_launcher(registry, launcher, QuiescenceBarrier::new(runtime.quiescence()))
    }

    pub fn with_launcher(
        registry: StageRegistry,
        launcher: Arc<dyn ContextLauncher>,
        barrier: QuiescenceBarrier,
    ) -> Self {
        let metrics = MetricsCollector::new();
        Self {
            registry,
            executor: StageExecutor::new(launcher, metrics.clone()),
            barrier,
            metrics,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn barrier(&self) -> &QuiescenceBarrier {
        &self.barrier
    }

    pub fn run(&mut self) -> Result<RunReport, PipelineError> {
        self.run_with_progress(|_| {})
    }

    #[instrument(skip_all, fields(stages = self.registry.len()))]
    pub fn run_with_progress<F>(&mut self, mut on_progress: F) -> Result<RunReport, PipelineError>
    where
        F: FnMut(StageProgress<'_>),
    {
        if self.state != RunState::Idle {
            return Err(PipelineError::RunnerFinished {
                state: self.state.label().to_string(),
            });
        }

        self.metrics.reset();
        if let Err(err) = self.registry.check_chain() {
            error!(error = %err, "Pipeline preflight failed");
            self.transition(RunState::Failed {
                stage: err.stage().map(str::to_string),
            });
            return Err(err);
        }

        let total_start = Instant::now();
        let total = self.registry.len();
        let mut outcomes = Vec::with_capacity(total);

        for (index, stage) in self.registry.stages.iter().enumerate() {
            let span = tracing::span!(tracing::Level::INFO, "stage", stage = stage.name.as_str());
            let _span_guard = span.enter();

            self.state = RunState::Running {
                index,
                stage: stage.name.clone(),
            };
            self.metrics.record_state(&self.state);
            info!(index = index + 1, total, notebook = %stage.notebook.display(), "Stage starting");
            on_progress(StageProgress {
                stage_index: index,
                total_stages: total,
                stage,
                phase: StagePhase::Starting,
            });

            match self.executor.execute(stage) {
                Ok(outcome) => {
                    info!(
                        output = %outcome.output_path.display(),
                        duration_ms = outcome.duration.as_secs_f64() * 1_000.0,
                        "Stage completed"
                    );
                    on_progress(StageProgress {
                        stage_index: index,
                        total_stages: total,
                        stage,
                        phase: StagePhase::Completed(&outcome),
                    });
                    if index + 1 < total {
                        self.barrier.settle(&stage.name, outcome.teardown.as_ref());
                    }
                    outcomes.push(outcome);
                }
                Err(err) => {
                    error!(error = %err, "Stage failed; halting pipeline");
                    self.metrics.record_stage_failure();
                    on_progress(StageProgress {
                        stage_index: index,
                        total_stages: total,
                        stage,
                        phase: StagePhase::Failed(&err),
                    });
                    self.state = RunState::Failed {
                        stage: Some(stage.name.clone()),
                    };
                    self.metrics.record_state(&self.state);
                    self.metrics.record_total_duration(total_start.elapsed());
                    return Err(err);
                }
            }
        }

        let total_duration = total_start.elapsed();
        self.metrics.record_total_duration(total_duration);
        self.transition(RunState::Completed);
        Ok(RunReport {
            outcomes,
            total_duration,
        })
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = self.state.label(), to = next.label(), "Pipeline state change");
        self.state = next;
        self.metrics.record_state(&self.state);
    }
}

/// Builds a papermill-backed runner from a recipe, anchoring paths at its workdir.
pub fn build_pipeline(recipe: &Recipe) -> Result<PipelineRunner> {
    let mut runtime = recipe.runtime.clone();
    runtime.workdir = runtime.resolved_workdir()?;
    let registry = recipe.registry()?;
    Ok(PipelineRunner::new(registry, &runtime))
}
