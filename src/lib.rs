pub mod artifacts;
pub mod error;
pub mod executor;
pub mod kernel;
pub mod lockfile;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod recipe;
pub mod validation;

pub use error::{PipelineError, ResourceCleanupWarning};
pub use executor::{ContextLauncher, ExecutionContext, StageExecutor, TeardownAck};
pub use pipeline::{PipelineRunner, RunState, StageDescriptor, StageRegistry};
pub use recipe::{Recipe, RuntimeConfig};
