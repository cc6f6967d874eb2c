use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::{StageDescriptor, StageRegistry};

pub const RECIPE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub version: u32,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub stages: Vec<StageDescriptor>,
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe file: {}", path.display()))?;
        let recipe: Recipe = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse recipe YAML: {}", path.display()))?;
        Ok(recipe)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to render recipe YAML")
    }

    /// Stage descriptors with relative paths anchored at the runtime workdir.
    pub fn resolved_stages(&self) -> Result<Vec<StageDescriptor>> {
        let root = self.runtime.resolved_workdir()?;
        Ok(self
            .stages
            .iter()
            .map(|stage| stage.resolved(&root))
            .collect())
    }

    pub fn registry(&self) -> Result<StageRegistry> {
        StageRegistry::from_descriptors(self.resolved_stages()?)
    }
}

/// Everything a stage context needs from its host, passed explicitly to the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub kernel: String,
    pub language: String,
    pub engine: EngineSpec,
    pub quiescence_ms: u64,
    pub workdir: PathBuf,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kernel: "python3".to_string(),
            language: "python".to_string(),
            engine: EngineSpec::default(),
            quiescence_ms: 2_000,
            workdir: PathBuf::from("."),
            env: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    /// Absolute working directory, so stage paths and the engine cwd agree.
    pub fn resolved_workdir(&self) -> Result<PathBuf> {
        let workdir = if self.workdir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            self.workdir.as_path()
        };
        if workdir.is_absolute() {
            return Ok(workdir.to_path_buf());
        }
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        let joined = cwd.join(workdir);
        Ok(joined.canonicalize().unwrap_or(joined))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSpec {
    pub program: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl Default for EngineSpec {
    fn default() -> Self {
        Self {
            program: "papermill".to_string(),
            args: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_defaults_apply_when_section_missing() {
        let recipe: Recipe = serde_yaml::from_str(
            r#"
version: 1
stages:
  - name: comparison
    notebook: notebooks/comparison.ipynb
    output_path: notebooks/runs/comparison_run.ipynb
"#,
        )
        .unwrap();
        assert_eq!(recipe.runtime, RuntimeConfig::default());
        assert_eq!(recipe.runtime.quiescence(), Duration::from_secs(2));
        assert!(recipe.stages[0].params.is_empty());
        assert!(recipe.stages[0].input_path.is_none());
    }

    #[test]
    fn partial_runtime_keeps_other_defaults() {
        let runtime: RuntimeConfig =
            serde_yaml::from_str("kernel: venv-py311\nquiescence_ms: 0\n").unwrap();
        assert_eq!(runtime.kernel, "venv-py311");
        assert_eq!(runtime.language, "python");
        assert_eq!(runtime.engine.program, "papermill");
        assert!(runtime.quiescence().is_zero());
    }
}
