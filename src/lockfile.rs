use std::fs::File;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::artifacts::compute_sha256;
use crate::pipeline::StageDescriptor;
use crate::recipe::Recipe;

#[derive(Debug, Serialize)]
pub struct PipelineLock {
    pub recipe_version: u32,
    pub generated_at: DateTime<Utc>,
    pub runtime: RuntimeLock,
    pub stages: Vec<StageLock>,
}

#[derive(Debug, Serialize)]
pub struct RuntimeLock {
    pub kernel: String,
    pub language: String,
    pub engine: String,
}

#[derive(Debug, Serialize)]
pub struct StageLock {
    pub name: String,
    pub notebook: String,
    pub notebook_sha256: Option<String>,
    pub output_path: String,
    pub params_hash: String,
}

pub fn generate_lock(recipe: &Recipe, path: &Path) -> Result<()> {
    let stages = recipe
        .resolved_stages()?
        .iter()
        .zip(&recipe.stages)
        .map(|(resolved, declared)| {
            Ok(StageLock {
                name: declared.name.clone(),
                notebook: declared.notebook.to_string_lossy().to_string(),
                notebook_sha256: notebook_digest(&resolved.notebook)?,
                output_path: declared.output_path.to_string_lossy().to_string(),
                params_hash: hash_params(declared),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let engine = &recipe.runtime.engine;
    let lock = PipelineLock {
        recipe_version: recipe.version,
        generated_at: Utc::now(),
        runtime: RuntimeLock {
            kernel: recipe.runtime.kernel.clone(),
            language: recipe.runtime.language.clone(),
            engine: std::iter::once(engine.program.as_str())
                .chain(engine.args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" "),
        },
        stages,
    };

    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;

    Ok(())
}

fn hash_params(stage: &StageDescriptor) -> String {
    let mut hasher = Sha256::new();
    let serialized = serde_json::to_vec(&stage.params).unwrap_or_default();
    hasher.update(stage.name.as_bytes());
    hasher.update(serialized);
    format!("{:x}", hasher.finalize())
}

/// A notebook that does not exist yet locks without a digest; any other read failure is an error.
fn notebook_digest(path: &Path) -> Result<Option<String>> {
    match compute_sha256(path) {
        Ok(digest) => Ok(Some(digest)),
        Err(err)
            if err
                .downcast_ref::<io::Error>()
                .is_some_and(|source| source.kind() == io::ErrorKind::NotFound) =>
        {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
