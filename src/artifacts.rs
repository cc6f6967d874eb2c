use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::to_writer_pretty;
use sha2::{Digest, Sha256};

use crate::pipeline::StageRegistry;

/// Compute the SHA256 digest of the file at `path` and return it as a hex string.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader
            .read(&mut buffer)
            .with_context(|| format!("Failed to read file for hashing: {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Executed notebook; carries execution timestamps, so never byte-stable.
    ExecutedRecord,
    Declared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub stage: String,
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub sha256: Option<String>,
    pub bytes: Option<u64>,
}

/// Digest of every artifact a registry declares, for comparing two runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<ArtifactEntry>,
}

impl ArtifactManifest {
    pub fn collect(registry: &StageRegistry) -> Result<Self> {
        let mut entries = Vec::new();
        for stage in registry.stages() {
            for (idx, path) in stage.declared_outputs().enumerate() {
                let kind = if idx == 0 {
                    ArtifactKind::ExecutedRecord
                } else {
                    ArtifactKind::Declared
                };
                let (sha256, bytes) = if path.is_file() {
                    let size = path
                        .metadata()
                        .with_context(|| format!("Failed to stat artifact: {}", path.display()))?
                        .len();
                    (Some(compute_sha256(path)?), Some(size))
                } else {
                    (None, None)
                };
                entries.push(ArtifactEntry {
                    stage: stage.name.clone(),
                    path: path.to_path_buf(),
                    kind,
                    sha256,
                    bytes,
                });
            }
        }
        Ok(Self {
            generated_at: Utc::now(),
            entries,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open artifact manifest: {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse artifact manifest: {}", path.display()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create manifest directory: {}", parent.display())
            })?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create artifact manifest: {}", path.display()))?;
        to_writer_pretty(file, self)
            .with_context(|| format!("Failed to write artifact manifest: {}", path.display()))
    }

    /// Declared artifacts whose digest differs from `baseline`.
    pub fn differences(&self, baseline: &ArtifactManifest) -> Vec<String> {
        let previous: BTreeMap<&Path, &ArtifactEntry> = baseline
            .entries
            .iter()
            .filter(|entry| entry.kind == ArtifactKind::Declared)
            .map(|entry| (entry.path.as_path(), entry))
            .collect();

        let mut differences = Vec::new();
        for entry in self
            .entries
            .iter()
            .filter(|entry| entry.kind == ArtifactKind::Declared)
        {
            match previous.get(entry.path.as_path()) {
                None => differences.push(format!(
                    "'{}' ({}) is not in the baseline",
                    entry.path.display(),
                    entry.stage
                )),
                Some(old) if old.sha256 != entry.sha256 => differences.push(format!(
                    "'{}' ({}) changed: {} -> {}",
                    entry.path.display(),
                    entry.stage,
                    old.sha256.as_deref().unwrap_or("<missing>"),
                    entry.sha256.as_deref().unwrap_or("<missing>")
                )),
                Some(_) => {}
            }
        }
        differences
    }
}
