use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Serialize;

use crate::pipeline::{StageDescriptor, chain_issues};
use crate::recipe::{RECIPE_VERSION, Recipe};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_recipe(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.version != RECIPE_VERSION {
        report
            .errors
            .push(format!("Unsupported recipe version: {}", recipe.version));
    }

    if recipe.runtime.kernel.trim().is_empty() {
        report.errors.push("Runtime kernel cannot be empty".into());
    }
    if recipe.runtime.engine.program.trim().is_empty() {
        report
            .errors
            .push("Runtime engine program cannot be empty".into());
    }

    if recipe.stages.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
        return report;
    }

    let stages = match recipe.resolved_stages() {
        Ok(stages) => stages,
        Err(err) => {
            report.errors.push(format!("{err:#}"));
            return report;
        }
    };

    report.merge(validate_names(&stages));
    report.merge(validate_writers(&stages));
    for stage in &stages {
        report.merge(validate_stage(stage));
    }
    for issue in chain_issues(&stages) {
        report.errors.push(issue.to_string());
    }

    report
}

fn validate_names(stages: &[StageDescriptor]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut seen = HashSet::new();
    for (idx, stage) in stages.iter().enumerate() {
        if stage.name.trim().is_empty() {
            report
                .errors
                .push(format!("Stage {} has an empty name", idx + 1));
        } else if !seen.insert(stage.name.as_str()) {
            report
                .errors
                .push(format!("Stage name '{}' is used more than once", stage.name));
        }
    }
    report
}

fn validate_writers(stages: &[StageDescriptor]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut writers: HashMap<&Path, usize> = HashMap::new();
    for (idx, stage) in stages.iter().enumerate() {
        for path in stage.declared_outputs() {
            match writers.get(path) {
                Some(&owner) if owner != idx => report.errors.push(format!(
                    "Artifact '{}' is written by both '{}' and '{}'",
                    path.display(),
                    stages[owner].name,
                    stage.name
                )),
                Some(_) => {}
                None => {
                    writers.insert(path, idx);
                }
            }
        }
    }
    report
}

fn validate_stage(stage: &StageDescriptor) -> ValidationReport {
    let mut report = ValidationReport::default();

    if !stage.notebook.exists() {
        report.warnings.push(format!(
            "Stage '{}' notebook '{}' does not exist yet",
            stage.name,
            stage.notebook.display()
        ));
    }
    if stage.output_path == stage.notebook {
        report.errors.push(format!(
            "Stage '{}' would overwrite its own notebook",
            stage.name
        ));
    }
    if stage.produces.contains(&stage.notebook) {
        report.errors.push(format!(
            "Stage '{}' lists its notebook among the artifacts it produces",
            stage.name
        ));
    }

    report
}
