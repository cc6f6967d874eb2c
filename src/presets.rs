use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};

use crate::pipeline::{StageDescriptor, StageParameters};
use crate::recipe::{RECIPE_VERSION, Recipe, RuntimeConfig};

const RAW_ZIP: &str = "data/raw/PRSA2017_Data_20130301-20170228.zip";
const CUTOFF: &str = "2017-01-01";

pub fn known_presets() -> &'static [&'static str] {
    &["air-quality"]
}

pub fn preset_recipe(name: &str) -> Result<Recipe> {
    match name {
        "air-quality" => Ok(air_quality()),
        other => anyhow::bail!(
            "Unknown preset '{other}'. Available presets: {}",
            known_presets().join(", ")
        ),
    }
}

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let rendered = preset_recipe(name)?.to_yaml()?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset recipe: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

/// Beijing multi-site air quality: cleaning, features, classification,
/// regression, ARIMA and the regression-vs-ARIMA comparison.
pub fn air_quality() -> Recipe {
    Recipe {
        version: RECIPE_VERSION,
        runtime: RuntimeConfig::default(),
        stages: vec![
            stage(
                "preprocessing_and_eda",
                Some(RAW_ZIP),
                &["data/processed/cleaned.parquet"],
                json!({
                    "USE_UCIMLREPO": false,
                    "RAW_ZIP_PATH": RAW_ZIP,
                    "OUTPUT_CLEANED_PATH": "data/processed/cleaned.parquet",
                    "LAG_HOURS": [1, 3, 24],
                }),
            ),
            stage(
                "feature_preparation",
                Some("data/processed/cleaned.parquet"),
                &["data/processed/dataset_for_clf.parquet"],
                json!({
                    "CLEANED_PATH": "data/processed/cleaned.parquet",
                    "OUTPUT_DATASET_PATH": "data/processed/dataset_for_clf.parquet",
                    "DROP_ROWS_WITHOUT_TARGET": true,
                }),
            ),
            stage(
                "classification_modelling",
                Some("data/processed/dataset_for_clf.parquet"),
                &[
                    "data/processed/metrics.json",
                    "data/processed/predictions_sample.csv",
                ],
                json!({
                    "DATASET_PATH": "data/processed/dataset_for_clf.parquet",
                    "CUTOFF": CUTOFF,
                    "METRICS_PATH": "data/processed/metrics.json",
                    "PRED_SAMPLE_PATH": "data/processed/predictions_sample.csv",
                }),
            ),
            // MODEL_OUT, METRICS_OUT and PRED_SAMPLE_OUT are bare file names that the
            // notebook places itself, so only the regression dataset is declared.
            stage(
                "regression_modelling",
                Some(RAW_ZIP),
                &["data/processed/dataset_for_regression.parquet"],
                json!({
                    "USE_UCIMLREPO": false,
                    "RAW_ZIP_PATH": RAW_ZIP,
                    "LAG_HOURS": [1, 3, 24],
                    "HORIZON": 1,
                    "TARGET_COL": "PM2.5",
                    "OUTPUT_REG_DATASET_PATH": "data/processed/dataset_for_regression.parquet",
                    "CUTOFF": CUTOFF,
                    "MODEL_OUT": "regressor.joblib",
                    "METRICS_OUT": "regression_metrics.json",
                    "PRED_SAMPLE_OUT": "regression_predictions_sample.csv",
                }),
            ),
            // Artifacts are named from ARTIFACTS_PREFIX inside the notebook; their paths
            // are not fixed here and stay out of the artifact manifest.
            stage(
                "arima_forecasting",
                Some(RAW_ZIP),
                &[],
                json!({
                    "RAW_ZIP_PATH": RAW_ZIP,
                    "STATION": "Aotizhongxin",
                    "VALUE_COL": "PM2.5",
                    "CUTOFF": CUTOFF,
                    "P_MAX": 3,
                    "Q_MAX": 3,
                    "D_MAX": 2,
                    "IC": "aic",
                    "ARTIFACTS_PREFIX": "arima_pm25",
                }),
            ),
            // Reads the regression and ARIMA artifacts from wherever those notebooks saved
            // them, so it has no declared input.
            stage("comparison_regression_vs_arima", None, &[], json!({})),
        ],
    }
}

fn stage(name: &str, input: Option<&str>, produces: &[&str], params: Value) -> StageDescriptor {
    StageDescriptor {
        name: name.to_string(),
        notebook: PathBuf::from(format!("notebooks/{name}.ipynb")),
        input_path: input.map(PathBuf::from),
        output_path: PathBuf::from(format!("notebooks/runs/{name}_run.ipynb")),
        produces: produces.iter().map(PathBuf::from).collect(),
        params: into_params(params),
    }
}

fn into_params(value: Value) -> StageParameters {
    match value {
        Value::Object(map) => map,
        _ => StageParameters::new(),
    }
}
