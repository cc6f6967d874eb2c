use std::fs;

use nbpipe::artifacts::{ArtifactKind, ArtifactManifest};
use nbpipe::presets::{air_quality, generate_preset, preset_recipe};
use nbpipe::recipe::Recipe;
use serde_json::json;
use tempfile::tempdir;

#[test]
fn generate_air_quality_preset_writes_loadable_recipe() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("recipes/air-quality.yaml");
    let generated = generate_preset("air-quality", &path).expect("preset generation");

    let contents = fs::read_to_string(&generated).expect("read preset");
    assert!(contents.contains("name: arima_forecasting"));
    assert!(contents.contains("kernel: python3"));

    let loaded = Recipe::load(&generated).unwrap();
    assert_eq!(loaded, air_quality());
}

#[test]
fn unknown_preset_lists_available_ones() {
    let err = preset_recipe("weather").unwrap_err();
    assert!(err.to_string().contains("air-quality"));
}

#[test]
fn air_quality_stages_follow_the_analysis_order() {
    let recipe = air_quality();
    let names: Vec<_> = recipe.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "preprocessing_and_eda",
            "feature_preparation",
            "classification_modelling",
            "regression_modelling",
            "arima_forecasting",
            "comparison_regression_vs_arima",
        ]
    );

    let classification = &recipe.stages[2];
    assert_eq!(classification.params["CUTOFF"], json!("2017-01-01"));
    assert_eq!(
        classification.input_path.as_deref(),
        recipe.stages[1].produces.first().map(|p| p.as_path())
    );
    assert_eq!(recipe.stages[0].params["LAG_HOURS"], json!([1, 3, 24]));
    assert_eq!(recipe.stages[4].params["P_MAX"], json!(3));
    assert!(recipe.stages[5].params.is_empty());
    assert!(recipe.stages[5].input_path.is_none());
}

#[test]
fn manifest_detects_changed_declared_artifacts() {
    let temp = tempdir().unwrap();
    let mut recipe = air_quality();
    recipe.runtime.workdir = temp.path().to_path_buf();
    let registry = recipe.registry().unwrap();

    let cleaned = temp.path().join("data/processed/cleaned.parquet");
    fs::create_dir_all(cleaned.parent().unwrap()).unwrap();
    fs::write(&cleaned, b"first run").unwrap();
    let record = temp.path().join("notebooks/runs/preprocessing_and_eda_run.ipynb");
    fs::create_dir_all(record.parent().unwrap()).unwrap();
    fs::write(&record, b"{\"executed_at\": 1}").unwrap();

    let baseline = ArtifactManifest::collect(&registry).unwrap();
    let entry = baseline
        .entries
        .iter()
        .find(|e| e.path == cleaned)
        .unwrap();
    assert_eq!(entry.kind, ArtifactKind::Declared);
    assert_eq!(entry.bytes, Some(9));
    assert!(
        baseline
            .entries
            .iter()
            .filter(|e| e.stage == "arima_forecasting")
            .all(|e| e.kind == ArtifactKind::ExecutedRecord && e.sha256.is_none())
    );

    // Executed records carry timestamps and are not compared.
    fs::write(&record, b"{\"executed_at\": 2}").unwrap();
    let rerun = ArtifactManifest::collect(&registry).unwrap();
    assert!(rerun.differences(&baseline).is_empty());

    fs::write(&cleaned, b"second run").unwrap();
    let drifted = ArtifactManifest::collect(&registry).unwrap();
    let differences = drifted.differences(&baseline);
    assert_eq!(differences.len(), 1);
    assert!(differences[0].contains("cleaned.parquet"));

    let manifest_path = temp.path().join("artifacts.json");
    drifted.write(&manifest_path).unwrap();
    let reloaded = ArtifactManifest::load(&manifest_path).unwrap();
    assert_eq!(reloaded.entries, drifted.entries);
}

#[test]
fn notebook_placed_artifacts_stay_undeclared() {
    let recipe = air_quality();

    let regression = &recipe.stages[3];
    assert_eq!(regression.name, "regression_modelling");
    assert_eq!(
        regression.produces,
        vec![std::path::PathBuf::from("data/processed/dataset_for_regression.parquet")]
    );
    assert_eq!(regression.params["MODEL_OUT"], json!("regressor.joblib"));

    let arima = &recipe.stages[4];
    assert!(arima.produces.is_empty());
    assert_eq!(arima.params["ARTIFACTS_PREFIX"], json!("arima_pm25"));
}
