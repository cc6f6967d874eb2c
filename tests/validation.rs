use std::fs;
use std::path::Path;

use nbpipe::lockfile::generate_lock;
use nbpipe::presets::air_quality;
use nbpipe::recipe::Recipe;
use nbpipe::validation::validate_recipe;
use tempfile::tempdir;

/// Air-quality recipe anchored at `root`, with its notebooks and raw archive on disk.
fn seeded_recipe(root: &Path) -> Recipe {
    let mut recipe = air_quality();
    recipe.runtime.workdir = root.to_path_buf();
    for stage in &recipe.stages {
        let notebook = root.join(&stage.notebook);
        fs::create_dir_all(notebook.parent().unwrap()).unwrap();
        fs::write(&notebook, "{}").unwrap();
    }
    let raw = root.join("data/raw/PRSA2017_Data_20130301-20170228.zip");
    fs::create_dir_all(raw.parent().unwrap()).unwrap();
    fs::write(raw, b"PK").unwrap();
    recipe
}

#[test]
fn seeded_air_quality_recipe_is_valid() {
    let temp = tempdir().unwrap();
    let recipe = seeded_recipe(temp.path());

    let report = validate_recipe(&recipe);

    assert!(report.is_ok(), "unexpected errors: {:?}", report.errors);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
}

#[test]
fn missing_raw_archive_breaks_the_chain() {
    let temp = tempdir().unwrap();
    let recipe = seeded_recipe(temp.path());
    fs::remove_file(
        temp.path()
            .join("data/raw/PRSA2017_Data_20130301-20170228.zip"),
    )
    .unwrap();

    let report = validate_recipe(&recipe);

    // preprocessing, regression and ARIMA all read the raw archive.
    assert_eq!(report.errors.len(), 3, "{:?}", report.errors);
    assert!(report.errors.iter().all(|e| e.contains("PRSA2017")));
}

#[test]
fn reordered_stages_are_rejected() {
    let temp = tempdir().unwrap();
    let mut recipe = seeded_recipe(temp.path());
    recipe.stages.swap(0, 1);

    let report = validate_recipe(&recipe);

    assert!(!report.is_ok());
    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("feature_preparation") && e.contains("produced later")),
        "{:?}",
        report.errors
    );
}

#[test]
fn duplicate_names_and_writers_are_reported() {
    let temp = tempdir().unwrap();
    let mut recipe = seeded_recipe(temp.path());
    let mut copy = recipe.stages[5].clone();
    copy.params.clear();
    recipe.stages.push(copy);

    let report = validate_recipe(&recipe);

    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("used more than once"))
    );
    assert!(report.errors.iter().any(|e| e.contains("written by both")));
}

#[test]
fn missing_notebook_is_only_a_warning() {
    let temp = tempdir().unwrap();
    let recipe = seeded_recipe(temp.path());
    fs::remove_file(temp.path().join("notebooks/arima_forecasting.ipynb")).unwrap();

    let report = validate_recipe(&recipe);

    assert!(report.is_ok());
    assert_eq!(report.warnings.len(), 1);
}

#[test]
fn unsupported_version_and_empty_runtime_fail() {
    let temp = tempdir().unwrap();
    let mut recipe = seeded_recipe(temp.path());
    recipe.version = 2;
    recipe.runtime.kernel = " ".to_string();

    let report = validate_recipe(&recipe);

    assert!(report.errors.iter().any(|e| e.contains("version")));
    assert!(report.errors.iter().any(|e| e.contains("kernel")));
}

#[test]
fn lockfile_records_notebook_digests_and_params() {
    let temp = tempdir().unwrap();
    let recipe = seeded_recipe(temp.path());

    let lock_path = temp.path().join("pipeline.lock");
    generate_lock(&recipe, &lock_path).unwrap();

    let content = fs::read_to_string(&lock_path).unwrap();
    assert!(content.contains("recipe_version: 1"));
    assert!(content.contains("kernel: python3"));
    assert!(content.contains("params_hash"));
    // sha256 of "{}"
    assert!(content.contains("44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"));
    assert_eq!(content.matches("- name:").count(), 6);
    assert!(!content.contains(&*temp.path().to_string_lossy()));
}

#[test]
fn lockfile_leaves_digest_empty_for_missing_notebook() {
    let temp = tempdir().unwrap();
    let recipe = seeded_recipe(temp.path());
    fs::remove_file(temp.path().join("notebooks/arima_forecasting.ipynb")).unwrap();

    let lock_path = temp.path().join("pipeline.lock");
    generate_lock(&recipe, &lock_path).unwrap();

    let content = fs::read_to_string(&lock_path).unwrap();
    assert_eq!(content.matches("notebook_sha256: null").count(), 1);
}

#[cfg(unix)]
#[test]
fn lockfile_reports_unreadable_notebook() {
    let temp = tempdir().unwrap();
    let recipe = seeded_recipe(temp.path());
    let notebook = temp.path().join("notebooks/arima_forecasting.ipynb");
    fs::remove_file(&notebook).unwrap();
    fs::create_dir(&notebook).unwrap();

    let lock_path = temp.path().join("pipeline.lock");
    let err = generate_lock(&recipe, &lock_path).unwrap_err();

    assert!(format!("{err:#}").contains("arima_forecasting.ipynb"));
    assert!(!lock_path.exists());
}
