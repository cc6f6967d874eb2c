#![cfg(unix)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use nbpipe::error::PipelineError;
use nbpipe::kernel::stage_log_path;
use nbpipe::pipeline::{PipelineRunner, RunState, StageDescriptor, StageParameters, StageRegistry};
use nbpipe::recipe::{EngineSpec, RuntimeConfig};
use serde_json::{Value, json};
use tempfile::tempdir;

// Stands in for papermill: records its argv and copies the notebook to the output path.
const FAKE_ENGINE: &str = r#"
printf '%s\n' "$@" > "$ARGS_DIR/$NBPIPE_STAGE.args"
if [ "$NBPIPE_STAGE" = "$FAIL_STAGE" ]; then
    echo "Traceback: boom in $NBPIPE_STAGE" >&2
    cp "$1" "$2"
    exit 3
fi
cp "$1" "$2"
"#;

fn runtime(root: &Path, fail_stage: &str) -> RuntimeConfig {
    let script = root.join("fake_papermill.sh");
    fs::write(&script, FAKE_ENGINE).unwrap();
    let args_dir = root.join("args");
    fs::create_dir_all(&args_dir).unwrap();

    let mut env = BTreeMap::new();
    env.insert("ARGS_DIR".to_string(), args_dir.to_string_lossy().to_string());
    env.insert("FAIL_STAGE".to_string(), fail_stage.to_string());
    RuntimeConfig {
        kernel: "pm25-env".to_string(),
        engine: EngineSpec {
            program: "sh".to_string(),
            args: vec![script.to_string_lossy().to_string()],
        },
        quiescence_ms: 0,
        workdir: root.to_path_buf(),
        env,
        ..RuntimeConfig::default()
    }
}

fn stage(root: &Path, name: &str, params: Value) -> StageDescriptor {
    let notebook = root.join(format!("{name}.ipynb"));
    fs::write(&notebook, format!("{{\"stage\": \"{name}\"}}")).unwrap();
    StageDescriptor {
        name: name.to_string(),
        notebook,
        input_path: None,
        output_path: root.join("runs").join(format!("{name}_run.ipynb")),
        produces: Vec::new(),
        params: match params {
            Value::Object(map) => map,
            _ => StageParameters::new(),
        },
    }
}

fn recorded_args(root: &Path, stage: &str) -> Vec<String> {
    fs::read_to_string(root.join("args").join(format!("{stage}.args")))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

fn value_after(args: &[String], flag: &str) -> Option<String> {
    let idx = args.iter().position(|arg| arg == flag)?;
    args.get(idx + 1).cloned()
}

#[test]
fn engine_receives_papermill_arguments_and_raw_parameters() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    let classify = stage(
        root,
        "classification_modelling",
        json!({
            "CUTOFF": "2017-01-01",
            "LAG_HOURS": [1, 3, 24],
            "TOL": 1e-7,
            "USE_UCIMLREPO": false
        }),
    );
    let expected_params = classify.params.clone();
    let registry = StageRegistry::from_descriptors([classify.clone()]).unwrap();
    let mut runner = PipelineRunner::new(registry, &runtime(root, ""));

    let report = runner.run().unwrap();

    assert_eq!(runner.state(), &RunState::Completed);
    let teardown = report.outcomes[0].teardown.clone().unwrap();
    assert_eq!(teardown.exit_code, Some(0));
    assert!(!teardown.forced);
    assert!(classify.output_path.is_file());

    let args = recorded_args(root, "classification_modelling");
    assert_eq!(PathBuf::from(&args[0]), classify.notebook);
    assert_eq!(PathBuf::from(&args[1]), classify.output_path);
    assert_eq!(value_after(&args, "--kernel").as_deref(), Some("pm25-env"));
    assert_eq!(value_after(&args, "--language").as_deref(), Some("python"));
    let raw_params = value_after(&args, "--parameters_yaml").unwrap();
    assert!(raw_params.contains("\"TOL\":1.0e-7"), "{raw_params}");
    let injected: StageParameters = serde_json::from_str(&raw_params).unwrap();
    assert_eq!(injected, expected_params);
    assert_eq!(injected["CUTOFF"], json!("2017-01-01"));
}

#[test]
fn stage_without_parameters_gets_no_parameter_flag() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    let registry =
        StageRegistry::from_descriptors([stage(root, "comparison", json!({}))]).unwrap();
    let mut runner = PipelineRunner::new(registry, &runtime(root, ""));

    runner.run().unwrap();

    let args = recorded_args(root, "comparison");
    assert!(!args.iter().any(|arg| arg == "--parameters_yaml"));
}

#[test]
fn engine_failure_keeps_record_and_log_and_stops_the_run() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    let first = stage(root, "regression_modelling", json!({"HORIZON": 1}));
    let second = stage(root, "arima_forecasting", json!({"IC": "aic"}));
    let third = stage(root, "comparison", json!({}));
    let registry =
        StageRegistry::from_descriptors([first.clone(), second.clone(), third]).unwrap();
    let mut runner = PipelineRunner::new(registry, &runtime(root, "arima_forecasting"));

    let err = runner.run().unwrap_err();

    match &err {
        PipelineError::StageExecution { stage, .. } => assert_eq!(stage, "arima_forecasting"),
        other => panic!("unexpected error: {other:?}"),
    }
    let message = err.to_string();
    assert!(message.contains("boom in arima_forecasting"), "{message}");
    assert!(first.output_path.is_file());
    assert!(second.output_path.is_file());
    assert!(stage_log_path(&second.output_path).is_file());
    assert!(!root.join("args").join("comparison.args").exists());

    let snapshot = runner.metrics().snapshot();
    assert_eq!(snapshot.contexts_launched, 2);
    assert_eq!(snapshot.contexts_released, 2);
}

#[test]
fn unknown_engine_is_a_stage_failure() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    let registry =
        StageRegistry::from_descriptors([stage(root, "preprocessing", json!({}))]).unwrap();
    let mut runtime = runtime(root, "");
    runtime.engine = EngineSpec {
        program: "nbpipe-no-such-engine".to_string(),
        args: Vec::new(),
    };
    let mut runner = PipelineRunner::new(registry, &runtime);

    let err = runner.run().unwrap_err();

    assert!(matches!(err, PipelineError::StageExecution { .. }));
    assert!(err.to_string().contains("nbpipe-no-such-engine"));
    assert_eq!(runner.metrics().snapshot().contexts_released, 1);
}
