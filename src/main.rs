use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use nbpipe::artifacts::ArtifactManifest;
use nbpipe::lockfile::generate_lock;
use nbpipe::observability::log_snapshot;
#[cfg(feature = "metrics-server")]
use nbpipe::observability::server::MetricsServer;
use nbpipe::pipeline::{StagePhase, StageProgress, build_pipeline};
use nbpipe::presets::{self, generate_preset};
use nbpipe::recipe::Recipe;
use nbpipe::validation::validate_recipe;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

const BANNER_WIDTH: usize = 60;

fn main() -> Result<()> {
    let Cli { command } = Cli::parse();

    let otlp_endpoint_for_tracing = match &command {
        Commands::Run(args) => args.otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result = match command {
        Commands::Run(args) => run_recipe(args),
        Commands::ListStages { recipe } => list_stages(recipe.as_deref()),
        Commands::Validate { recipe } => validate_recipe_cmd(&recipe),
        Commands::Lock { recipe, output } => lock_recipe(&recipe, &output),
        Commands::Recipe { action } => recipe_command(action),
        Commands::Digest {
            recipe,
            output,
            compare,
        } => digest_command(recipe.as_deref(), output, compare),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "nbpipe", &mut io::stdout());
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "nbpipe")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
            return Ok(());
        }
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
            endpoint
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

/// Recipe from disk, or the built-in air-quality pipeline when none is given.
fn load_recipe(path: Option<&Path>) -> Result<Recipe> {
    match path {
        Some(path) => Recipe::load(path),
        None => Ok(presets::air_quality()),
    }
}

fn run_recipe(args: RunArgs) -> Result<()> {
    let mut recipe = load_recipe(args.recipe.as_deref())?;
    if let Some(kernel) = args.kernel {
        recipe.runtime.kernel = kernel;
    }
    if let Some(quiescence_ms) = args.quiescence_ms {
        recipe.runtime.quiescence_ms = quiescence_ms;
    }
    if let Some(workdir) = args.workdir {
        recipe.runtime.workdir = workdir;
    }

    let report = validate_recipe(&recipe);
    for warning in &report.warnings {
        warn!("{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!("{error_msg}");
        }
        bail!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        );
    }

    let mut runner = build_pipeline(&recipe)?;

    if args.dry_run {
        info!(
            kernel = recipe.runtime.kernel.as_str(),
            engine = recipe.runtime.engine.program.as_str(),
            quiescence_ms = runner.barrier().delay().as_millis() as u64,
            stages = %runner.registry().known_stages().join(" -> "),
            "Loaded recipe with {} stage(s)",
            runner.registry().len()
        );
        for (idx, stage) in runner.registry().stages().iter().enumerate() {
            info!(
                index = idx + 1,
                stage = stage.name.as_str(),
                notebook = %stage.notebook.display(),
                output = %stage.output_path.display(),
                params = stage.params.len(),
                "Planned stage"
            );
        }
        return Ok(());
    }

    let metrics_handle = runner.metrics();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = args.metrics_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, metrics_handle.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = args.metrics_listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let run_result = runner.run_with_progress(print_banner);

    let snapshot = metrics_handle.snapshot();
    if args.print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = args.metrics_json {
        create_parent_dir(&path)?;
        let file = File::create(&path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = args.metrics_prometheus {
        create_parent_dir(&path)?;
        std::fs::write(&path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    let run_report = run_result?;

    if let Some(path) = args.artifact_manifest {
        let manifest = ArtifactManifest::collect(runner.registry())?;
        manifest.write(&path)?;
        info!(manifest = %path.display(), "Artifact manifest written");
    }

    println!();
    println!("{}", "=".repeat(BANNER_WIDTH));
    println!(
        "[OK] Pipeline finished: {} stage(s) in {:.1}s",
        run_report.outcomes.len(),
        run_report.total_duration.as_secs_f64()
    );
    println!("{}", "=".repeat(BANNER_WIDTH));

    Ok(())
}

fn print_banner(progress: StageProgress<'_>) {
    match progress.phase {
        StagePhase::Starting => {
            println!();
            println!("{}", "=".repeat(BANNER_WIDTH));
            println!(
                "[{}/{}] Running: {}",
                progress.stage_index + 1,
                progress.total_stages,
                progress.stage.notebook.display()
            );
            println!("{}", "=".repeat(BANNER_WIDTH));
        }
        StagePhase::Completed(outcome) => {
            println!("[OK] Completed: {}", outcome.output_path.display());
        }
        StagePhase::Failed(err) => {
            println!("[FAILED] {}: {err}", progress.stage.name);
        }
    }
}

fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn list_stages(recipe_path: Option<&Path>) -> Result<()> {
    let recipe = load_recipe(recipe_path)?;
    println!("Pipeline stages:");
    for (idx, stage) in recipe.stages.iter().enumerate() {
        let input = stage
            .input_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>2}. {} ({} <- {})",
            idx + 1,
            stage.name,
            stage.notebook.display(),
            input
        );
    }
    Ok(())
}

fn validate_recipe_cmd(recipe_path: &Path) -> Result<()> {
    let recipe = Recipe::load(recipe_path)?;
    let report = validate_recipe(&recipe);

    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %recipe_path.display(), "Recipe validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %recipe_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn lock_recipe(recipe_path: &Path, output_path: &Path) -> Result<()> {
    let recipe = Recipe::load(recipe_path)?;
    let report = validate_recipe(&recipe);

    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }

    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %recipe_path.display(), "{error_msg}");
        }
        return Err(anyhow!(
            "Cannot generate lockfile due to {} validation error(s)",
            report.errors.len()
        ));
    }

    create_parent_dir(output_path)?;
    generate_lock(&recipe, output_path)?;
    info!(
        lockfile = %output_path.display(),
        "Lockfile generated successfully"
    );

    Ok(())
}

fn recipe_command(command: RecipeCommands) -> Result<()> {
    match command {
        RecipeCommands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("recipes/{preset}.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset recipe generated"
            );
            Ok(())
        }
        RecipeCommands::Lint { recipes } => lint_recipes(&recipes),
        RecipeCommands::Diff { lhs, rhs } => diff_recipes(&lhs, &rhs),
    }
}

fn lint_recipes(recipes: &[PathBuf]) -> Result<()> {
    if recipes.is_empty() {
        bail!("No recipe files supplied for linting");
    }

    let mut failures = 0usize;

    for recipe_path in recipes {
        match Recipe::load(recipe_path) {
            Ok(recipe) => {
                let report = validate_recipe(&recipe);
                for warning in &report.warnings {
                    warn!(file = %recipe_path.display(), "{warning}");
                }
                if report.is_ok() {
                    info!(file = %recipe_path.display(), "Lint passed");
                } else {
                    failures += 1;
                    for error_msg in &report.errors {
                        error!(file = %recipe_path.display(), "{error_msg}");
                    }
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %recipe_path.display(), "Failed to load recipe: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} recipe(s)");
    }

    info!("All recipe lint checks passed");
    Ok(())
}

fn diff_recipes(lhs: &Path, rhs: &Path) -> Result<()> {
    let left = Recipe::load(lhs)?;
    let right = Recipe::load(rhs)?;

    let mut differences = Vec::new();

    if left.version != right.version {
        differences.push(format!(
            "Version mismatch: {} vs {}",
            left.version, right.version
        ));
    }

    if left.runtime != right.runtime {
        differences.push(format!(
            "Runtime differs: {} vs {}",
            serde_json::to_string(&left.runtime).unwrap_or_else(|_| "<invalid>".into()),
            serde_json::to_string(&right.runtime).unwrap_or_else(|_| "<invalid>".into())
        ));
    }

    let min_len = left.stages.len().min(right.stages.len());
    if left.stages.len() != right.stages.len() {
        differences.push(format!(
            "Stage count differs: {} vs {}",
            left.stages.len(),
            right.stages.len()
        ));
    }

    for (idx, (l_stage, r_stage)) in left
        .stages
        .iter()
        .zip(right.stages.iter())
        .enumerate()
    {
        if l_stage.name != r_stage.name {
            differences.push(format!(
                "Stage {} name differs: '{}' vs '{}'",
                idx + 1,
                l_stage.name,
                r_stage.name
            ));
        }
        if l_stage.notebook != r_stage.notebook {
            differences.push(format!(
                "Stage {} ('{}') notebook differs: '{}' vs '{}'",
                idx + 1,
                l_stage.name,
                l_stage.notebook.display(),
                r_stage.notebook.display()
            ));
        }
        if l_stage.input_path != r_stage.input_path
            || l_stage.output_path != r_stage.output_path
            || l_stage.produces != r_stage.produces
        {
            differences.push(format!(
                "Stage {} ('{}') artifact contract differs",
                idx + 1,
                l_stage.name
            ));
        }
        if l_stage.params != r_stage.params {
            differences.push(format!(
                "Stage {} ('{}') parameters differ: {} vs {}",
                idx + 1,
                l_stage.name,
                serde_json::to_string(&l_stage.params).unwrap_or_else(|_| "<invalid>".into()),
                serde_json::to_string(&r_stage.params).unwrap_or_else(|_| "<invalid>".into())
            ));
        }
    }

    for (side, stages) in [("left", &left.stages), ("right", &right.stages)] {
        for (extra_idx, stage) in stages[min_len..].iter().enumerate() {
            differences.push(format!(
                "Extra stage in {side} recipe at position {}: '{}'",
                min_len + extra_idx + 1,
                stage.name
            ));
        }
    }

    if differences.is_empty() {
        info!(
            left = %lhs.display(),
            right = %rhs.display(),
            "Recipes are equivalent"
        );
        println!("Recipes match: {} == {}", lhs.display(), rhs.display());
        Ok(())
    } else {
        println!(
            "Recipe differences between '{}' and '{}':",
            lhs.display(),
            rhs.display()
        );
        for diff in &differences {
            println!("- {diff}");
        }
        bail!("Recipes differ ({} difference(s) found)", differences.len());
    }
}

fn digest_command(
    recipe_path: Option<&Path>,
    output: Option<PathBuf>,
    compare: Option<PathBuf>,
) -> Result<()> {
    let recipe = load_recipe(recipe_path)?;
    let manifest = ArtifactManifest::collect(&recipe.registry()?)?;

    for entry in &manifest.entries {
        println!(
            "{}  {}",
            entry.sha256.as_deref().unwrap_or("-"),
            entry.path.display()
        );
    }

    if let Some(path) = output {
        manifest.write(&path)?;
        info!(manifest = %path.display(), "Artifact manifest written");
    }

    if let Some(baseline_path) = compare {
        let baseline = ArtifactManifest::load(&baseline_path)?;
        let differences = manifest.differences(&baseline);
        if !differences.is_empty() {
            for diff in &differences {
                println!("- {diff}");
            }
            bail!(
                "Artifacts differ from baseline {} ({} difference(s))",
                baseline_path.display(),
                differences.len()
            );
        }
        info!(baseline = %baseline_path.display(), "Artifacts match baseline");
    }

    Ok(())
}

#[derive(Parser)]
#[command(
    name = "nbpipe",
    version,
    about = "Sequential notebook pipeline driver"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage in order; the first failure aborts the run
    Run(RunArgs),
    ListStages {
        recipe: Option<PathBuf>,
    },
    Validate {
        recipe: PathBuf,
    },
    Lock {
        recipe: PathBuf,
        output: PathBuf,
    },
    Recipe {
        #[command(subcommand)]
        action: RecipeCommands,
    },
    /// Hash every declared artifact
    Digest {
        recipe: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        compare: Option<PathBuf>,
    },
    Completions {
        shell: Shell,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Recipe file; defaults to the built-in air-quality pipeline
    recipe: Option<PathBuf>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
    #[arg(long = "metrics-listen")]
    metrics_listen: Option<String>,
    #[arg(long = "otlp-endpoint")]
    otlp_endpoint: Option<String>,
    #[arg(long = "artifact-manifest")]
    artifact_manifest: Option<PathBuf>,
    #[arg(long)]
    kernel: Option<String>,
    #[arg(long = "quiescence-ms")]
    quiescence_ms: Option<u64>,
    #[arg(long)]
    workdir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum RecipeCommands {
    New {
        #[arg(long, default_value = "air-quality")]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Lint {
        #[arg(required = true)]
        recipes: Vec<PathBuf>,
    },
    Diff {
        lhs: PathBuf,
        rhs: PathBuf,
    },
}
