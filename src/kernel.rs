use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::debug;

use crate::executor::{ContextLauncher, ExecutionContext, TeardownAck};
use crate::pipeline::{StageDescriptor, StageParameters};
use crate::recipe::RuntimeConfig;

const LOG_TAIL_LINES: usize = 20;

/// Launches one papermill process (and through it one kernel) per stage.
#[derive(Debug, Clone)]
pub struct PapermillLauncher {
    runtime: RuntimeConfig,
}

impl PapermillLauncher {
    pub fn new(runtime: RuntimeConfig) -> Self {
        Self { runtime }
    }
}

impl ContextLauncher for PapermillLauncher {
    fn launch(&self, stage: &StageDescriptor) -> Result<Box<dyn ExecutionContext>> {
        if self.runtime.engine.program.trim().is_empty() {
            bail!("No execution engine configured for stage '{}'", stage.name);
        }
        Ok(Box::new(KernelContext {
            runtime: self.runtime.clone(),
            child: None,
            pid: None,
            exit: None,
        }))
    }
}

pub struct KernelContext {
    runtime: RuntimeConfig,
    child: Option<Child>,
    pid: Option<u32>,
    exit: Option<ExitStatus>,
}

impl KernelContext {
    fn command(&self, stage: &StageDescriptor, log: File) -> Result<Command> {
        let engine = &self.runtime.engine;
        let mut command = Command::new(&engine.program);
        command
            .args(&engine.args)
            .arg(&stage.notebook)
            .arg(&stage.output_path)
            .arg("--kernel")
            .arg(&self.runtime.kernel)
            .arg("--language")
            .arg(&self.runtime.language);
        if !stage.params.is_empty() {
            command
                .arg("--parameters_yaml")
                .arg(render_parameters(&stage.params)?);
        }
        if !self.runtime.workdir.as_os_str().is_empty() {
            command.current_dir(&self.runtime.workdir);
        }
        let stdout = log.try_clone().context("Failed to share stage log handle")?;
        command
            .envs(&self.runtime.env)
            .env("NBPIPE_STAGE", &stage.name)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(log));
        Ok(command)
    }
}

impl ExecutionContext for KernelContext {
    fn run(&mut self, stage: &StageDescriptor) -> Result<()> {
        let log_path = stage_log_path(&stage.output_path);
        let log = File::create(&log_path)
            .with_context(|| format!("Failed to create stage log: {}", log_path.display()))?;
        let mut command = self.command(stage, log)?;
        debug!(?command, log = %log_path.display(), "Spawning execution engine");

        let child = command.spawn().with_context(|| {
            format!(
                "Failed to start execution engine '{}'",
                self.runtime.engine.program
            )
        })?;
        self.pid = Some(child.id());
        let child = self.child.insert(child);
        let status = child
            .wait()
            .context("Failed to wait for execution engine")?;
        self.exit = Some(status);

        if !status.success() {
            let tail = log_tail(&log_path, LOG_TAIL_LINES).unwrap_or_default();
            bail!(
                "{} exited with {} (log: {})\n{}",
                self.runtime.engine.program,
                status,
                log_path.display(),
                tail
            );
        }
        Ok(())
    }

    fn teardown(mut self: Box<Self>) -> Result<TeardownAck> {
        let mut forced = false;
        if let Some(mut child) = self.child.take()
            && self.exit.is_none()
        {
            match child.try_wait().context("Failed to poll execution engine")? {
                Some(status) => self.exit = Some(status),
                None => {
                    child.kill().context("Failed to kill execution engine")?;
                    forced = true;
                    self.exit = Some(child.wait().context("Failed to reap execution engine")?);
                }
            }
        }
        Ok(TeardownAck {
            pid: self.pid,
            exit_code: self.exit.and_then(|status| status.code()),
            forced,
        })
    }
}

/// Parameters as a JSON flow mapping for papermill's YAML loader.
///
/// Strings stay quoted so values like `2017-01-01` reach the notebook as strings.
/// Floats are written in YAML 1.1 form (`1.0e-7`, `1.0e+16`), since PyYAML reads
/// `1e-7` as a string.
pub fn render_parameters(params: &StageParameters) -> Result<String> {
    let mut rendered = String::new();
    write_entries(&mut rendered, params)?;
    Ok(rendered)
}

fn write_entries(out: &mut String, params: &StageParameters) -> Result<()> {
    out.push('{');
    for (idx, (key, value)) in params.iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        let key = serde_json::to_string(key).context("Failed to serialize parameter name")?;
        out.push_str(&key);
        out.push(':');
        write_value(out, value)?;
    }
    out.push('}');
    Ok(())
}

fn write_value(out: &mut String, value: &Value) -> Result<()> {
    match value {
        Value::Number(number) if number.is_f64() => {
            out.push_str(&yaml_float(&number.to_string()));
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => write_entries(out, map)?,
        other => out.push_str(
            &serde_json::to_string(other).context("Failed to serialize stage parameter")?,
        ),
    }
    Ok(())
}

/// YAML 1.1 floats need a dot in the mantissa and a signed exponent.
fn yaml_float(text: &str) -> String {
    let (mantissa, exponent) = match text.find(['e', 'E']) {
        Some(pos) => (&text[..pos], Some(&text[pos + 1..])),
        None => (text, None),
    };
    let mut rendered = mantissa.to_string();
    if !mantissa.contains('.') {
        rendered.push_str(".0");
    }
    if let Some(exponent) = exponent {
        rendered.push('e');
        if !exponent.starts_with(['+', '-']) {
            rendered.push('+');
        }
        rendered.push_str(exponent);
    }
    rendered
}

/// Engine output for a stage lives next to its executed record.
pub fn stage_log_path(output_path: &Path) -> PathBuf {
    let mut name = output_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "stage".into());
    name.push(".log");
    output_path.with_file_name(name)
}

fn log_tail(path: &Path, lines: usize) -> Result<String> {
    let content = fs::read_to_string(path)?;
    let collected: Vec<&str> = content.lines().collect();
    let start = collected.len().saturating_sub(lines);
    Ok(collected[start..].join("\n"))
}
