//! Built-in subprocess runner.
//!
//! [`CommandTask`] carries the argument list for one invocation.
//! [`CommandRunner`] spawns the configured program with those arguments and
//! the worker's scratch directory as its current directory, then parses its
//! stdout as the task result.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::codec::Tagged;
use crate::error::{Error, Result};
use crate::runner::{RunnerFailure, TaskRunner};

// ---------------------------------------------------------------------------
// Task descriptor
// ---------------------------------------------------------------------------

/// Arguments appended to the runner's configured command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTask {
    pub args: Vec<String>,
}

impl Tagged for CommandTask {
    const TAG: &'static str = "command";
}

/// Task kinds that can be executed by [`CommandRunner`].
pub trait CommandArgs {
    fn command_args(&self) -> &[String];
}

impl CommandArgs for CommandTask {
    fn command_args(&self) -> &[String] {
        &self.args
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How the child's stdout becomes a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// A single JSON document.
    #[default]
    Json,
    /// One JSON object per line, collected into an array in output order.
    JsonLines,
    /// A header row, then one record per row. Each record becomes an object
    /// of string fields keyed by the header.
    Csv,
}

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct RunnerFile {
    runner: RunnerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub format: OutputFormat,
}

impl RunnerConfig {
    /// Load the `[runner]` table from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read runner config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad runner config {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: RunnerFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        Ok(file.runner)
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CommandRunner {
    config: RunnerConfig,
}

impl CommandRunner {
    /// A relative program path like `bin/analyze` is resolved against the
    /// current directory now, since the child starts in the scratch
    /// directory. Bare names are left for `PATH` lookup.
    pub fn new(mut config: RunnerConfig) -> Result<Self> {
        let program = &config.program;
        let has_dir = program.components().count() > 1
            || program.components().next() == Some(Component::CurDir);
        if program.is_relative() && has_dir {
            let absolute = std::env::current_dir()?.join(program);
            config.program = absolute;
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn parse(&self, stdout: &str) -> std::result::Result<Value, RunnerFailure> {
        match self.config.format {
            OutputFormat::Json => serde_json::from_str(stdout)
                .map_err(|e| RunnerFailure::BadOutput(format!("stdout is not JSON: {e}"))),
            OutputFormat::JsonLines => stdout
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(n, line)| match serde_json::from_str(line) {
                    Ok(record @ Value::Object(_)) => Ok(record),
                    Ok(_) => Err(RunnerFailure::BadOutput(format!(
                        "line {} is not a JSON object",
                        n + 1
                    ))),
                    Err(e) => Err(RunnerFailure::BadOutput(format!("line {}: {e}", n + 1))),
                })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            OutputFormat::Csv => csv_records(stdout),
        }
    }
}

fn csv_records(stdout: &str) -> std::result::Result<Value, RunnerFailure> {
    let bad = |e: csv::Error| RunnerFailure::BadOutput(format!("stdout is not CSV: {e}"));
    let mut reader = csv::Reader::from_reader(stdout.as_bytes());
    let headers = reader.headers().map_err(bad)?.clone();
    reader
        .records()
        .map(|record| -> std::result::Result<Value, RunnerFailure> {
            let record = record.map_err(bad)?;
            Ok(Value::Object(
                headers
                    .iter()
                    .zip(record.iter())
                    .map(|(key, field)| (key.to_string(), Value::String(field.to_string())))
                    .collect(),
            ))
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map(Value::Array)
}

impl<T: CommandArgs> TaskRunner<T> for CommandRunner {
    type Output = Value;

    fn run(&mut self, task: &T, workdir: &Path) -> std::result::Result<Value, RunnerFailure> {
        debug!(
            program = %self.config.program.display(),
            args = ?task.command_args(),
            workdir = %workdir.display(),
            "running command"
        );

        let output = Command::new(&self.config.program)
            .args(&self.config.args)
            .args(task.command_args())
            .envs(&self.config.env)
            .env("BATCHQ_WORKDIR", workdir)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .output()
            .map_err(RunnerFailure::Spawn)?;

        if !output.status.success() {
            return Err(RunnerFailure::Exit {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|e| RunnerFailure::BadOutput(format!("stdout is not UTF-8: {e}")))?;
        self.parse(&stdout)
    }
}
