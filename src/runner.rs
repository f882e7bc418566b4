//! The task runner seam.
//!
//! A runner executes one decoded task descriptor inside a scratch directory
//! holding the task's materialized files and returns a serializable result.
//! Each worker owns its own runner instance.

use std::path::Path;

use serde::Serialize;
use thiserror::Error;

/// Why a runner could not produce a result. The task stays claimed.
#[derive(Debug, Error)]
pub enum RunnerFailure {
    #[error("failed to start runner: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("runner exited with status {code}: {stderr}")]
    Exit { code: i32, stderr: String },

    #[error("unparseable runner output: {0}")]
    BadOutput(String),

    #[error("{0}")]
    Failed(String),
}

pub trait TaskRunner<T>: Send {
    type Output: Serialize;

    /// Run `task` with `workdir` as its working context. Relative paths
    /// inside the descriptor resolve against `workdir`.
    fn run(&mut self, task: &T, workdir: &Path) -> Result<Self::Output, RunnerFailure>;
}

/// Closures are runners, which keeps stubs and one-off pools short.
impl<T, F, O> TaskRunner<T> for F
where
    F: FnMut(&T, &Path) -> Result<O, RunnerFailure> + Send,
    O: Serialize,
{
    type Output = O;

    fn run(&mut self, task: &T, workdir: &Path) -> Result<O, RunnerFailure> {
        self(task, workdir)
    }
}
