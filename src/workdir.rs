//! Per-worker scratch directories.
//!
//! Each worker owns one directory named after its id, created lazily on first
//! use. A task's attached files are written into it before the runner starts
//! and removed when the [`Materialized`] guard drops, whatever the runner's
//! outcome. Subdirectories created for them are removed too, once empty.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Files, WorkerId};

pub struct ScratchDir {
    dir: PathBuf,
    created: bool,
}

impl ScratchDir {
    pub fn for_worker(base: &Path, worker: WorkerId) -> Self {
        Self {
            dir: base.join(worker.to_string()),
            created: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Write `files` into the scratch directory.
    ///
    /// If any write fails, files already written are removed before the
    /// error is returned.
    pub fn materialize(&mut self, files: &Files) -> Result<Materialized<'_>> {
        if !self.created {
            std::fs::create_dir_all(&self.dir)?;
            self.created = true;
            debug!(dir = %self.dir.display(), "scratch dir created");
        }

        let mut guard = Materialized {
            dir: &self.dir,
            written: Vec::with_capacity(files.len()),
            created_dirs: Vec::new(),
        };
        for (name, contents) in files {
            let relative = checked_relative(name)?;
            if let Some(parent) = relative.parent() {
                let mut dir = self.dir.clone();
                for component in parent.components() {
                    dir.push(component);
                    if !dir.is_dir() {
                        std::fs::create_dir(&dir)?;
                        guard.created_dirs.push(dir.clone());
                    }
                }
            }
            let path = self.dir.join(relative);
            std::fs::write(&path, contents)?;
            guard.written.push(path);
        }
        Ok(guard)
    }
}

/// Attached filenames must stay inside the scratch directory.
fn checked_relative(name: &str) -> Result<&Path> {
    let path = Path::new(name);
    let mut components = path.components().peekable();
    if components.peek().is_none() {
        return Err(Error::InvalidPath(format!("empty file name {name:?}")));
    }
    if components.all(|c| matches!(c, Component::Normal(_))) {
        Ok(path)
    } else {
        Err(Error::InvalidPath(name.to_string()))
    }
}

/// Files written for one task. Removes them on drop.
pub struct Materialized<'a> {
    dir: &'a Path,
    written: Vec<PathBuf>,
    /// Parents before children.
    created_dirs: Vec<PathBuf>,
}

impl Materialized<'_> {
    pub fn dir(&self) -> &Path {
        self.dir
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.written
    }
}

impl Drop for Materialized<'_> {
    fn drop(&mut self) {
        for path in &self.written {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "cleanup error: {e}"),
            }
        }
        // Anything the runner left behind keeps its directory alive.
        for dir in self.created_dirs.iter().rev() {
            match std::fs::remove_dir(dir) {
                Ok(()) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::DirectoryNotEmpty
                    ) => {}
                Err(e) => warn!(dir = %dir.display(), "cleanup error: {e}"),
            }
        }
    }
}
