use crate::{MigrunError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Default name of the staging directory inside the scripts directory.
pub const DEFAULT_STAGING_DIR: &str = "run_manually";

/// Directory of scripts the operator has to run by hand.
///
/// It is wiped at the start of every run and created again on the first
/// script staged, so an empty run leaves no directory behind.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

/// A script written outside the staging area for one runner invocation.
/// The file is removed when this is dropped.
pub struct WorkingFile {
    _dir: TempDir,
    path: PathBuf,
}

impl WorkingFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Refuse a staging directory that is, or contains, `scripts_dir`, since
    /// `reset` removes it recursively.
    pub fn ensure_outside(&self, scripts_dir: &Path) -> Result<()> {
        let staging = resolve(&self.dir)?;
        let scripts = resolve(scripts_dir)?;
        if scripts.starts_with(&staging) {
            return Err(MigrunError::StagingOverlapsScripts { staging, scripts });
        }
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                debug!("Cleared staging area {}", self.dir.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MigrunError::io(&self.dir, e)),
        }
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| MigrunError::io(&self.dir, e))
    }

    /// Write `text` as `name`, used for rollbacks replayed from the ledger.
    pub fn stage_text(&self, name: &str, text: &str) -> Result<PathBuf> {
        self.ensure_dir()?;
        let target = self.dir.join(name);
        fs::write(&target, text).map_err(|e| MigrunError::io(&target, e))?;
        info!("Staged {} for manual execution", target.display());
        Ok(target)
    }

    /// Copy a script file from the scripts directory.
    pub fn stage_file(&self, source: &Path) -> Result<PathBuf> {
        self.ensure_dir()?;
        let name = source
            .file_name()
            .ok_or_else(|| MigrunError::InvalidScriptName(source.display().to_string()))?;
        let target = self.dir.join(name);
        fs::copy(source, &target).map_err(|e| MigrunError::io(source, e))?;
        info!("Staged {} for manual execution", target.display());
        Ok(target)
    }

    /// Write `text` to a throwaway file named `name` for the runner to execute.
    pub fn working_file(&self, name: &str, text: &str) -> Result<WorkingFile> {
        let dir = tempfile::Builder::new()
            .prefix("migrun-")
            .tempdir()
            .map_err(|e| MigrunError::io(std::env::temp_dir(), e))?;
        let path = dir.path().join(name);
        fs::write(&path, text).map_err(|e| MigrunError::io(&path, e))?;
        Ok(WorkingFile { _dir: dir, path })
    }
}

/// Absolute form of `path` with symlinks resolved for the part that exists.
fn resolve(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| MigrunError::io(path, e))?
            .join(path)
    };

    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return Ok(missing.iter().rev().fold(canonical, |acc, part| acc.join(part)));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(absolute),
        }
    }
}
