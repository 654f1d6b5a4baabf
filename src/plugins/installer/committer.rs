use anyhow::Context;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::plugins::registry::{CommitOutcome, InstallJob, PackageCommitter, UninstallJob};

const ENOSPC: i32 = 28;

/// Commits splits by moving them into a local install directory.
#[derive(Debug, Clone)]
pub struct DirectoryCommitter {
    install_dir: PathBuf,
    require_confirmation: bool,
}

impl DirectoryCommitter {
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self { install_dir: install_dir.into(), require_confirmation: false }
    }

    /// Every commit and removal needs an explicit user approval first.
    pub fn with_confirmation(mut self, required: bool) -> Self {
        self.require_confirmation = required;
        self
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    fn place(artifact: &Path, target: &Path) -> io::Result<()> {
        match fs::rename(artifact, target) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(ENOSPC) => Err(e),
            // Cross-device moves fall back to copy + remove.
            Err(_) => {
                fs::copy(artifact, target)?;
                fs::remove_file(artifact)
            }
        }
    }
}

fn belongs_to(stem: &str, job: &UninstallJob) -> bool {
    job.modules
        .iter()
        .any(|m| stem == m || stem.strip_prefix(m.as_str()).map_or(false, |rest| rest.starts_with('.')))
        || job.languages.iter().any(|l| stem.ends_with(&format!("config.{}", l)))
}

impl PackageCommitter for DirectoryCommitter {
    fn commit(&self, job: &InstallJob) -> anyhow::Result<CommitOutcome> {
        if self.require_confirmation && !job.user_confirmed {
            return Ok(CommitOutcome::NeedsConfirmation);
        }
        fs::create_dir_all(&self.install_dir)
            .with_context(|| format!("create install dir {}", self.install_dir.display()))?;

        for artifact in &job.artifacts {
            let name = artifact
                .file_name()
                .with_context(|| format!("artifact without file name: {}", artifact.display()))?;
            let target = self.install_dir.join(name);
            match Self::place(artifact, &target) {
                Ok(()) => debug!(from = %artifact.display(), to = %target.display(), "split placed"),
                Err(e) if e.raw_os_error() == Some(ENOSPC) => return Ok(CommitOutcome::InsufficientStorage),
                Err(e) => {
                    return Err(e).with_context(|| format!("place {} into {}", artifact.display(), target.display()))
                }
            }
        }
        info!(session_id = job.session_id, count = job.artifacts.len(), dir = %self.install_dir.display(), "splits committed");
        Ok(CommitOutcome::Committed)
    }

    fn remove(&self, job: &UninstallJob) -> anyhow::Result<CommitOutcome> {
        if self.require_confirmation && !job.user_confirmed {
            return Ok(CommitOutcome::NeedsConfirmation);
        }
        let entries = match fs::read_dir(&self.install_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CommitOutcome::Committed),
            Err(e) => return Err(e).with_context(|| format!("list {}", self.install_dir.display())),
        };

        let mut removed = 0usize;
        for entry in entries {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.is_file() && belongs_to(stem, job) {
                fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
                removed += 1;
            }
        }
        info!(session_id = job.session_id, removed, "splits removed");
        Ok(CommitOutcome::Committed)
    }
}
