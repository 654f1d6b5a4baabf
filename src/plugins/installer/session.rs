use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::model::{ErrorCode, InstallStatus, ResolutionIntent, SessionId};
use crate::plugins::registry::{
    CommitOutcome, InstallJob, PackageCommitter, SplitInstaller, StatusSink, UninstallJob,
};

type CommitOp<C, J> = fn(&C, &J) -> anyhow::Result<CommitOutcome>;

/// Drives one platform install session per call: reports `Installing`, runs
/// the blocking commit once and maps the outcome to exactly one closing
/// [`InstallStatus`]. A deferred commit closes with `Pending`; re-polling is
/// left to the caller.
pub struct SessionInstaller<C: PackageCommitter> {
    committer: Arc<C>,
}

impl<C: PackageCommitter + 'static> SessionInstaller<C> {
    pub fn new(committer: C) -> Self {
        Self { committer: Arc::new(committer) }
    }

    pub fn committer(&self) -> &C {
        &self.committer
    }

    async fn settle<J>(&self, session_id: SessionId, job: J, op: CommitOp<C, J>, done: InstallStatus) -> InstallStatus
    where
        J: Send + 'static,
    {
        let committer = self.committer.clone();
        let outcome = match tokio::task::spawn_blocking(move || op(&committer, &job)).await {
            Ok(Ok(o)) => o,
            Ok(Err(e)) => {
                return InstallStatus::Failed {
                    code: ErrorCode::InternalError,
                    reason: format!("{:#}", e),
                }
            }
            Err(e) => {
                return InstallStatus::Failed {
                    code: ErrorCode::ServiceDied,
                    reason: format!("package service died: {}", e),
                }
            }
        };

        match outcome {
            CommitOutcome::Committed => done,
            CommitOutcome::Deferred => {
                debug!(session_id, "commit deferred");
                InstallStatus::Pending
            }
            CommitOutcome::NeedsConfirmation => InstallStatus::RequiresUserPermission {
                intent: ResolutionIntent::new(session_id),
            },
            CommitOutcome::Rejected(reason) => InstallStatus::Failed {
                code: ErrorCode::InternalError,
                reason,
            },
            CommitOutcome::ServiceDied => InstallStatus::Failed {
                code: ErrorCode::ServiceDied,
                reason: "package service died".to_string(),
            },
            CommitOutcome::InsufficientStorage => InstallStatus::Failed {
                code: ErrorCode::InsufficientStorage,
                reason: "not enough storage to commit".to_string(),
            },
            CommitOutcome::Aborted => InstallStatus::Canceled,
        }
    }
}

async fn remove_artifacts(artifacts: &[PathBuf]) {
    for path in artifacts {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "artifact not removed");
            }
        }
    }
}

#[async_trait]
impl<C: PackageCommitter + 'static> SplitInstaller for SessionInstaller<C> {
    fn name(&self) -> &'static str {
        "session-installer"
    }

    async fn install(&self, job: InstallJob, sink: StatusSink<InstallStatus>) {
        if job.artifacts.is_empty() {
            let _ = sink.send(InstallStatus::Failed {
                code: ErrorCode::InternalError,
                reason: "no artifacts to install".to_string(),
            });
            return;
        }
        let _ = sink.send(InstallStatus::Installing);

        let session_id = job.session_id;
        let artifacts = job.artifacts.clone();
        info!(session_id, count = artifacts.len(), confirmed = job.user_confirmed, "committing artifacts");
        let status = self.settle(session_id, job, |c, j| c.commit(j), InstallStatus::Installed).await;

        // Artifacts stay on disk while the user decides or the commit is retried.
        if !matches!(status, InstallStatus::RequiresUserPermission { .. } | InstallStatus::Pending) {
            remove_artifacts(&artifacts).await;
        }
        let _ = sink.send(status);
    }

    async fn uninstall(&self, job: UninstallJob, sink: StatusSink<InstallStatus>) {
        let _ = sink.send(InstallStatus::Uninstalling);
        let session_id = job.session_id;
        info!(session_id, modules = ?job.modules, languages = ?job.languages, "removing splits");
        let status = self.settle(session_id, job, |c, j| c.remove(j), InstallStatus::Uninstalled).await;
        let _ = sink.send(status);
    }
}
