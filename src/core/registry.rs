use crate::core::error::SplitInstallError;
use crate::core::model::{InstallRequest, SessionId, NO_OP_SESSION_ID};
use crate::core::task::InstallTask;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Active tasks. A task is present from acceptance until it reaches a
/// terminal state.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<Vec<Arc<InstallTask>>>,
}

impl TaskRegistry {
    /// Registers `task` unless an active task of the same kind already covers
    /// it or is covered by it. The check and the insert happen under one lock.
    pub fn try_register(&self, task: Arc<InstallTask>) -> Result<(), SplitInstallError> {
        let mut tasks = self.tasks.lock();
        if let Some(existing) = tasks.iter().find(|t| overlaps(t.request(), task.request())) {
            return Err(SplitInstallError::active_sessions_limit_exceeded(
                existing.reserved_session_id(),
            ));
        }
        tasks.push(task);
        Ok(())
    }

    pub fn unregister(&self, key: Uuid) -> bool {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|t| t.key() != key);
        tasks.len() != before
    }

    pub fn list_all(&self) -> Vec<Arc<InstallTask>> {
        self.tasks.lock().clone()
    }

    /// Matches against each task's published state, so a task whose id has
    /// not been assigned yet is not found.
    pub fn find_by_session_id(&self, session_id: SessionId) -> Option<Arc<InstallTask>> {
        if session_id == NO_OP_SESSION_ID {
            return None;
        }
        // Snapshot first: task state locks are never taken under the registry lock.
        self.list_all()
            .into_iter()
            .find(|t| t.state().session_id() == session_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

fn overlaps(existing: &InstallRequest, new: &InstallRequest) -> bool {
    existing.is_uninstall() == new.is_uninstall() && (existing.covers(new) || new.covers(existing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ErrorCode;
    use crate::core::testing::{test_context, ScriptedDownloader};

    fn request(modules: &[&str]) -> InstallRequest {
        InstallRequest::builder().modules(modules.iter().copied()).build()
    }

    #[tokio::test]
    async fn rejects_covering_and_covered_requests() {
        let (ctx, _d, _dir) = test_context(ScriptedDownloader::hanging());
        let registry = TaskRegistry::default();
        registry
            .try_register(InstallTask::new(request(&["a", "b"]), 1, ctx.clone()))
            .unwrap();

        let subset = registry.try_register(InstallTask::new(request(&["a"]), 2, ctx.clone()));
        assert_eq!(subset.unwrap_err().error_code(), ErrorCode::ActiveSessionsLimitExceeded);

        let superset = registry.try_register(InstallTask::new(request(&["a", "b", "c"]), 3, ctx.clone()));
        assert_eq!(superset.unwrap_err().error_code(), ErrorCode::ActiveSessionsLimitExceeded);

        registry
            .try_register(InstallTask::new(request(&["b", "c"]), 4, ctx.clone()))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn uninstalls_do_not_collide_with_installs() {
        let (ctx, _d, _dir) = test_context(ScriptedDownloader::hanging());
        let registry = TaskRegistry::default();
        registry.try_register(InstallTask::new(request(&["a"]), 1, ctx.clone())).unwrap();
        let uninstall = InstallRequest::builder().module("a").uninstall(true).build();
        registry.try_register(InstallTask::new(uninstall, 2, ctx)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn unassigned_ids_are_not_found() {
        let (ctx, _d, _dir) = test_context(ScriptedDownloader::hanging());
        let registry = TaskRegistry::default();
        let task = InstallTask::new(request(&["a"]), 5, ctx);
        registry.try_register(task.clone()).unwrap();

        assert!(registry.find_by_session_id(0).is_none());
        assert!(registry.find_by_session_id(5).is_none());

        task.start();
        task.accepted().await.unwrap();
        assert_eq!(registry.find_by_session_id(5).map(|t| t.key()), Some(task.key()));

        assert!(registry.unregister(task.key()));
        assert!(!registry.unregister(task.key()));
        assert!(registry.is_empty());
    }
}
