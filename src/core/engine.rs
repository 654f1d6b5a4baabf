use crate::core::catalog::SplitCatalog;
use crate::core::config::{ConfigProvider, EngineSettings};
use crate::core::error::SplitInstallError;
use crate::core::events::{EngineEvent, ListenerId, ListenerSet, SessionStateListener};
use crate::core::model::*;
use crate::core::registry::TaskRegistry;
use crate::core::runner::{BackgroundRunner, CallbackContext};
use crate::core::session::SessionState;
use crate::core::task::{InstallTask, TaskContext};
use crate::plugins::registry::PluginRegistry;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Entry point for install, uninstall, cancel and query operations.
#[derive(Clone)]
pub struct Engine {
    ctx: TaskContext,
    registry: Arc<TaskRegistry>,
    next_session_id: Arc<AtomicI32>,
    accepting: Arc<AtomicBool>,
}

impl Engine {
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        plugins: PluginRegistry,
        catalog: Arc<SplitCatalog>,
        settings: EngineSettings,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(settings.event_capacity);
        let registry = Arc::new(TaskRegistry::default());
        info!(plugins = %plugins.describe(), staging = %settings.staging_dir.display(), "engine ready");

        Self {
            ctx: TaskContext {
                config,
                plugins,
                runner: BackgroundRunner::new(CallbackContext::spawn()),
                registry: Arc::downgrade(&registry),
                global_listeners: Arc::new(ListenerSet::default()),
                events: event_tx,
                catalog,
                settings,
            },
            registry,
            next_session_id: Arc::new(AtomicI32::new(1)),
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }

    pub fn catalog(&self) -> &Arc<SplitCatalog> {
        &self.ctx.catalog
    }

    /// Validates and registers a task without starting it, so task-local
    /// listeners can be attached before the first transition. `Ok(None)` means
    /// there is nothing to do.
    pub fn prepare(&self, request: InstallRequest) -> Result<Option<Arc<InstallTask>>, SplitInstallError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SplitInstallError::api_not_available());
        }
        if let Some(module) = self.ctx.catalog.first_unknown(&request) {
            return Err(SplitInstallError::module_unavailable(module));
        }

        let nothing_to_do = if request.is_empty() {
            true
        } else if request.is_uninstall() {
            self.ctx.catalog.lacks_all(&request)
        } else {
            !request.include_missing_base_splits() && self.ctx.catalog.satisfies(&request)
        };
        if nothing_to_do {
            debug!(?request, "request already satisfied");
            return Ok(None);
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let task = InstallTask::new(request, session_id, self.ctx.clone());
        self.registry.try_register(task.clone())?;
        let _ = self.ctx.events.send(EngineEvent::Info {
            scope: "engine".to_string(),
            message: format!("session {} registered", session_id),
        });
        Ok(Some(task))
    }

    pub fn submit(&self, request: InstallRequest) -> Result<Option<Arc<InstallTask>>, SplitInstallError> {
        let task = self.prepare(request)?;
        if let Some(t) = &task {
            t.start();
        }
        Ok(task)
    }

    /// Resolves with the session id once the download is enqueued, or with
    /// [`NO_OP_SESSION_ID`] when the request is already satisfied.
    pub async fn start_install(&self, request: InstallRequest) -> Result<SessionId, SplitInstallError> {
        match self.submit(request)? {
            Some(task) => task.accepted().await,
            None => Ok(NO_OP_SESSION_ID),
        }
    }

    pub async fn start_uninstall<I, S>(&self, modules: I) -> Result<SessionId, SplitInstallError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = InstallRequest::builder().modules(modules).uninstall(true).build();
        self.start_install(request).await
    }

    /// Unknown ids fail; known sessions outside DOWNLOADING ignore the request.
    pub fn cancel_install(&self, session_id: SessionId) -> Result<(), SplitInstallError> {
        let task = self.find(session_id)?;
        if !task.cancel() {
            debug!(session_id, "cancel had no effect");
        }
        Ok(())
    }

    pub fn confirm_install(&self, session_id: SessionId, approved: bool) -> Result<(), SplitInstallError> {
        self.find(session_id)?.resolve_confirmation(approved)
    }

    pub fn get_session_state(&self, session_id: SessionId) -> Result<SessionState, SplitInstallError> {
        Ok(self.find(session_id)?.state())
    }

    /// States of active sessions that have been assigned an id.
    pub fn get_session_states(&self) -> Vec<SessionState> {
        self.registry
            .list_all()
            .into_iter()
            .map(|t| t.state())
            .filter(|s| s.session_id() != NO_OP_SESSION_ID)
            .collect()
    }

    pub fn register_listener(&self, listener: Arc<dyn SessionStateListener>) -> ListenerId {
        self.ctx.global_listeners.add(listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.ctx.global_listeners.remove(id)
    }

    pub fn task(&self, session_id: SessionId) -> Option<Arc<InstallTask>> {
        self.registry.find_by_session_id(session_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Waits for the session to finish. Returns immediately for ids that are
    /// no longer active.
    pub async fn wait_session(&self, session_id: SessionId) {
        match self.task(session_id) {
            Some(task) => task.wait().await,
            None => self.ctx.runner.callbacks().flush().await,
        }
    }

    /// Stops accepting requests, denies pending confirmations and cancels
    /// in-flight downloads.
    pub fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(active = self.registry.len(), "engine shutting down");
        for task in self.registry.list_all() {
            let _ = task.resolve_confirmation(false);
        }
        self.ctx.plugins.downloader().cancel_all();
        self.ctx.runner.shutdown();
    }

    fn find(&self, session_id: SessionId) -> Result<Arc<InstallTask>, SplitInstallError> {
        self.registry
            .find_by_session_id(session_id)
            .ok_or_else(|| SplitInstallError::session_not_found(session_id))
    }
}
