//! One install or uninstall request, driven end to end.
//!
//! A task runs its stages as sequential awaits: configuration fetch,
//! download, extraction, install and runtime patch. Every status reported by
//! a collaborator is folded into the session state at exactly one mapping
//! site per collaborator (`on_download_status`, `on_install_status`), and
//! every resulting transition is fanned out to task-local listeners and then
//! global listeners on the engine's callback context.

use crate::core::catalog::SplitCatalog;
use crate::core::config::{ConfigProvider, DeliveryConfig, EngineSettings};
use crate::core::error::{SplitInstallError, TaskResultError};
use crate::core::events::{EngineEvent, ListenerId, ListenerSet, SessionStateListener};
use crate::core::model::*;
use crate::core::registry::TaskRegistry;
use crate::core::runner::BackgroundRunner;
use crate::core::session::SessionState;
use crate::plugins::registry::{DownloadRequest, InstallJob, PluginRegistry, UninstallJob};
use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

const ARCHIVE_NAME: &str = "artifacts.zip";
const EXTRACT_DIR: &str = "extracted";

/// Collaborators shared by every task of one engine.
#[derive(Clone)]
pub struct TaskContext {
    pub config: Arc<dyn ConfigProvider>,
    pub plugins: PluginRegistry,
    pub runner: BackgroundRunner,
    pub registry: Weak<TaskRegistry>,
    pub global_listeners: Arc<ListenerSet>,
    pub events: broadcast::Sender<EngineEvent>,
    pub catalog: Arc<SplitCatalog>,
    pub settings: EngineSettings,
}

enum DownloadFlow {
    Continue,
    Downloaded(PathBuf),
    Finished,
}

enum InstallFlow {
    Continue,
    Installed,
    Deferred,
    AwaitConfirmation(oneshot::Receiver<bool>),
    Finished,
}

type Acceptance = Option<Result<SessionId, SplitInstallError>>;

pub struct InstallTask {
    key: Uuid,
    request: InstallRequest,
    session_id: SessionId,
    ctx: TaskContext,
    state: Mutex<SessionState>,
    failure: Mutex<Option<SplitInstallError>>,
    listeners: ListenerSet,
    started: AtomicBool,
    download: Mutex<Option<DownloadId>>,
    confirmation: Mutex<Option<oneshot::Sender<bool>>>,
    accepted: watch::Sender<Acceptance>,
    done: watch::Sender<bool>,
}

impl InstallTask {
    /// `session_id` is reserved for this task; it becomes visible in the
    /// session state once the download is enqueued (or the uninstall begins).
    pub fn new(request: InstallRequest, session_id: SessionId, ctx: TaskContext) -> Arc<Self> {
        let (accepted, _) = watch::channel(None);
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            key: Uuid::new_v4(),
            state: Mutex::new(SessionState::pending(&request)),
            request,
            session_id,
            ctx,
            failure: Mutex::new(None),
            listeners: ListenerSet::default(),
            started: AtomicBool::new(false),
            download: Mutex::new(None),
            confirmation: Mutex::new(None),
            accepted,
            done,
        })
    }

    pub fn key(&self) -> Uuid {
        self.key
    }

    pub fn request(&self) -> &InstallRequest {
        &self.request
    }

    pub fn reserved_session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().is_terminal()
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionStateListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Starts the task. Calling it again is a no-op returning false.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(session_id = self.session_id, "task already started");
            return false;
        }
        let task = self.clone();
        let on_error = self.clone();
        self.ctx.runner.execute(
            async move { task.run().await },
            |_| {},
            move |e| {
                warn!(session_id = on_error.session_id, error = %e, "task aborted");
                on_error.fail(ErrorCode::InternalError, format!("task aborted: {}", e));
            },
        );
        true
    }

    /// Resolves once the request is accepted (download enqueued or uninstall
    /// begun) or has failed before reaching that point.
    pub async fn accepted(&self) -> Result<SessionId, SplitInstallError> {
        let mut rx = self.accepted.subscribe();
        let outcome = match rx.wait_for(|v| v.is_some()).await {
            Ok(v) => v.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(SplitInstallError::internal("task dropped before acceptance")))
    }

    /// Resolves after the task reached a terminal state and every listener
    /// notification queued so far has been delivered.
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|d| *d).await;
        self.ctx.runner.callbacks().flush().await;
    }

    pub fn result(&self) -> Result<SessionId, TaskResultError> {
        let state = self.state();
        match state.status() {
            SessionStatus::Installed | SessionStatus::Uninstalled | SessionStatus::Canceled => {
                Ok(state.session_id())
            }
            SessionStatus::Failed => Err(TaskResultError::Failed(self.failure_error(&state))),
            _ => Err(TaskResultError::NotComplete),
        }
    }

    /// Only effective while downloading. Installs already handed to the
    /// platform cannot be aborted from here, so any other status is left alone.
    pub fn cancel(&self) -> bool {
        let id = {
            let state = self.state.lock();
            if state.status() != SessionStatus::Downloading {
                debug!(session_id = self.session_id, status = %state.status(), "cancel ignored");
                return false;
            }
            match *self.download.lock() {
                Some(id) => id,
                None => return false,
            }
        };
        if !self.ctx.plugins.downloader().cancel(id) {
            return false;
        }
        self.transition(|s| {
            (s.status() == SessionStatus::Downloading).then(|| s.with_status(SessionStatus::Canceling))
        });
        true
    }

    pub fn resolve_confirmation(&self, approved: bool) -> Result<(), SplitInstallError> {
        let tx = self.confirmation.lock().take().ok_or_else(|| {
            SplitInstallError::new(
                ErrorCode::InvalidRequest,
                format!("session {} is not awaiting confirmation", self.session_id),
            )
        })?;
        let _ = tx.send(approved);
        Ok(())
    }

    fn staging_dir(&self) -> PathBuf {
        self.ctx.settings.staging_dir.join(self.key.to_string())
    }

    async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let config = match self.ctx.config.fetch().await {
            Ok(c) => c,
            Err(e) => {
                self.fail(ErrorCode::InternalError, format!("configuration fetch failed: {:#}", e));
                return Ok(());
            }
        };

        if self.request.is_uninstall() {
            return self.run_uninstall().await;
        }

        let archive = match self.download(&config).await? {
            Some(p) => p,
            None => return Ok(()),
        };
        let artifacts = match self.extract(archive).await {
            Some(a) => a,
            None => return Ok(()),
        };
        self.install(artifacts).await;
        Ok(())
    }

    async fn download(&self, config: &DeliveryConfig) -> anyhow::Result<Option<PathBuf>> {
        let url = match config.download_url(&self.request) {
            Ok(u) => u,
            Err(e) => {
                self.fail(ErrorCode::InternalError, format!("{:#}", e));
                return Ok(None);
            }
        };
        let staging = self.staging_dir();
        if let Err(e) = tokio::fs::create_dir_all(&staging).await {
            self.fail(ErrorCode::InternalError, format!("create {}: {}", staging.display(), e));
            return Ok(None);
        }

        let request = DownloadRequest {
            id: self.session_id,
            url,
            body: serde_json::to_vec(&config.device_spec)?,
            dest: staging.join(ARCHIVE_NAME),
        };
        info!(session_id = self.session_id, url = %request.url, "starting download");

        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.download.lock() = Some(self.session_id);
        if !self.ctx.plugins.downloader().start(request, tx) {
            *self.download.lock() = None;
            self.fail(ErrorCode::InternalError, "download already in flight");
            return Ok(None);
        }

        let outcome = loop {
            let Some(status) = rx.recv().await else {
                self.fail(ErrorCode::InternalError, "download ended without a terminal status");
                break None;
            };
            match self.on_download_status(status) {
                DownloadFlow::Continue => {}
                DownloadFlow::Downloaded(path) => break Some(path),
                DownloadFlow::Finished => break None,
            }
        };
        *self.download.lock() = None;
        Ok(outcome)
    }

    async fn extract(&self, archive: PathBuf) -> Option<Vec<PathBuf>> {
        let extractor = self.ctx.plugins.extractor();
        let dest = self.staging_dir().join(EXTRACT_DIR);
        let source = archive.clone();
        let result = self
            .ctx
            .runner
            .run_blocking(move || extractor.extract(&source, &dest).map_err(anyhow::Error::from))
            .await;
        let _ = tokio::fs::remove_file(&archive).await;

        match result {
            Ok(artifacts) => {
                debug!(session_id = self.session_id, count = artifacts.len(), "archive extracted");
                Some(artifacts)
            }
            Err(e) => {
                self.fail(ErrorCode::InternalError, format!("extraction failed: {:#}", e));
                None
            }
        }
    }

    async fn install(&self, artifacts: Vec<PathBuf>) {
        let mut user_confirmed = false;
        let mut deferrals = 0u32;
        loop {
            let (tx, rx) = mpsc::unbounded_channel();
            let installer = self.ctx.plugins.installer();
            let job = InstallJob {
                session_id: self.session_id,
                artifacts: artifacts.clone(),
                user_confirmed,
            };
            self.spawn_installer(async move { installer.install(job, tx).await });

            match self.drive_installer(rx).await {
                InstallFlow::Installed => return self.patch().await,
                InstallFlow::Deferred => {
                    deferrals += 1;
                    if !self.await_commit_retry(deferrals).await {
                        return;
                    }
                }
                InstallFlow::AwaitConfirmation(rx) => {
                    if !self.await_confirmation(rx).await {
                        return;
                    }
                    user_confirmed = true;
                }
                InstallFlow::Continue | InstallFlow::Finished => return,
            }
        }
    }

    async fn run_uninstall(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            *state = state.with_session_id(self.session_id);
        }
        self.accept(Ok(self.session_id));

        let mut user_confirmed = false;
        let mut deferrals = 0u32;
        loop {
            let (tx, rx) = mpsc::unbounded_channel();
            let installer = self.ctx.plugins.installer();
            let job = UninstallJob {
                session_id: self.session_id,
                modules: self.request.modules().clone(),
                languages: self.request.languages().clone(),
                user_confirmed,
            };
            self.spawn_installer(async move { installer.uninstall(job, tx).await });

            match self.drive_installer(rx).await {
                InstallFlow::Deferred => {
                    deferrals += 1;
                    if !self.await_commit_retry(deferrals).await {
                        return Ok(());
                    }
                }
                InstallFlow::AwaitConfirmation(rx) => {
                    if !self.await_confirmation(rx).await {
                        return Ok(());
                    }
                    user_confirmed = true;
                }
                InstallFlow::Installed => {
                    self.fail(ErrorCode::InternalError, "installer reported an install during uninstall");
                    return Ok(());
                }
                InstallFlow::Continue | InstallFlow::Finished => return Ok(()),
            }
        }
    }

    fn spawn_installer<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let session_id = self.session_id;
        self.ctx.runner.execute(
            async move {
                work.await;
                Ok(())
            },
            |_| {},
            move |e| warn!(session_id, error = %e, "installer crashed"),
        );
    }

    async fn drive_installer(&self, mut rx: mpsc::UnboundedReceiver<InstallStatus>) -> InstallFlow {
        while let Some(status) = rx.recv().await {
            match self.on_install_status(status) {
                InstallFlow::Continue => {}
                flow => return flow,
            }
        }
        self.fail(ErrorCode::ServiceDied, "installer disconnected before reporting an outcome");
        InstallFlow::Finished
    }

    /// Waits out one commit deferral on the runner. False once the task has
    /// ended: polls exhausted, or the engine shut down while waiting.
    async fn await_commit_retry(&self, deferrals: u32) -> bool {
        let max = self.ctx.settings.max_commit_polls;
        if deferrals > max {
            self.fail(ErrorCode::InternalError, format!("commit still pending after {} polls", max));
            return false;
        }
        debug!(session_id = self.session_id, attempt = deferrals, "commit deferred, polling again");
        let (tx, rx) = oneshot::channel();
        self.ctx.runner.schedule(self.ctx.settings.commit_poll_interval, move || {
            let _ = tx.send(());
        });
        if rx.await.is_err() {
            info!(session_id = self.session_id, "shutdown while a commit was pending");
            self.transition(|s| Some(s.with_status(SessionStatus::Canceled)));
            return false;
        }
        true
    }

    async fn await_confirmation(&self, rx: oneshot::Receiver<bool>) -> bool {
        let approved = rx.await.unwrap_or(false);
        if approved {
            info!(session_id = self.session_id, "user approved install");
        } else {
            self.fail(ErrorCode::RequireInstallConfirm, "user declined the installation");
        }
        approved
    }

    async fn patch(&self) {
        match self.ctx.plugins.patcher().apply(&self.request).await {
            Ok(()) => self.transition(|s| Some(s.with_status(SessionStatus::Installed))),
            Err(e) => self.fail(ErrorCode::InternalError, format!("runtime patch failed: {:#}", e)),
        }
    }

    fn on_download_status(&self, status: DownloadStatus) -> DownloadFlow {
        debug!(session_id = self.session_id, ?status, "download status");
        match status {
            DownloadStatus::Enqueued { id } => {
                self.transition(|s| Some(s.with_session_id(id).with_status(SessionStatus::Pending)));
                self.accept(Ok(id));
                DownloadFlow::Continue
            }
            DownloadStatus::Pending | DownloadStatus::Paused => {
                self.transition(|s| {
                    (s.status() != SessionStatus::Canceling).then(|| s.with_status(SessionStatus::Pending))
                });
                DownloadFlow::Continue
            }
            DownloadStatus::Running { downloaded, total } => {
                self.transition(|s| {
                    let status = match s.status() {
                        SessionStatus::Canceling => SessionStatus::Canceling,
                        _ => SessionStatus::Downloading,
                    };
                    Some(s.with_progress(status, downloaded, total))
                });
                DownloadFlow::Continue
            }
            DownloadStatus::Unknown => {
                self.transition(|s| Some(s.with_status(SessionStatus::Unknown)));
                DownloadFlow::Continue
            }
            DownloadStatus::Successful { path, total } => {
                self.transition(|s| Some(s.with_progress(SessionStatus::Downloaded, total, total)));
                DownloadFlow::Downloaded(path)
            }
            DownloadStatus::Failed { code, reason } => {
                self.fail(code, reason);
                DownloadFlow::Finished
            }
            DownloadStatus::Canceled => {
                self.transition(|s| Some(s.with_status(SessionStatus::Canceled)));
                DownloadFlow::Finished
            }
        }
    }

    fn on_install_status(&self, status: InstallStatus) -> InstallFlow {
        debug!(session_id = self.session_id, ?status, "install status");
        match status {
            InstallStatus::Pending => {
                self.transition(|s| Some(s.with_status(SessionStatus::Pending)));
                InstallFlow::Deferred
            }
            InstallStatus::Installing => {
                self.transition(|s| Some(s.with_status(SessionStatus::Installing)));
                InstallFlow::Continue
            }
            InstallStatus::Uninstalling => {
                self.transition(|s| Some(s.with_status(SessionStatus::Uninstalling)));
                InstallFlow::Continue
            }
            InstallStatus::Unknown => {
                self.transition(|s| Some(s.with_status(SessionStatus::Unknown)));
                InstallFlow::Continue
            }
            InstallStatus::RequiresUserPermission { intent } => {
                // The sender must exist before listeners can observe the state.
                let (tx, rx) = oneshot::channel();
                *self.confirmation.lock() = Some(tx);
                self.transition(|s| Some(s.requiring_confirmation(intent)));
                InstallFlow::AwaitConfirmation(rx)
            }
            InstallStatus::Installed => InstallFlow::Installed,
            InstallStatus::Uninstalled => {
                self.ctx
                    .catalog
                    .mark_uninstalled(self.request.modules(), self.request.languages());
                self.transition(|s| Some(s.with_status(SessionStatus::Uninstalled)));
                InstallFlow::Finished
            }
            InstallStatus::Failed { code, reason } => {
                self.fail(code, reason);
                InstallFlow::Finished
            }
            InstallStatus::Canceled => {
                self.transition(|s| Some(s.with_status(SessionStatus::Canceled)));
                InstallFlow::Finished
            }
        }
    }

    pub(crate) fn fail(&self, code: ErrorCode, reason: impl Into<String>) {
        let code = match code {
            ErrorCode::NoError => ErrorCode::InternalError,
            c => c,
        };
        let error = SplitInstallError::new(code, reason);
        {
            let state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            *self.failure.lock() = Some(error.clone());
        }
        warn!(session_id = self.session_id, %error, "session failed");
        let _ = self.ctx.events.send(EngineEvent::Error {
            scope: format!("session({})", self.session_id),
            message: error.to_string(),
        });
        self.transition(|s| Some(s.failed(code)));
    }

    /// Replaces the state with `f`'s result and fans it out. Terminal states
    /// are final, and a transition to an identical state is dropped.
    fn transition<F>(&self, f: F)
    where
        F: FnOnce(&SessionState) -> Option<SessionState>,
    {
        let terminal = {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            let Some(next) = f(&state) else {
                return;
            };
            if next == *state {
                return;
            }
            *state = next.clone();
            // Posting under the lock keeps delivery order equal to transition order.
            self.publish(next);
            state.is_terminal()
        };
        if terminal {
            self.finish();
        }
    }

    fn publish(&self, state: SessionState) {
        debug!(
            session_id = state.session_id(),
            status = %state.status(),
            downloaded = state.bytes_downloaded(),
            total = state.total_bytes_to_download(),
            "session state"
        );
        let _ = self.ctx.events.send(EngineEvent::SessionUpdated(state.clone()));
        let local = self.listeners.snapshot();
        let global = self.ctx.global_listeners.snapshot();
        self.ctx.runner.callbacks().post(move || {
            for l in local.iter().chain(global.iter()) {
                l.on_state_update(&state);
            }
        });
    }

    fn finish(&self) {
        let state = self.state();
        if let Some(registry) = self.ctx.registry.upgrade() {
            registry.unregister(self.key);
        }
        self.confirmation.lock().take();

        let staging = self.staging_dir();
        if let Err(e) = std::fs::remove_dir_all(&staging) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %staging.display(), error = %e, "staging cleanup failed");
            }
        }

        let outcome = match state.status() {
            SessionStatus::Failed => Err(self.failure_error(&state)),
            _ => Ok(state.session_id()),
        };
        self.accept(outcome);
        info!(session_id = state.session_id(), status = %state.status(), code = %state.error_code(), "session finished");
        self.done.send_replace(true);
    }

    fn accept(&self, outcome: Result<SessionId, SplitInstallError>) {
        self.accepted.send_if_modified(move |slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
    }

    fn failure_error(&self, state: &SessionState) -> SplitInstallError {
        self.failure
            .lock()
            .clone()
            .unwrap_or_else(|| SplitInstallError::new(state.error_code(), "session failed"))
    }
}
