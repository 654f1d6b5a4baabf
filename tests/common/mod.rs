#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use futures::StreamExt;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use split_delivery::core::catalog::SplitCatalog;
use split_delivery::core::config::{DeliveryConfig, DeviceSpec, EngineSettings, StaticConfigProvider};
use split_delivery::core::engine::Engine;
use split_delivery::core::error::ExtractError;
use split_delivery::core::events::SessionStateListener;
use split_delivery::core::model::{ErrorCode, InstallRequest, InstallStatus, ResolutionIntent, SessionStatus};
use split_delivery::core::session::SessionState;
use split_delivery::plugins::http::driver::HttpDownloadClient;
use split_delivery::plugins::registry::*;

/// What the fake delivery server answers to `POST /download`.
#[derive(Clone)]
pub enum Reply {
    Body(Vec<u8>),
    Status(StatusCode),
    /// Streams `body` in `chunk`-sized pieces, pausing `delay` before each.
    Slow { body: Vec<u8>, chunk: usize, delay: Duration },
    /// Chunked transfer, no content-length.
    Unsized(Vec<u8>),
    /// Declares `declared` bytes but sends only `body`.
    Short { body: Vec<u8>, declared: usize },
}

pub struct Server {
    reply: Mutex<Reply>,
    pub requests: Mutex<Vec<(String, Vec<u8>)>>,
}

impl Server {
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

async fn download(State(server): State<Arc<Server>>, RawQuery(query): RawQuery, body: Bytes) -> Response {
    server.requests.lock().push((query.unwrap_or_default(), body.to_vec()));
    let reply = server.reply.lock().clone();
    match reply {
        Reply::Body(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/zip".to_string()), (header::CONTENT_LENGTH, body.len().to_string())],
            body,
        )
            .into_response(),
        Reply::Status(status) => (status, "server says no").into_response(),
        Reply::Slow { body, chunk, delay } => {
            let len = body.len();
            let chunks: Vec<Vec<u8>> = body.chunks(chunk).map(|c| c.to_vec()).collect();
            let stream = futures::stream::iter(chunks).then(move |c| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, std::io::Error>(Bytes::from(c))
            });
            (
                StatusCode::OK,
                [(header::CONTENT_LENGTH, len.to_string())],
                Body::from_stream(stream),
            )
                .into_response()
        }
        Reply::Unsized(body) => {
            let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(body))]);
            (StatusCode::OK, Body::from_stream(stream)).into_response()
        }
        Reply::Short { body, declared } => {
            let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(body))]);
            (
                StatusCode::OK,
                [(header::CONTENT_LENGTH, declared.to_string())],
                Body::from_stream(stream),
            )
                .into_response()
        }
    }
}

pub async fn start_server(reply: Reply) -> (SocketAddr, Arc<Server>) {
    let server = Arc::new(Server { reply: Mutex::new(reply), requests: Mutex::new(Vec::new()) });
    let app = Router::new().route("/download", post(download)).with_state(server.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, server)
}

pub fn delivery_config(addr: SocketAddr) -> DeliveryConfig {
    DeliveryConfig {
        server_url: format!("http://{}", addr),
        variant: "release".to_string(),
        version: "7".to_string(),
        signature: "AB:CD:EF".to_string(),
        application_id: "com.example.app".to_string(),
        throttle: None,
        device_spec: DeviceSpec {
            supported_abis: vec!["arm64-v8a".to_string()],
            supported_locales: vec!["en-US".to_string()],
            sdk_version: 33,
            screen_density: 420,
            ..Default::default()
        },
    }
}

pub fn quiet_driver() -> DriverContext {
    DriverContext { progress_interval_ms: 60_000, ..DriverContext::default() }
}

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut w = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, body) in entries {
        w.start_file(*name, zip::write::FileOptions::default()).unwrap();
        w.write_all(body).unwrap();
    }
    w.finish().unwrap().into_inner()
}

/// Ignores the archive and writes `names` into the destination.
pub struct FixedExtractor {
    pub names: Vec<String>,
}

impl ArchiveExtractor for FixedExtractor {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn extract(&self, _archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
        std::fs::create_dir_all(dest_dir).unwrap();
        Ok(self
            .names
            .iter()
            .map(|n| {
                let p = dest_dir.join(n);
                std::fs::write(&p, n.as_bytes()).unwrap();
                p
            })
            .collect())
    }
}

/// One scripted reply per install call. `None` closes the channel after
/// `Installing` without an outcome.
pub struct RecordingInstaller {
    pub installs: Mutex<Vec<InstallJob>>,
    pub uninstalls: Mutex<Vec<UninstallJob>>,
    script: Mutex<VecDeque<Option<InstallStatus>>>,
    pub gate: Option<Arc<Notify>>,
}

impl RecordingInstaller {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<Option<InstallStatus>>) -> Self {
        Self {
            installs: Mutex::new(Vec::new()),
            uninstalls: Mutex::new(Vec::new()),
            script: Mutex::new(script.into()),
            gate: None,
        }
    }

    /// Holds every install in INSTALLING until the gate is notified.
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self { gate: Some(gate), ..Self::new() }
    }

    pub fn install_calls(&self) -> usize {
        self.installs.lock().len()
    }
}

#[async_trait]
impl SplitInstaller for RecordingInstaller {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn install(&self, job: InstallJob, sink: StatusSink<InstallStatus>) {
        let session_id = job.session_id;
        self.installs.lock().push(job);
        let next = self.script.lock().pop_front().unwrap_or(Some(InstallStatus::Installed));
        if let Some(InstallStatus::RequiresUserPermission { .. }) = next {
            let _ = sink.send(InstallStatus::RequiresUserPermission {
                intent: ResolutionIntent::new(session_id),
            });
            return;
        }
        let _ = sink.send(InstallStatus::Installing);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(status) = next {
            let _ = sink.send(status);
        }
    }

    async fn uninstall(&self, job: UninstallJob, sink: StatusSink<InstallStatus>) {
        self.uninstalls.lock().push(job);
        let _ = sink.send(InstallStatus::Uninstalling);
        let _ = sink.send(InstallStatus::Uninstalled);
    }
}

pub struct FlakyPatcher {
    pub fail: bool,
    pub catalog: Arc<SplitCatalog>,
}

#[async_trait]
impl RuntimePatcher for FlakyPatcher {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn apply(&self, request: &InstallRequest) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("class loader refused the new splits");
        }
        self.catalog.mark_installed(request.modules(), request.languages());
        Ok(())
    }
}

/// Collects every state it is handed and wakes waiters on chosen statuses.
#[derive(Default)]
pub struct Recorder {
    pub states: Mutex<Vec<SessionState>>,
    pub reached: Notify,
    watch_for: Mutex<Option<SessionStatus>>,
}

impl Recorder {
    pub fn watching(status: SessionStatus) -> Arc<Self> {
        let r = Self::default();
        *r.watch_for.lock() = Some(status);
        Arc::new(r)
    }

    pub fn record(&self, state: &SessionState) {
        self.states.lock().push(state.clone());
        if *self.watch_for.lock() == Some(state.status()) {
            self.reached.notify_one();
        }
    }

    /// Failed states carry an error, byte counts never go backwards and
    /// nothing follows a terminal state.
    pub fn assert_consistent(&self) {
        let states = self.states.lock();
        let mut downloaded = 0;
        for (i, s) in states.iter().enumerate() {
            if s.status() == SessionStatus::Failed {
                assert_ne!(s.error_code(), ErrorCode::NoError);
            }
            assert!(s.bytes_downloaded() >= downloaded, "progress went backwards: {:?}", *states);
            downloaded = s.bytes_downloaded();
            if s.is_terminal() {
                assert_eq!(i, states.len() - 1, "state after terminal: {:?}", *states);
            }
        }
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.states.lock().iter().map(|s| s.status()).collect()
    }

    pub fn last(&self) -> Option<SessionState> {
        self.states.lock().last().cloned()
    }

    pub async fn wait_reached(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.reached.notified())
            .await
            .expect("status never reached");
    }
}

impl SessionStateListener for Recorder {
    fn on_state_update(&self, state: &SessionState) {
        self.record(state);
    }
}

pub struct Harness {
    pub engine: Engine,
    pub server: Arc<Server>,
    pub installer: Arc<RecordingInstaller>,
    pub catalog: Arc<SplitCatalog>,
    pub dir: TempDir,
}

impl Harness {
    pub fn staging(&self) -> PathBuf {
        self.dir.path().join("staging")
    }

    pub fn staging_is_empty(&self) -> bool {
        match std::fs::read_dir(self.staging()) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }
}

pub struct HarnessBuilder {
    reply: Reply,
    installer: RecordingInstaller,
    artifacts: Vec<String>,
    patch_fails: bool,
    installed: Vec<String>,
    max_commit_polls: u32,
}

impl HarnessBuilder {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply,
            installer: RecordingInstaller::new(),
            artifacts: vec!["camera.apk".to_string(), "camera.config.arm64_v8a.apk".to_string()],
            patch_fails: false,
            installed: Vec::new(),
            max_commit_polls: EngineSettings::default().max_commit_polls,
        }
    }

    pub fn installer(mut self, installer: RecordingInstaller) -> Self {
        self.installer = installer;
        self
    }

    pub fn patch_fails(mut self) -> Self {
        self.patch_fails = true;
        self
    }

    pub fn max_commit_polls(mut self, max: u32) -> Self {
        self.max_commit_polls = max;
        self
    }

    pub fn installed(mut self, module: &str) -> Self {
        self.installed.push(module.to_string());
        self
    }

    pub async fn build(self) -> Harness {
        let (addr, server) = start_server(self.reply).await;
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(
            SplitCatalog::new(["base"], ["camera", "maps", "chat"]).with_installed_modules(self.installed),
        );
        let installer = Arc::new(self.installer);
        let plugins = PluginRegistry::new(
            Arc::new(HttpDownloadClient::new(quiet_driver()).unwrap()),
            Arc::new(FixedExtractor { names: self.artifacts }),
            installer.clone(),
            Arc::new(FlakyPatcher { fail: self.patch_fails, catalog: catalog.clone() }),
        );
        let engine = Engine::new(
            Arc::new(StaticConfigProvider::new(delivery_config(addr))),
            plugins,
            catalog.clone(),
            EngineSettings::default()
                .with_staging_dir(dir.path().join("staging"))
                .with_commit_poll_interval(Duration::from_millis(10))
                .with_max_commit_polls(self.max_commit_polls),
        );
        Harness { engine, server, installer, catalog, dir }
    }
}
