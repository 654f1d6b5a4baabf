//! In-crate test doubles for the engine's collaborators.

use crate::core::catalog::SplitCatalog;
use crate::core::config::{DeliveryConfig, DeviceSpec, EngineSettings, StaticConfigProvider};
use crate::core::error::ExtractError;
use crate::core::events::ListenerSet;
use crate::core::model::{DownloadId, DownloadStatus, InstallStatus};
use crate::core::runner::{BackgroundRunner, CallbackContext};
use crate::core::task::TaskContext;
use crate::plugins::registry::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Enqueues every download and then holds it open until cancelled.
#[derive(Default)]
pub struct ScriptedDownloader {
    starts: AtomicUsize,
    sinks: Mutex<Vec<(DownloadId, StatusSink<DownloadStatus>)>>,
}

impl ScriptedDownloader {
    pub fn hanging() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl DownloadService for ScriptedDownloader {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn start(&self, request: DownloadRequest, sink: StatusSink<DownloadStatus>) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let _ = sink.send(DownloadStatus::Enqueued { id: request.id });
        self.sinks.lock().push((request.id, sink));
        true
    }

    fn cancel(&self, id: DownloadId) -> bool {
        let mut sinks = self.sinks.lock();
        match sinks.iter().position(|(i, _)| *i == id) {
            Some(pos) => {
                let (_, sink) = sinks.remove(pos);
                let _ = sink.send(DownloadStatus::Canceled);
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) {
        for (_, sink) in self.sinks.lock().drain(..) {
            let _ = sink.send(DownloadStatus::Canceled);
        }
    }
}

pub struct NoopExtractor;

impl ArchiveExtractor for NoopExtractor {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn extract(&self, _archive: &Path, _dest_dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
        Ok(Vec::new())
    }
}

pub struct NoopInstaller;

#[async_trait]
impl SplitInstaller for NoopInstaller {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn install(&self, _job: InstallJob, sink: StatusSink<InstallStatus>) {
        let _ = sink.send(InstallStatus::Installed);
    }

    async fn uninstall(&self, _job: UninstallJob, sink: StatusSink<InstallStatus>) {
        let _ = sink.send(InstallStatus::Uninstalled);
    }
}

pub struct NoopPatcher;

#[async_trait]
impl RuntimePatcher for NoopPatcher {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn apply(&self, _request: &crate::core::model::InstallRequest) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn delivery_config() -> DeliveryConfig {
    DeliveryConfig {
        server_url: "http://127.0.0.1:9".to_string(),
        variant: "release".to_string(),
        version: "1".to_string(),
        signature: "00".to_string(),
        application_id: "com.example.app".to_string(),
        throttle: None,
        device_spec: DeviceSpec::default(),
    }
}

pub fn test_context(downloader: Arc<ScriptedDownloader>) -> (TaskContext, Arc<ScriptedDownloader>, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let (events, _) = broadcast::channel(64);
    let ctx = TaskContext {
        config: Arc::new(StaticConfigProvider::new(delivery_config())),
        plugins: PluginRegistry::new(
            downloader.clone(),
            Arc::new(NoopExtractor),
            Arc::new(NoopInstaller),
            Arc::new(NoopPatcher),
        ),
        runner: BackgroundRunner::new(CallbackContext::spawn()),
        registry: Weak::new(),
        global_listeners: Arc::new(ListenerSet::default()),
        events,
        catalog: Arc::new(SplitCatalog::new(["base"], ["dynamicfeature", "a", "b", "c"])),
        settings: EngineSettings::default().with_staging_dir(dir.path()),
    };
    (ctx, downloader, dir)
}
