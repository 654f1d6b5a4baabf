use async_trait::async_trait;
use crate::core::error::ExtractError;
use crate::core::model::{DownloadId, DownloadStatus, InstallRequest, InstallStatus, SessionId};
use clap::{ArgMatches, Command};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

pub type StatusSink<T> = mpsc::UnboundedSender<T>;

#[derive(Debug, Clone)]
pub struct DriverContext {
    pub user_agent: String,
    /// Extra request headers, sent with every download.
    pub headers: Vec<(String, String)>,
    /// Longest silence tolerated while waiting for headers or the next chunk.
    pub read_timeout_ms: u64,
    pub connect_timeout_secs: u64,
    /// Minimum gap between two progress reports for one download.
    pub progress_interval_ms: u64,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self {
            user_agent: "split-delivery/0.1".to_string(),
            headers: Vec::new(),
            read_timeout_ms: 60_000,
            connect_timeout_secs: 30,
            progress_interval_ms: 1000,
        }
    }
}

impl DriverContext {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: DownloadId,
    pub url: Url,
    /// Serialized device spec, sent as the request body.
    pub body: Vec<u8>,
    pub dest: PathBuf,
}

pub trait DownloadService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Begins the transfer. `Enqueued` is sent before this returns, followed by
    /// zero or more non-terminal statuses and exactly one terminal status.
    /// Starting an id that is already in flight is a no-op returning false.
    fn start(&self, request: DownloadRequest, sink: StatusSink<DownloadStatus>) -> bool;

    /// Requests cancellation. No-op (false) once the download has reached a terminal status.
    fn cancel(&self, id: DownloadId) -> bool;

    fn cancel_all(&self);
}

pub trait ArchiveExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Unpacks `archive` under `dest_dir`, returning the files written.
    fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, ExtractError>;
}

#[derive(Debug, Clone)]
pub struct InstallJob {
    pub session_id: SessionId,
    pub artifacts: Vec<PathBuf>,
    pub user_confirmed: bool,
}

#[derive(Debug, Clone)]
pub struct UninstallJob {
    pub session_id: SessionId,
    pub modules: BTreeSet<String>,
    pub languages: BTreeSet<String>,
    pub user_confirmed: bool,
}

#[async_trait]
pub trait SplitInstaller: Send + Sync {
    fn name(&self) -> &'static str;

    /// Emits `Installing`, commits, then emits exactly one outcome status.
    async fn install(&self, job: InstallJob, sink: StatusSink<InstallStatus>);

    async fn uninstall(&self, job: UninstallJob, sink: StatusSink<InstallStatus>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Platform accepted the session but has not finished it yet; poll again.
    Deferred,
    NeedsConfirmation,
    Rejected(String),
    ServiceDied,
    InsufficientStorage,
    Aborted,
}

/// The platform's privileged install primitive.
pub trait PackageCommitter: Send + Sync {
    fn commit(&self, job: &InstallJob) -> anyhow::Result<CommitOutcome>;
    fn remove(&self, job: &UninstallJob) -> anyhow::Result<CommitOutcome>;
}

#[async_trait]
pub trait RuntimePatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Makes the splits a finished install request delivered visible to the running process.
    async fn apply(&self, request: &InstallRequest) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct CliConfig {
    pub driver_ctx: DriverContext,
    pub install_dir: PathBuf,
    pub require_confirmation: bool,
    pub auto_confirm: bool,
}

pub trait CliPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn augment_command(&self, cmd: Command) -> Command;
    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut CliConfig) -> anyhow::Result<()>;
}

/// The collaborators an engine drives.
#[derive(Clone)]
pub struct PluginRegistry {
    downloader: Arc<dyn DownloadService>,
    extractor: Arc<dyn ArchiveExtractor>,
    installer: Arc<dyn SplitInstaller>,
    patcher: Arc<dyn RuntimePatcher>,
}

impl PluginRegistry {
    pub fn new(
        downloader: Arc<dyn DownloadService>,
        extractor: Arc<dyn ArchiveExtractor>,
        installer: Arc<dyn SplitInstaller>,
        patcher: Arc<dyn RuntimePatcher>,
    ) -> Self {
        Self { downloader, extractor, installer, patcher }
    }

    pub fn downloader(&self) -> Arc<dyn DownloadService> {
        self.downloader.clone()
    }

    pub fn extractor(&self) -> Arc<dyn ArchiveExtractor> {
        self.extractor.clone()
    }

    pub fn installer(&self) -> Arc<dyn SplitInstaller> {
        self.installer.clone()
    }

    pub fn patcher(&self) -> Arc<dyn RuntimePatcher> {
        self.patcher.clone()
    }

    pub fn default_cli_plugins() -> Vec<Box<dyn CliPlugin>> {
        vec![
            Box::new(crate::plugins::http::cli::HttpCliPlugin::new()),
            Box::new(crate::plugins::installer::cli::InstallerCliPlugin::new()),
        ]
    }

    pub fn augment_command(plugins: &[Box<dyn CliPlugin>], cmd: Command) -> Command {
        plugins.iter().fold(cmd, |c, p| p.augment_command(c))
    }

    pub fn apply_matches(
        plugins: &[Box<dyn CliPlugin>],
        matches: &ArgMatches,
        cfg: &mut CliConfig,
    ) -> anyhow::Result<()> {
        for p in plugins {
            p.apply_matches(matches, cfg)?;
        }
        Ok(())
    }

    pub fn describe(&self) -> String {
        format!(
            "downloader={} extractor={} installer={} patcher={}",
            self.downloader.name(),
            self.extractor.name(),
            self.installer.name(),
            self.patcher.name(),
        )
    }
}
