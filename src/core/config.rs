use crate::core::model::InstallRequest;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Device capabilities sent to the server so it can pick compatible artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSpec {
    pub supported_abis: Vec<String>,
    /// `lang-COUNTRY` form, e.g. `en-US`.
    pub supported_locales: Vec<String>,
    pub device_features: Vec<String>,
    pub gl_extensions: Vec<String>,
    pub screen_density: u32,
    pub sdk_version: u32,
}

/// Per-request server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    pub server_url: String,
    pub variant: String,
    pub version: String,
    pub signature: String,
    pub application_id: String,
    #[serde(default)]
    pub throttle: Option<u32>,
    #[serde(default)]
    pub device_spec: DeviceSpec,
}

impl DeliveryConfig {
    /// `POST {server}/download?variant=..&version=..&signature=..&application-id=..`
    /// plus the optional throttle, include-missing and filter parameters.
    pub fn download_url(&self, request: &InstallRequest) -> anyhow::Result<Url> {
        let base = format!("{}/download", self.server_url.trim_end_matches('/'));
        let mut url = Url::parse(&base).with_context(|| format!("invalid server url {}", self.server_url))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("variant", &self.variant)
                .append_pair("version", &self.version)
                .append_pair("signature", &self.signature)
                .append_pair("application-id", &self.application_id);
            if let Some(t) = self.throttle {
                q.append_pair("throttle", &t.to_string());
            }
            if request.include_missing_base_splits() {
                q.append_pair("include-missing", "true");
            }
            if !request.modules().is_empty() {
                q.append_pair("features", &join(request.modules().iter()));
            }
            if !request.languages().is_empty() {
                q.append_pair("languages", &join(request.languages().iter()));
            }
        }
        Ok(url)
    }
}

fn join<'a>(items: impl Iterator<Item = &'a String>) -> String {
    items.map(String::as_str).collect::<Vec<_>>().join(",")
}

#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<DeliveryConfig>;
}

pub struct StaticConfigProvider {
    config: DeliveryConfig,
}

impl StaticConfigProvider {
    pub fn new(config: DeliveryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn fetch(&self) -> anyhow::Result<DeliveryConfig> {
        Ok(self.config.clone())
    }
}

/// Re-reads a JSON [`DeliveryConfig`] on every fetch.
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn fetch(&self) -> anyhow::Result<DeliveryConfig> {
        let raw = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("read config {}", self.path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("parse config {}", self.path.display()))
    }
}

/// Engine-wide tunables.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Per-session scratch space for archives and extracted artifacts.
    pub staging_dir: PathBuf,
    /// Delay between polls while the platform defers a commit.
    pub commit_poll_interval: Duration,
    pub max_commit_polls: u32,
    pub event_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            staging_dir: std::env::temp_dir().join("split-delivery-staging"),
            commit_poll_interval: Duration::from_millis(250),
            max_commit_polls: 40,
            event_capacity: 256,
        }
    }
}

impl EngineSettings {
    pub fn with_staging_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.staging_dir = path.into();
        self
    }

    pub fn with_commit_poll_interval(mut self, interval: Duration) -> Self {
        self.commit_poll_interval = interval;
        self
    }

    pub fn with_max_commit_polls(mut self, max: u32) -> Self {
        self.max_commit_polls = max.max(1);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
