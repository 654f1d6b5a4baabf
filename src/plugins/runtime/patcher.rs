use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::core::catalog::SplitCatalog;
use crate::core::model::InstallRequest;
use crate::plugins::registry::RuntimePatcher;

/// Publishes freshly installed splits to the process-wide catalog. With an
/// install directory set, each requested module must have landed there first.
pub struct CatalogPatcher {
    catalog: Arc<SplitCatalog>,
    install_dir: Option<PathBuf>,
}

impl CatalogPatcher {
    pub fn new(catalog: Arc<SplitCatalog>) -> Self {
        Self { catalog, install_dir: None }
    }

    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = Some(dir.into());
        self
    }

    async fn verify(&self, request: &InstallRequest) -> anyhow::Result<()> {
        let Some(dir) = &self.install_dir else {
            return Ok(());
        };
        for module in request.modules() {
            let path = dir.join(format!("{}.apk", module));
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                anyhow::bail!("split for module '{}' missing at {}", module, path.display());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimePatcher for CatalogPatcher {
    fn name(&self) -> &'static str {
        "catalog"
    }

    async fn apply(&self, request: &InstallRequest) -> anyhow::Result<()> {
        self.verify(request).await?;
        self.catalog.mark_installed(request.modules(), request.languages());
        info!(modules = ?request.modules(), languages = ?request.languages(), "splits live");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn apply_marks_catalog() {
        let catalog = Arc::new(SplitCatalog::new(Vec::<String>::new(), ["camera"]));
        let req = InstallRequest::builder().module("camera").language("de-DE").build();
        CatalogPatcher::new(catalog.clone()).apply(&req).await.unwrap();
        assert!(catalog.satisfies(&req));
    }

    #[tokio::test]
    async fn missing_split_fails_and_leaves_catalog_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        let catalog = Arc::new(SplitCatalog::new(Vec::<String>::new(), ["camera"]));
        let req = InstallRequest::builder().module("camera").build();
        let patcher = CatalogPatcher::new(catalog.clone()).with_install_dir(dir.path());

        assert!(patcher.apply(&req).await.is_err());
        assert!(!catalog.satisfies(&req));

        std::fs::write(dir.path().join("camera.apk"), b"apk").unwrap();
        patcher.apply(&req).await.unwrap();
        assert!(catalog.satisfies(&req));
    }
}
