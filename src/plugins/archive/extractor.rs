use crate::core::error::ExtractError;
use crate::plugins::registry::ArchiveExtractor;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Unpacks zip archives. Any entry whose resolved path would leave the
/// destination directory fails the whole extraction.
pub struct ZipExtractor;

impl ZipExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ZipExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn io(path: &Path) -> impl FnOnce(std::io::Error) -> ExtractError + '_ {
    move |source| ExtractError::Io { path: path.to_path_buf(), source }
}

impl ArchiveExtractor for ZipExtractor {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
        fs::create_dir_all(dest_dir).map_err(io(dest_dir))?;
        let root = dest_dir.canonicalize().map_err(io(dest_dir))?;

        let file = File::open(archive).map_err(io(archive))?;
        let mut zip = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| ExtractError::Archive {
            path: archive.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut written = Vec::new();
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).map_err(|e| ExtractError::Archive {
                path: archive.to_path_buf(),
                reason: e.to_string(),
            })?;
            let relative = match entry.enclosed_name() {
                Some(p) => p.to_path_buf(),
                None => return Err(ExtractError::UnsafeEntry { name: entry.name().to_string() }),
            };
            let output_path = root.join(&relative);
            if !output_path.starts_with(&root) {
                return Err(ExtractError::UnsafeEntry { name: entry.name().to_string() });
            }

            if entry.is_dir() {
                fs::create_dir_all(&output_path).map_err(io(&output_path))?;
                continue;
            }
            if let Some(parent) = output_path.parent() {
                fs::create_dir_all(parent).map_err(io(parent))?;
            }
            let mut out = File::create(&output_path).map_err(io(&output_path))?;
            std::io::copy(&mut entry, &mut out).map_err(io(&output_path))?;
            debug!(entry = %relative.display(), bytes = entry.size(), "extracted");
            written.push(output_path);
        }
        Ok(written)
    }
}
