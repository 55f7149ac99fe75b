use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

pub const DEFAULT_FALLBACK_DIR: &str = "public/violations";
pub const DEFAULT_FALLBACK_URL_PREFIX: &str = "/violations";

/// Local directory used when the object store cannot take an image.
#[derive(Clone, Debug)]
pub struct LocalFallback {
    dir: PathBuf,
    url_prefix: String,
}

impl LocalFallback {
    pub fn new(dir: impl Into<PathBuf>, url_prefix: &str) -> Self {
        Self {
            dir: dir.into(),
            url_prefix: url_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `bytes` as `filename` and return the root-relative URL.
    ///
    /// The file is written under a temporary name and renamed into place, so
    /// a reader never sees a partial image.
    pub fn save(&self, filename: &str, bytes: &[u8]) -> Result<String> {
        if filename.is_empty() || filename.contains(['/', '\\']) || filename.starts_with('.') {
            return Err(anyhow!("invalid fallback filename '{}'", filename));
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create fallback dir {}", self.dir.display()))?;
        let final_path = self.dir.join(filename);
        let tmp_path = self.dir.join(format!(".{}.tmp", filename));
        fs::write(&tmp_path, bytes)
            .with_context(|| format!("write fallback image {}", tmp_path.display()))?;
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e).with_context(|| format!("move fallback image to {}", final_path.display()));
        }
        Ok(format!("{}/{}", self.url_prefix, filename))
    }

    /// Map a URL returned by [`LocalFallback::save`] back to its file.
    pub fn resolve(&self, url: &str) -> Option<PathBuf> {
        let filename = url.strip_prefix(&self.url_prefix)?.strip_prefix('/')?;
        if filename.is_empty() || filename.contains(['/', '\\']) {
            return None;
        }
        Some(self.dir.join(filename))
    }
}

impl Default for LocalFallback {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_DIR, DEFAULT_FALLBACK_URL_PREFIX)
    }
}
