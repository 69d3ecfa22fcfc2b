use anyhow::Context;
use backon::{ExponentialBuilder, Retryable};
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tunwarden_core::{DownloadConfig, TunwardenError};

const DIST_BASE: &str = "https://dist.tunwarden.dev/agent/stable";

/// Ensures the tunnel agent binary exists on disk, downloading and
/// extracting it when missing.
///
/// The happy path is a pure filesystem check; nothing touches the network
/// unless the binary is absent. Extraction goes through a staging file and
/// an atomic rename so a corrupt download can never leave a partial
/// executable at the target path.
pub struct Installer {
    client: reqwest::Client,
    urls: HashMap<String, String>,
}

impl Installer {
    pub fn new() -> Self {
        Self::with_urls(Self::default_urls())
    }

    /// Installer with a custom platform -> archive URL mapping (mirrors,
    /// pinned agent versions)
    pub fn with_urls(urls: HashMap<String, String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            urls,
        }
    }

    fn default_urls() -> HashMap<String, String> {
        let mut urls = HashMap::new();
        for os in ["linux", "macos", "windows"] {
            urls.insert(os.to_string(), format!("{DIST_BASE}/tunneld-{os}-amd64.gz"));
        }
        urls
    }

    /// Resolve the download URL for a platform id (`std::env::consts::OS`
    /// naming)
    pub fn resolve_url(&self, platform: &str) -> Result<&str, TunwardenError> {
        self.urls
            .get(platform)
            .map(String::as_str)
            .ok_or_else(|| TunwardenError::UnsupportedPlatform {
                platform: platform.to_string(),
            })
    }

    /// Idempotent: returns immediately when the binary is already present.
    pub async fn ensure_binary(
        &self,
        target: &Path,
        platform: &str,
        download: &DownloadConfig,
    ) -> Result<PathBuf, TunwardenError> {
        if target.exists() {
            debug!("agent binary already installed at {}", target.display());
            return Ok(target.to_path_buf());
        }

        // Resolved before any network access so an unsupported platform
        // fails without a single request
        let url = self.resolve_url(platform)?.to_string();

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("downloading tunnel agent from {}", url);
        let archive = self.download_with_retries(&url, download).await?;
        self.extract_to(target, &archive).await?;

        info!("agent installed at {}", target.display());
        Ok(target.to_path_buf())
    }

    async fn download_with_retries(
        &self,
        url: &str,
        download: &DownloadConfig,
    ) -> Result<Vec<u8>, TunwardenError> {
        let fetch = || async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .context("request failed")?
                .error_for_status()
                .context("server returned an error status")?;
            let bytes = response.bytes().await.context("body read failed")?;
            Ok::<Vec<u8>, anyhow::Error>(bytes.to_vec())
        };

        // backon counts retries after the first attempt, so max_attempts
        // total requests means max_attempts - 1 retries
        fetch
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(download.min_delay())
                    .with_max_delay(download.max_delay())
                    .with_max_times(download.max_attempts.saturating_sub(1) as usize),
            )
            .notify(|err, delay| {
                warn!("agent download failed, retrying in {delay:?}: {err}");
            })
            .await
            .map_err(|e| TunwardenError::Download {
                url: url.to_string(),
                attempts: download.max_attempts,
                message: format!("{e:#}"),
            })
    }

    /// Gunzip the archive into a staging file, set the executable bit, then
    /// atomically rename into place.
    async fn extract_to(&self, target: &Path, archive: &[u8]) -> Result<(), TunwardenError> {
        let mut decoder = GzDecoder::new(archive);
        let mut binary = Vec::new();
        decoder
            .read_to_end(&mut binary)
            .map_err(|e| TunwardenError::Extraction {
                target: target.to_path_buf(),
                message: e.to_string(),
            })?;

        let staging = target.with_extension("partial");
        tokio::fs::write(&staging, &binary).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755)).await?;
        }

        tokio::fs::rename(&staging, target).await?;
        Ok(())
    }
}

impl Default for Installer {
    fn default() -> Self {
        Self::new()
    }
}
