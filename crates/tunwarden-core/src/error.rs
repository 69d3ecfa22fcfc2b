use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Core error types for tunwarden operations
#[derive(Error, Debug)]
pub enum TunwardenError {
    #[error("no agent build is published for platform {platform:?}")]
    UnsupportedPlatform { platform: String },

    #[error("download of {url} failed after {attempts} attempts: {message}")]
    Download {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("failed to extract agent archive into {target}: {message}")]
    Extraction { target: PathBuf, message: String },

    #[error("agent {binary} did not report ready within {timeout:?}")]
    StartupTimeout { binary: PathBuf, timeout: Duration },

    #[error("agent process reported fatal error {code}: {message}")]
    AgentProcess { code: i64, message: String },

    #[error("agent process for config {key} exited unexpectedly")]
    ProcessCrashed { key: String },

    #[error("no active tunnel named {name:?}")]
    UnknownTunnel { name: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TunwardenError {
    /// Process exit code for the CLI surface. Zero is reserved for success;
    /// each installer/monitor failure class gets its own code so scripts can
    /// branch without parsing stderr.
    pub fn exit_code(&self) -> i32 {
        match self {
            TunwardenError::Config(_) => 2,
            TunwardenError::UnsupportedPlatform { .. } => 3,
            TunwardenError::Download { .. } => 4,
            TunwardenError::Extraction { .. } => 5,
            TunwardenError::StartupTimeout { .. } => 6,
            TunwardenError::AgentProcess { .. } => 7,
            TunwardenError::ProcessCrashed { .. } => 8,
            TunwardenError::UnknownTunnel { .. } => 9,
            TunwardenError::Io(_) | TunwardenError::Other(_) => 1,
        }
    }

    /// Check if this error indicates a permanent failure that retrying
    /// cannot fix
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TunwardenError::UnsupportedPlatform { .. }
                | TunwardenError::Config(_)
                | TunwardenError::UnknownTunnel { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = TunwardenError::UnsupportedPlatform {
            platform: "plan9".to_string(),
        };
        let display = format!("{error}");
        assert!(display.contains("plan9"));

        let error = TunwardenError::AgentProcess {
            code: 102,
            message: "account limit reached".to_string(),
        };
        let display = format!("{error}");
        assert!(display.contains("102"));
        assert!(display.contains("account limit reached"));
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = vec![
            TunwardenError::Config("bad".into()),
            TunwardenError::UnsupportedPlatform {
                platform: "plan9".into(),
            },
            TunwardenError::Download {
                url: "https://example.com".into(),
                attempts: 3,
                message: "timed out".into(),
            },
            TunwardenError::Extraction {
                target: PathBuf::from("/tmp/agent"),
                message: "corrupt gzip".into(),
            },
            TunwardenError::StartupTimeout {
                binary: PathBuf::from("/tmp/agent"),
                timeout: Duration::from_secs(10),
            },
            TunwardenError::AgentProcess {
                code: 1,
                message: "boom".into(),
            },
            TunwardenError::ProcessCrashed { key: "k".into() },
            TunwardenError::UnknownTunnel { name: "t1".into() },
        ];

        let mut codes: Vec<i32> = errors.iter().map(|e| e.exit_code()).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_error_categorization() {
        assert!(
            TunwardenError::UnsupportedPlatform {
                platform: "plan9".into()
            }
            .is_permanent()
        );
        assert!(TunwardenError::Config("bad".into()).is_permanent());
        assert!(
            !TunwardenError::Download {
                url: "u".into(),
                attempts: 1,
                message: "m".into()
            }
            .is_permanent()
        );
    }
}
