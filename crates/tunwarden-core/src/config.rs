use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the installer's download retry loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadConfig {
    /// Maximum number of download attempts before surfacing a failure
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Minimum delay between retry attempts (in milliseconds)
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Maximum delay between retry attempts (in milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl DownloadConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("max_attempts must be at least 1"));
        }
        if self.max_attempts > 10 {
            return Err(anyhow::anyhow!(
                "max_attempts should not exceed 10 to avoid excessive retries"
            ));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(anyhow::anyhow!(
                "min_delay_ms cannot be greater than max_delay_ms"
            ));
        }
        Ok(())
    }
}

/// Protocol of a requested forwarding endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProto {
    #[default]
    Http,
    Tcp,
}

impl TunnelProto {
    /// Protocol implied by a public URL's scheme, when recognizable
    pub fn from_url(url: &str) -> Option<Self> {
        let (scheme, _) = url.split_once("://")?;
        match scheme {
            "http" | "https" => Some(TunnelProto::Http),
            "tcp" => Some(TunnelProto::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for TunnelProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelProto::Http => f.write_str("http"),
            TunnelProto::Tcp => f.write_str("tcp"),
        }
    }
}

/// Main supervisor configuration for one tunnel request.
///
/// Constructed once per session via the builder; the auth token is a secret
/// and is redacted from the Debug output.
#[derive(Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// Path to the tunnel agent binary (installed on demand)
    pub binary_path: PathBuf,

    /// Agent config file; generated next to the binary when not set.
    /// Doubles as the process-identifying cache key.
    #[builder(default)]
    #[serde(default)]
    pub config_path: Option<PathBuf>,

    /// Region hint passed to the agent
    #[builder(default)]
    #[serde(default)]
    pub region: Option<String>,

    /// Account auth token. Injected through the environment, never argv.
    #[builder(default)]
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Write the auth token into the generated agent config file instead of
    /// the environment
    #[builder(default)]
    #[serde(default)]
    pub auth_token_in_file: bool,

    /// Local port to forward
    pub port: u16,

    #[builder(default)]
    #[serde(default)]
    pub proto: TunnelProto,

    /// Port of the agent's local web inspection interface
    #[builder(default = "default_web_port()")]
    #[serde(default = "default_web_port")]
    pub web_port: u16,

    /// How long to wait for the agent's ready event (in milliseconds)
    #[builder(default = "default_startup_timeout_ms()")]
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL (in milliseconds)
    #[builder(default = "default_termination_grace_ms()")]
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,

    /// Retry a failed agent spawn exactly once. Off by default: download
    /// retries are bounded and configured separately, spawn retries are
    /// opt-in.
    #[builder(default)]
    #[serde(default)]
    pub retry_on_spawn_failure: bool,

    /// Extra environment variables for the agent process
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[builder(default)]
    #[serde(default)]
    pub download: DownloadConfig,
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }

    /// Agent config file path, falling back to a generated one beside the
    /// binary
    pub fn resolved_config_path(&self) -> PathBuf {
        match &self.config_path {
            Some(path) => path.clone(),
            None => match self.binary_path.parent() {
                Some(dir) => dir.join("tunwarden.yml"),
                None => PathBuf::from("tunwarden.yml"),
            },
        }
    }

    /// Process-identifying key: one agent process per config file
    pub fn cache_key(&self) -> String {
        self.resolved_config_path().to_string_lossy().into_owned()
    }

    /// Local address the requested tunnel forwards to
    pub fn local_addr(&self) -> String {
        format!("localhost:{}", self.port)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.binary_path.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("binary_path must not be empty"));
        }
        if self.port == 0 {
            return Err(anyhow::anyhow!("port must be non-zero"));
        }
        if self.startup_timeout_ms == 0 {
            return Err(anyhow::anyhow!("startup_timeout_ms must be non-zero"));
        }
        self.download.validate()
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("binary_path", &self.binary_path)
            .field("config_path", &self.config_path)
            .field("region", &self.region)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("auth_token_in_file", &self.auth_token_in_file)
            .field("port", &self.port)
            .field("proto", &self.proto)
            .field("web_port", &self.web_port)
            .field("startup_timeout_ms", &self.startup_timeout_ms)
            .field("termination_grace_ms", &self.termination_grace_ms)
            .field("retry_on_spawn_failure", &self.retry_on_spawn_failure)
            .field("env", &self.env)
            .field("download", &self.download)
            .finish()
    }
}

impl TunnelConfigBuilder {
    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

// Default value functions for serde and the builder
fn default_max_attempts() -> u32 {
    3
}
fn default_min_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_web_port() -> u16 {
    4041
}
fn default_startup_timeout_ms() -> u64 {
    10_000
}
fn default_termination_grace_ms() -> u64 {
    2_000
}
