//! Configuration loading and types for SurveyShield.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  A handful of deployment-specific values can then be
//! overridden from the environment (see [`Config::apply_env_overrides`]) so
//! the same file can be shared by every instance of a fleet.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Deployment mode and inter-instance settings.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Leader election tuning (used when the shared store has no value yet).
    #[serde(default)]
    pub election: ElectionConfig,

    /// Delayed-submission flush tuning.
    #[serde(default)]
    pub flush: FlushConfig,

    /// Free-text anonymization settings.
    #[serde(default)]
    pub anonymization: AnonymizationConfig,

    /// Durable storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probes).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// How many instances share the coordination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// One process; leader election is bypassed entirely.
    #[default]
    Single,
    /// Several processes racing for leadership through the shared store.
    Multi,
}

impl std::str::FromStr for DeploymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "single-instance" => Ok(Self::Single),
            "multi" | "multi-instance" => Ok(Self::Multi),
            other => Err(format!("unknown deployment mode '{other}'")),
        }
    }
}

/// Cluster configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Single-instance or multi-instance deployment.
    #[serde(default)]
    pub mode: DeploymentMode,

    /// Host other instances use to reach this one. Falls back to
    /// `server.host` when empty.
    #[serde(default)]
    pub advertise_host: String,

    /// Port other instances use to reach this one. Falls back to
    /// `server.port` when absent.
    #[serde(default)]
    pub advertise_port: Option<u16>,

    /// Shared secret used to sign inter-instance requests.
    #[serde(default)]
    pub shared_secret: String,

    /// Timeout for inter-instance HTTP calls, in seconds.
    #[serde(default = "default_peer_timeout")]
    pub request_timeout_seconds: u64,

    /// Whether followers hand submissions to the leader before falling back
    /// to their own queue.
    #[serde(default = "default_true")]
    pub forward_submissions: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::default(),
            advertise_host: String::new(),
            advertise_port: None,
            shared_secret: String::new(),
            request_timeout_seconds: default_peer_timeout(),
            forward_submissions: true,
        }
    }
}

/// Leader election defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ElectionConfig {
    /// Heartbeat age after which a leader may be taken over.
    #[serde(default = "default_leader_timeout_minutes")]
    pub leader_timeout_minutes: u64,

    /// Interval between election checks.
    #[serde(default = "default_leader_check_interval")]
    pub check_interval_seconds: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            leader_timeout_minutes: default_leader_timeout_minutes(),
            check_interval_seconds: default_leader_check_interval(),
        }
    }
}

/// Raw flush tuning as it appears in the YAML file.
///
/// Validated into a [`crate::dss::FlushPolicy`] once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct FlushConfig {
    /// Seconds between scheduler ticks.
    #[serde(default = "default_flush_interval")]
    pub check_interval_seconds: u64,

    /// Starting flush probability, in percent.
    #[serde(default = "default_min_percentage")]
    pub min_percentage: u32,

    /// Ceiling for the flush probability, in percent.
    #[serde(default = "default_max_percentage")]
    pub max_percentage: u32,

    /// Probability added on every eligible tick that does not flush.
    #[serde(default = "default_percentage_increment")]
    pub percentage_increment: u32,

    /// Chance, in percent, that the reset after a flush is skipped.
    #[serde(default = "default_reset_skip_percentage")]
    pub reset_skip_percentage: u32,

    /// Pending responses a survey needs before it can be flushed on a tick.
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    /// Seconds an empty survey queue is kept before its state is discarded.
    #[serde(default = "default_idle_state_ttl")]
    pub idle_state_ttl_seconds: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_flush_interval(),
            min_percentage: default_min_percentage(),
            max_percentage: default_max_percentage(),
            percentage_increment: default_percentage_increment(),
            reset_skip_percentage: default_reset_skip_percentage(),
            min_batch_size: default_min_batch_size(),
            idle_state_ttl_seconds: default_idle_state_ttl(),
        }
    }
}

/// Anonymization configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AnonymizationConfig {
    /// Run free-text answers through the redaction pipeline.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AnonymizationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Durable storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database holding settings and responses.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

impl Config {
    /// Host and port this instance advertises to its peers.
    pub fn advertised_endpoint(&self) -> (String, u16) {
        let host = if self.cluster.advertise_host.is_empty() {
            self.server.host.clone()
        } else {
            self.cluster.advertise_host.clone()
        };
        let port = self.cluster.advertise_port.unwrap_or(self.server.port);
        (host, port)
    }

    /// Override selected values from `SHIELD_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("SHIELD_MODE") {
            self.cluster.mode = mode.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(host) = lookup("SHIELD_HOST") {
            self.cluster.advertise_host = host;
        }
        if let Some(port) = lookup("SHIELD_PORT") {
            self.cluster.advertise_port = Some(port.parse()?);
        }
        if let Some(secret) = lookup("SHIELD_SHARED_SECRET") {
            self.cluster.shared_secret = secret;
        }
        if let Some(path) = lookup("SHIELD_DB_PATH") {
            self.storage.path = path;
        }
        Ok(())
    }

    /// Apply a `host:port` listen override.  The advertised endpoint follows
    /// it unless `cluster.advertise_*` are set explicitly.
    pub fn apply_bind(&mut self, bind: &str) -> anyhow::Result<()> {
        let (host, port) = bind
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("bind address '{bind}' must be host:port"))?;
        let port: u16 = port
            .parse()
            .map_err(|e| anyhow::anyhow!("bind address '{bind}': invalid port: {e}"))?;
        self.server.host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        self.server.port = port;
        Ok(())
    }

    /// Listen address for the HTTP server.
    pub fn bind_address(&self) -> String {
        if self.server.host.contains(':') {
            format!("[{}]:{}", self.server.host, self.server.port)
        } else {
            format!("{}:{}", self.server.host, self.server.port)
        }
    }

    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cluster.mode == DeploymentMode::Multi && self.cluster.shared_secret.is_empty() {
            anyhow::bail!("cluster.shared_secret is required in multi-instance mode");
        }
        if self.election.check_interval_seconds == 0 {
            anyhow::bail!("election.check_interval_seconds must be at least 1");
        }
        if !(1..=MAX_LEADER_TIMEOUT_MINUTES).contains(&self.election.leader_timeout_minutes) {
            anyhow::bail!(
                "election.leader_timeout_minutes must be between 1 and {MAX_LEADER_TIMEOUT_MINUTES}"
            );
        }
        if self.flush.check_interval_seconds == 0 {
            anyhow::bail!("flush.check_interval_seconds must be at least 1");
        }
        Ok(())
    }
}

// -- Defaults ----------------------------------------------------------------

/// One week.
const MAX_LEADER_TIMEOUT_MINUTES: u64 = 7 * 24 * 60;

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8480
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_peer_timeout() -> u64 {
    10
}

fn default_leader_timeout_minutes() -> u64 {
    5
}

fn default_leader_check_interval() -> u64 {
    30
}

fn default_flush_interval() -> u64 {
    60
}

fn default_min_percentage() -> u32 {
    10
}

fn default_max_percentage() -> u32 {
    80
}

fn default_percentage_increment() -> u32 {
    5
}

fn default_reset_skip_percentage() -> u32 {
    20
}

fn default_min_batch_size() -> usize {
    3
}

fn default_idle_state_ttl() -> u64 {
    3600
}

fn default_db_path() -> String {
    "./data/surveyshield.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.cluster.mode, DeploymentMode::Single);
        assert_eq!(config.election.leader_timeout_minutes, 5);
        assert_eq!(config.flush.min_batch_size, 3);
        assert!(config.anonymization.enabled);
    }

    #[test]
    fn test_parse_multi_instance_yaml() {
        let yaml = r#"
server:
  host: 10.0.0.4
  port: 9000
cluster:
  mode: multi
  shared_secret: s3cret
flush:
  min_percentage: 5
  max_percentage: 50
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cluster.mode, DeploymentMode::Multi);
        assert_eq!(config.advertised_endpoint(), ("10.0.0.4".to_string(), 9000));
        assert_eq!(config.flush.max_percentage, 50);
        assert_eq!(config.flush.percentage_increment, 5);
        config.validate().unwrap();
    }

    #[test]
    fn test_multi_mode_requires_secret() {
        let mut config = Config::default();
        config.cluster.mode = DeploymentMode::Multi;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SHIELD_MODE", "multi"),
            ("SHIELD_HOST", "shield-2"),
            ("SHIELD_PORT", "8481"),
            ("SHIELD_SHARED_SECRET", "abc"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.cluster.mode, DeploymentMode::Multi);
        assert_eq!(config.advertised_endpoint(), ("shield-2".to_string(), 8481));
        assert_eq!(config.cluster.shared_secret, "abc");
    }

    #[test]
    fn test_bind_override_moves_advertised_endpoint() {
        let mut config = Config::default();
        config.apply_bind("10.1.2.3:9001").unwrap();
        assert_eq!(config.bind_address(), "10.1.2.3:9001");
        assert_eq!(config.advertised_endpoint(), ("10.1.2.3".to_string(), 9001));

        // An explicit advertised endpoint still wins.
        let mut config = Config::default();
        config.cluster.advertise_host = "shield-1".to_string();
        config.cluster.advertise_port = Some(8480);
        config.apply_bind("0.0.0.0:9001").unwrap();
        assert_eq!(config.bind_address(), "0.0.0.0:9001");
        assert_eq!(config.advertised_endpoint(), ("shield-1".to_string(), 8480));
    }

    #[test]
    fn test_bad_bind_rejected() {
        let mut config = Config::default();
        assert!(config.apply_bind("9001").is_err());
        assert!(config.apply_bind("host:port").is_err());
        assert_eq!(config.server.port, 8480);
    }

    #[test]
    fn test_leader_timeout_bounds() {
        let mut config = Config::default();
        config.election.leader_timeout_minutes = 0;
        assert!(config.validate().is_err());
        config.election.leader_timeout_minutes = u64::MAX;
        assert!(config.validate().is_err());
        config.election.leader_timeout_minutes = 5;
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_mode_override_rejected() {
        let mut config = Config::default();
        let result = config.apply_overrides(|name| {
            (name == "SHIELD_MODE").then(|| "triple".to_string())
        });
        assert!(result.is_err());
    }
}
