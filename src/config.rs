//! Configuration for the rpc fabric.
use crate::error::ConfigError;
use crate::forwarder::{ForwarderOptions, DEFAULT_MAXBATCH};
use crate::monitor::{MonitorSettings, PROBE_ACCOUNT};
use crate::transport::DEFAULT_USER_AGENT;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, serde::Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,

    pub forwarder: ForwarderConfig,

    pub monitor: MonitorConfig,

    /// Default tracing filter, e.g. "info" or "rpc_fabric=debug". RUST_LOG wins when set.
    pub log_level: String,
}

#[derive(Debug, serde::Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    /// Acceptance resumes once a drain brings the queue down to this many tasks
    pub low: usize,

    /// Acceptance stops once the queue holds this many tasks
    pub high: usize,

    /// Namespace prepended to calls that don't name one, e.g. "condenser_api"
    pub namespace: Option<String>,

    /// Maximum number of commands per JSON-RPC batch
    pub maxbatch: usize,
}

#[derive(Debug, serde::Deserialize, Clone)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Fixed node to forward to. Mutually exclusive with `use_health_injector`.
    pub host_url: Option<String>,

    /// Follow the fastest node found by the health monitors instead of a fixed one.
    /// Defaults to true exactly when no `host_url` is given.
    pub use_health_injector: Option<bool>,

    /// Pad single-command batches with a throwaway command
    pub pad_singletons: bool,

    pub user_agent: String,

    /// The maximum time in milliseconds a single batch POST may take
    pub request_timeout_ms: u64,
}

#[derive(Debug, serde::Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    /// Nodes to start monitoring with. The first one is used until something was measured.
    pub seed_nodes: Vec<String>,

    /// Account whose json_metadata advertises candidate nodes
    pub probe_account: String,

    pub queue_low: usize,

    pub queue_high: usize,

    pub ok_interval_sec: u64,

    pub permanent_failure_interval_sec: u64,

    pub temporary_failure_interval_sec: u64,

    /// How long the best node's sample stays authoritative, on top of the latency of the
    /// sample that challenges it
    pub rescan_grace_sec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            queue: QueueConfig::default(),
            forwarder: ForwarderConfig::default(),
            monitor: MonitorConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            low: 8000,
            high: 10000,
            namespace: None,
            maxbatch: DEFAULT_MAXBATCH,
        }
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            host_url: None,
            use_health_injector: None,
            pad_singletons: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let settings = MonitorSettings::default();
        MonitorConfig {
            seed_nodes: vec!["https://api.steemit.com".to_string()],
            probe_account: PROBE_ACCOUNT.to_string(),
            queue_low: settings.queue_low,
            queue_high: settings.queue_high,
            ok_interval_sec: settings.ok_interval.as_secs(),
            permanent_failure_interval_sec: settings.permanent_failure_interval.as_secs(),
            temporary_failure_interval_sec: settings.temporary_failure_interval.as_secs(),
            rescan_grace_sec: settings.rescan_grace.as_secs(),
        }
    }
}

/// Load the configuration from the config json file
/// path is src/config.json
impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("src/config.json")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config_data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&config_data)
    }

    pub fn from_json(config_data: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(config_data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.low > self.queue.high || self.queue.high == 0 {
            return Err(ConfigError::Invalid(format!(
                "queue.low ({}) must not exceed queue.high ({}), which must be positive",
                self.queue.low, self.queue.high
            )));
        }
        if self.queue.maxbatch == 0 {
            return Err(ConfigError::Invalid("queue.maxbatch must be at least 1".into()));
        }
        match (&self.forwarder.host_url, self.uses_health_injector()) {
            (Some(_), true) => {
                return Err(ConfigError::Invalid(
                    "forwarder.host_url and forwarder.use_health_injector are mutually exclusive".into(),
                ))
            }
            (None, false) => {
                return Err(ConfigError::Invalid(
                    "forwarder needs either host_url or use_health_injector".into(),
                ))
            }
            (Some(url), false) => {
                url::Url::parse(url).map_err(|e| {
                    ConfigError::Invalid(format!("forwarder.host_url {:?} is not a URL: {}", url, e))
                })?;
            }
            (None, true) => {}
        }
        if self.uses_health_injector() && self.monitor.seed_nodes.is_empty() {
            return Err(ConfigError::Invalid(
                "monitor.seed_nodes must not be empty when the health injector is used".into(),
            ));
        }
        if self.monitor.queue_low > self.monitor.queue_high || self.monitor.queue_high == 0 {
            return Err(ConfigError::Invalid(format!(
                "monitor.queue_low ({}) must not exceed monitor.queue_high ({}), which must be positive",
                self.monitor.queue_low, self.monitor.queue_high
            )));
        }
        Ok(())
    }

    pub fn uses_health_injector(&self) -> bool {
        self.forwarder
            .use_health_injector
            .unwrap_or(self.forwarder.host_url.is_none())
    }

    pub fn forwarder_options(&self) -> ForwarderOptions {
        ForwarderOptions {
            maxbatch: self.queue.maxbatch,
            pad_singletons: self.forwarder.pad_singletons,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.forwarder.request_timeout_ms)
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            probe_account: self.monitor.probe_account.clone(),
            queue_low: self.monitor.queue_low,
            queue_high: self.monitor.queue_high,
            ok_interval: Duration::from_secs(self.monitor.ok_interval_sec),
            permanent_failure_interval: Duration::from_secs(self.monitor.permanent_failure_interval_sec),
            temporary_failure_interval: Duration::from_secs(self.monitor.temporary_failure_interval_sec),
            rescan_grace: Duration::from_secs(self.monitor.rescan_grace_sec),
        }
    }
}
