//! Dispatcher configuration
//!
//! [`DispatcherConfig::load`] layers, lowest first: built-in defaults, an
//! optional TOML file, then `DISPATCHER_*` environment variables
//! (`DISPATCHER_PING_INTERVAL=10`, `DISPATCHER_FAILOVER=true`, ...).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DispatcherError, Result};
use crate::health::{ProbeSettings, ReplyCodes, Thresholds};
use crate::load::TrackerSettings;
use crate::registry::RegistryOptions;
use crate::select::SelectOptions;
use crate::types::{ProbingMode, SocketSpec};
use crate::uri::SipUri;

/// Prefix of the environment variables read by [`DispatcherConfig::load`]
pub const ENV_PREFIX: &str = "DISPATCHER";

impl From<::config::ConfigError> for DispatcherError {
    fn from(e: ::config::ConfigError) -> Self {
        DispatcherError::Config(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Destination list file
    pub list_file: Option<PathBuf>,
    /// Overwrite a destination URI already set on the message
    pub force_dst: bool,
    /// Keep the last destination of each set as the default
    pub use_default: bool,
    /// Record alternates for failover
    pub failover: bool,
    /// Hash only the user part of URIs
    pub hash_user_only: bool,
    /// Expression hashed by the expression algorithm
    pub hash_expression: Option<String>,

    /// Failed probes before a destination goes inactive
    pub probing_threshold: u32,
    /// Successful probes before an inactive destination is used again
    pub inactive_threshold: u32,
    pub ping_method: String,
    pub ping_from: String,
    /// Seconds between probe rounds, 0 disables probing
    pub ping_interval: u64,
    pub probing_mode: ProbingMode,
    /// Extra success codes, `code=404;class=3`
    pub ping_reply_codes: Option<String>,
    pub ping_latency_stats: bool,
    pub latency_estimator_alpha: f64,
    pub outbound_proxy: Option<String>,

    /// Socket for destinations without a `socket` attribute, `proto:host:port`
    pub default_socket: Option<String>,
    pub try_ipv6: bool,

    /// Call-load tracker buckets, 0 disables tracking
    pub load_hash_size: usize,
    /// Seconds a tracked call is kept at most
    pub load_expire: u64,
    /// Seconds a tracked call is kept while unconfirmed
    pub load_init_expire: u64,
    /// Seconds between tracker sweeps
    pub load_check_interval: u64,

    /// Seed for weighted tables and random selection
    pub rng_seed: Option<u64>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            list_file: None,
            force_dst: true,
            use_default: false,
            failover: false,
            hash_user_only: false,
            hash_expression: None,
            probing_threshold: 1,
            inactive_threshold: 1,
            ping_method: "OPTIONS".to_string(),
            ping_from: "sip:dispatcher@localhost".to_string(),
            ping_interval: 0,
            probing_mode: ProbingMode::None,
            ping_reply_codes: None,
            ping_latency_stats: false,
            latency_estimator_alpha: 0.9,
            outbound_proxy: None,
            default_socket: None,
            try_ipv6: true,
            load_hash_size: 0,
            load_expire: 7200,
            load_init_expire: 7200,
            load_check_interval: 30,
            rng_seed: None,
        }
    }
}

impl DispatcherConfig {
    /// Load defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder().add_source(::config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let config: DispatcherConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the dispatcher cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.ping_method.trim().is_empty() {
            return Err(DispatcherError::Config("ping_method is empty".to_string()));
        }
        self.ping_from
            .parse::<SipUri>()
            .map_err(|e| DispatcherError::Config(format!("ping_from: {}", e)))?;
        if let Some(proxy) = &self.outbound_proxy {
            proxy
                .parse::<SipUri>()
                .map_err(|e| DispatcherError::Config(format!("outbound_proxy: {}", e)))?;
        }
        if !(self.latency_estimator_alpha > 0.0 && self.latency_estimator_alpha <= 1.0) {
            return Err(DispatcherError::Config(format!(
                "latency_estimator_alpha must be in (0, 1], got {}",
                self.latency_estimator_alpha
            )));
        }
        if self.load_hash_size > 0 && self.load_check_interval == 0 {
            return Err(DispatcherError::Config(
                "load_check_interval must be positive when call-load tracking is enabled".to_string(),
            ));
        }
        self.reply_codes()?;
        self.default_socket()?;
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            probing: self.probing_threshold,
            inactive: self.inactive_threshold,
        }
    }

    fn reply_codes(&self) -> Result<ReplyCodes> {
        match &self.ping_reply_codes {
            Some(codes) => ReplyCodes::parse(codes),
            None => Ok(ReplyCodes::default()),
        }
    }

    fn default_socket(&self) -> Result<Option<SocketSpec>> {
        self.default_socket.as_deref().map(str::parse).transpose()
    }

    pub fn registry_options(&self) -> Result<RegistryOptions> {
        Ok(RegistryOptions {
            try_ipv6: self.try_ipv6,
            default_socket: self.default_socket()?,
            rng_seed: self.rng_seed,
        })
    }

    pub fn select_options(&self) -> SelectOptions {
        SelectOptions {
            force_dst: self.force_dst,
            use_default: self.use_default,
            failover: self.failover,
            hash_user_only: self.hash_user_only,
            hash_expression: self.hash_expression.clone(),
            thresholds: self.thresholds(),
            rng_seed: self.rng_seed,
        }
    }

    pub fn probe_settings(&self) -> Result<ProbeSettings> {
        Ok(ProbeSettings {
            method: self.ping_method.clone(),
            from_uri: self.ping_from.clone(),
            mode: self.probing_mode,
            reply_codes: self.reply_codes()?,
            outbound_proxy: self.outbound_proxy.clone(),
            thresholds: self.thresholds(),
            latency_stats: self.ping_latency_stats,
            latency_alpha: self.latency_estimator_alpha,
        })
    }

    /// Tracker settings, `None` when call-load tracking is off
    pub fn tracker_settings(&self) -> Option<TrackerSettings> {
        if self.load_hash_size == 0 {
            return None;
        }
        Some(TrackerSettings {
            buckets: self.load_hash_size,
            expire: Duration::from_secs(self.load_expire),
            init_expire: Duration::from_secs(self.load_init_expire),
        })
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval > 0).then(|| Duration::from_secs(self.ping_interval))
    }

    pub fn load_check_interval(&self) -> Duration {
        Duration::from_secs(self.load_check_interval.max(1))
    }
}
