//! Realtime transport configuration
//!
//! Configuration is resolved once at startup, either from environment
//! variables ([`RealtimeConfig::from_env`]) or programmatically through the
//! struct literals below. The backend factory consumes the resolved config
//! and never re-reads the environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Default websocket connect deadline
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum channels a single connection will serve (fan-out fairness bound)
pub const MAX_CHANNELS_PER_CONNECTION: usize = 20;

/// Top-level realtime configuration
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Whether realtime is enabled at all; when false the factory returns
    /// the no-op backend and no sockets are ever opened
    pub enabled: bool,

    /// Hosted pub/sub provider credentials (optional)
    pub hosted: Option<HostedConfig>,

    /// Pooled raw-socket backend configuration (optional)
    pub pooled: Option<PooledConfig>,
}

/// Hosted pub/sub provider configuration
#[derive(Debug, Clone)]
pub struct HostedConfig {
    /// Provider application key
    pub key: String,

    /// Provider cluster identifier (e.g. "us2")
    pub cluster: String,

    /// Provider websocket host
    pub host: String,

    /// Connect deadline
    pub connect_timeout: Duration,
}

/// Pooled raw-socket backend configuration
#[derive(Debug, Clone)]
pub struct PooledConfig {
    /// Raw websocket endpoints the pool balances across
    pub endpoints: Vec<String>,

    /// Connection pool tuning
    pub pool: PoolConfig,

    /// Outbound message queue tuning
    pub queue: QueueConfig,

    /// Window during which an identical (channel, event, data) inbound
    /// delivery is suppressed
    pub dedup_ttl: Duration,

    /// Outbound batches at or above this many messages are sent as one
    /// compressed binary envelope instead of individual text frames
    pub binary_batch_threshold: usize,
}

/// Connection pool tuning
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live connections across all endpoints
    pub max_connections: usize,

    /// Maximum live connections per endpoint
    pub max_connections_per_endpoint: usize,

    /// Deadline for opening a single connection
    pub connection_timeout: Duration,

    /// Interval between health-score ticks
    pub health_check_interval: Duration,

    /// Interval between latency-sampling pings on each connection
    pub ping_interval: Duration,

    /// Reconnect attempts before a dropped connection is removed for good
    pub max_reconnect_attempts: u32,

    /// First reconnect delay; doubled (times `reconnect_multiplier`) per attempt
    pub reconnect_initial_delay: Duration,

    /// Upper bound on the reconnect delay
    pub reconnect_max_delay: Duration,

    /// Exponential backoff multiplier
    pub reconnect_multiplier: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_connections_per_endpoint: 5,
            connection_timeout: DEFAULT_CONNECT_TIMEOUT,
            health_check_interval: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_multiplier: 2.0,
        }
    }
}

/// Outbound message queue tuning
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum queued messages; overflow evicts the oldest entry of the
    /// lowest populated priority class
    pub max_size: usize,

    /// Maximum messages handed to the sender per flush
    pub batch_size: usize,

    /// Delivery attempts before a message is dropped with a `Failed` event
    pub max_retries: u32,

    /// Interval between flush events
    pub flush_interval: Duration,

    /// Optional file the persistent-flagged messages mirror to, reloaded at
    /// construction; writes are best-effort and never block the send path
    pub persist_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            batch_size: 50,
            max_retries: 3,
            flush_interval: Duration::from_millis(100),
            persist_path: None,
        }
    }
}

impl Default for PooledConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            pool: PoolConfig::default(),
            queue: QueueConfig::default(),
            dedup_ttl: Duration::from_secs(5),
            binary_batch_threshold: 10,
        }
    }
}

impl RealtimeConfig {
    /// A config with realtime switched off; the factory yields the no-op
    /// backend, useful in tests and degraded deployments
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            hosted: None,
            pooled: None,
        }
    }

    /// A pooled-backend config with default tuning over the given endpoints
    pub fn pooled(endpoints: Vec<String>) -> Self {
        Self {
            enabled: true,
            hosted: None,
            pooled: Some(PooledConfig {
                endpoints,
                ..PooledConfig::default()
            }),
        }
    }

    /// Load configuration from environment variables
    ///
    /// In production mode (`ENVIRONMENT=production`) the pooled backend
    /// requires `REALTIME_ENDPOINTS` to be explicitly set; in development a
    /// localhost default is used with a warning.
    pub fn from_env() -> Result<Self> {
        let is_production = env::var("ENVIRONMENT")
            .map(|e| e.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let enabled = parse_bool_var("REALTIME_ENABLED", true)?;
        if !enabled {
            return Ok(Self::disabled());
        }

        let hosted = Self::load_hosted()?;
        let pooled = Self::load_pooled(is_production)?;

        if hosted.is_none() && pooled.is_none() {
            tracing::warn!(
                "realtime enabled but no backend configured, falling back to no-op"
            );
        }

        Ok(Self {
            enabled,
            hosted,
            pooled,
        })
    }

    fn load_hosted() -> Result<Option<HostedConfig>> {
        let key = match env::var("REALTIME_HOSTED_KEY").ok().filter(|s| !s.is_empty()) {
            Some(key) => key,
            None => return Ok(None),
        };

        Ok(Some(HostedConfig {
            key,
            cluster: env::var("REALTIME_HOSTED_CLUSTER").unwrap_or_else(|_| "us2".to_string()),
            host: env::var("REALTIME_HOSTED_HOST")
                .unwrap_or_else(|_| "realtime.courtside.live".to_string()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }))
    }

    fn load_pooled(is_production: bool) -> Result<Option<PooledConfig>> {
        if !parse_bool_var("REALTIME_POOLED_ENABLED", false)? {
            return Ok(None);
        }

        let endpoints: Vec<String> = match env::var("REALTIME_ENDPOINTS") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ if is_production => {
                bail!(
                    "REALTIME_ENDPOINTS is required in production when the pooled \
                     backend is enabled. Provide a comma-separated websocket URL list."
                );
            }
            _ => {
                tracing::warn!(
                    "REALTIME_ENDPOINTS not set, using ws://localhost:9100. \
                     This is only acceptable in development mode."
                );
                vec!["ws://localhost:9100".to_string()]
            }
        };

        for endpoint in &endpoints {
            let parsed = url::Url::parse(endpoint)
                .with_context(|| format!("invalid realtime endpoint: {endpoint}"))?;
            if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
                bail!("realtime endpoint must use ws:// or wss://: {endpoint}");
            }
        }

        let mut config = PooledConfig {
            endpoints,
            ..PooledConfig::default()
        };

        if let Ok(raw) = env::var("REALTIME_QUEUE_PERSIST_PATH") {
            if !raw.is_empty() {
                config.queue.persist_path = Some(PathBuf::from(raw));
            }
        }

        Ok(Some(config))
    }
}

fn parse_bool_var(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("invalid boolean for {name}: {other}"),
        },
        Err(_) => Ok(default),
    }
}
