//! Adapter settings and the `tagsql` command line.
//!
//! An [`AdapterConfig`] bundles the connection string with pool sizing and TLS
//! material. Pool knobs may also ride along in the URL query string.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_PRE_WARM_RATIO: f64 = 0.7;
pub const DEFAULT_ACQUIRE_SAMPLE_INTERVAL: u32 = 64;
pub const DEFAULT_RELEASE_SAMPLE_INTERVAL: u32 = 128;

/// Lower bound of the warm idle set, regardless of pool size.
pub const MIN_WARM_IDLE: u32 = 2;

/// Sizing and pre-warm behaviour of the connection pool. Unset fields fall
/// back to the `DEFAULT_*` constants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolOptions {
    pub max_connections: Option<u32>,
    /// Accepted for compatibility; idle connections live until the pool is disposed.
    pub idle_timeout_secs: Option<u64>,
    pub pre_warm: Option<bool>,
    /// Fraction of capacity at which creation triggers a pre-warm.
    pub pre_warm_ratio: Option<f64>,
    /// Check the warm idle set on every Nth acquisition.
    pub acquire_sample_interval: Option<u32>,
    /// Check the warm idle set on every Nth release.
    pub release_sample_interval: Option<u32>,
}

impl PoolOptions {
    /// Never below 1, so a pool built from unvalidated options can still serve.
    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS).max(1)
    }

    pub fn idle_timeout_or_default(&self) -> u64 {
        self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)
    }

    pub fn pre_warm_or_default(&self) -> bool {
        self.pre_warm.unwrap_or(true)
    }

    pub fn pre_warm_ratio_or_default(&self) -> f64 {
        self.pre_warm_ratio.unwrap_or(DEFAULT_PRE_WARM_RATIO)
    }

    pub fn acquire_sample_interval_or_default(&self) -> u32 {
        self.acquire_sample_interval
            .unwrap_or(DEFAULT_ACQUIRE_SAMPLE_INTERVAL)
            .max(1)
    }

    pub fn release_sample_interval_or_default(&self) -> u32 {
        self.release_sample_interval
            .unwrap_or(DEFAULT_RELEASE_SAMPLE_INTERVAL)
            .max(1)
    }

    /// Pool size at which a connection creation triggers a background pre-warm.
    pub fn pre_warm_threshold(&self) -> u32 {
        (self.max_connections_or_default() as f64 * self.pre_warm_ratio_or_default()).floor()
            as u32
    }

    /// Minimum number of idle connections kept warm by sampled checks.
    pub fn min_idle(&self) -> u32 {
        let tenth = (self.max_connections_or_default() as f64 * 0.1).floor() as u32;
        tenth.max(MIN_WARM_IDLE)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == Some(0) {
            return Err("max_connections must be at least 1".to_string());
        }
        match self.pre_warm_ratio {
            Some(ratio) if !(ratio > 0.0 && ratio <= 1.0) => {
                return Err(format!("pre_warm_ratio ({ratio}) must be in the range (0, 1]"));
            }
            _ => {}
        }
        if self.acquire_sample_interval == Some(0) || self.release_sample_interval == Some(0) {
            return Err("sample intervals must be at least 1".to_string());
        }
        Ok(())
    }
}

/// TLS settings applied to every physical connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    pub enabled: bool,
    /// Verify the server certificate chain and host name (default: true)
    pub reject_unauthorized: bool,
    /// PEM-encoded CA certificate
    pub ca: Option<String>,
    /// PEM-encoded client certificate
    pub cert: Option<String>,
    /// PEM-encoded client key
    pub key: Option<String>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            reject_unauthorized: true,
            ca: None,
            cert: None,
            key: None,
        }
    }
}

/// Complete adapter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Connection URL (sensitive - not logged).
    pub connection_string: String,
    #[serde(default)]
    pub pool: PoolOptions,
    #[serde(default)]
    pub tls: TlsOptions,
}

/// URL query keys consumed by the adapter instead of the driver.
const ADAPTER_URL_KEYS: [&str; 3] = ["max_connections", "connection_limit", "idle_timeout"];

fn is_adapter_key(key: &str) -> bool {
    ADAPTER_URL_KEYS
        .iter()
        .any(|known| key.eq_ignore_ascii_case(known))
}

impl AdapterConfig {
    /// Build a configuration from a connection string alone.
    ///
    /// Adapter-only query parameters (`max_connections`, its `connection_limit`
    /// alias and `idle_timeout`) are moved into [`PoolOptions`]; everything else
    /// stays in the URL for the driver. Strings the URL parser rejects are kept
    /// verbatim so the connection-string normalizer can still repair them.
    ///
    /// # Examples
    ///
    /// ```text
    /// postgres://app:secret@db:5432/shop?max_connections=10
    /// postgresql://app@db/shop?schema=tenant_a&connection_limit=5
    /// ```
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut config = Self {
            connection_string: s.to_string(),
            ..Self::default()
        };

        let Ok(mut url) = Url::parse(s) else {
            return Ok(config);
        };
        if !url.query_pairs().any(|(k, _)| is_adapter_key(&k)) {
            return Ok(config);
        }

        let (ours, theirs): (Vec<_>, Vec<_>) = url
            .query_pairs()
            .map(|(k, v)| (k.to_ascii_lowercase(), k.into_owned(), v.into_owned()))
            .partition(|(lower, _, _)| is_adapter_key(lower));

        if theirs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut()
                .clear()
                .extend_pairs(theirs.iter().map(|(_, k, v)| (k, v)));
        }

        let lookup = |name: &str| {
            ours.iter()
                .find(|(lower, _, _)| lower == name)
                .map(|(_, _, v)| v.as_str())
        };
        config.pool = PoolOptions {
            max_connections: lookup("max_connections")
                .or_else(|| lookup("connection_limit"))
                .and_then(|v| v.parse().ok()),
            idle_timeout_secs: lookup("idle_timeout").and_then(|v| v.parse().ok()),
            ..PoolOptions::default()
        };
        config.pool.validate()?;
        config.connection_string = url.to_string();
        Ok(config)
    }

    pub fn with_pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }
}

/// Command-line arguments of the `tagsql` binary.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tagsql",
    about = "Run positional-parameter SQL through the tagsql adapter and print JSON results",
    version,
    author
)]
pub struct Config {
    /// Database connection URL.
    #[arg(short = 'd', long = "database", value_name = "URL", env = "DATABASE_URL")]
    pub database: String,

    /// Maximum pool size (overrides the URL's max_connections)
    #[arg(long, env = "TAGSQL_MAX_CONNECTIONS")]
    pub max_connections: Option<u32>,

    /// Default tracing filter when RUST_LOG is unset
    #[arg(long, default_value = "info", env = "TAGSQL_LOG_LEVEL")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "TAGSQL_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a row-returning statement and print the result set.
    Query {
        sql: String,
        /// Positional arguments as JSON literals; non-JSON text is bound as a string.
        #[arg(short, long = "arg", value_name = "JSON")]
        args: Vec<String>,
    },
    /// Run a statement and print the affected row count.
    Execute {
        sql: String,
        #[arg(short, long = "arg", value_name = "JSON")]
        args: Vec<String>,
    },
    /// Run a `;`-separated script on one connection.
    Script { script: String },
}

impl Config {
    /// Build the adapter configuration, applying CLI overrides.
    pub fn adapter_config(&self) -> Result<AdapterConfig, String> {
        let mut config = AdapterConfig::parse(&self.database)?;
        if let Some(max) = self.max_connections {
            config.pool.max_connections = Some(max);
        }
        config.pool.validate()?;
        Ok(config)
    }
}
