//! Gateway configuration
//!
//! Every option can be given on the command line or through the environment
//! (a `.env` file is loaded first by the binary). [`Args`] is the raw clap
//! surface; [`GatewayConfig::from_args`] validates it and groups it into the
//! settings each component needs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;
use tracing::trace;
use url::Url;

use crate::backoff::BackoffPolicy;

/// Largest delivery batch we allow
pub const MAX_FORWARD_BATCH_SIZE: usize = 5000;

pub const MAX_RETENTION_DAYS: u32 = 3650;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid URL for {name}: {reason}")]
    InvalidUrl { name: &'static str, reason: String },

    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error(transparent)]
    Cli(#[from] clap::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Command line / environment surface of the gateway
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Edge collection and forwarding gateway", long_about = None)]
pub struct Args {
    /// Identifier of this gateway
    #[arg(long, env = "GATEWAY_ID")]
    pub gateway_id: String,

    /// Organization this gateway belongs to
    #[arg(long, env = "ORGANIZATION_ID")]
    pub organization_id: Option<String>,

    /// Address of the ingestion and health API
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: SocketAddr,

    /// SQLite buffer file
    #[arg(long, env = "BUFFER_PATH", default_value = "./gateway-buffer.db")]
    pub buffer_path: PathBuf,

    /// Records older than this are removed whatever their state
    #[arg(long, env = "RETENTION_DAYS", default_value = "7")]
    pub retention_days: u32,

    /// How long delivered records are kept before removal
    #[arg(long, env = "CONFIRMATION_GRACE_SECS", default_value = "3600")]
    pub confirmation_grace_secs: u64,

    #[arg(long, env = "RETENTION_INTERVAL_SECS", default_value = "3600")]
    pub retention_interval_secs: u64,

    /// In-flight records leased longer than this go back to pending
    #[arg(long, env = "IN_FLIGHT_LEASE_SECS", default_value = "600")]
    pub in_flight_lease_secs: u64,

    /// Base URL of the central service
    #[arg(long, env = "UPLINK_URL")]
    pub uplink_url: String,

    #[arg(long, env = "UPLINK_PATH", default_value = "/api/v1/gateway/batches")]
    pub uplink_path: String,

    /// Bearer token for batch delivery
    #[arg(long, env = "UPLINK_TOKEN", hide_env_values = true)]
    pub uplink_token: Option<String>,

    #[arg(long, env = "UPLINK_TIMEOUT_SECS", default_value = "15")]
    pub uplink_timeout_secs: u64,

    #[arg(long, env = "FORWARD_INTERVAL_SECS", default_value = "5")]
    pub forward_interval_secs: u64,

    /// Maximum records per delivery batch
    #[arg(long, env = "FORWARD_BATCH_SIZE", default_value = "500")]
    pub forward_batch_size: usize,

    #[arg(long, env = "BACKOFF_BASE_MS", default_value = "1000")]
    pub backoff_base_ms: u64,

    #[arg(long, env = "BACKOFF_MAX_SECS", default_value = "300")]
    pub backoff_max_secs: u64,

    /// Control channel socket (ws:// or wss://); the channel is off when unset
    #[arg(long, env = "CONTROL_URL")]
    pub control_url: Option<String>,

    #[arg(long, env = "CONTROL_TOKEN", hide_env_values = true)]
    pub control_token: Option<String>,

    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value = "30")]
    pub heartbeat_interval_secs: u64,

    #[arg(long, env = "CONTROL_CONNECT_TIMEOUT_SECS", default_value = "10")]
    pub control_connect_timeout_secs: u64,

    /// Buffer depth above which health is degraded
    #[arg(long, env = "HEALTH_MAX_DEPTH", default_value = "10000")]
    pub health_max_depth: u64,

    /// Disconnect duration above which health is degraded
    #[arg(long, env = "HEALTH_DISCONNECT_SECS", default_value = "120")]
    pub health_disconnect_secs: u64,

    /// Maximum records accepted in one ingest request
    #[arg(long, env = "MAX_INGEST_RECORDS", default_value = "1000")]
    pub max_ingest_records: usize,

    #[arg(long, env = "LOG_LEVEL", value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

/// Retention policy applied to the buffer
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub retention: Duration,
    pub confirmation_grace: Duration,
    pub interval: Duration,
    pub in_flight_lease: Duration,
}

#[derive(Debug, Clone)]
pub struct UplinkConfig {
    pub base_url: Url,
    pub path: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub url: Url,
    pub token: Option<String>,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub max_depth: u64,
    pub disconnect_threshold: Duration,
}

/// Validated gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub gateway_id: String,
    pub organization_id: Option<String>,
    pub bind_addr: SocketAddr,
    pub max_ingest_records: usize,
    pub log_level: LogLevel,

    /// SQLite buffer file
    pub buffer_path: PathBuf,
    pub retention: RetentionConfig,
    pub uplink: UplinkConfig,
    pub forwarder: ForwarderConfig,

    /// `None` when no control URL is configured
    pub control: Option<ControlConfig>,
    pub health: HealthConfig,
}

impl GatewayConfig {
    /// Parse `std::env::args()` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(Args::try_parse()?)
    }

    pub fn try_parse_from<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::from_args(Args::try_parse_from(args)?)
    }

    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let gateway_id = args.gateway_id.trim().to_string();
        if gateway_id.is_empty() {
            return Err(ConfigError::Missing("GATEWAY_ID"));
        }

        let organization_id = args
            .organization_id
            .map(|org| org.trim().to_string())
            .filter(|org| !org.is_empty());

        let base_url = parse_url("UPLINK_URL", &args.uplink_url, &["http", "https"])?;

        let control_url = args
            .control_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| parse_url("CONTROL_URL", url, &["ws", "wss"]))
            .transpose()?;

        if !(1..=MAX_FORWARD_BATCH_SIZE).contains(&args.forward_batch_size) {
            return Err(ConfigError::Invalid {
                name: "FORWARD_BATCH_SIZE",
                reason: format!("must be between 1 and {MAX_FORWARD_BATCH_SIZE}"),
            });
        }
        if args.max_ingest_records == 0 {
            return Err(invalid_zero("MAX_INGEST_RECORDS"));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&args.retention_days) {
            return Err(ConfigError::Invalid {
                name: "RETENTION_DAYS",
                reason: format!("must be between 1 and {MAX_RETENTION_DAYS}"),
            });
        }

        let secs = |name: &'static str, value: u64| {
            if value == 0 {
                Err(invalid_zero(name))
            } else {
                Ok(Duration::from_secs(value))
            }
        };

        let backoff = BackoffPolicy::new(
            Duration::from_millis(args.backoff_base_ms.max(1)),
            secs("BACKOFF_MAX_SECS", args.backoff_max_secs)?,
        );

        let retention = RetentionConfig {
            retention: Duration::from_secs(u64::from(args.retention_days) * 24 * 60 * 60),
            confirmation_grace: Duration::from_secs(args.confirmation_grace_secs),
            interval: secs("RETENTION_INTERVAL_SECS", args.retention_interval_secs)?,
            in_flight_lease: secs("IN_FLIGHT_LEASE_SECS", args.in_flight_lease_secs)?,
        };

        let uplink = UplinkConfig {
            base_url,
            path: args.uplink_path,
            token: args.uplink_token.filter(|t| !t.is_empty()),
            timeout: secs("UPLINK_TIMEOUT_SECS", args.uplink_timeout_secs)?,
        };

        let forwarder = ForwarderConfig {
            interval: secs("FORWARD_INTERVAL_SECS", args.forward_interval_secs)?,
            batch_size: args.forward_batch_size,
            backoff,
        };

        let control = match control_url {
            Some(url) => Some(ControlConfig {
                url,
                token: args.control_token.filter(|t| !t.is_empty()),
                heartbeat_interval: secs("HEARTBEAT_INTERVAL_SECS", args.heartbeat_interval_secs)?,
                connect_timeout: secs(
                    "CONTROL_CONNECT_TIMEOUT_SECS",
                    args.control_connect_timeout_secs,
                )?,
                backoff,
            }),
            None => None,
        };

        let health = HealthConfig {
            max_depth: args.health_max_depth,
            disconnect_threshold: secs("HEALTH_DISCONNECT_SECS", args.health_disconnect_secs)?,
        };

        trace!("configuration validated");

        Ok(Self {
            gateway_id,
            organization_id,
            bind_addr: args.bind_addr,
            max_ingest_records: args.max_ingest_records,
            log_level: args.log_level,
            buffer_path: args.buffer_path,
            retention,
            uplink,
            forwarder,
            control,
            health,
        })
    }
}

fn invalid_zero(name: &'static str) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: "must be greater than 0".to_string(),
    }
}

fn parse_url(name: &'static str, raw: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidUrl {
        name,
        reason: format!("'{raw}': {e}"),
    })?;

    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUrl {
            name,
            reason: format!(
                "scheme '{}' not supported, expected one of {}",
                url.scheme(),
                schemes.join(", ")
            ),
        });
    }

    Ok(url)
}
