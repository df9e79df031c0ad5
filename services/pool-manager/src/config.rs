//! Configuration for the pool manager.
//!
//! Everything is read from `VPNPOOL_*` environment variables at startup.
//! Only the VPN credentials are required; a missing credential is fatal.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use vpnpool_reconcile::{
    LayoutError, PoolLayout, DEFAULT_BASE_PORT, DEFAULT_CAPACITY, DEFAULT_MONITOR_INTERVAL,
    DEFAULT_NAME_PREFIX, DEFAULT_ROTATION_INTERVAL,
};

use crate::orchestrator::RotationOrder;

/// Default directory service base URL.
pub const DEFAULT_DIRECTORY_URL: &str = "https://api.nordvpn.com";

/// Default geo filter: country ids queried from the directory.
pub const DEFAULT_COUNTRY_IDS: &[u32] = &[195, 108, 97, 212, 238, 114, 211, 100, 131, 101];

/// Default upstream result cap.
pub const DEFAULT_DIRECTORY_LIMIT: u32 = 100;

/// Default proxy container image.
pub const DEFAULT_IMAGE: &str = "mogzol/nordvpn-tinyproxy:latest";

/// Configuration errors. All of them abort startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required credential: {0}")]
    MissingCredential(&'static str),

    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// VPN service credentials passed to every container.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Container settings shared by every slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerTemplate {
    /// Image reference.
    pub image: String,

    /// Proxy port inside the container, bound to the slot's host port.
    pub proxy_port: u16,

    /// DNS servers handed to the container.
    pub dns: Vec<String>,

    /// Runtime restart policy name.
    pub restart_policy: String,
}

impl Default for ContainerTemplate {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            proxy_port: 8888,
            dns: vec!["1.1.1.1".to_string()],
            restart_policy: "unless-stopped".to_string(),
        }
    }
}

/// Directory service settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub country_ids: Vec<u32>,
    pub limit: u32,
    pub request_timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_DIRECTORY_URL.to_string(),
            country_ids: DEFAULT_COUNTRY_IDS.to_vec(),
            limit: DEFAULT_DIRECTORY_LIMIT,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Timer periods for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub rotation_interval: Duration,
    pub monitor_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
        }
    }
}

/// Pool manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Status surface listen address.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Pool capacity, port range and naming.
    pub layout: PoolLayout,

    /// Per-container runtime settings.
    pub container: ContainerTemplate,

    /// VPN credentials.
    pub credentials: Credentials,

    /// Docker Engine API socket.
    pub docker_socket: PathBuf,

    /// Upper bound on any single runtime call.
    pub runtime_timeout: Duration,

    /// Whether rotation cleans up before or after fetching candidates.
    pub rotation_order: RotationOrder,

    pub directory: DirectoryConfig,

    pub schedule: ScheduleConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let username = var("VPNPOOL_USERNAME").ok_or(ConfigError::MissingCredential(
            "VPNPOOL_USERNAME",
        ))?;
        let password = var("VPNPOOL_PASSWORD").ok_or(ConfigError::MissingCredential(
            "VPNPOOL_PASSWORD",
        ))?;

        let listen_addr = parse_or(var("VPNPOOL_LISTEN_ADDR"), "VPNPOOL_LISTEN_ADDR", || {
            SocketAddr::from(([0, 0, 0, 0], 3000))
        })?;

        let capacity = parse_or(var("VPNPOOL_CAPACITY"), "VPNPOOL_CAPACITY", || {
            DEFAULT_CAPACITY
        })?;
        let base_port = parse_or(var("VPNPOOL_BASE_PORT"), "VPNPOOL_BASE_PORT", || {
            DEFAULT_BASE_PORT
        })?;
        let name_prefix =
            var("VPNPOOL_NAME_PREFIX").unwrap_or_else(|| DEFAULT_NAME_PREFIX.to_string());
        let layout = PoolLayout::new(capacity, base_port, name_prefix).map_err(|e| {
            let var = match e {
                LayoutError::EmptyPool => "VPNPOOL_CAPACITY",
                LayoutError::PortRangeOverflow { .. } => "VPNPOOL_BASE_PORT",
                LayoutError::InvalidPrefix(_) => "VPNPOOL_NAME_PREFIX",
            };
            ConfigError::Invalid {
                var,
                message: e.to_string(),
            }
        })?;

        let defaults = ContainerTemplate::default();
        let container = ContainerTemplate {
            image: var("VPNPOOL_IMAGE").unwrap_or(defaults.image),
            proxy_port: parse_or(var("VPNPOOL_PROXY_PORT"), "VPNPOOL_PROXY_PORT", || {
                defaults.proxy_port
            })?,
            dns: var("VPNPOOL_DNS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.dns),
            restart_policy: var("VPNPOOL_RESTART_POLICY").unwrap_or(defaults.restart_policy),
        };

        let defaults = DirectoryConfig::default();
        let country_ids = match var("VPNPOOL_COUNTRY_IDS") {
            Some(raw) => split_list(&raw)
                .iter()
                .map(|id| id.parse::<u32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ConfigError::Invalid {
                    var: "VPNPOOL_COUNTRY_IDS",
                    message: e.to_string(),
                })?,
            None => defaults.country_ids,
        };
        let directory = DirectoryConfig {
            base_url: var("VPNPOOL_DIRECTORY_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            country_ids,
            limit: parse_or(var("VPNPOOL_DIRECTORY_LIMIT"), "VPNPOOL_DIRECTORY_LIMIT", || {
                defaults.limit
            })?,
            request_timeout: defaults.request_timeout,
        };

        let defaults = ScheduleConfig::default();
        let schedule = ScheduleConfig {
            rotation_interval: secs_or(
                var("VPNPOOL_ROTATION_INTERVAL_SECS"),
                "VPNPOOL_ROTATION_INTERVAL_SECS",
                defaults.rotation_interval,
            )?,
            monitor_interval: secs_or(
                var("VPNPOOL_MONITOR_INTERVAL_SECS"),
                "VPNPOOL_MONITOR_INTERVAL_SECS",
                defaults.monitor_interval,
            )?,
        };

        let runtime_timeout = secs_or(
            var("VPNPOOL_RUNTIME_TIMEOUT_SECS"),
            "VPNPOOL_RUNTIME_TIMEOUT_SECS",
            Duration::from_secs(60),
        )?;

        let rotation_order = parse_or(
            var("VPNPOOL_ROTATION_ORDER"),
            "VPNPOOL_ROTATION_ORDER",
            RotationOrder::default,
        )?;

        let docker_socket = var("VPNPOOL_DOCKER_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/run/docker.sock"));

        let log_level = var("VPNPOOL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            log_level,
            layout,
            container,
            credentials: Credentials { username, password },
            docker_socket,
            runtime_timeout,
            rotation_order,
            directory,
            schedule,
        })
    }
}

fn parse_or<T, D>(raw: Option<String>, var: &'static str, default: D) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    D: FnOnce() -> T,
{
    match raw {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            message: e.to_string(),
        }),
        None => Ok(default()),
    }
}

fn secs_or(
    raw: Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_or(raw, var, || default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            var,
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
