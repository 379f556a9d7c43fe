//! Configuration file support for fpmsyncd
//!
//! Loads and validates fpmsyncd configuration from TOML files.
//! Default location: /etc/sonic/fpmsyncd.toml
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-6: Configuration Settings - Validated daemon settings
//! - SC-7: Boundary Protection - FPM listener bound to loopback by default

use crate::error::{FpmError, Result};
use crate::framing::{DEFAULT_BATCH_SIZE, FPM_MAX_MSG_LEN, FPM_MAX_WIRE_LEN, FPM_MSG_HDR_LEN};
use crate::netlink::NETLINK_HEADER_LEN;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/fpmsyncd.toml";

/// Default TCP port of the FPM server
pub const FPM_DEFAULT_PORT: u16 = 2620;

/// FPM transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FpmConfig {
    /// Address the FPM listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port of the FPM listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted FPM message, header included
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,

    /// Number of maximum-size messages the reassembly buffer holds
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Event loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLoopConfig {
    /// Bounded wait of one select iteration in milliseconds
    #[serde(default = "default_select_timeout")]
    pub select_timeout_ms: u64,
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Redis host
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    /// Redis port
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Redis database number for APPL_DB
    #[serde(default = "default_appl_db_number")]
    pub appl_db_number: u32,
}

/// Route handling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Seconds a route dump may stay open without NLMSG_DONE
    #[serde(default = "default_dump_timeout")]
    pub dump_timeout_secs: u64,

    /// Interfaces whose routes are never published
    #[serde(default = "default_ignored_interfaces")]
    pub ignored_interfaces: Vec<String>,
}

/// Complete fpmsyncd configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FpmsyncConfig {
    #[serde(default)]
    pub fpm: FpmConfig,

    #[serde(default)]
    pub event_loop: EventLoopConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub routing: RoutingConfig,
}

// Default functions
fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    FPM_DEFAULT_PORT
}

fn default_max_message_len() -> usize {
    FPM_MAX_MSG_LEN
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_select_timeout() -> u64 {
    1000
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_appl_db_number() -> u32 {
    0
}

fn default_dump_timeout() -> u64 {
    120
}

fn default_ignored_interfaces() -> Vec<String> {
    vec!["eth0".to_string(), "docker0".to_string()]
}

impl Default for FpmConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_message_len: default_max_message_len(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            select_timeout_ms: default_select_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            appl_db_number: default_appl_db_number(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            dump_timeout_secs: default_dump_timeout(),
            ignored_interfaces: default_ignored_interfaces(),
        }
    }
}

impl FpmConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

impl DatabaseConfig {
    /// Redis connection URL for APPL_DB
    pub fn appl_db_url(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.redis_host, self.redis_port, self.appl_db_number
        )
    }
}

impl FpmsyncConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                FpmError::Config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(FpmError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.event_loop.select_timeout_ms)
    }

    pub fn dump_timeout(&self) -> Duration {
        Duration::from_secs(self.routing.dump_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // NIST: SC-7 - The FPM peer is unauthenticated; never listen off-host
        if !self.fpm.bind_address.is_loopback() {
            return Err(FpmError::Config(format!(
                "bind_address must be a loopback address, got {}",
                self.fpm.bind_address
            )));
        }

        let min_len = FPM_MSG_HDR_LEN + NETLINK_HEADER_LEN;
        if self.fpm.max_message_len < min_len || self.fpm.max_message_len > FPM_MAX_WIRE_LEN {
            return Err(FpmError::Config(format!(
                "max_message_len must be {}-{}",
                min_len, FPM_MAX_WIRE_LEN
            )));
        }

        if self.fpm.batch_size == 0 {
            return Err(FpmError::Config("batch_size must be > 0".to_string()));
        }

        if self.event_loop.select_timeout_ms == 0 {
            return Err(FpmError::Config(
                "select_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.database.redis_port == 0 {
            return Err(FpmError::Config("redis_port must be > 0".to_string()));
        }

        Ok(())
    }
}
