//! Relay configuration loaded from a [`config::Config`].
//!
//! Lookup follows the namespacing rules used throughout the crate:
//! 1. `{name}.{key}` (e.g., `camera_feed.poll_interval_ms`)
//! 2. `{key}` (e.g., `poll_interval_ms`)
//! 3. Hard-coded default

use crate::error::Error;
use crate::rtp::{DriveMode, SessionParams};
use crate::transport::{TransportKind, DEFAULT_MAX_SEND_BACKLOG};
use ::config::{Config, ConfigError};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Default address the relay listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:15000";
/// Default packet size limit: a 1500 byte payload plus room for the RTP header.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1500 + 64;

const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_ACCEPT_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_MAINTENANCE_INTERVAL_MS: u64 = 100;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_bool(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<bool, ConfigError> {
    get_namespaced_value(config, name, key, Config::get_bool)
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

// Missing keys fall back to the default; present but unparsable keys are
// reported.
fn optional<T>(result: Result<T, ConfigError>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Resolves `addr` to the first socket address it names.
pub fn resolve_addr(addr: &str) -> Result<SocketAddr, Error> {
    if let Ok(parsed) = addr.parse::<SocketAddr>() {
        return Ok(parsed);
    }
    addr.to_socket_addrs()
        .map_err(|_| Error::InvalidAddress(addr.to_string()))?
        .next()
        .ok_or_else(|| Error::InvalidAddress(addr.to_string()))
}

/// Settings for a [`Relay`](crate::Relay).
///
/// # Configuration Keys
///
/// - `transport_type`: `"tcp"` or `"udp"` (defaults to `"tcp"`)
/// - `listen_addr`: address to bind (defaults to `0.0.0.0:15000`)
/// - `drive_mode`: `"external"` or `"internal"` (defaults to `"external"`)
/// - `poll_interval_ms`: wait bound while streaming (defaults to 1000)
/// - `accept_poll_interval_ms`: wait bound while listening (defaults to 200)
/// - `max_packet_size`: largest accepted packet in bytes (defaults to 1564)
/// - `max_send_backlog`: unsent bytes queued per stream peer before packets
///   are dropped (defaults to 262140, at least one framed packet)
/// - `accept_own_packets`: queue packets carrying our own SSRC (defaults to false)
/// - `maintenance_interval_ms`: wait bound of the internal maintenance task
///   (defaults to 100)
///
/// # Example
///
/// ```toml
/// transport_type = "tcp"
/// listen_addr = "0.0.0.0:9001"
///
/// [camera_feed]
/// drive_mode = "internal"
/// poll_interval_ms = 500
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub transport: TransportKind,
    pub listen_addr: SocketAddr,
    pub drive_mode: DriveMode,
    pub poll_interval: Duration,
    pub accept_poll_interval: Duration,
    pub max_packet_size: usize,
    pub max_send_backlog: usize,
    pub accept_own_packets: bool,
    pub maintenance_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 15000)),
            drive_mode: DriveMode::External,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            accept_poll_interval: Duration::from_millis(DEFAULT_ACCEPT_POLL_INTERVAL_MS),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_send_backlog: DEFAULT_MAX_SEND_BACKLOG,
            accept_own_packets: false,
            maintenance_interval: Duration::from_millis(DEFAULT_MAINTENANCE_INTERVAL_MS),
        }
    }
}

impl RelayConfig {
    /// Reads the relay settings from `config` without a namespace.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads the relay settings from `config`, preferring keys under `name`.
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let defaults = Self::default();

        let transport = match optional(get_namespaced_string(config, name, "transport_type"))? {
            Some(value) => value.parse()?,
            None => defaults.transport,
        };

        let listen_addr = optional(get_namespaced_string(config, name, "listen_addr"))?
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = resolve_addr(&listen_addr)?;

        let drive_mode = match optional(get_namespaced_string(config, name, "drive_mode"))? {
            Some(value) => value.parse()?,
            None => defaults.drive_mode,
        };

        let poll_interval = optional(get_namespaced_u64(config, name, "poll_interval_ms"))?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);
        let accept_poll_interval =
            optional(get_namespaced_u64(config, name, "accept_poll_interval_ms"))?
                .map(Duration::from_millis)
                .unwrap_or(defaults.accept_poll_interval);
        let maintenance_interval =
            optional(get_namespaced_u64(config, name, "maintenance_interval_ms"))?
                .map(Duration::from_millis)
                .unwrap_or(defaults.maintenance_interval);

        let max_packet_size = optional(get_namespaced_usize(config, name, "max_packet_size"))?
            .unwrap_or(defaults.max_packet_size);
        if max_packet_size < crate::rtp::RTP_HEADER_SIZE || max_packet_size > u16::MAX as usize {
            return Err(Error::InvalidConfigValue {
                key: "max_packet_size".to_string(),
                reason: format!(
                    "{max_packet_size} is outside {}..={}",
                    crate::rtp::RTP_HEADER_SIZE,
                    u16::MAX
                ),
            });
        }

        // A full-size packet plus its length prefix must always fit.
        let max_send_backlog = optional(get_namespaced_usize(config, name, "max_send_backlog"))?
            .unwrap_or(defaults.max_send_backlog);
        if max_send_backlog < max_packet_size + 2 {
            return Err(Error::InvalidConfigValue {
                key: "max_send_backlog".to_string(),
                reason: format!(
                    "{max_send_backlog} is smaller than a framed packet of {} bytes",
                    max_packet_size + 2
                ),
            });
        }

        let accept_own_packets =
            optional(get_namespaced_bool(config, name, "accept_own_packets"))?
                .unwrap_or(defaults.accept_own_packets);

        Ok(Self {
            transport,
            listen_addr,
            drive_mode,
            poll_interval,
            accept_poll_interval,
            max_packet_size,
            max_send_backlog,
            accept_own_packets,
            maintenance_interval,
        })
    }

    /// Session parameters for bindings created under this configuration.
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            max_packet_size: self.max_packet_size,
            max_send_backlog: self.max_send_backlog,
            accept_own_packets: self.accept_own_packets,
            drive_mode: self.drive_mode,
            maintenance_interval: self.maintenance_interval,
            ..SessionParams::default()
        }
    }
}
