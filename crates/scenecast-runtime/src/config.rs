//! Session configuration
//!
//! One explicit struct handed to every participant and daemon at
//! construction. Durations are written as humantime strings in JSON
//! (`"300ms"`, `"1.5s"`).

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use scenecast_core::{ParticipantId, SceneCastError, SceneCastResult, PROTOCOL_VERSION};
use scenecast_flush::DEFAULT_MAX_PENDING_FLUSHES;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::outbox::DEFAULT_MAX_QUEUED_SENDS;

/// Default port of the discovery daemon
pub const DEFAULT_DISCOVERY_PORT: u16 = 5999;

/// Minimum slack between keep-alive interval and timeout before warning
pub const KEEP_ALIVE_SLACK: Duration = Duration::from_millis(100);

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Where this participant listens on the network
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcpConfig {
    pub bind_address: String,
    #[serde(default)]
    pub port: u16,
}

impl TcpConfig {
    pub fn socket_addr(&self) -> SceneCastResult<SocketAddr> {
        resolve(&self.bind_address, self.port)
            .ok_or_else(|| SceneCastError::InvalidConfig(format!("invalid bind address {}", self.bind_address)))
    }
}

/// Well-known address of the discovery daemon
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    pub address: String,
    #[serde(default = "default_discovery_port")]
    pub port: u16,
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

impl DiscoveryConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        DiscoveryConfig {
            address: address.into(),
            port,
        }
    }

    pub fn socket_addr(&self) -> SceneCastResult<SocketAddr> {
        if self.address.trim().is_empty() {
            return Err(SceneCastError::InvalidDiscoveryAddress("empty address".into()));
        }
        if self.port == 0 {
            return Err(SceneCastError::InvalidDiscoveryAddress(format!(
                "{}:0 has no port",
                self.address
            )));
        }
        resolve(&self.address, self.port).ok_or_else(|| {
            SceneCastError::InvalidDiscoveryAddress(format!("{}:{}", self.address, self.port))
        })
    }
}

fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

/// Which transport implementation a participant runs on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Network,
    Loopback,
}

/// Participant and daemon configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub participant_name: String,
    /// Random when absent
    pub participant_id: Option<u64>,
    pub tcp: Option<TcpConfig>,
    pub local_only: bool,
    pub discovery: Option<DiscoveryConfig>,
    #[serde(with = "duration_str")]
    pub keep_alive_interval: Duration,
    #[serde(with = "duration_str")]
    pub keep_alive_timeout: Duration,
    pub worker_pool_size: usize,
    #[serde(with = "duration_str")]
    pub watchdog_interval: Duration,
    #[serde(with = "duration_str")]
    pub max_frame_callback_polling_time: Duration,
    pub protocol_version: u32,
    /// Out-of-order flushes a subscription may hold before its provider is dropped
    pub max_pending_flushes: usize,
    /// Payloads queued for one peer before the connection is dropped
    pub max_queued_sends: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            participant_name: "scenecast".into(),
            participant_id: None,
            tcp: Some(TcpConfig {
                bind_address: "127.0.0.1".into(),
                port: 0,
            }),
            local_only: false,
            discovery: None,
            keep_alive_interval: Duration::from_millis(300),
            keep_alive_timeout: Duration::from_millis(1500),
            worker_pool_size: 2,
            watchdog_interval: Duration::from_secs(1),
            max_frame_callback_polling_time: Duration::from_millis(10),
            protocol_version: PROTOCOL_VERSION,
            max_pending_flushes: DEFAULT_MAX_PENDING_FLUSHES,
            max_queued_sends: DEFAULT_MAX_QUEUED_SENDS,
        }
    }
}

impl SessionConfig {
    /// In-process mesh with fast liveness detection
    pub fn local_testing() -> Self {
        SessionConfig {
            tcp: None,
            local_only: true,
            keep_alive_interval: Duration::from_millis(20),
            keep_alive_timeout: Duration::from_millis(300),
            watchdog_interval: Duration::from_millis(200),
            ..Default::default()
        }
    }

    /// LAN deployment with a discovery daemon on the default port
    pub fn lan(discovery_host: impl Into<String>) -> Self {
        SessionConfig {
            tcp: Some(TcpConfig {
                bind_address: "0.0.0.0".into(),
                port: 0,
            }),
            discovery: Some(DiscoveryConfig::new(discovery_host, DEFAULT_DISCOVERY_PORT)),
            worker_pool_size: 4,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.participant_name = name.into();
        self
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.participant_id = Some(id);
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn from_json_str(json: &str) -> SceneCastResult<Self> {
        let config: SessionConfig = serde_json::from_str(json)
            .map_err(|e| SceneCastError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> SceneCastResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn to_json(&self) -> SceneCastResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| SceneCastError::InvalidConfig(e.to_string()))
    }

    /// Reject contradictory or unusable settings
    pub fn validate(&self) -> SceneCastResult<()> {
        self.transport_kind()?;
        if let Some(tcp) = &self.tcp {
            tcp.socket_addr()?;
        }
        if let Some(discovery) = &self.discovery {
            discovery.socket_addr()?;
        }
        if self.worker_pool_size == 0 {
            return Err(SceneCastError::InvalidConfig("worker_pool_size must be at least 1".into()));
        }
        if self.keep_alive_interval.is_zero() || self.keep_alive_timeout.is_zero() {
            return Err(SceneCastError::InvalidConfig("keep-alive durations must be non-zero".into()));
        }
        if self.max_pending_flushes == 0 || self.max_queued_sends == 0 {
            return Err(SceneCastError::InvalidConfig("queue limits must be at least 1".into()));
        }
        if self.watchdog_interval.is_zero() {
            return Err(SceneCastError::InvalidConfig("watchdog_interval must be non-zero".into()));
        }
        if self.participant_id == Some(0) || self.participant_id == Some(ParticipantId::DAEMON.0) {
            return Err(SceneCastError::InvalidConfig("participant_id is reserved".into()));
        }
        if self.keep_alive_timeout < self.keep_alive_interval + KEEP_ALIVE_SLACK {
            warn!(
                interval = ?self.keep_alive_interval,
                timeout = ?self.keep_alive_timeout,
                "keep-alive timeout is too close to the interval, connections may drop spuriously"
            );
        }
        Ok(())
    }

    pub fn transport_kind(&self) -> SceneCastResult<TransportKind> {
        match (self.tcp.is_some(), self.local_only) {
            (true, true) => Err(SceneCastError::ConflictingTransports),
            (true, false) => Ok(TransportKind::Network),
            (false, true) => Ok(TransportKind::Loopback),
            (false, false) => Err(SceneCastError::InvalidConfig(
                "no transport configured: set tcp or local_only".into(),
            )),
        }
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
            .map(ParticipantId::new)
            .unwrap_or_else(ParticipantId::random)
    }
}
