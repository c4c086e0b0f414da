//! SFU signaling configuration.
//!
//! Configuration is loaded from environment variables with defaults for
//! everything. Values that are present but unparsable are rejected rather
//! than silently replaced by defaults.

use common::config::{LogFormat, ObservabilityConfig, PortRange};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Default signaling WebSocket bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3016";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default lowest RTC port handed to media workers.
pub const DEFAULT_RTC_MIN_PORT: u16 = 10000;

/// Default highest RTC port handed to media workers.
pub const DEFAULT_RTC_MAX_PORT: u16 = 10100;

/// Default transport listen IP.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default initial available outgoing bitrate (bps).
pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 1_000_000;

/// Default max incoming bitrate per transport (bps). Zero disables the cap.
pub const DEFAULT_MAX_INCOMING_BITRATE: u32 = 1_500_000;

/// Default preferred simulcast spatial layer.
pub const DEFAULT_PREFERRED_SPATIAL_LAYER: u8 = 2;

/// Default preferred simulcast temporal layer.
pub const DEFAULT_PREFERRED_TEMPORAL_LAYER: u8 = 2;

/// Default per-peer egress queue size (responses and notifications).
pub const DEFAULT_PEER_EGRESS_BUFFER: usize = 256;

/// Default graceful shutdown deadline in seconds.
pub const DEFAULT_SHUTDOWN_DEADLINE_SECONDS: u64 = 30;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "sfu";

/// How the worker pool picks a worker for a new router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerSelection {
    /// Fewest live routers, lowest index on ties.
    #[default]
    LeastLoaded,
    /// Rotate through workers regardless of load.
    RoundRobin,
}

impl FromStr for WorkerSelection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "least-loaded" | "least_loaded" => Ok(WorkerSelection::LeastLoaded),
            "round-robin" | "round_robin" => Ok(WorkerSelection::RoundRobin),
            other => Err(ConfigError::InvalidValue(format!(
                "SFU_WORKER_SELECTION must be least-loaded or round-robin, got '{other}'"
            ))),
        }
    }
}

/// What happens to a room once its last peer leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReclaimPolicy {
    /// Close the router, release the worker and unregister the room.
    #[default]
    Eager,
    /// Keep the room and its router until removed explicitly.
    Lazy,
}

impl FromStr for ReclaimPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eager" => Ok(ReclaimPolicy::Eager),
            "lazy" => Ok(ReclaimPolicy::Lazy),
            other => Err(ConfigError::InvalidValue(format!(
                "SFU_ROOM_RECLAIM must be eager or lazy, got '{other}'"
            ))),
        }
    }
}

/// Which room identifiers a peer may join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoomAdmission {
    /// Any identifier; rooms are created on first join.
    #[default]
    Open,
    /// Only identifiers with a live record in the room store.
    Registered,
}

impl FromStr for RoomAdmission {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(RoomAdmission::Open),
            "registered" => Ok(RoomAdmission::Registered),
            other => Err(ConfigError::InvalidValue(format!(
                "SFU_ROOM_ADMISSION must be open or registered, got '{other}'"
            ))),
        }
    }
}

/// Settings applied to every WebRTC transport.
#[derive(Clone, PartialEq, Eq)]
pub struct TransportSettings {
    /// Local IP the transport listens on.
    pub listen_ip: IpAddr,
    /// Public address announced in ICE candidates (NAT / cloud deployments).
    pub announced_address: Option<String>,
    /// Offer UDP candidates.
    pub enable_udp: bool,
    /// Offer TCP candidates.
    pub enable_tcp: bool,
    /// Prefer UDP over TCP.
    pub prefer_udp: bool,
    /// Initial outgoing bitrate estimate (bps).
    pub initial_available_outgoing_bitrate: u32,
    /// Incoming bitrate cap (bps), `None` for uncapped.
    pub max_incoming_bitrate: Option<u32>,
}

impl fmt::Debug for TransportSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSettings")
            .field("listen_ip", &self.listen_ip)
            .field(
                "announced_address",
                &self.announced_address.as_ref().map(|_| "[REDACTED]"),
            )
            .field("enable_udp", &self.enable_udp)
            .field("enable_tcp", &self.enable_tcp)
            .field("prefer_udp", &self.prefer_udp)
            .field(
                "initial_available_outgoing_bitrate",
                &self.initial_available_outgoing_bitrate,
            )
            .field("max_incoming_bitrate", &self.max_incoming_bitrate)
            .finish()
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            announced_address: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: DEFAULT_INITIAL_OUTGOING_BITRATE,
            max_incoming_bitrate: Some(DEFAULT_MAX_INCOMING_BITRATE),
        }
    }
}

/// Preferred simulcast layers requested for new simulcast consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreferredLayers {
    pub spatial: u8,
    pub temporal: u8,
}

impl Default for PreferredLayers {
    fn default() -> Self {
        Self {
            spatial: DEFAULT_PREFERRED_SPATIAL_LAYER,
            temporal: DEFAULT_PREFERRED_TEMPORAL_LAYER,
        }
    }
}

/// Room-level behavior shared by every room actor.
#[derive(Debug, Clone, Default)]
pub struct RoomSettings {
    /// Transport creation settings.
    pub transport: TransportSettings,
    /// Simulcast preferred layers.
    pub preferred_layers: PreferredLayers,
}

/// SFU signaling configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Signaling WebSocket bind address (default: "0.0.0.0:3016").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this instance.
    pub instance_id: String,

    /// Number of media workers in the pool.
    pub num_workers: usize,

    /// Base RTC port range, split evenly across workers.
    pub rtc_port_range: PortRange,

    /// Worker selection strategy.
    pub worker_selection: WorkerSelection,

    /// Room reclamation policy.
    pub room_reclaim: ReclaimPolicy,

    /// Room admission policy.
    pub room_admission: RoomAdmission,

    /// Settings shared by every room.
    pub room: RoomSettings,

    /// Per-peer egress queue size.
    pub peer_egress_buffer: usize,

    /// Graceful shutdown deadline in seconds.
    pub shutdown_deadline_seconds: u64,

    /// Logging settings.
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional variable, falling back to `default` only when absent.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key} has invalid value '{raw}'"))),
        None => Ok(default),
    }
}

fn parse_bool(
    vars: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v == "true" || v == "1" || v == "yes" => Ok(true),
        Some(v) if v == "false" || v == "0" || v == "no" => Ok(false),
        Some(v) => Err(ConfigError::InvalidValue(format!(
            "{key} must be a boolean, got '{v}'"
        ))),
    }
}

fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("SFU_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let num_workers: usize = parse_var(vars, "SFU_NUM_WORKERS", default_num_workers())?;
        if num_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_NUM_WORKERS must be at least 1".to_string(),
            ));
        }

        // Every worker needs its own slice of the port range
        let rtc_min_port = parse_var(vars, "SFU_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "SFU_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        let rtc_port_range = PortRange::new(rtc_min_port, rtc_max_port)
            .map_err(|e| ConfigError::InvalidValue(format!("SFU_RTC_*_PORT: {e}")))?;
        rtc_port_range
            .split(num_workers)
            .map_err(|e| ConfigError::InvalidValue(format!("SFU_RTC_*_PORT: {e}")))?;

        let worker_selection = parse_var(
            vars,
            "SFU_WORKER_SELECTION",
            WorkerSelection::default(),
        )?;
        let room_reclaim = parse_var(vars, "SFU_ROOM_RECLAIM", ReclaimPolicy::default())?;
        let room_admission = parse_var(vars, "SFU_ROOM_ADMISSION", RoomAdmission::default())?;

        let listen_ip: IpAddr = parse_var(
            vars,
            "SFU_LISTEN_IP",
            IpAddr::from([0, 0, 0, 0]),
        )?;
        let announced_address = vars
            .get("SFU_ANNOUNCED_ADDRESS")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let max_incoming_bitrate: u32 = parse_var(
            vars,
            "SFU_MAX_INCOMING_BITRATE",
            DEFAULT_MAX_INCOMING_BITRATE,
        )?;

        let transport = TransportSettings {
            listen_ip,
            announced_address,
            enable_udp: parse_bool(vars, "SFU_ENABLE_UDP", true)?,
            enable_tcp: parse_bool(vars, "SFU_ENABLE_TCP", true)?,
            prefer_udp: parse_bool(vars, "SFU_PREFER_UDP", true)?,
            initial_available_outgoing_bitrate: parse_var(
                vars,
                "SFU_INITIAL_OUTGOING_BITRATE",
                DEFAULT_INITIAL_OUTGOING_BITRATE,
            )?,
            max_incoming_bitrate: (max_incoming_bitrate > 0).then_some(max_incoming_bitrate),
        };

        if !transport.enable_udp && !transport.enable_tcp {
            return Err(ConfigError::InvalidValue(
                "at least one of SFU_ENABLE_UDP and SFU_ENABLE_TCP must be true".to_string(),
            ));
        }

        let preferred_layers = PreferredLayers {
            spatial: parse_var(
                vars,
                "SFU_PREFERRED_SPATIAL_LAYER",
                DEFAULT_PREFERRED_SPATIAL_LAYER,
            )?,
            temporal: parse_var(
                vars,
                "SFU_PREFERRED_TEMPORAL_LAYER",
                DEFAULT_PREFERRED_TEMPORAL_LAYER,
            )?,
        };

        let peer_egress_buffer: usize =
            parse_var(vars, "SFU_PEER_EGRESS_BUFFER", DEFAULT_PEER_EGRESS_BUFFER)?;
        if peer_egress_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_PEER_EGRESS_BUFFER must be at least 1".to_string(),
            ));
        }

        let shutdown_deadline_seconds = parse_var(
            vars,
            "SFU_SHUTDOWN_DEADLINE_SECONDS",
            DEFAULT_SHUTDOWN_DEADLINE_SECONDS,
        )?;

        let log_format = match vars.get("SFU_LOG_FORMAT").map(|s| s.trim().to_ascii_lowercase()) {
            None => LogFormat::Text,
            Some(v) if v == "text" => LogFormat::Text,
            Some(v) if v == "json" => LogFormat::Json,
            Some(v) => {
                return Err(ConfigError::InvalidValue(format!(
                    "SFU_LOG_FORMAT must be text or json, got '{v}'"
                )))
            }
        };
        let observability = ObservabilityConfig {
            log_filter: vars.get("SFU_LOG_FILTER").cloned(),
            log_format,
        };

        // Generate instance ID
        let instance_id = vars.get("SFU_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            instance_id,
            num_workers,
            rtc_port_range,
            worker_selection,
            room_reclaim,
            room_admission,
            room: RoomSettings {
                transport,
                preferred_layers,
            },
            peer_egress_buffer,
            shutdown_deadline_seconds,
            observability,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            ("SFU_INSTANCE_ID".to_string(), "sfu-test".to_string()),
            ("SFU_NUM_WORKERS".to_string(), "2".to_string()),
        ])
    }

    #[test]
    fn test_from_vars_defaults() {
        let config = Config::from_vars(&base_vars()).unwrap();

        assert_eq!(config.instance_id, "sfu-test");
        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.rtc_port_range.min, DEFAULT_RTC_MIN_PORT);
        assert_eq!(config.rtc_port_range.max, DEFAULT_RTC_MAX_PORT);
        assert_eq!(config.worker_selection, WorkerSelection::LeastLoaded);
        assert_eq!(config.room_reclaim, ReclaimPolicy::Eager);
        assert_eq!(config.room_admission, RoomAdmission::Open);
        assert_eq!(
            config.room.transport.max_incoming_bitrate,
            Some(DEFAULT_MAX_INCOMING_BITRATE)
        );
        assert_eq!(config.room.preferred_layers, PreferredLayers::default());
        assert_eq!(config.observability.log_format, LogFormat::Text);
    }

    #[test]
    fn test_from_vars_custom_values() {
        let mut vars = base_vars();
        vars.insert("SFU_WORKER_SELECTION".to_string(), "round-robin".to_string());
        vars.insert("SFU_ROOM_RECLAIM".to_string(), "lazy".to_string());
        vars.insert("SFU_ROOM_ADMISSION".to_string(), "registered".to_string());
        vars.insert("SFU_RTC_MIN_PORT".to_string(), "40000".to_string());
        vars.insert("SFU_RTC_MAX_PORT".to_string(), "40999".to_string());
        vars.insert("SFU_LISTEN_IP".to_string(), "127.0.0.1".to_string());
        vars.insert("SFU_ANNOUNCED_ADDRESS".to_string(), "203.0.113.7".to_string());
        vars.insert("SFU_MAX_INCOMING_BITRATE".to_string(), "0".to_string());
        vars.insert("SFU_LOG_FORMAT".to_string(), "json".to_string());

        let config = Config::from_vars(&vars).unwrap();

        assert_eq!(config.worker_selection, WorkerSelection::RoundRobin);
        assert_eq!(config.room_reclaim, ReclaimPolicy::Lazy);
        assert_eq!(config.room_admission, RoomAdmission::Registered);
        assert_eq!(config.rtc_port_range, PortRange { min: 40000, max: 40999 });
        assert_eq!(
            config.room.transport.listen_ip,
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            config.room.transport.announced_address.as_deref(),
            Some("203.0.113.7")
        );
        assert_eq!(config.room.transport.max_incoming_bitrate, None);
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_enum_value_rejected() {
        let mut vars = base_vars();
        vars.insert("SFU_ROOM_RECLAIM".to_string(), "sometimes".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("SFU_ROOM_RECLAIM")));
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let mut vars = base_vars();
        vars.insert("SFU_RTC_MIN_PORT".to_string(), "20000".to_string());
        vars.insert("SFU_RTC_MAX_PORT".to_string(), "10000".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_port_range_too_small_for_workers_rejected() {
        let mut vars = base_vars();
        vars.insert("SFU_NUM_WORKERS".to_string(), "8".to_string());
        vars.insert("SFU_RTC_MIN_PORT".to_string(), "10000".to_string());
        vars.insert("SFU_RTC_MAX_PORT".to_string(), "10003".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut vars = base_vars();
        vars.insert("SFU_NUM_WORKERS".to_string(), "0".to_string());

        assert!(Config::from_vars(&vars).is_err());
    }

    #[test]
    fn test_unparsable_number_rejected() {
        let mut vars = base_vars();
        vars.insert("SFU_RTC_MIN_PORT".to_string(), "ten thousand".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(msg)) if msg.contains("SFU_RTC_MIN_PORT")
        ));
    }

    #[test]
    fn test_udp_and_tcp_cannot_both_be_disabled() {
        let mut vars = base_vars();
        vars.insert("SFU_ENABLE_UDP".to_string(), "false".to_string());
        vars.insert("SFU_ENABLE_TCP".to_string(), "0".to_string());

        assert!(Config::from_vars(&vars).is_err());
    }

    #[test]
    fn test_debug_redacts_announced_address() {
        let mut vars = base_vars();
        vars.insert("SFU_ANNOUNCED_ADDRESS".to_string(), "198.51.100.23".to_string());

        let config = Config::from_vars(&vars).unwrap();
        let debug_output = format!("{config:?}");

        assert!(!debug_output.contains("198.51.100.23"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn test_generated_instance_id_has_prefix() {
        let mut vars = base_vars();
        vars.remove("SFU_INSTANCE_ID");

        let config = Config::from_vars(&vars).unwrap();
        assert!(config.instance_id.starts_with("sfu-"));
    }
}
