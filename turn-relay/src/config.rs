//! Configuration loading for garlic-turn.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`). Every
//! section and field is optional.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use turn_core::LifetimePolicy;

/// Root configuration for garlic-turn.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// SAM bridge and overlay session configuration.
    #[serde(default)]
    pub overlay: OverlayConfig,
    /// Allocation, permission, channel and nonce lifetimes.
    #[serde(default)]
    pub lifetimes: LifetimesConfig,
    /// Rate limiting and quotas.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
    /// Cleanup task configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Rooms seeded into the in-process room registry.
    #[serde(default)]
    pub rooms: Vec<RoomConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Long-term credential realm (default: rtchat.io).
    #[serde(default = "default_realm")]
    pub realm: String,
    /// Address the server is published at, used for turn:/stun: URLs (default: 127.0.0.1).
    #[serde(default = "default_public_address")]
    pub public_address: String,
    /// Listening port (default: 3478).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// SOFTWARE attribute value on responses.
    #[serde(default = "default_software")]
    pub software: String,
    /// Also listen on a conventional UDP socket (default: false).
    ///
    /// Such clients can use Binding but can never authenticate.
    #[serde(default)]
    pub conventional_listener: bool,
}

/// SAM bridge and overlay session configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    /// SAM bridge TCP control address (default: 127.0.0.1:7656).
    #[serde(default = "default_sam_address")]
    pub sam_address: String,
    /// SAM bridge UDP datagram address (default: 127.0.0.1:7655).
    #[serde(default = "default_sam_udp_address")]
    pub sam_udp_address: String,
    /// Name of the control session (default: rtcchat-turn).
    #[serde(default = "default_control_session")]
    pub control_session: String,
    /// Prefix for relay session names (default: rtcchat-turn-udp).
    #[serde(default = "default_relay_prefix")]
    pub relay_session_prefix: String,
    /// Tunnel options passed to SESSION CREATE.
    #[serde(default = "default_tunnel_options")]
    pub tunnel_options: Vec<String>,
    /// Timeout in seconds for each bridge step while opening a session (default: 120).
    ///
    /// Building tunnels can take a while on a fresh router.
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
}

/// Lifetimes in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct LifetimesConfig {
    /// Allocation lifetime when LIFETIME is absent (default: 600).
    #[serde(default = "default_allocation_secs")]
    pub allocation_default_secs: u64,
    /// Maximum allocation lifetime (default: 3600).
    #[serde(default = "default_allocation_max_secs")]
    pub allocation_max_secs: u64,
    /// Permission lifetime (default: 300).
    #[serde(default = "default_permission_secs")]
    pub permission_secs: u64,
    /// Channel binding lifetime (default: 600).
    #[serde(default = "default_channel_secs")]
    pub channel_secs: u64,
    /// Nonce lifetime (default: 600).
    #[serde(default = "default_nonce_secs")]
    pub nonce_secs: u64,
}

/// Rate limiting and quota configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent allocations (default: 1000).
    #[serde(default = "default_max_allocations")]
    pub max_allocations: usize,
    /// Maximum STUN requests per client per minute (default: 600).
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Maximum STUN requests per second across all clients (default: 2000).
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
    /// Seconds a client worker lingers without traffic or allocation (default: 30).
    #[serde(default = "default_client_idle_secs")]
    pub client_idle_secs: u64,
    /// Pending requests queued per client before new ones are dropped (default: 64).
    #[serde(default = "default_client_queue_depth")]
    pub client_queue_depth: usize,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Serve /health and /metrics (default: true).
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    /// Bind address for HTTP server (default: 127.0.0.1:8080).
    #[serde(default = "default_http_bind")]
    pub bind_address: String,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in seconds (default: 60).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

/// A room seeded into the in-process registry.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomConfig {
    /// Room identifier, used as the TURN username.
    pub id: String,
    /// Shared secret, used as the TURN password.
    pub credential: String,
}

// Default value functions
fn default_realm() -> String {
    "rtchat.io".to_string()
}

fn default_public_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    3478
}

fn default_software() -> String {
    format!("garlic-turn/{}", env!("CARGO_PKG_VERSION"))
}

fn default_sam_address() -> String {
    "127.0.0.1:7656".to_string()
}

fn default_sam_udp_address() -> String {
    "127.0.0.1:7655".to_string()
}

fn default_control_session() -> String {
    "rtcchat-turn".to_string()
}

fn default_relay_prefix() -> String {
    "rtcchat-turn-udp".to_string()
}

fn default_tunnel_options() -> Vec<String> {
    [
        "inbound.length=1",
        "outbound.length=1",
        "inbound.lengthVariance=0",
        "outbound.lengthVariance=0",
        "inbound.backupQuantity=2",
        "outbound.backupQuantity=2",
        "inbound.quantity=3",
        "outbound.quantity=3",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_open_timeout_secs() -> u64 {
    120
}

fn default_allocation_secs() -> u64 {
    600
}

fn default_allocation_max_secs() -> u64 {
    3600
}

fn default_permission_secs() -> u64 {
    300
}

fn default_channel_secs() -> u64 {
    600
}

fn default_nonce_secs() -> u64 {
    600
}

fn default_max_allocations() -> usize {
    1000
}

fn default_requests_per_minute() -> u32 {
    600
}

fn default_global_requests_per_second() -> u32 {
    2000
}

fn default_client_idle_secs() -> u64 {
    30
}

fn default_client_queue_depth() -> usize {
    64
}

fn default_http_enabled() -> bool {
    true
}

fn default_http_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            realm: default_realm(),
            public_address: default_public_address(),
            listen_port: default_listen_port(),
            software: default_software(),
            conventional_listener: false,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            sam_address: default_sam_address(),
            sam_udp_address: default_sam_udp_address(),
            control_session: default_control_session(),
            relay_session_prefix: default_relay_prefix(),
            tunnel_options: default_tunnel_options(),
            open_timeout_secs: default_open_timeout_secs(),
        }
    }
}

impl Default for LifetimesConfig {
    fn default() -> Self {
        Self {
            allocation_default_secs: default_allocation_secs(),
            allocation_max_secs: default_allocation_max_secs(),
            permission_secs: default_permission_secs(),
            channel_secs: default_channel_secs(),
            nonce_secs: default_nonce_secs(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_allocations: default_max_allocations(),
            requests_per_minute: default_requests_per_minute(),
            global_requests_per_second: default_global_requests_per_second(),
            client_idle_secs: default_client_idle_secs(),
            client_queue_depth: default_client_queue_depth(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_http_bind(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl LifetimesConfig {
    /// Lifetime policy for the allocation tables.
    pub fn policy(&self) -> LifetimePolicy {
        LifetimePolicy {
            default_lifetime: Duration::from_secs(self.allocation_default_secs),
            max_lifetime: Duration::from_secs(self.allocation_max_secs),
            permission_lifetime: Duration::from_secs(self.permission_secs),
            channel_lifetime: Duration::from_secs(self.channel_secs),
        }
    }

    /// Nonce lifetime.
    pub fn nonce_lifetime(&self) -> Duration {
        Duration::from_secs(self.nonce_secs)
    }
}

impl ServerConfig {
    /// `turn:` URL for clients.
    pub fn turn_url(&self) -> String {
        format!("turn:{}:{}", self.public_address, self.listen_port)
    }

    /// `stun:` URL for clients.
    pub fn stun_url(&self) -> String {
        format!("stun:{}:{}", self.public_address, self.listen_port)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };

        if self.server.realm.trim().is_empty() {
            return Err(invalid("server.realm", "must not be empty"));
        }
        if self.overlay.control_session.trim().is_empty() {
            return Err(invalid("overlay.control_session", "must not be empty"));
        }
        if self.overlay.relay_session_prefix.trim().is_empty() {
            return Err(invalid("overlay.relay_session_prefix", "must not be empty"));
        }
        if self.overlay.open_timeout_secs == 0 {
            return Err(invalid("overlay.open_timeout_secs", "must be > 0"));
        }
        let lt = &self.lifetimes;
        if lt.allocation_default_secs == 0 {
            return Err(invalid("lifetimes.allocation_default_secs", "must be > 0"));
        }
        if lt.allocation_max_secs < lt.allocation_default_secs {
            return Err(invalid(
                "lifetimes.allocation_max_secs",
                "must not be below allocation_default_secs",
            ));
        }
        if lt.permission_secs == 0 || lt.channel_secs == 0 || lt.nonce_secs == 0 {
            return Err(invalid("lifetimes", "permission, channel and nonce lifetimes must be > 0"));
        }
        let limits = &self.limits;
        if limits.max_allocations == 0 {
            return Err(invalid("limits.max_allocations", "must be > 0"));
        }
        if limits.requests_per_minute == 0 {
            return Err(invalid("limits.requests_per_minute", "must be > 0"));
        }
        if limits.global_requests_per_second == 0 {
            return Err(invalid("limits.global_requests_per_second", "must be > 0"));
        }
        if limits.client_idle_secs == 0 || limits.client_queue_depth == 0 {
            return Err(invalid("limits", "client idle timeout and queue depth must be > 0"));
        }
        if self.cleanup.enabled && self.cleanup.interval_secs == 0 {
            return Err(invalid("cleanup.interval_secs", "must be > 0"));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config value {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.server.realm, "rtchat.io");
        assert_eq!(config.server.listen_port, 3478);
        assert_eq!(config.overlay.sam_address, "127.0.0.1:7656");
        assert_eq!(config.overlay.control_session, "rtcchat-turn");
        assert_eq!(config.overlay.tunnel_options.len(), 8);
        config.validate().unwrap();
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
realm = "example.org"
listen_port = 5349

[overlay]
sam_address = "10.0.0.5:7656"
tunnel_options = ["inbound.length=2"]

[lifetimes]
permission_secs = 120

[limits]
max_allocations = 5

[http]
bind_address = "0.0.0.0:9090"

[cleanup]
interval_secs = 15

[[rooms]]
id = "room-42"
credential = "s3cr3t"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.realm, "example.org");
        assert_eq!(config.server.listen_port, 5349);
        assert_eq!(config.overlay.sam_address, "10.0.0.5:7656");
        assert_eq!(config.overlay.tunnel_options, vec!["inbound.length=2"]);
        assert_eq!(config.lifetimes.permission_secs, 120);
        assert_eq!(config.lifetimes.channel_secs, 600);
        assert_eq!(config.limits.max_allocations, 5);
        assert_eq!(config.http.bind_address, "0.0.0.0:9090");
        assert_eq!(config.cleanup.interval_secs, 15);
        assert_eq!(config.rooms.len(), 1);
        assert_eq!(config.rooms[0].id, "room-42");
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.lifetimes.allocation_default_secs, 600);
        assert_eq!(config.lifetimes.allocation_max_secs, 3600);
        assert_eq!(config.overlay.relay_session_prefix, "rtcchat-turn-udp");
        assert!(config.rooms.is_empty());
    }

    #[test]
    fn policy_from_lifetimes() {
        let policy = LifetimesConfig::default().policy();
        assert_eq!(policy, LifetimePolicy::default());
    }

    #[test]
    fn validate_rejects_empty_realm() {
        let mut config = Config::default();
        config.server.realm = "  ".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "server.realm", .. })
        ));
    }

    #[test]
    fn validate_rejects_max_below_default() {
        let mut config = Config::default();
        config.lifetimes.allocation_max_secs = 300;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut config = Config::default();
        config.limits.requests_per_minute = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.max_allocations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn urls_from_public_address() {
        let config = Config::default();
        assert_eq!(config.server.turn_url(), "turn:127.0.0.1:3478");
        assert_eq!(config.server.stun_url(), "stun:127.0.0.1:3478");
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/relay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[server]\nrealm = \"file.example\"\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.server.realm, "file.example");
    }
}
