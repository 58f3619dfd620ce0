//! Configuration for sessions and the three process roles
//!
//! Plain structs with defaults plus `with_*` builders; the CLI maps its flags
//! onto these.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default port of a central system
pub const CSMS_PORT: u16 = 9002;

/// Default port of a relay
pub const RELAY_PORT: u16 = 9000;

/// Default wait for a call's answer
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default budget of a relayed exchange. Kept below [`CALL_TIMEOUT`] so a
/// station hears `RelayFailure` before its own call times out.
pub const RELAY_CALL_TIMEOUT: Duration = Duration::from_secs(20);

/// Settings shared by every session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long `call()` waits for a CALLRESULT/CALLERROR
    pub call_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            call_timeout: CALL_TIMEOUT,
        }
    }
}

/// Charging station role
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Charge point identity, appended to the URL path
    pub station_id: String,

    /// Central system port on every candidate address
    pub port: u16,

    /// Fixed central system host; discovery is used when unset
    pub fixed_address: Option<String>,

    /// Vendor name for BootNotification
    pub vendor: String,

    /// Model name for BootNotification
    pub model: String,

    /// Heartbeat interval used when the CSMS answers with interval 0
    pub default_heartbeat_interval: Duration,

    /// Pause after a session to one candidate ends
    pub reconnect_delay: Duration,

    /// Pause after every candidate failed, before discovering again
    pub discovery_backoff: Duration,

    /// Limit on the TCP connect plus WebSocket handshake to one candidate
    pub connect_timeout: Duration,

    /// Round-trip record file
    pub report_path: PathBuf,

    pub session: SessionConfig,
}

impl StationConfig {
    pub fn new(station_id: impl Into<String>) -> Self {
        let station_id = station_id.into();

        Self {
            model: format!("Wallbox {}", station_id),
            station_id,
            port: CSMS_PORT,
            fixed_address: None,
            vendor: "INESCTEC".to_string(),
            default_heartbeat_interval: Duration::from_secs(300),
            reconnect_delay: Duration::from_secs(5),
            discovery_backoff: Duration::from_secs(6),
            connect_timeout: Duration::from_secs(10),
            report_path: PathBuf::from("rtt_ocpp_messages.txt"),
            session: SessionConfig::default(),
        }
    }

    /// Connect to this host only
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.fixed_address = Some(address.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set vendor info
    pub fn with_vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self.model = model.into();
        self
    }

    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = path.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_discovery_backoff(mut self, delay: Duration) -> Self {
        self.discovery_backoff = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.session.call_timeout = timeout;
        self
    }

    /// WebSocket URL for one candidate host
    pub fn url_for(&self, host: &str) -> String {
        build_ocpp_url(&format!("ws://{}:{}", host, self.port), &self.station_id)
    }
}

/// Central system role
#[derive(Debug, Clone)]
pub struct CentralSystemConfig {
    pub bind: SocketAddr,

    /// Interval handed out in BootNotification responses
    pub heartbeat_interval: Duration,

    /// Announce the listener over mDNS
    pub announce_mdns: bool,

    pub session: SessionConfig,
}

impl Default for CentralSystemConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], CSMS_PORT)),
            heartbeat_interval: Duration::from_secs(10),
            announce_mdns: false,
            session: SessionConfig::default(),
        }
    }
}

impl CentralSystemConfig {
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_mdns(mut self) -> Self {
        self.announce_mdns = true;
        self
    }
}

/// Relay role
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,

    /// Central system base URL; the station id is appended per connection
    pub upstream_url: String,

    /// How long a relayed call waits for the upstream session to come up
    pub upstream_wait: Duration,

    pub session: SessionConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], RELAY_PORT)),
            upstream_url: format!("ws://localhost:{}", CSMS_PORT),
            upstream_wait: Duration::from_secs(5),
            session: SessionConfig {
                call_timeout: RELAY_CALL_TIMEOUT,
            },
        }
    }
}

impl RelayConfig {
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_upstream(mut self, url: impl Into<String>) -> Self {
        self.upstream_url = url.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.session.call_timeout = timeout;
        self
    }

    /// Upstream URL for one station
    pub fn upstream_url_for(&self, station_id: &str) -> String {
        build_ocpp_url(&self.upstream_url, station_id)
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}
