//! Charging station role
//!
//! Finds a central system, connects as `ws://<host>:<port>/<station_id>`,
//! boots and keeps the connection alive with heartbeats. When the
//! connection ends, the next candidate is tried.
//!
//! Reconnection policy:
//! - candidates are tried round-robin in the order discovery returns them
//! - a refused connection moves straight on to the next candidate
//! - a session that ended is followed by `reconnect_delay`
//! - a pass in which no candidate connected is followed by
//!   `discovery_backoff`, then discovery runs again

use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::StationConfig;
use crate::discovery::Discovery;
use crate::error::OcppError;
use crate::ocpp::{
    BootNotificationRequest, BootReason, Catalog, ChargingStationInfo, ConnectorStatus,
    DataTransferRequest, DataTransferResponse, DataTransferStatus, RegistrationStatus,
    StatusNotificationRequest,
};
use crate::reporting::{RttLog, RttSummary};
use crate::rpc::handlers::{CallErrorReply, Handlers};
use crate::rpc::heartbeat::{interval_from_secs, HeartbeatScheduler};
use crate::rpc::session::Session;
use crate::rpc::transport::{connect, Connection, TransportError, OCPP_SUBPROTOCOL};

const EVENT_CAPACITY: usize = 32;

/// Connection status as seen by the station
#[derive(Debug, Clone, PartialEq)]
pub enum StationEvent {
    Discovered { candidates: Vec<String> },
    Connecting { url: String },
    Connected { url: String },
    ConnectFailed { url: String, reason: String },
    BootAccepted { interval: Duration },
    BootPending { retry_in: Duration },
    BootRejected { retry_in: Duration },
    Disconnected { url: String },
    Backoff { delay: Duration },
}

/// Closes the session if the station stops driving it, including when the
/// driving future is dropped
struct CloseOnDrop(Session);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Charging station client
pub struct ChargingStation<D> {
    config: StationConfig,
    discovery: D,
    events: broadcast::Sender<StationEvent>,
}

impl<D: Discovery> ChargingStation<D> {
    pub fn new(config: StationConfig, discovery: D) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            discovery,
            events,
        }
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    /// Status events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StationEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn boot_request(&self) -> BootNotificationRequest {
        BootNotificationRequest {
            charging_station: ChargingStationInfo {
                model: self.config.model.clone(),
                vendor_name: self.config.vendor.clone(),
                serial_number: None,
                firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
            reason: BootReason::PowerUp,
        }
    }

    /// Calls a central system may send to the station
    pub fn handlers(&self) -> Handlers {
        let vendor = self.config.vendor.clone();

        Handlers::new().on_request(move |request: DataTransferRequest| {
            let known = request.vendor_id == vendor;
            async move {
                let status = if known {
                    DataTransferStatus::Accepted
                } else {
                    DataTransferStatus::UnknownVendorId
                };
                Ok::<_, CallErrorReply>(DataTransferResponse {
                    status,
                    data: request.data.filter(|_| known),
                    status_info: None,
                })
            }
        })
    }

    async fn candidates(&self) -> Vec<String> {
        match &self.config.fixed_address {
            Some(address) => vec![address.clone()],
            None => self.discovery.discover().await,
        }
    }

    /// Connect, boot and heartbeat forever
    pub async fn run(&self) {
        loop {
            let candidates = self.candidates().await;
            self.emit(StationEvent::Discovered {
                candidates: candidates.clone(),
            });

            let mut reached = false;

            for host in &candidates {
                let url = self.config.url_for(host);
                info!("Connecting to central system at {}", url);
                self.emit(StationEvent::Connecting { url: url.clone() });

                let limit = self.config.connect_timeout;
                let attempt = tokio::time::timeout(limit, connect(&url, OCPP_SUBPROTOCOL))
                    .await
                    .unwrap_or(Err(TransportError::Timeout(limit)));
                let connection = match attempt {
                    Ok(connection) => connection,
                    Err(e) => {
                        error!("Error trying to connect to central system at {}: {}", url, e);
                        self.emit(StationEvent::ConnectFailed {
                            url,
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };

                reached = true;
                self.emit(StationEvent::Connected { url: url.clone() });

                if let Err(e) = self.run_session(connection).await {
                    warn!("Session with {} ended: {}", url, e);
                }
                self.emit(StationEvent::Disconnected { url });

                self.backoff(self.config.reconnect_delay).await;
            }

            if !reached {
                self.backoff(self.config.discovery_backoff).await;
            }
        }
    }

    async fn backoff(&self, delay: Duration) {
        self.emit(StationEvent::Backoff { delay });
        tokio::time::sleep(delay).await;
    }

    /// Drive one connection until it closes
    pub async fn run_session<C: Connection>(&self, connection: C) -> Result<(), OcppError> {
        let guard = CloseOnDrop(Session::open(
            self.config.station_id.clone(),
            connection,
            self.handlers(),
            Catalog::v201(),
            self.config.session.clone(),
        ));
        let session = &guard.0;

        let result = self.boot_and_beat(session).await;

        session.close();
        session.closed().await;
        result
    }

    async fn boot_and_beat(&self, session: &Session) -> Result<(), OcppError> {
        let request = self.boot_request();
        let fallback = self.config.default_heartbeat_interval;

        loop {
            let response = session.send(&request).await?;
            let interval = interval_from_secs(response.interval, fallback);

            let retry_in = match response.status {
                RegistrationStatus::Accepted => break self.heartbeat(session, interval).await,
                RegistrationStatus::Pending => {
                    info!("Boot pending, retrying in {:?}", interval);
                    self.emit(StationEvent::BootPending { retry_in: interval });
                    interval
                }
                RegistrationStatus::Rejected => {
                    warn!("Boot rejected, retrying in {:?}", interval);
                    self.emit(StationEvent::BootRejected { retry_in: interval });
                    interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(retry_in) => {}
                _ = session.closing() => return Ok(()),
            }
        }
    }

    async fn heartbeat(&self, session: &Session, interval: Duration) -> Result<(), OcppError> {
        info!("Connected to central system, heartbeat every {:?}", interval);
        self.emit(StationEvent::BootAccepted { interval });

        let status = StatusNotificationRequest {
            timestamp: Utc::now(),
            connector_status: ConnectorStatus::Available,
            evse_id: 1,
            connector_id: 1,
        };
        if let Err(e) = session.send(&status).await {
            warn!("StatusNotification failed: {}", e);
        }

        let reporter = RttLog::new(self.config.report_path.clone());
        let state = HeartbeatScheduler::new(session.clone(), reporter)
            .start(interval)
            .join()
            .await;

        match RttSummary::from_samples(&state.samples) {
            Some(summary) => info!("Heartbeat RTT: {}", summary),
            None => info!("No heartbeat completed"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CentralSystemConfig, SessionConfig};
    use crate::discovery::StaticDiscovery;
    use crate::ocpp::{BootNotificationResponse, StatusNotificationResponse};
    use crate::reporting::RttLog;
    use crate::roles::central::CentralSystem;
    use crate::rpc::transport::memory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    fn station(report: &std::path::Path) -> ChargingStation<StaticDiscovery> {
        let config = StationConfig::new("CP001")
            .with_report_path(report)
            .with_reconnect_delay(Duration::from_millis(50))
            .with_discovery_backoff(Duration::from_millis(50));
        ChargingStation::new(config, StaticDiscovery::new(["127.0.0.1"]))
    }

    #[test]
    fn test_boot_request() {
        let dir = tempdir().unwrap();
        let request = station(&dir.path().join("rtt.txt")).boot_request();

        assert_eq!(request.charging_station.model, "Wallbox CP001");
        assert_eq!(request.charging_station.vendor_name, "INESCTEC");
        assert_eq!(request.reason, BootReason::PowerUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_boots_and_records_heartbeats() {
        let dir = tempdir().unwrap();
        let report = dir.path().join("rtt.txt");
        let station = Arc::new(station(&report));
        let mut events = station.subscribe();

        let central = CentralSystem::new(CentralSystemConfig::default());
        let (ours, theirs) = memory::pair();
        let csms = Session::open("CP001", theirs, central.handlers(), Catalog::v201(), SessionConfig::default());

        let running = {
            let station = station.clone();
            tokio::spawn(async move { station.run_session(ours).await })
        };

        assert_eq!(
            events.recv().await.unwrap(),
            StationEvent::BootAccepted {
                interval: Duration::from_secs(10)
            }
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        csms.close();
        running.await.unwrap().unwrap();

        assert_eq!(RttLog::new(&report).read_all().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_boot_is_retried() {
        let dir = tempdir().unwrap();
        let station = Arc::new(station(&dir.path().join("rtt.txt")));
        let mut events = station.subscribe();

        let boots = Arc::new(AtomicUsize::new(0));
        let seen = boots.clone();
        let handlers = Handlers::new()
            .on_request(move |_: BootNotificationRequest| {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok::<_, CallErrorReply>(BootNotificationResponse {
                        current_time: Utc::now(),
                        interval: if n == 0 { 5 } else { 10 },
                        status: if n == 0 {
                            RegistrationStatus::Rejected
                        } else {
                            RegistrationStatus::Accepted
                        },
                        status_info: None,
                    })
                }
            })
            .on_request(|_: StatusNotificationRequest| async {
                Ok::<_, CallErrorReply>(StatusNotificationResponse {})
            });

        let (ours, theirs) = memory::pair();
        let csms = Session::open("CP001", theirs, handlers, Catalog::v201(), SessionConfig::default());
        let running = {
            let station = station.clone();
            tokio::spawn(async move { station.run_session(ours).await })
        };

        assert_eq!(
            events.recv().await.unwrap(),
            StationEvent::BootRejected {
                retry_in: Duration::from_secs(5)
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            StationEvent::BootAccepted {
                interval: Duration::from_secs(10)
            }
        );
        assert_eq!(boots.load(Ordering::SeqCst), 2);

        csms.close();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_inbound_data_transfer() {
        let dir = tempdir().unwrap();
        let station = station(&dir.path().join("rtt.txt"));

        let (ours, theirs) = memory::pair();
        let _station_side = Session::open("CP001", ours, station.handlers(), Catalog::v201(), SessionConfig::default());
        let csms = Session::open("CP001", theirs, Handlers::new(), Catalog::v201(), SessionConfig::default());

        let known = csms
            .send(&DataTransferRequest {
                vendor_id: "INESCTEC".into(),
                message_id: None,
                data: Some(serde_json::json!({"ping": 1})),
            })
            .await
            .unwrap();
        assert_eq!(known.status, DataTransferStatus::Accepted);
        assert_eq!(known.data, Some(serde_json::json!({"ping": 1})));

        let unknown = csms
            .send(&DataTransferRequest {
                vendor_id: "Other".into(),
                message_id: None,
                data: None,
            })
            .await
            .unwrap();
        assert_eq!(unknown.status, DataTransferStatus::UnknownVendorId);
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        // Accepts TCP through the backlog but never answers the handshake
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let dir = tempdir().unwrap();
        let station = ChargingStation::new(
            StationConfig::new("CP001")
                .with_port(port)
                .with_report_path(dir.path().join("rtt.txt"))
                .with_connect_timeout(Duration::from_millis(100))
                .with_discovery_backoff(Duration::from_millis(50)),
            StaticDiscovery::new(["127.0.0.1"]),
        );
        let mut events = station.subscribe();
        let running = tokio::spawn(async move { station.run().await });

        let failure = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let StationEvent::ConnectFailed { reason, .. } = events.recv().await.unwrap() {
                    return reason;
                }
            }
        })
        .await
        .expect("station kept waiting on the handshake");
        assert!(failure.contains("timed out"), "{}", failure);
        assert_eq!(
            events.recv().await.unwrap(),
            StationEvent::Backoff {
                delay: Duration::from_millis(50)
            }
        );

        running.abort();
        drop(listener);
    }

    #[tokio::test]
    async fn test_unreachable_candidates_back_off() {
        // A port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempdir().unwrap();
        let station = Arc::new(ChargingStation::new(
            StationConfig::new("CP001")
                .with_port(port)
                .with_report_path(dir.path().join("rtt.txt"))
                .with_discovery_backoff(Duration::from_millis(50)),
            StaticDiscovery::new(["127.0.0.1"]),
        ));
        let mut events = station.subscribe();

        let running = {
            let station = station.clone();
            tokio::spawn(async move { station.run().await })
        };

        assert_eq!(
            events.recv().await.unwrap(),
            StationEvent::Discovered {
                candidates: vec!["127.0.0.1".into()]
            }
        );
        assert!(matches!(events.recv().await.unwrap(), StationEvent::Connecting { .. }));
        assert!(matches!(events.recv().await.unwrap(), StationEvent::ConnectFailed { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            StationEvent::Backoff {
                delay: Duration::from_millis(50)
            }
        );

        // Discovery runs again after the backoff
        assert!(matches!(events.recv().await.unwrap(), StationEvent::Discovered { .. }));
        running.abort();
    }

    #[tokio::test]
    async fn test_connects_to_central_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let central = CentralSystem::new(CentralSystemConfig::default());
        tokio::spawn(central.clone().serve(listener));

        let dir = tempdir().unwrap();
        let station = Arc::new(ChargingStation::new(
            StationConfig::new("CP007")
                .with_address("127.0.0.1")
                .with_port(port)
                .with_report_path(dir.path().join("rtt.txt")),
            StaticDiscovery::new(Vec::<String>::new()),
        ));
        let mut events = station.subscribe();

        let running = {
            let station = station.clone();
            tokio::spawn(async move { station.run().await })
        };

        loop {
            match events.recv().await.unwrap() {
                StationEvent::BootAccepted { interval } => {
                    assert_eq!(interval, Duration::from_secs(10));
                    break;
                }
                StationEvent::ConnectFailed { reason, .. } => panic!("connect failed: {}", reason),
                _ => {}
            }
        }

        assert_eq!(central.connected(), vec!["CP007"]);
        running.abort();
    }
}
