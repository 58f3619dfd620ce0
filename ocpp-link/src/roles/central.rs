//! Central system role
//!
//! Accepts station connections, runs one session per connection and answers
//! BootNotification, Heartbeat and StatusNotification.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::config::CentralSystemConfig;
use crate::discovery::MdnsAnnouncement;
use crate::error::OcppError;
use crate::ocpp::{
    BootNotificationRequest, BootNotificationResponse, Catalog, HeartbeatRequest,
    HeartbeatResponse, RegistrationStatus, StatusNotificationRequest, StatusNotificationResponse,
};
use crate::rpc::handlers::{CallErrorReply, Handlers};
use crate::rpc::session::Session;
use crate::rpc::transport::{accept, OCPP_SUBPROTOCOL};

/// Central system server
#[derive(Clone)]
pub struct CentralSystem {
    config: CentralSystemConfig,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl CentralSystem {
    pub fn new(config: CentralSystemConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handler table given to every station session
    pub fn handlers(&self) -> Handlers {
        let interval = i32::try_from(self.config.heartbeat_interval.as_secs()).unwrap_or(i32::MAX);

        Handlers::new()
            .on_request(move |request: BootNotificationRequest| async move {
                info!(
                    "BootNotification from {} {} ({:?})",
                    request.charging_station.vendor_name,
                    request.charging_station.model,
                    request.reason
                );
                Ok::<_, CallErrorReply>(BootNotificationResponse {
                    current_time: Utc::now(),
                    interval,
                    status: RegistrationStatus::Accepted,
                    status_info: None,
                })
            })
            .on_request(|_: HeartbeatRequest| async {
                info!("Got a Heartbeat!");
                Ok::<_, CallErrorReply>(HeartbeatResponse {
                    current_time: Utc::now(),
                })
            })
            .on_request(|request: StatusNotificationRequest| async move {
                info!(
                    "StatusNotification: EVSE {} connector {} is {:?}",
                    request.evse_id, request.connector_id, request.connector_status
                );
                Ok::<_, CallErrorReply>(StatusNotificationResponse {})
            })
    }

    /// Ids of the stations currently connected
    pub fn connected(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Session of a connected station
    pub fn session(&self, station_id: &str) -> Option<Session> {
        self.sessions.lock().get(station_id).cloned()
    }

    /// Bind the configured address and serve forever
    pub async fn run(self) -> Result<(), OcppError> {
        let listener = TcpListener::bind(self.config.bind).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), OcppError> {
        let local = listener.local_addr()?;
        info!("Server started listening to new connections on {}", local);

        let _announcement = if self.config.announce_mdns {
            let instance = format!("csms-{}", local.port());
            match MdnsAnnouncement::announce(&instance, local.port()) {
                Ok(announcement) => Some(announcement),
                Err(e) => {
                    warn!("mDNS announce failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let handlers = self.handlers();

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    continue;
                }
            };

            let central = self.clone();
            let handlers = handlers.clone();
            tokio::spawn(async move { central.handle_connection(stream, peer, handlers).await });
        }
    }

    async fn handle_connection(self, stream: TcpStream, peer: SocketAddr, handlers: Handlers) {
        let accepted = match accept(stream, OCPP_SUBPROTOCOL).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Handshake with {} failed: {}", peer, e);
                return;
            }
        };

        let station_id = if accepted.path.is_empty() {
            peer.to_string()
        } else {
            accepted.path
        };
        info!("Protocols matched: {} connected from {}", station_id, peer);

        let session = Session::open(
            station_id.clone(),
            accepted.connection,
            handlers,
            Catalog::v201(),
            self.config.session.clone(),
        );

        if let Some(previous) = self.sessions.lock().insert(station_id.clone(), session.clone()) {
            warn!("{} reconnected, dropping its previous session", station_id);
            previous.close();
        }

        session.closed().await;

        let mut sessions = self.sessions.lock();
        if sessions
            .get(&station_id)
            .is_some_and(|current| current.same_as(&session))
        {
            sessions.remove(&station_id);
        }
        drop(sessions);

        info!("{} disconnected", station_id);
    }
}
