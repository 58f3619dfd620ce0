//! Relay role
//!
//! Sits between charging stations and a central system. Each station
//! connection gets its own upstream connection, opened under the same
//! station id, and a [`RelayBridge`] that splices the two.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::error::OcppError;
use crate::ocpp::Catalog;
use crate::rpc::relay::RelayBridge;
use crate::rpc::session::Session;
use crate::rpc::transport::{accept, connect, OCPP_SUBPROTOCOL};

/// Relay server
#[derive(Clone)]
pub struct Relay {
    config: RelayConfig,
    bridges: Arc<Mutex<HashMap<String, RelayBridge>>>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            bridges: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Ids of the stations currently relayed
    pub fn connected(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.bridges.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Bridge of a relayed station
    pub fn bridge(&self, station_id: &str) -> Option<RelayBridge> {
        self.bridges.lock().get(station_id).cloned()
    }

    /// Bind the configured address and serve forever
    pub async fn run(self) -> Result<(), OcppError> {
        let listener = TcpListener::bind(self.config.bind).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), OcppError> {
        info!(
            "Relay listening on {}, forwarding to {}",
            listener.local_addr()?,
            self.config.upstream_url
        );

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    continue;
                }
            };

            let relay = self.clone();
            tokio::spawn(async move { relay.handle_connection(stream, peer).await });
        }
    }

    async fn handle_connection(self, stream: TcpStream, peer: SocketAddr) {
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
        info!("Relay: {} connected from {}", station_id, peer);

        let bridge = RelayBridge::new(station_id.clone(), self.config.upstream_wait);
        let station = Session::open(
            station_id.clone(),
            accepted.connection,
            bridge.station_handlers(),
            Catalog::permissive(),
            self.config.session.clone(),
        );

        tokio::spawn(self.clone().open_upstream(bridge.clone()));

        if self
            .bridges
            .lock()
            .insert(station_id.clone(), bridge.clone())
            .is_some()
        {
            warn!("{} reconnected while still relayed", station_id);
        }

        bridge.run(station).await;

        let mut bridges = self.bridges.lock();
        if bridges
            .get(&station_id)
            .is_some_and(|current| current.same_as(&bridge))
        {
            bridges.remove(&station_id);
        }
    }

    async fn open_upstream(self, bridge: RelayBridge) {
        let url = self.config.upstream_url_for(bridge.station_id());
        info!("Relay: connecting {} to {}", bridge.station_id(), url);

        match connect(&url, OCPP_SUBPROTOCOL).await {
            Ok(connection) => {
                let session = Session::open(
                    bridge.station_id().to_string(),
                    connection,
                    bridge.upstream_handlers(),
                    Catalog::permissive(),
                    self.config.session.clone(),
                );
                bridge.attach_upstream(session);
            }
            Err(e) => bridge.upstream_failed(format!("{}: {}", url, e)),
        }
    }
}
