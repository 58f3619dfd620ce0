//! Relay bridge
//!
//! Splices a station-facing session and a central-facing session. Every CALL
//! arriving on one side is re-issued on the other under a fresh unique id;
//! the answer goes back under the caller's original id. Payloads and error
//! codes pass through untouched.
//!
//! ```text
//! station ──[2,"A",..]──► relay ──[2,"B",..]──► central system
//! station ◄─[3,"A",P]──── relay ◄─[3,"B",P]──── central system
//! ```
//!
//! The upstream session is published once it is up, so the station side can
//! start before the central system has answered the handshake.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::correlator::CallFailure;
use super::handlers::{CallErrorReply, HandlerResult, Handlers, InboundCall};
use super::session::Session;
use crate::ocpp::ErrorCode;

/// State of the central-facing side
#[derive(Debug, Clone)]
pub enum UpstreamLink {
    Connecting,
    Ready(Session),
    Failed(String),
}

/// Live id mappings, per direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InFlight {
    pub to_upstream: usize,
    pub to_station: usize,
}

/// Calls relayed in one direction: origin id → id issued on the far side
struct Forwarder {
    direction: &'static str,
    /// `None` until the far side has issued its id
    ids: Mutex<HashMap<String, Option<String>>>,
    idle: Notify,
}

impl Forwarder {
    fn new(direction: &'static str) -> Self {
        Self {
            direction,
            ids: Mutex::new(HashMap::new()),
            idle: Notify::new(),
        }
    }

    /// Re-issue `call` on `target`, answering within `budget`
    async fn forward(&self, target: &Session, call: InboundCall, budget: Duration) -> HandlerResult {
        let Some(mut mapping) = Mapping::claim(self, &call.unique_id) else {
            warn!("Relay {} {}: {} already in flight", self.direction, call.action, call.unique_id);
            return Err(CallErrorReply::new(
                ErrorCode::RpcFrameworkError,
                format!("unique id {} is already in flight", call.unique_id),
            ));
        };

        let pending = target
            .start_call_with_timeout(&call.action, call.payload, budget)
            .await
            .map_err(|e| relay_failure(format!("{}: {}", self.direction, e)))?;

        mapping.bind(pending.unique_id());
        debug!(
            "Relay {} {} {} -> {}",
            self.direction,
            call.action,
            call.unique_id,
            pending.unique_id()
        );

        match pending.wait().await {
            Ok(payload) => Ok(payload),
            Err(CallFailure::Rejected {
                code,
                description,
                details,
            }) => Err(CallErrorReply::new(code, description).with_details(details)),
            Err(e) => {
                warn!("Relay {} {} failed: {}", self.direction, call.action, e);
                Err(relay_failure(format!("{}: {}", self.direction, e)))
            }
        }
    }

    fn len(&self) -> usize {
        self.ids.lock().len()
    }

    fn target_of(&self, origin_id: &str) -> Option<String> {
        self.ids.lock().get(origin_id).cloned().flatten()
    }

    /// Wait until no exchange is in flight
    async fn drained(&self) {
        loop {
            let idle = self.idle.notified();
            if self.ids.lock().is_empty() {
                return;
            }
            idle.await;
        }
    }
}

/// One relayed exchange; the mapping is dropped with it
struct Mapping<'a> {
    forwarder: &'a Forwarder,
    origin_id: String,
}

impl<'a> Mapping<'a> {
    /// Reserve `origin_id`; `None` when an exchange under that id is live
    fn claim(forwarder: &'a Forwarder, origin_id: &str) -> Option<Self> {
        match forwarder.ids.lock().entry(origin_id.to_string()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                slot.insert(None);
            }
        }

        Some(Self {
            forwarder,
            origin_id: origin_id.to_string(),
        })
    }

    fn bind(&mut self, target_id: &str) {
        if let Some(slot) = self.forwarder.ids.lock().get_mut(&self.origin_id) {
            *slot = Some(target_id.to_string());
        }
    }
}

impl Drop for Mapping<'_> {
    fn drop(&mut self) {
        let mut ids = self.forwarder.ids.lock();
        ids.remove(&self.origin_id);
        if ids.is_empty() {
            self.forwarder.idle.notify_waiters();
        }
    }
}

fn relay_failure(description: impl Into<String>) -> CallErrorReply {
    CallErrorReply::new(ErrorCode::RelayFailure, description)
}

/// What is left of `timeout` since `started`
fn remaining(timeout: Duration, started: Instant) -> Result<Duration, CallErrorReply> {
    match timeout.checked_sub(started.elapsed()) {
        Some(left) if !left.is_zero() => Ok(left),
        _ => Err(relay_failure("call budget spent waiting for the far side")),
    }
}

struct BridgeInner {
    station_id: String,
    upstream_wait: Duration,
    upstream: watch::Sender<UpstreamLink>,
    station: watch::Sender<Option<Session>>,
    to_upstream: Forwarder,
    to_station: Forwarder,
    finished: AtomicBool,
}

/// Bridge for one station connection
#[derive(Clone)]
pub struct RelayBridge {
    inner: Arc<BridgeInner>,
}

impl RelayBridge {
    /// `upstream_wait` bounds how long a relayed call waits for the far side
    /// to come up
    pub fn new(station_id: impl Into<String>, upstream_wait: Duration) -> Self {
        let (upstream, _) = watch::channel(UpstreamLink::Connecting);
        let (station, _) = watch::channel(None);

        Self {
            inner: Arc::new(BridgeInner {
                station_id: station_id.into(),
                upstream_wait,
                upstream,
                station,
                to_upstream: Forwarder::new("to central"),
                to_station: Forwarder::new("to station"),
                finished: AtomicBool::new(false),
            }),
        }
    }

    pub fn station_id(&self) -> &str {
        &self.inner.station_id
    }

    /// Whether both handles refer to the same bridge
    pub fn same_as(&self, other: &RelayBridge) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Handlers for the station-facing session: everything goes upstream
    pub fn station_handlers(&self) -> Handlers {
        let bridge = self.clone();
        Handlers::new().fallback(move |call: InboundCall| {
            let bridge = bridge.clone();
            async move { bridge.relay_to_upstream(call).await }
        })
    }

    /// Handlers for the central-facing session: everything goes to the station
    pub fn upstream_handlers(&self) -> Handlers {
        let bridge = self.clone();
        Handlers::new().fallback(move |call: InboundCall| {
            let bridge = bridge.clone();
            async move { bridge.relay_to_station(call).await }
        })
    }

    /// Publish the central-facing session
    pub fn attach_upstream(&self, session: Session) {
        info!("Relay {}: upstream {} ready", self.inner.station_id, session.id());
        self.inner
            .upstream
            .send_replace(UpstreamLink::Ready(session.clone()));

        // The station may already be gone
        if self.inner.finished.load(Ordering::SeqCst) {
            session.close();
        }
    }

    /// Record that the central system could not be reached
    pub fn upstream_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Relay {}: upstream failed: {}", self.inner.station_id, reason);
        self.inner.upstream.send_replace(UpstreamLink::Failed(reason));
    }

    pub fn upstream(&self) -> UpstreamLink {
        self.inner.upstream.borrow().clone()
    }

    pub fn in_flight(&self) -> InFlight {
        InFlight {
            to_upstream: self.inner.to_upstream.len(),
            to_station: self.inner.to_station.len(),
        }
    }

    /// Upstream id currently standing in for a station call
    pub fn upstream_id_for(&self, station_call_id: &str) -> Option<String> {
        self.inner.to_upstream.target_of(station_call_id)
    }

    // The far side's call timeout bounds the whole exchange, including the
    // wait for that side to come up.
    async fn relay_to_upstream(&self, call: InboundCall) -> HandlerResult {
        let started = Instant::now();
        let upstream = self.upstream_session().await?;
        let budget = remaining(upstream.call_timeout(), started)?;
        self.inner.to_upstream.forward(&upstream, call, budget).await
    }

    async fn relay_to_station(&self, call: InboundCall) -> HandlerResult {
        let started = Instant::now();
        let station = self.station_session().await?;
        let budget = remaining(station.call_timeout(), started)?;
        self.inner.to_station.forward(&station, call, budget).await
    }

    async fn upstream_session(&self) -> Result<Session, CallErrorReply> {
        let mut link = self.inner.upstream.subscribe();

        let ready = async {
            loop {
                let current = link.borrow_and_update().clone();
                match current {
                    UpstreamLink::Ready(session) => return Ok(session),
                    UpstreamLink::Failed(reason) => return Err(reason),
                    UpstreamLink::Connecting => {}
                }
                if link.changed().await.is_err() {
                    return Err("relay shut down".to_string());
                }
            }
        };

        match tokio::time::timeout(self.inner.upstream_wait, ready).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(reason)) => Err(relay_failure(format!("central system unavailable: {}", reason))),
            Err(_) => Err(relay_failure("central system not connected")),
        }
    }

    async fn station_session(&self) -> Result<Session, CallErrorReply> {
        let mut station = self.inner.station.subscribe();

        let ready = async {
            loop {
                let current = station.borrow_and_update().clone();
                if let Some(session) = current {
                    return Some(session);
                }
                if station.changed().await.is_err() {
                    return None;
                }
            }
        };

        match tokio::time::timeout(self.inner.upstream_wait, ready).await {
            Ok(Some(session)) => Ok(session),
            _ => Err(relay_failure("station not connected")),
        }
    }

    /// Run until either side closes.
    ///
    /// When the station leaves, exchanges already sent upstream are allowed
    /// to finish before the upstream session is closed; their answers have
    /// nowhere to go and are dropped. When the central side ends, the station
    /// session is closed.
    pub async fn run(&self, station: Session) {
        let id = &self.inner.station_id;
        self.inner.station.send_replace(Some(station.clone()));

        tokio::select! {
            _ = station.closed() => {
                info!("Relay {}: station disconnected", id);
                let in_flight = self.inner.to_upstream.len();
                if in_flight > 0 {
                    debug!("Relay {}: letting {} upstream exchanges finish", id, in_flight);
                }
                self.inner.to_upstream.drained().await;
            }
            _ = self.upstream_ended() => {
                info!("Relay {}: central side ended, closing station", id);
                // Failed exchanges answer the station before it goes
                self.inner.to_upstream.drained().await;
                station.close();
            }
        }

        self.inner.finished.store(true, Ordering::SeqCst);
        if let UpstreamLink::Ready(upstream) = self.upstream() {
            upstream.close();
        }
        station.closed().await;
        info!("Relay {} finished", id);
    }

    async fn upstream_ended(&self) {
        let mut link = self.inner.upstream.subscribe();

        loop {
            let current = link.borrow_and_update().clone();
            match current {
                UpstreamLink::Ready(session) => return session.closed().await,
                UpstreamLink::Failed(_) => return,
                UpstreamLink::Connecting => {}
            }
            if link.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for RelayBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBridge")
            .field("station_id", &self.inner.station_id)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
