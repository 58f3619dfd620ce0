//! One OCPP-J session over one connection
//!
//! A session owns two tasks:
//! - the writer, the only code that touches the sending half, fed through a
//!   bounded queue so frames go out whole and in order
//! - the receive loop, which decodes frames in arrival order, hands results to
//!   the correlator and spawns one task per inbound call so a slow handler
//!   never holds up the frames behind it
//!
//! `Session` itself is a cheap handle; clone it into whoever needs to call.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::correlator::{CallFailure, Correlator, PendingCall};
use super::handlers::{Handlers, InboundCall};
use super::transport::{Connection, FrameReceiver, FrameSender};
use crate::config::SessionConfig;
use crate::error::OcppError;
use crate::ocpp::catalog::{from_payload, to_payload, Catalog, OcppRequest};
use crate::ocpp::{Call, CallError, CallResult, DecodeError, ErrorCode, Message};

const OUTBOUND_QUEUE: usize = 64;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

struct Inner {
    id: String,
    catalog: Catalog,
    config: SessionConfig,
    correlator: Correlator,
    outbound: mpsc::Sender<String>,
    state: watch::Sender<SessionState>,
}

/// Handle to a running session
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Start a session on an established connection.
    ///
    /// The handler table is frozen here; the session is `Open` on return.
    pub fn open<C: Connection>(
        id: impl Into<String>,
        connection: C,
        handlers: Handlers,
        catalog: Catalog,
        config: SessionConfig,
    ) -> Self {
        let (sender, receiver) = connection.split();
        let (outbound, frames) = mpsc::channel(OUTBOUND_QUEUE);
        let (state, _) = watch::channel(SessionState::Connecting);

        let inner = Arc::new(Inner {
            id: id.into(),
            catalog,
            config,
            correlator: Correlator::new(),
            outbound,
            state,
        });

        let writer = tokio::spawn(write_loop(inner.clone(), sender, frames));
        inner.state.send_replace(SessionState::Open);
        tokio::spawn(receive_loop(inner.clone(), receiver, Arc::new(handlers), writer));

        info!("Session {} open", inner.id);
        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Whether both handles refer to the same session
    pub fn same_as(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Default wait for an outbound call's answer
    pub fn call_timeout(&self) -> Duration {
        self.inner.config.call_timeout
    }

    /// Outbound calls still waiting for an answer
    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Send a CALL and wait for its answer with the configured timeout
    pub async fn call(&self, action: &str, payload: Value) -> Result<Value, CallFailure> {
        self.call_with_timeout(action, payload, self.inner.config.call_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, CallFailure> {
        self.start_call_with_timeout(action, payload, timeout)
            .await?
            .wait()
            .await
    }

    /// Send a CALL and return its waiter without waiting
    pub async fn start_call(&self, action: &str, payload: Value) -> Result<PendingCall, CallFailure> {
        self.start_call_with_timeout(action, payload, self.inner.config.call_timeout)
            .await
    }

    pub async fn start_call_with_timeout(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<PendingCall, CallFailure> {
        if !self.is_open() {
            return Err(CallFailure::Disconnected);
        }

        let pending = self.inner.correlator.issue(action, timeout)?;
        let call = Call::new(pending.unique_id(), action, payload);

        // Dropping `pending` on failure releases the entry
        self.inner.write(call.into()).await?;
        Ok(pending)
    }

    /// Send a typed request and parse the typed response
    pub async fn send<R: OcppRequest>(&self, request: &R) -> Result<R::Response, OcppError> {
        let payload = to_payload(R::ACTION, request)?;
        let response = self.call(R::ACTION, payload).await?;
        Ok(from_payload(R::ACTION, response)?)
    }

    /// Stop the session.
    ///
    /// Pending calls fail with `Disconnected` right away; the connection is
    /// closed once the writer has flushed what was already queued.
    pub fn close(&self) {
        self.inner.begin_close();
    }

    /// Wait until the session has reached `Closing`
    pub async fn closing(&self) {
        wait_for_state(self.inner.state.subscribe(), SessionState::Closing).await;
    }

    /// Wait until both session tasks have finished
    pub async fn closed(&self) {
        wait_for_state(self.inner.state.subscribe(), SessionState::Closed).await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl Inner {
    /// Move to `Closing` and fail every pending call. Returns whether this
    /// call made the transition.
    fn begin_close(&self) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state < SessionState::Closing {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });

        if changed {
            debug!("Session {} closing", self.id);
            self.correlator.close(CallFailure::Disconnected);
        }
        changed
    }

    async fn write(&self, message: Message) -> Result<(), CallFailure> {
        let frame = message.encode();
        debug!("{} >> {}", self.id, frame);

        self.outbound
            .send(frame)
            .await
            .map_err(|_| CallFailure::Disconnected)
    }

    async fn reply_error(&self, unique_id: String, code: ErrorCode, description: String) {
        let error = CallError::new(unique_id, code, description);
        if self.write(error.into()).await.is_err() {
            debug!("Session {} gone before CALLERROR could be sent", self.id);
        }
    }

    async fn handle_frame(self: &Arc<Self>, frame: &str, handlers: &Arc<Handlers>) {
        debug!("{} << {}", self.id, frame);

        match Message::decode(frame, &self.catalog) {
            Ok(Message::Call(call)) => self.dispatch(call, handlers).await,
            Ok(Message::CallResult(result)) => self.on_result(result),
            Ok(Message::CallError(error)) => {
                self.correlator.reject(
                    &error.unique_id,
                    error.error_code,
                    error.error_description,
                    error.error_details,
                );
            }
            Err(DecodeError::UnknownAction { unique_id, action }) => {
                warn!("Session {}: unknown action {}", self.id, action);
                self.reply_error(
                    unique_id,
                    ErrorCode::NotImplemented,
                    format!("Action {} is not supported", action),
                )
                .await;
            }
            Err(DecodeError::Malformed {
                call_id: Some(unique_id),
                reason,
            }) => {
                warn!("Session {}: malformed call {}: {}", self.id, unique_id, reason);
                self.reply_error(unique_id, ErrorCode::FormatViolation, reason)
                    .await;
            }
            Err(e) => {
                warn!("Session {}: dropping frame: {}", self.id, e);
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, call: Call, handlers: &Arc<Handlers>) {
        let Some(handler) = handlers.lookup(&call.action) else {
            warn!("Session {}: no handler for {}", self.id, call.action);
            self.reply_error(
                call.unique_id,
                ErrorCode::NotImplemented,
                format!("No handler for {}", call.action),
            )
            .await;
            return;
        };

        if let Err(e) = self.catalog.validate_request(&call.action, &call.payload) {
            warn!("Session {}: invalid {} payload: {}", self.id, call.action, e);
            self.reply_error(call.unique_id, ErrorCode::FormatViolation, e.to_string())
                .await;
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            let unique_id = call.unique_id.clone();
            let action = call.action.clone();

            let reply: Message = match handler(InboundCall {
                unique_id: call.unique_id,
                action: call.action,
                payload: call.payload,
            })
            .await
            {
                Ok(payload) => CallResult::new(unique_id, payload).into(),
                Err(e) => {
                    debug!("Session {}: {} handler failed: {}", inner.id, action, e);
                    CallError::new(unique_id, e.code, e.description)
                        .with_details(e.details)
                        .into()
                }
            };

            if inner.write(reply).await.is_err() {
                debug!("Session {} gone before {} reply could be sent", inner.id, action);
            }
        });
    }

    fn on_result(&self, result: CallResult) {
        let action = self.correlator.action_of(&result.unique_id);

        if let Some(action) = action.filter(|a| self.catalog.contains(a)) {
            if let Err(e) = self.catalog.validate_response(&action, &result.payload) {
                warn!("Session {}: invalid {} response: {}", self.id, action, e);
                self.correlator.reject(
                    &result.unique_id,
                    ErrorCode::FormatViolation,
                    e.to_string(),
                    json!({}),
                );
                return;
            }
        }

        self.correlator.resolve(&result.unique_id, result.payload);
    }
}

async fn write_loop<S: FrameSender>(
    inner: Arc<Inner>,
    mut sender: S,
    mut frames: mpsc::Receiver<String>,
) {
    let state = inner.state.subscribe();

    loop {
        tokio::select! {
            biased;

            frame = frames.recv() => {
                let Some(frame) = frame else { break };

                if let Err(e) = sender.send(frame).await {
                    warn!("Session {}: write failed: {}", inner.id, e);
                    inner.begin_close();
                    break;
                }
            }

            _ = wait_for_state(state.clone(), SessionState::Closing) => break,
        }
    }

    sender.close().await;
}

async fn receive_loop<R: FrameReceiver>(
    inner: Arc<Inner>,
    mut receiver: R,
    handlers: Arc<Handlers>,
    writer: JoinHandle<()>,
) {
    let state = inner.state.subscribe();

    loop {
        let frame = tokio::select! {
            frame = receiver.receive() => frame,
            _ = wait_for_state(state.clone(), SessionState::Closing) => None,
        };

        match frame {
            Some(frame) => inner.handle_frame(&frame, &handlers).await,
            None => break,
        }
    }

    inner.begin_close();
    if let Err(e) = writer.await {
        warn!("Session {}: writer task failed: {}", inner.id, e);
    }

    inner.state.send_replace(SessionState::Closed);
    info!("Session {} closed", inner.id);
}

async fn wait_for_state(mut state: watch::Receiver<SessionState>, target: SessionState) {
    loop {
        let current = *state.borrow_and_update();
        if current >= target {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::{HeartbeatRequest, HeartbeatResponse};
    use crate::rpc::handlers::CallErrorReply;
    use crate::rpc::transport::memory::{self, MemoryReceiver, MemorySender};
    use tokio::sync::oneshot;

    /// The far end of a memory connection, speaking raw frames
    struct Peer {
        tx: MemorySender,
        rx: MemoryReceiver,
    }

    impl Peer {
        async fn send(&mut self, message: impl Into<Message>) {
            self.tx.send(message.into().encode()).await.unwrap();
        }

        async fn send_raw(&mut self, frame: &str) {
            self.tx.send(frame.to_string()).await.unwrap();
        }

        async fn next(&mut self) -> Message {
            let frame = self.rx.receive().await.unwrap();
            Message::decode_frame(&frame).unwrap()
        }

        async fn next_call(&mut self) -> Call {
            match self.next().await {
                Message::Call(call) => call,
                other => panic!("expected CALL, got {:?}", other),
            }
        }
    }

    fn open(handlers: Handlers, catalog: Catalog) -> (Session, Peer) {
        let (ours, theirs) = memory::pair();
        let session = Session::open("CP001", ours, handlers, catalog, SessionConfig::default());
        let (tx, rx) = theirs.split();
        (session, Peer { tx, rx })
    }

    fn heartbeat_handlers() -> Handlers {
        Handlers::new().on_request(|_: HeartbeatRequest| async {
            Ok::<_, CallErrorReply>(HeartbeatResponse {
                current_time: "2026-01-20T12:00:00Z".parse().unwrap(),
            })
        })
    }

    fn now() -> Value {
        json!({"currentTime": "2026-01-20T12:00:00Z"})
    }

    #[tokio::test]
    async fn test_call_resolves() {
        let (session, mut peer) = open(Handlers::new(), Catalog::v201());

        let caller = session.clone();
        let task = tokio::spawn(async move { caller.call("Heartbeat", json!({})).await });

        let call = peer.next_call().await;
        assert_eq!(call.action, "Heartbeat");
        assert_eq!(call.payload, json!({}));
        peer.send(CallResult::new(&call.unique_id, now())).await;

        assert_eq!(task.await.unwrap().unwrap(), now());
        assert_eq!(session.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_rejected() {
        let (session, mut peer) = open(Handlers::new(), Catalog::v201());

        let caller = session.clone();
        let task = tokio::spawn(async move { caller.call("Heartbeat", json!({})).await });

        let call = peer.next_call().await;
        peer.send(CallError::new(&call.unique_id, ErrorCode::InternalError, "boom"))
            .await;

        assert_eq!(
            task.await.unwrap().unwrap_err(),
            CallFailure::Rejected {
                code: ErrorCode::InternalError,
                description: "boom".into(),
                details: json!({}),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let (session, mut peer) = open(Handlers::new(), Catalog::v201());

        let caller = session.clone();
        let task = tokio::spawn(async move {
            caller
                .call_with_timeout("Heartbeat", json!({}), Duration::from_secs(5))
                .await
        });

        let call = peer.next_call().await;
        assert_eq!(task.await.unwrap().unwrap_err(), CallFailure::Timeout);

        // Late answer is ignored and the session stays usable
        peer.send(CallResult::new(&call.unique_id, now())).await;
        tokio::task::yield_now().await;
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_typed_send() {
        let (session, mut peer) = open(Handlers::new(), Catalog::v201());

        let caller = session.clone();
        let task = tokio::spawn(async move { caller.send(&HeartbeatRequest {}).await });

        let call = peer.next_call().await;
        peer.send(CallResult::new(&call.unique_id, now())).await;

        let response = task.await.unwrap().unwrap();
        assert_eq!(response.current_time.to_rfc3339(), "2026-01-20T12:00:00+00:00");
    }

    #[tokio::test]
    async fn test_invalid_response_payload_is_format_violation() {
        let (session, mut peer) = open(Handlers::new(), Catalog::v201());

        let caller = session.clone();
        let task = tokio::spawn(async move { caller.call("Heartbeat", json!({})).await });

        let call = peer.next_call().await;
        peer.send(CallResult::new(&call.unique_id, json!({"currentTime": 5})))
            .await;

        match task.await.unwrap() {
            Err(CallFailure::Rejected { code, .. }) => assert_eq!(code, ErrorCode::FormatViolation),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inbound_call_answered_with_same_id() {
        let (_session, mut peer) = open(heartbeat_handlers(), Catalog::v201());

        peer.send(Call::new("abc-1", "Heartbeat", json!({}))).await;

        assert_eq!(peer.next().await, Message::CallResult(CallResult::new("abc-1", now())));
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_implemented() {
        let (session, mut peer) = open(heartbeat_handlers(), Catalog::v201());

        peer.send(Call::new("x-1", "FooBar", json!({}))).await;

        match peer.next().await {
            Message::CallError(error) => {
                assert_eq!(error.unique_id, "x-1");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Still serving
        assert!(session.is_open());
        peer.send(Call::new("x-2", "Heartbeat", json!({}))).await;
        assert_eq!(peer.next().await.unique_id(), "x-2");
    }

    #[tokio::test]
    async fn test_known_action_without_handler_is_not_implemented() {
        let (_session, mut peer) = open(heartbeat_handlers(), Catalog::v201());

        peer.send(Call::new("s-1", "StatusNotification", json!({}))).await;

        match peer.next().await {
            Message::CallError(error) => assert_eq!(error.error_code, ErrorCode::NotImplemented),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_request_payload_is_format_violation() {
        let handlers = Handlers::new().on("BootNotification", |_| async {
            Ok::<_, CallErrorReply>(json!({}))
        });
        let (_session, mut peer) = open(handlers, Catalog::v201());

        peer.send(Call::new("b-1", "BootNotification", json!({"reason": "PowerUp"})))
            .await;

        match peer.next().await {
            Message::CallError(error) => {
                assert_eq!(error.unique_id, "b-1");
                assert_eq!(error.error_code, ErrorCode::FormatViolation);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_error_uses_its_code() {
        let handlers = Handlers::new().on("Heartbeat", |_| async {
            Err::<Value, _>(CallErrorReply::new(ErrorCode::SecurityError, "not allowed"))
        });
        let (_session, mut peer) = open(handlers, Catalog::v201());

        peer.send(Call::new("h-1", "Heartbeat", json!({}))).await;

        assert_eq!(
            peer.next().await,
            Message::CallError(CallError::new("h-1", ErrorCode::SecurityError, "not allowed"))
        );
    }

    #[tokio::test]
    async fn test_malformed_frames() {
        let (session, mut peer) = open(heartbeat_handlers(), Catalog::v201());

        // Unparsable: dropped silently
        peer.send_raw("not json").await;
        peer.send_raw("[9,\"x\",{}]").await;

        // Recognisably a call: answered
        peer.send_raw("[2,\"m-1\",\"Heartbeat\",[]]").await;
        match peer.next().await {
            Message::CallError(error) => {
                assert_eq!(error.unique_id, "m-1");
                assert_eq!(error.error_code, ErrorCode::FormatViolation);
            }
            other => panic!("unexpected {:?}", other),
        }

        peer.send(Call::new("m-2", "Heartbeat", json!({}))).await;
        assert_eq!(peer.next().await.unique_id(), "m-2");
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_disconnect_fails_all_pending() {
        let (session, peer) = open(Handlers::new(), Catalog::v201());

        let mut calls = Vec::new();
        for _ in 0..3 {
            calls.push(session.start_call("Heartbeat", json!({})).await.unwrap());
        }
        assert_eq!(session.pending_calls(), 3);

        drop(peer);

        for call in calls {
            assert_eq!(call.wait().await.unwrap_err(), CallFailure::Disconnected);
        }
        session.closed().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session.call("Heartbeat", json!({})).await.unwrap_err(),
            CallFailure::Disconnected
        );
    }

    #[tokio::test]
    async fn test_close_unblocks_waiters() {
        let (session, _peer) = open(Handlers::new(), Catalog::v201());

        let pending = session.start_call("Heartbeat", json!({})).await.unwrap();
        session.close();

        assert_eq!(pending.wait().await.unwrap_err(), CallFailure::Disconnected);
        session.closed().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_concurrent_calls_resolved_out_of_order() {
        let (session, mut peer) = open(Handlers::new(), Catalog::permissive());

        let mut tasks = Vec::new();
        for n in 0..3 {
            let caller = session.clone();
            tasks.push(tokio::spawn(async move {
                caller.call("Echo", json!({ "n": n })).await
            }));
        }

        let mut calls = Vec::new();
        for _ in 0..3 {
            calls.push(peer.next_call().await);
        }

        for call in calls.iter().rev() {
            peer.send(CallResult::new(&call.unique_id, call.payload.clone()))
                .await;
        }

        for (n, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap().unwrap(), json!({ "n": n }));
        }
    }

    #[tokio::test]
    async fn test_suspended_handler_does_not_block_receive_loop() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(parking_lot::Mutex::new(Some(release_rx)));

        let handlers = Handlers::new()
            .on("Slow", move |_| {
                let release = release_rx.lock().take();
                async move {
                    if let Some(release) = release {
                        let _ = release.await;
                    }
                    Ok::<_, CallErrorReply>(json!({"slow": true}))
                }
            })
            .on("Fast", |_| async { Ok::<_, CallErrorReply>(json!({"fast": true})) });
        let (_session, mut peer) = open(handlers, Catalog::permissive());

        peer.send(Call::new("1", "Slow", json!({}))).await;
        peer.send(Call::new("2", "Fast", json!({}))).await;

        assert_eq!(peer.next().await.unique_id(), "2");

        release_tx.send(()).unwrap();
        assert_eq!(peer.next().await.unique_id(), "1");
    }

    #[tokio::test]
    async fn test_duplicate_result_is_ignored() {
        let (session, mut peer) = open(Handlers::new(), Catalog::v201());

        let caller = session.clone();
        let task = tokio::spawn(async move { caller.call("Heartbeat", json!({})).await });

        let call = peer.next_call().await;
        peer.send(CallResult::new(&call.unique_id, now())).await;
        peer.send(CallResult::new(&call.unique_id, json!({"currentTime": "2030-01-01T00:00:00Z"})))
            .await;
        peer.send(CallResult::new("never-issued", now())).await;

        assert_eq!(task.await.unwrap().unwrap(), now());
        assert!(session.is_open());
    }
}
