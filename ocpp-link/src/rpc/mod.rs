//! OCPP-J RPC core
//!
//! - `transport`: WebSocket and in-process connections
//! - `correlator`: outbound call bookkeeping
//! - `handlers`: inbound action → handler table
//! - `session`: one connection's receive loop, writer and `call()`
//! - `heartbeat`: periodic Heartbeat with round-trip measurement
//! - `relay`: splices a station session onto a central system session

pub mod correlator;
pub mod handlers;
pub mod heartbeat;
pub mod relay;
pub mod session;
pub mod transport;

pub use correlator::{CallFailure, Correlator, PendingCall};
pub use handlers::{CallErrorReply, HandlerResult, Handlers, InboundCall};
pub use heartbeat::{HeartbeatHandle, HeartbeatScheduler, HeartbeatState, HeartbeatStatus};
pub use relay::{InFlight, RelayBridge, UpstreamLink};
pub use session::{Session, SessionState};
pub use transport::{Connection, FrameReceiver, FrameSender, TransportError, OCPP_SUBPROTOCOL};
