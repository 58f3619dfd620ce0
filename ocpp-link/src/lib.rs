//! # OCPP Link
//!
//! OCPP-J (OCPP 2.0.1 over WebSocket) session core with three roles built on
//! it: a charging station, a central system and a relay between the two.
//!
//! ## Architecture
//!
//! ```text
//! ChargingStation ──ws──► Relay ──ws──► CentralSystem
//!        │                  │                 │
//!        └──────────────────┼─────────────────┘
//!                           ▼
//! ┌──────────────────────────────────────────────┐
//! │ rpc::Session                                 │
//! │  Transport │ Codec │ Correlator │ Handlers   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Every connection is one [`Session`]: a receive loop decoding
//! `[2|3|4, ...]` frames, a writer task, a [`Correlator`] matching results to
//! outstanding calls and a [`Handlers`] table answering inbound calls.
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_link::{CentralSystem, CentralSystemConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let central = CentralSystem::new(CentralSystemConfig::default());
//!     central.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod ocpp;
pub mod reporting;
pub mod roles;
pub mod rpc;

pub use config::{CentralSystemConfig, RelayConfig, SessionConfig, StationConfig};
pub use discovery::{Discovery, MdnsAnnouncement, MdnsDiscovery, StaticDiscovery};
pub use error::{OcppError, Result};
pub use ocpp::{Call, CallError, CallResult, Catalog, ErrorCode, Message, OcppRequest};
pub use reporting::{export_csv, RttLog, RttSample, RttSummary};
pub use roles::{CentralSystem, ChargingStation, Relay, StationEvent};
pub use rpc::{CallFailure, Correlator, Handlers, RelayBridge, Session, SessionState};
