//! OCPP 2.0.1 message layer
//!
//! - `messages`: OCPP-J framing (CALL, CALLRESULT, CALLERROR)
//! - `catalog`: known actions and their payload shapes
//! - `types`: typed payloads for the supported actions

pub mod catalog;
pub mod messages;
pub mod types;

pub use catalog::{Catalog, OcppRequest, SchemaError};
pub use messages::*;
pub use types::*;
