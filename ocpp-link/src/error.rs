//! Crate-level error type

use thiserror::Error;

use crate::ocpp::catalog::SchemaError;
use crate::ocpp::DecodeError;
use crate::reporting::ReportError;
use crate::rpc::correlator::CallFailure;
use crate::rpc::transport::TransportError;

/// Errors surfaced by role entry points and typed calls
#[derive(Debug, Error)]
pub enum OcppError {
    #[error(transparent)]
    Call(#[from] CallFailure),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error("discovery error: {0}")]
    Discovery(#[from] mdns_sd::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OcppError>;
