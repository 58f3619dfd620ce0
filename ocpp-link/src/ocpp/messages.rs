//! OCPP-J RPC framing
//!
//! Every WebSocket text frame carries exactly one message, encoded as a JSON array:
//! - CALL: `[2, uniqueId, action, payload]`
//! - CALLRESULT: `[3, uniqueId, payload]`
//! - CALLERROR: `[4, uniqueId, errorCode, errorDescription, errorDetails]`

use serde_json::{Map, Value};
use thiserror::Error;

use super::catalog::Catalog;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    fn from_marker(marker: &Value) -> Option<Self> {
        match marker.as_i64()? {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }
}

/// CALLERROR codes.
///
/// Covers the RPC framework codes plus `RelayFailure`, which a relay returns
/// when it cannot obtain an answer from the central system. Codes this crate
/// does not know survive a decode/encode cycle through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
    RelayFailure,
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::RelayFailure => "RelayFailure",
            ErrorCode::Other(code) => code,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ErrorCode {
    fn from(s: &str) -> Self {
        match s {
            "FormatViolation" => ErrorCode::FormatViolation,
            "GenericError" => ErrorCode::GenericError,
            "InternalError" => ErrorCode::InternalError,
            "MessageTypeNotSupported" => ErrorCode::MessageTypeNotSupported,
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "OccurrenceConstraintViolation" => ErrorCode::OccurrenceConstraintViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "ProtocolError" => ErrorCode::ProtocolError,
            "RpcFrameworkError" => ErrorCode::RpcFrameworkError,
            "SecurityError" => ErrorCode::SecurityError,
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            "RelayFailure" => ErrorCode::RelayFailure,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

/// Why a frame could not be turned into a [`Message`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The frame is not one of the three message shapes.
    ///
    /// `call_id` is set when the frame was recognisably a CALL with a string
    /// id, so the receiver can still answer it with a CALLERROR.
    #[error("malformed frame: {reason}")]
    Malformed {
        call_id: Option<String>,
        reason: String,
    },

    /// A well-formed CALL whose action the message catalog does not know
    #[error("unknown action {action:?} in call {unique_id}")]
    UnknownAction { unique_id: String, action: String },
}

impl DecodeError {
    fn malformed(reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            call_id: None,
            reason: reason.into(),
        }
    }

    fn malformed_call(call_id: &str, reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            call_id: Some(call_id.to_string()),
            reason: reason.into(),
        }
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    pub fn new(unique_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            unique_id: unique_id.into(),
            action: action.into(),
            payload,
        }
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub unique_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(unique_id: impl Into<String>, payload: Value) -> Self {
        Self {
            unique_id: unique_id.into(),
            payload,
        }
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub unique_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message with empty details
    pub fn new(
        unique_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            unique_id: unique_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Message {
    /// Decode a frame and check CALL actions against the catalog
    pub fn decode(text: &str, catalog: &Catalog) -> Result<Self, DecodeError> {
        let message = Self::decode_frame(text)?;

        if let Message::Call(call) = &message {
            if !catalog.contains(&call.action) {
                return Err(DecodeError::UnknownAction {
                    unique_id: call.unique_id.clone(),
                    action: call.action.clone(),
                });
            }
        }

        Ok(message)
    }

    /// Decode a frame without consulting any catalog
    pub fn decode_frame(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| DecodeError::malformed(format!("invalid JSON: {}", e)))?;

        let Value::Array(mut array) = value else {
            return Err(DecodeError::malformed("frame is not a JSON array"));
        };

        if array.len() < 3 {
            return Err(DecodeError::malformed(format!(
                "expected at least 3 elements, got {}",
                array.len()
            )));
        }

        let message_type = MessageType::from_marker(&array[0])
            .ok_or_else(|| DecodeError::malformed(format!("unknown message type {}", array[0])))?;

        let unique_id = match &array[1] {
            Value::String(id) => id.clone(),
            _ => return Err(DecodeError::malformed("uniqueId is not a string")),
        };

        match message_type {
            MessageType::Call => {
                // [2, uniqueId, action, payload]
                if array.len() != 4 {
                    return Err(DecodeError::malformed_call(
                        &unique_id,
                        format!("CALL has {} elements, expected 4", array.len()),
                    ));
                }

                let payload = array.pop().unwrap_or_default();
                let action = match &array[2] {
                    Value::String(action) => action.clone(),
                    _ => return Err(DecodeError::malformed_call(&unique_id, "action is not a string")),
                };
                if !payload.is_object() {
                    return Err(DecodeError::malformed_call(&unique_id, "payload is not an object"));
                }

                Ok(Message::Call(Call {
                    unique_id,
                    action,
                    payload,
                }))
            }
            MessageType::CallResult => {
                // [3, uniqueId, payload]
                if array.len() != 3 {
                    return Err(DecodeError::malformed(format!(
                        "CALLRESULT has {} elements, expected 3",
                        array.len()
                    )));
                }

                let payload = array.pop().unwrap_or_default();
                if !payload.is_object() {
                    return Err(DecodeError::malformed("payload is not an object"));
                }

                Ok(Message::CallResult(CallResult { unique_id, payload }))
            }
            MessageType::CallError => {
                // [4, uniqueId, errorCode, errorDescription, errorDetails]
                if array.len() != 5 {
                    return Err(DecodeError::malformed(format!(
                        "CALLERROR has {} elements, expected 5",
                        array.len()
                    )));
                }

                let error_details = array.pop().unwrap_or_default();
                let error_code = match &array[2] {
                    Value::String(code) => ErrorCode::from(code.as_str()),
                    _ => return Err(DecodeError::malformed("errorCode is not a string")),
                };
                let error_description = match &array[3] {
                    Value::String(description) => description.clone(),
                    _ => return Err(DecodeError::malformed("errorDescription is not a string")),
                };
                if !error_details.is_object() {
                    return Err(DecodeError::malformed("errorDetails is not an object"));
                }

                Ok(Message::CallError(CallError {
                    unique_id,
                    error_code,
                    error_description,
                    error_details,
                }))
            }
        }
    }

    /// Serialize to the OCPP-J wire format
    pub fn encode(&self) -> String {
        let array = match self {
            Message::Call(call) => serde_json::json!([
                MessageType::Call as i32,
                &call.unique_id,
                &call.action,
                &call.payload
            ]),
            Message::CallResult(result) => serde_json::json!([
                MessageType::CallResult as i32,
                &result.unique_id,
                &result.payload
            ]),
            Message::CallError(error) => serde_json::json!([
                MessageType::CallError as i32,
                &error.unique_id,
                error.error_code.as_str(),
                &error.error_description,
                &error.error_details
            ]),
        };
        array.to_string()
    }

    /// Get the unique id
    pub fn unique_id(&self) -> &str {
        match self {
            Message::Call(c) => &c.unique_id,
            Message::CallResult(r) => &r.unique_id,
            Message::CallError(e) => &e.unique_id,
        }
    }
}

impl From<Call> for Message {
    fn from(call: Call) -> Self {
        Message::Call(call)
    }
}

impl From<CallResult> for Message {
    fn from(result: CallResult) -> Self {
        Message::CallResult(result)
    }
}

impl From<CallError> for Message {
    fn from(error: CallError) -> Self {
        Message::CallError(error)
    }
}
