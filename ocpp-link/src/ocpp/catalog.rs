//! Message catalog
//!
//! Knows which actions exist and what their payloads look like. The codec asks
//! it whether an inbound CALL names a known action; the session asks it to
//! validate payloads before a handler sees them.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::types::*;

/// A request payload with a fixed action name and response type
pub trait OcppRequest: Serialize + DeserializeOwned + Send + 'static {
    const ACTION: &'static str;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// Payload did not match the shape the catalog expects for its action
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{action}: {reason}")]
pub struct SchemaError {
    pub action: String,
    pub reason: String,
}

type Validator = fn(&Value) -> Result<(), serde_json::Error>;

fn shape_of<T: DeserializeOwned>(payload: &Value) -> Result<(), serde_json::Error> {
    T::deserialize(payload).map(|_| ())
}

#[derive(Clone, Copy)]
struct Schema {
    request: Validator,
    response: Validator,
}

/// Registry of known actions and their payload shapes
#[derive(Clone, Default)]
pub struct Catalog {
    schemas: HashMap<&'static str, Schema>,
    permissive: bool,
}

impl Catalog {
    /// Empty catalog: every CALL is an unknown action
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts every action and never validates payloads
    pub fn permissive() -> Self {
        Self {
            schemas: HashMap::new(),
            permissive: true,
        }
    }

    /// The OCPP 2.0.1 subset this crate speaks
    pub fn v201() -> Self {
        Self::new()
            .with::<BootNotificationRequest>()
            .with::<HeartbeatRequest>()
            .with::<StatusNotificationRequest>()
            .with::<MeterValuesRequest>()
            .with::<DataTransferRequest>()
    }

    pub fn register<R: OcppRequest>(&mut self) {
        self.schemas.insert(
            R::ACTION,
            Schema {
                request: shape_of::<R>,
                response: shape_of::<R::Response>,
            },
        );
    }

    pub fn with<R: OcppRequest>(mut self) -> Self {
        self.register::<R>();
        self
    }

    pub fn contains(&self, action: &str) -> bool {
        self.permissive || self.schemas.contains_key(action)
    }

    pub fn is_permissive(&self) -> bool {
        self.permissive
    }

    /// Registered action names, sorted
    pub fn actions(&self) -> Vec<&'static str> {
        let mut actions: Vec<_> = self.schemas.keys().copied().collect();
        actions.sort_unstable();
        actions
    }

    /// Check an inbound or outbound CALL payload
    pub fn validate_request(&self, action: &str, payload: &Value) -> Result<(), SchemaError> {
        self.validate(action, payload, |schema| schema.request)
    }

    /// Check a CALLRESULT payload against the action it answers
    pub fn validate_response(&self, action: &str, payload: &Value) -> Result<(), SchemaError> {
        self.validate(action, payload, |schema| schema.response)
    }

    fn validate(
        &self,
        action: &str,
        payload: &Value,
        pick: impl Fn(&Schema) -> Validator,
    ) -> Result<(), SchemaError> {
        match self.schemas.get(action) {
            Some(schema) => pick(schema)(payload).map_err(|e| SchemaError {
                action: action.to_string(),
                reason: e.to_string(),
            }),
            None if self.permissive => Ok(()),
            None => Err(SchemaError {
                action: action.to_string(),
                reason: "action is not in the catalog".to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("actions", &self.actions())
            .field("permissive", &self.permissive)
            .finish()
    }
}

/// Turn a typed payload into its wire value
pub fn to_payload<T: Serialize>(action: &str, value: &T) -> Result<Value, SchemaError> {
    serde_json::to_value(value).map_err(|e| SchemaError {
        action: action.to_string(),
        reason: e.to_string(),
    })
}

/// Read a wire value as a typed payload
pub fn from_payload<T: DeserializeOwned>(action: &str, payload: Value) -> Result<T, SchemaError> {
    serde_json::from_value(payload).map_err(|e| SchemaError {
        action: action.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_v201_knows_core_actions() {
        let catalog = Catalog::v201();

        assert!(catalog.contains("BootNotification"));
        assert!(catalog.contains("Heartbeat"));
        assert!(!catalog.contains("FooBar"));
        assert_eq!(catalog.actions().len(), 5);
    }

    #[test]
    fn test_validate_boot_notification() {
        let catalog = Catalog::v201();

        let good = json!({
            "chargingStation": {"model": "Wallbox CP1", "vendorName": "INESCTEC"},
            "reason": "PowerUp"
        });
        assert!(catalog.validate_request("BootNotification", &good).is_ok());

        let bad = json!({"chargingStation": {"model": "Wallbox CP1"}});
        let err = catalog.validate_request("BootNotification", &bad).unwrap_err();
        assert_eq!(err.action, "BootNotification");
    }

    #[test]
    fn test_validate_response() {
        let catalog = Catalog::v201();

        let good = json!({"currentTime": "2026-01-20T12:00:00Z"});
        assert!(catalog.validate_response("Heartbeat", &good).is_ok());
        assert!(catalog.validate_response("Heartbeat", &json!({})).is_err());
    }

    #[test]
    fn test_permissive_accepts_anything() {
        let catalog = Catalog::permissive();

        assert!(catalog.contains("FooBar"));
        assert!(catalog.validate_request("FooBar", &json!({"x": 1})).is_ok());
    }

    #[test]
    fn test_typed_payload_helpers() {
        let value = to_payload("Heartbeat", &HeartbeatRequest {}).unwrap();
        assert_eq!(value, json!({}));

        let resp: HeartbeatResponse =
            from_payload("Heartbeat", json!({"currentTime": "2026-01-20T12:00:00Z"})).unwrap();
        assert_eq!(resp.current_time.to_rfc3339(), "2026-01-20T12:00:00+00:00");
    }
}
