//! Inbound call handlers
//!
//! A plain action-name → handler map, built once before a session starts and
//! shared read-only afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ocpp::catalog::{from_payload, to_payload, OcppRequest, SchemaError};
use crate::ocpp::ErrorCode;

/// A CALL received from the peer
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCall {
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
}

/// Error a handler answers with; sent back as a CALLERROR
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {description}")]
pub struct CallErrorReply {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl CallErrorReply {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl From<SchemaError> for CallErrorReply {
    fn from(e: SchemaError) -> Self {
        CallErrorReply::new(ErrorCode::FormatViolation, e.to_string())
    }
}

pub type HandlerResult = Result<Value, CallErrorReply>;

pub(crate) type Handler = Arc<dyn Fn(InboundCall) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Handler table for one session
#[derive(Clone, Default)]
pub struct Handlers {
    table: HashMap<String, Handler>,
    fallback: Option<Handler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler working on raw payloads
    pub fn on<F, Fut>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(InboundCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.table
            .insert(action.into(), Arc::new(move |call: InboundCall| handler(call).boxed()));
        self
    }

    /// Register a handler for a typed request
    pub fn on_request<R, F, Fut>(self, handler: F) -> Self
    where
        R: OcppRequest,
        F: Fn(R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Response, CallErrorReply>> + Send + 'static,
    {
        self.on(R::ACTION, move |call: InboundCall| {
            let pending = from_payload::<R>(R::ACTION, call.payload).map(&handler);
            async move {
                let response = pending?.await?;
                Ok::<_, CallErrorReply>(to_payload(R::ACTION, &response)?)
            }
        })
    }

    /// Handler for every action without its own entry
    pub fn fallback<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(InboundCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.fallback = Some(Arc::new(move |call: InboundCall| handler(call).boxed()));
        self
    }

    pub(crate) fn lookup(&self, action: &str) -> Option<Handler> {
        self.table.get(action).or(self.fallback.as_ref()).cloned()
    }

    pub fn handles(&self, action: &str) -> bool {
        self.table.contains_key(action) || self.fallback.is_some()
    }

    /// Actions with a dedicated handler, sorted
    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<_> = self.table.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("actions", &self.actions())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
