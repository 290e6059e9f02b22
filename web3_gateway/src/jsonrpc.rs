//! JSON-RPC envelope handling.
//!
//! Incoming requests and upstream responses are kept as raw maps so that ids
//! and params round-trip byte-faithfully; only the form sent upstream (with
//! the rewritten correlation id) is strongly shaped.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION_1: &str = "1.0";
pub const JSONRPC_VERSION_2: &str = "2.0";

pub type RawRpc = Map<String, Value>;

/// One incoming sub-request, untouched.
#[derive(Clone, Debug)]
pub struct JsonRpcRequest {
    raw: RawRpc,
}

/// An inbound body is either one request object or a batch array.
#[derive(Clone, Debug)]
pub enum JsonRpcPayload {
    Single(JsonRpcRequest),
    Batch(Vec<JsonRpcRequest>),
}

pub fn parse_payload(body: &[u8]) -> Result<JsonRpcPayload, serde_json::Error> {
    // batches first. a failed array parse falls back to a single object and
    // surfaces that error when both shapes are wrong
    match serde_json::from_slice::<Vec<RawRpc>>(body) {
        Ok(raws) => Ok(JsonRpcPayload::Batch(
            raws.into_iter().map(JsonRpcRequest::new).collect(),
        )),
        Err(_) => serde_json::from_slice::<RawRpc>(body)
            .map(|raw| JsonRpcPayload::Single(JsonRpcRequest::new(raw))),
    }
}

/// Canonical correlation form of an id: numbers in lowercase hex, strings
/// as-is, anything else empty. The client's original value is never sent
/// back through this.
fn correlation_id(id: Option<&Value>) -> String {
    match id {
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_i64() {
                format!("{:x}", v)
            } else if let Some(v) = n.as_f64() {
                format!("{:x}", v as i64)
            } else {
                String::new()
            }
        }
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

impl JsonRpcRequest {
    pub fn new(raw: RawRpc) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &RawRpc {
        &self.raw
    }

    pub fn raw_id(&self) -> Option<&Value> {
        self.raw.get("id")
    }

    pub fn correlation_id(&self) -> String {
        correlation_id(self.raw.get("id"))
    }

    pub fn version(&self) -> &str {
        match self.raw.get("jsonrpc") {
            Some(Value::String(v)) => v,
            _ => JSONRPC_VERSION_1,
        }
    }

    pub fn method(&self) -> &str {
        match self.raw.get("method") {
            Some(Value::String(m)) => m,
            _ => "",
        }
    }

    /// Positional params. A bare (non-array) value is treated as a
    /// single-element list.
    pub fn params(&self) -> Vec<Value> {
        match self.raw.get("params") {
            Some(Value::Array(params)) => params.clone(),
            Some(v) => vec![v.clone()],
            None => vec![],
        }
    }

    /// Borrowing positional access, used by the cache predicates.
    pub fn param(&self, index: usize) -> Option<&Value> {
        match self.raw.get("params") {
            Some(Value::Array(params)) => params.get(index),
            Some(v) if index == 0 => Some(v),
            _ => None,
        }
    }

    /// A version-2 request without an id is a notification and is excluded
    /// from correlation.
    pub fn is_notify(&self) -> bool {
        self.version() == JSONRPC_VERSION_2 && !self.raw.contains_key("id")
    }

    pub fn seal(&self) -> SealedRequest {
        SealedRequest {
            params: self.params(),
            id: self.correlation_id(),
            version: self.version().to_string(),
            method: self.method().to_string(),
        }
    }

    /// Build the outgoing result for this sub-request, preserving the
    /// client's id and version exactly.
    pub fn make_result(
        &self,
        result: Option<Value>,
        error: Option<Value>,
    ) -> JsonRpcForwardedResponse {
        JsonRpcForwardedResponse {
            id: self.raw.get("id").cloned().unwrap_or(Value::Null),
            version: match self.raw.get("jsonrpc") {
                Some(Value::String(v)) => v.clone(),
                _ => String::new(),
            },
            result,
            error,
        }
    }
}

/// Wire form sent upstream. The id carries the request-scoped prefix.
#[derive(Clone, Debug, Serialize)]
pub struct SealedRequest {
    pub params: Vec<Value>,
    pub id: String,
    #[serde(rename = "jsonrpc", skip_serializing_if = "String::is_empty")]
    pub version: String,
    pub method: String,
}

/// One response object as the upstream sent it.
#[derive(Clone, Debug, Serialize)]
#[serde(transparent)]
pub struct UpstreamResponse {
    raw: RawRpc,
}

pub fn parse_upstream(body: &[u8]) -> Result<(Vec<UpstreamResponse>, bool), serde_json::Error> {
    match serde_json::from_slice::<Vec<RawRpc>>(body) {
        Ok(raws) => Ok((
            raws.into_iter().map(|raw| UpstreamResponse { raw }).collect(),
            true,
        )),
        Err(_) => serde_json::from_slice::<RawRpc>(body)
            .map(|raw| (vec![UpstreamResponse { raw }], false)),
    }
}

impl UpstreamResponse {
    pub fn raw(&self) -> &RawRpc {
        &self.raw
    }

    pub fn raw_mut(&mut self) -> &mut RawRpc {
        &mut self.raw
    }

    pub fn correlation_id(&self) -> String {
        correlation_id(self.raw.get("id"))
    }

    pub fn version(&self) -> &str {
        match self.raw.get("jsonrpc") {
            Some(Value::String(v)) => v,
            _ => "",
        }
    }

    pub fn result(&self) -> Option<&Value> {
        self.raw.get("result")
    }

    pub fn error(&self) -> Option<&Value> {
        match self.raw.get("error") {
            Some(Value::Null) | None => None,
            Some(err) => Some(err),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }
}

/// The shape handed back to the client.
///
/// Serialization emits `"error"` iff one is set, otherwise `"result"` even
/// when it is null.
#[derive(Clone, Debug, Default)]
pub struct JsonRpcForwardedResponse {
    pub id: Value,
    pub version: String,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl JsonRpcForwardedResponse {
    /// Pass-through for an upstream response that matched none of our
    /// requests. Whatever id the upstream used is kept.
    pub fn from_upstream(upstream: &UpstreamResponse) -> Self {
        let id = upstream.correlation_id();

        Self {
            id: if id.is_empty() {
                Value::Null
            } else {
                Value::String(id)
            },
            version: upstream.version().to_string(),
            result: upstream.result().cloned(),
            error: upstream.error().cloned(),
        }
    }
}

impl Serialize for JsonRpcForwardedResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("JsonRpcForwardedResponse", 3)?;

        state.serialize_field("id", &self.id)?;
        if let Some(error) = &self.error {
            state.serialize_field("error", error)?;
        } else {
            state.serialize_field("result", &self.result)?;
        }
        if self.version.is_empty() {
            state.skip_field("jsonrpc")?;
        } else {
            state.serialize_field("jsonrpc", &self.version)?;
        }

        state.end()
    }
}
