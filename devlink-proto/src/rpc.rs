//! JSON-RPC shaped payloads published on `stream/<device-id>/rpcout`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};

pub const JSONRPC_VERSION: &str = "2.0";

/// Telemetry notification: one message per channel, carrying every pending
/// parameter of that channel
///
/// `{"jsonrpc":"2.0","method":"<channel>","params":{"<param>":{"value":<n>}}}`
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub method: String,
    pub params: Vec<(String, f64)>,
}

impl TelemetryMessage {
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: method.into(), params: Vec::new() }
    }

    pub fn param(mut self, name: impl Into<String>, value: f64) -> Self {
        self.params.push((name.into(), value));
        self
    }

    pub fn to_json(&self) -> JsonValue {
        let mut params = Map::new();
        for (name, value) in &self.params {
            params.insert(name.clone(), json!({ "value": two_decimals(*value) }));
        }
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": self.method,
            "params": params,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.to_json()).unwrap_or_default()
    }
}

/// Values go out with two decimal places.
fn two_decimals(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Inbound JSON-RPC request on `command/<device-id>/rpc`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: i64,
    pub method: String,
    #[serde(default)]
    pub params: JsonValue,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Reply to an [`RpcRequest`]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcReply {
    pub jsonrpc: String,
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcReply {
    pub fn success(id: i64, result: JsonValue) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), id, result: Some(result), error: None }
    }

    pub fn error(id: i64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError { code, message: message.into() }),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}
