//! Provisioning request/response documents exchanged with the companion app

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Request message format: `{"command": <string>, "data": {...}}`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProvisionRequest {
    pub command: String,
    #[serde(default)]
    pub data: JsonValue,
}

impl ProvisionRequest {
    pub fn new(command: &str, data: JsonValue) -> Self {
        Self { command: command.to_string(), data }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Response message format
///
/// `command`, `isSuccess`, `error` and `byteReceived` are always present;
/// `data` only on a successful `GET_TOKEN`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProvisionResponse {
    pub command: String,
    #[serde(rename = "isSuccess")]
    pub is_success: bool,
    pub error: String,
    #[serde(rename = "byteReceived")]
    pub byte_received: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<TokenData>,
}

impl ProvisionResponse {
    pub fn ok(command: &str, byte_received: usize) -> Self {
        Self {
            command: command.to_string(),
            is_success: true,
            error: String::new(),
            byte_received,
            data: None,
        }
    }

    pub fn err(command: &str, byte_received: usize, msg: impl Into<String>) -> Self {
        Self {
            command: command.to_string(),
            is_success: false,
            error: msg.into(),
            byte_received,
            data: None,
        }
    }

    pub fn with_data(mut self, data: TokenData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// Endpoint set carried by `SERVER_DATA` and by the remote config document
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerData {
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub mqtt_url: Option<String>,
    pub cloud_api_url: Option<String>,
    pub config_url: Option<String>,
}

impl ServerData {
    /// Name of the first endpoint that is absent, if any
    pub fn missing_field(&self) -> Option<&'static str> {
        [
            ("authUrl", &self.auth_url),
            ("tokenUrl", &self.token_url),
            ("mqttUrl", &self.mqtt_url),
            ("cloudApiUrl", &self.cloud_api_url),
            ("configUrl", &self.config_url),
        ]
        .into_iter()
        .find(|(_, v)| v.is_none())
        .map(|(name, _)| name)
    }
}

/// Identity and pairing data returned by `GET_TOKEN`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenData {
    pub chip_id: String,
    pub mac_address: String,
    pub user_code: String,
    pub verification_uri: String,
    pub model_code: String,
    pub vendor_code: String,
    pub version_code: String,
    pub hw_code: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_uses_companion_field_names() {
        let v = serde_json::to_value(ProvisionResponse::err("CHECK_AUTH", 24, "nope")).unwrap();
        assert_eq!(
            v,
            json!({"command": "CHECK_AUTH", "isSuccess": false, "error": "nope", "byteReceived": 24})
        );
    }

    #[test]
    fn missing_server_data_field_is_named() {
        let data: ServerData = serde_json::from_value(json!({
            "authUrl": "a", "tokenUrl": "t", "mqttUrl": "m", "configUrl": "c"
        }))
        .unwrap();
        assert_eq!(data.missing_field(), Some("cloudApiUrl"));
    }

    #[test]
    fn request_without_data_defaults_to_null() {
        let req: ProvisionRequest = serde_json::from_str(r#"{"command":"GET_TOKEN"}"#).unwrap();
        assert_eq!(req.command, "GET_TOKEN");
        assert!(req.data.is_null());
    }
}
