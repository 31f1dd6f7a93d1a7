//! Application command handlers, invoked through JSON-RPC on `command/<id>/rpc`

use std::collections::HashMap;

use devlink_proto::RpcReply;
use devlink_proto::rpc::RpcRequest;
use log::*;
use serde_json::Value as JsonValue;

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const HANDLER_ERROR: i64 = -32000;

/// Command handler function type
pub type CommandHandler = Box<dyn Fn(&CommandContext, JsonValue) -> Result<JsonValue, String> + Send + Sync>;

/// Context passed to command handlers
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Chip id of this device
    pub device_id: String,
    /// JSON-RPC id of the request being served
    pub request_id: i64,
}

/// Method name to handler, with reply deduplication
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, CommandHandler>,
    last_id: Option<i64>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&CommandContext, JsonValue) -> Result<JsonValue, String> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Box::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the request in `payload` and build the reply
    ///
    /// Requests with id 0 are notifications: the handler runs, nothing is
    /// returned. A redelivered id is dropped without running the handler again.
    pub fn handle(&mut self, device_id: &str, payload: &[u8]) -> Option<RpcReply> {
        let req: RpcRequest = match serde_json::from_slice(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!("Invalid rpc request: {}", e);
                return None;
            }
        };

        if req.id != 0 && self.last_id == Some(req.id) {
            debug!("Duplicate rpc id {}, ignoring", req.id);
            return None;
        }

        let ctx = CommandContext { device_id: device_id.to_string(), request_id: req.id };
        let reply = match self.handlers.get(&req.method) {
            Some(handler) => match handler(&ctx, req.params) {
                Ok(JsonValue::Null) => RpcReply::success(req.id, JsonValue::from("success")),
                Ok(result) => RpcReply::success(req.id, result),
                Err(e) => RpcReply::error(req.id, HANDLER_ERROR, e),
            },
            None => RpcReply::error(req.id, METHOD_NOT_FOUND, format!("unknown command: {}", req.method)),
        };

        if req.id == 0 {
            return None;
        }
        self.last_id = Some(req.id);
        Some(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> CommandRegistry {
        let mut r = CommandRegistry::new();
        r.register("status", |ctx, _| Ok(json!({ "id": ctx.device_id })));
        r.register("relay/set", |_, args| match args.get("on").and_then(|v| v.as_bool()) {
            Some(_) => Ok(JsonValue::Null),
            None => Err("missing on".to_string()),
        });
        r
    }

    #[test]
    fn replies_by_method() {
        let mut r = registry();
        let reply = r.handle("DEV", br#"{"id":1,"method":"status"}"#).unwrap();
        assert_eq!(reply.result, Some(json!({"id": "DEV"})));

        let reply = r.handle("DEV", br#"{"id":2,"method":"relay/set","params":{"on":true}}"#).unwrap();
        assert_eq!(reply.result, Some(json!("success")));

        let reply = r.handle("DEV", br#"{"id":3,"method":"relay/set"}"#).unwrap();
        assert_eq!(reply.error.unwrap().message, "missing on");

        let reply = r.handle("DEV", br#"{"id":4,"method":"fly"}"#).unwrap();
        assert_eq!(reply.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[test]
    fn same_id_is_answered_once() {
        let mut r = registry();
        assert!(r.handle("DEV", br#"{"id":9,"method":"status"}"#).is_some());
        assert!(r.handle("DEV", br#"{"id":9,"method":"status"}"#).is_none());
        assert!(r.handle("DEV", br#"{"method":"status"}"#).is_none());
        assert!(r.handle("DEV", b"nope").is_none());
    }
}
