//! JSON-RPC 2.0 framing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const REQUEST_TIMEOUT: i64 = -32000;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Absent id marks a notification — no response element is produced.
    #[serde(default)]
    pub id: Option<Value>,
}

impl RpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Build a success response for `id`.
pub fn response(id: Value, result: Value) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Build an error response for `id` (null when the request id is unknown).
pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    let error = RpcError {
        code,
        message: message.to_string(),
    };
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

/// Best-effort extraction of a request id from an unparsed body, for error
/// responses to malformed or timed-out requests.
pub fn id_of(body: &Value) -> Value {
    body.get("id").cloned().unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_has_no_id() {
        let req: RpcRequest =
            serde_json::from_value(serde_json::json!({ "jsonrpc": "2.0", "method": "initialized" }))
                .unwrap();
        assert!(req.is_notification());

        let req: RpcRequest = serde_json::from_value(
            serde_json::json!({ "jsonrpc": "2.0", "method": "ping", "id": 1 }),
        )
        .unwrap();
        assert!(!req.is_notification());
    }

    #[test]
    fn error_response_shape() {
        let value = error_response(Value::from(3), METHOD_NOT_FOUND, "unknown tool");
        assert_eq!(value["error"]["code"], serde_json::json!(-32601));
        assert_eq!(value["id"], serde_json::json!(3));
        assert!(value.get("result").is_none());
    }
}
