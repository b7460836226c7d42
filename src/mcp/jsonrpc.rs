use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const VERSION: &str = "2.0";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: Value, // string or number
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcSuccess {
    pub jsonrpc: String,
    pub id: Value,
    pub result: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcErrorObj {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcError {
    pub jsonrpc: String,
    pub id: Value,
    pub error: RpcErrorObj,
}

// Variant order matters for untagged decoding: responses carry `result` or
// `error`, requests carry `method` and `id`, notifications only `method`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum RpcMessage {
    Ok(RpcSuccess),
    Err(RpcError),
    Req(RpcRequest),
    Notification(RpcNotification),
}

impl RpcMessage {
    pub fn id(&self) -> Option<&Value> {
        match self {
            RpcMessage::Ok(r) => Some(&r.id),
            RpcMessage::Err(r) => Some(&r.id),
            RpcMessage::Req(r) => Some(&r.id),
            RpcMessage::Notification(_) => None,
        }
    }
}

/// Key used to match responses to waiting callers; string ids are used as-is.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn req(method: &str, id: Value, params: Option<Value>) -> RpcRequest {
    RpcRequest {
        jsonrpc: VERSION.into(),
        id,
        method: method.into(),
        params,
    }
}

pub fn notification(method: &str, params: Option<Value>) -> RpcNotification {
    RpcNotification {
        jsonrpc: VERSION.into(),
        method: method.into(),
        params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn responses_and_notifications_decode() {
        let ok: RpcMessage = serde_json::from_value(json!({"jsonrpc": "2.0", "id": "a", "result": {"tools": []}})).unwrap();
        assert!(matches!(ok, RpcMessage::Ok(_)));
        assert_eq!(ok.id().map(id_key), Some("a".to_string()));

        let err: RpcMessage = serde_json::from_value(
            json!({"jsonrpc": "2.0", "id": 7, "error": {"code": -32601, "message": "nope"}}),
        )
        .unwrap();
        assert!(matches!(err, RpcMessage::Err(_)));
        assert_eq!(err.id().map(id_key), Some("7".to_string()));

        let note: RpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"})).unwrap();
        assert!(matches!(note, RpcMessage::Notification(_)));
        assert!(note.id().is_none());
    }
}
