//! JSON-RPC 2.0 message validation and the proxy's error responses.
//!
//! The proxy passes JSON-RPC through without translating it; this module
//! only enforces the envelope (`jsonrpc: "2.0"`, string `method`, responses
//! carry `result` or `error`) and builds the error replies the proxy itself
//! originates.

use serde_json::{json, Value};

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const INTERNAL_ERROR: i32 = -32603;

/// Why a parsed value is not an acceptable JSON-RPC 2.0 message.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RpcViolation {
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("missing or wrong jsonrpc version")]
    WrongVersion,
    #[error("method is present but not a string")]
    NonStringMethod,
    #[error("message has neither method nor result/error")]
    NoMethodNoResult,
}

/// Validate the JSON-RPC 2.0 envelope of an already-parsed value.
pub fn validate(msg: &Value) -> Result<(), RpcViolation> {
    let obj = msg.as_object().ok_or(RpcViolation::NotAnObject)?;

    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(RpcViolation::WrongVersion);
    }

    match obj.get("method") {
        Some(method) => {
            if !method.is_string() {
                return Err(RpcViolation::NonStringMethod);
            }
        }
        None => {
            if !obj.contains_key("result") && !obj.contains_key("error") {
                return Err(RpcViolation::NoMethodNoResult);
            }
        }
    }

    Ok(())
}

/// The `method` field, when present.
pub fn method_of(msg: &Value) -> Option<&str> {
    msg.get("method").and_then(Value::as_str)
}

/// The `id` field, or `null` when absent. The proxy echoes this back on the
/// error responses it synthesizes.
pub fn id_of(msg: &Value) -> Value {
    msg.get("id").cloned().unwrap_or(Value::Null)
}

/// Build a JSON-RPC error response.
pub fn error_response(id: Value, code: i32, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

/// `-32700`: the frame was not valid UTF-8 JSON (or was a binary frame).
pub fn parse_error() -> Value {
    error_response(Value::Null, PARSE_ERROR, "Invalid JSON format")
}

/// `-32600`: the envelope is malformed.
pub fn invalid_request(id: Value) -> Value {
    error_response(id, INVALID_REQUEST, "Invalid JSON-RPC message")
}

/// `-32603`: a rate bucket was exhausted.
pub fn rate_limited(id: Value) -> Value {
    error_response(id, INTERNAL_ERROR, "Rate limit exceeded")
}

/// `-32603`: strict mode blocked the message.
pub fn forbidden_content(id: Value) -> Value {
    error_response(id, INTERNAL_ERROR, "Message contains forbidden content")
}

/// `-32603`: the downstream server is unavailable.
pub fn server_unavailable(id: Value) -> Value {
    error_response(id, INTERNAL_ERROR, "MCP server not connected")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_requests_notifications_and_responses() {
        let request = json!({"jsonrpc": "2.0", "method": "echo", "params": {}, "id": 1});
        let notification = json!({"jsonrpc": "2.0", "method": "notify"});
        let result = json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}});
        let error = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -1, "message": "x"}});

        for msg in [request, notification, result, error] {
            assert!(validate(&msg).is_ok(), "should accept {msg}");
        }
    }

    #[test]
    fn rejects_non_objects() {
        assert_eq!(validate(&json!([1, 2])), Err(RpcViolation::NotAnObject));
        assert_eq!(validate(&json!("hi")), Err(RpcViolation::NotAnObject));
        assert_eq!(validate(&json!(null)), Err(RpcViolation::NotAnObject));
    }

    #[test]
    fn rejects_wrong_version() {
        assert_eq!(
            validate(&json!({"method": "m"})),
            Err(RpcViolation::WrongVersion)
        );
        assert_eq!(
            validate(&json!({"jsonrpc": "1.0", "method": "m"})),
            Err(RpcViolation::WrongVersion)
        );
        assert_eq!(
            validate(&json!({"jsonrpc": 2.0, "method": "m"})),
            Err(RpcViolation::WrongVersion)
        );
    }

    #[test]
    fn rejects_non_string_method() {
        assert_eq!(
            validate(&json!({"jsonrpc": "2.0", "method": 42, "id": 1})),
            Err(RpcViolation::NonStringMethod)
        );
    }

    #[test]
    fn rejects_id_only_messages() {
        assert_eq!(
            validate(&json!({"jsonrpc": "2.0", "id": 5})),
            Err(RpcViolation::NoMethodNoResult)
        );
    }

    #[test]
    fn id_of_echoes_scalars_and_defaults_to_null() {
        assert_eq!(id_of(&json!({"id": 7})), json!(7));
        assert_eq!(id_of(&json!({"id": "abc"})), json!("abc"));
        assert_eq!(id_of(&json!({"id": null})), Value::Null);
        assert_eq!(id_of(&json!({"method": "m"})), Value::Null);
    }

    #[test]
    fn error_responses_have_the_wire_shape() {
        let resp = forbidden_content(json!(7));
        assert_eq!(
            resp,
            json!({
                "jsonrpc": "2.0",
                "id": 7,
                "error": {"code": -32603, "message": "Message contains forbidden content"}
            })
        );

        let parse = parse_error();
        assert_eq!(parse["id"], Value::Null);
        assert_eq!(parse["error"]["code"], json!(-32700));
        assert_eq!(parse["error"]["message"], json!("Invalid JSON format"));

        assert_eq!(rate_limited(json!(1))["error"]["message"], json!("Rate limit exceeded"));
        assert_eq!(
            invalid_request(json!(2))["error"]["message"],
            json!("Invalid JSON-RPC message")
        );
        assert_eq!(
            server_unavailable(json!(3))["error"]["message"],
            json!("MCP server not connected")
        );
    }
}
