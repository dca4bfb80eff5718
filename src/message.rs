use crate::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC error code a server sends when its end of the connection is gone
/// (server-specific extension; drives a reconnect).
pub const CONNECTION_CLOSED: i64 = -32000;
/// Standard JSON-RPC "method not found" code.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// One JSON-RPC document (request, response, or notification). The bridge
/// relays these opaquely; the only fields it ever inspects are `error.code`
/// and, for outbound traffic, the tool-call shape used by the analytics
/// side channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonRpcMessage(pub Value);

impl JsonRpcMessage {
    /// Parse one newline-delimited wire line.
    pub fn from_line(line: &str) -> Result<Self, BridgeError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| BridgeError::protocol(format!("invalid JSON-RPC payload: {e}")))?;
        Ok(Self(value))
    }

    /// Compact wire encoding, no trailing newline. Consumers depend on one
    /// compact object per line, so this must never pretty-print.
    pub fn to_wire(&self) -> String {
        self.0.to_string()
    }

    /// Numeric `error.code`, if the document carries an error object.
    pub fn error_code(&self) -> Option<i64> {
        self.0.get("error")?.get("code")?.as_i64()
    }

    pub fn is_method_not_found(&self) -> bool {
        self.error_code() == Some(METHOD_NOT_FOUND)
    }

    /// Name of the called tool when this is an outbound `tools/call` request.
    pub fn tool_call_name(&self) -> Option<&str> {
        if self.0.get("method")?.as_str()? != "tools/call" {
            return None;
        }
        self.0.get("params")?.get("name")?.as_str()
    }
}

/// What the runner does with an inbound message that carries an `error`
/// object. The set of codes is closed, so the trichotomy is dispatched
/// exhaustively instead of compared ad hoc at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Server reported its end closed; cycle the transport.
    Reconnect,
    /// Well-known protocol-level error; log it, keep relaying.
    Continue,
    /// Unclassified code; the session cannot be trusted to continue.
    Fatal,
}

impl ErrorDisposition {
    pub fn classify(code: i64) -> Self {
        match code {
            CONNECTION_CLOSED => Self::Reconnect,
            // parse / invalid request / method not found / invalid params / internal
            -32700 | -32600 | -32601 | -32602 | -32603 => Self::Continue,
            _ => Self::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_encoding_is_compact() {
        let msg = JsonRpcMessage(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}));
        let wire = msg.to_wire();
        assert!(!wire.contains('\n'));
        assert!(!wire.contains("  "));
        // Round-trips through the line parser untouched.
        assert_eq!(JsonRpcMessage::from_line(&wire).unwrap(), msg);
    }

    #[test]
    fn test_from_line_rejects_garbage() {
        let err = JsonRpcMessage::from_line("not json").unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
    }

    #[test]
    fn test_error_code_extraction() {
        let msg = JsonRpcMessage(json!({
            "jsonrpc": "2.0", "id": 1,
            "error": {"code": -32601, "message": "Method not found"}
        }));
        assert_eq!(msg.error_code(), Some(-32601));
        assert!(msg.is_method_not_found());

        let msg = JsonRpcMessage(json!({"jsonrpc": "2.0", "id": 1, "result": {}}));
        assert_eq!(msg.error_code(), None);
        assert!(!msg.is_method_not_found());
    }

    #[test]
    fn test_tool_call_detection() {
        let msg = JsonRpcMessage(json!({
            "jsonrpc": "2.0", "id": 7, "method": "tools/call",
            "params": {"name": "get_weather", "arguments": {"city": "Berlin"}}
        }));
        assert_eq!(msg.tool_call_name(), Some("get_weather"));

        let msg = JsonRpcMessage(json!({"jsonrpc": "2.0", "id": 8, "method": "tools/list"}));
        assert_eq!(msg.tool_call_name(), None);

        let msg = JsonRpcMessage(json!({"jsonrpc": "2.0", "id": 9, "method": "tools/call"}));
        assert_eq!(msg.tool_call_name(), None);
    }

    #[test]
    fn test_error_disposition() {
        assert_eq!(
            ErrorDisposition::classify(CONNECTION_CLOSED),
            ErrorDisposition::Reconnect
        );
        for code in [-32700, -32600, -32601, -32602, -32603] {
            assert_eq!(ErrorDisposition::classify(code), ErrorDisposition::Continue);
        }
        assert_eq!(ErrorDisposition::classify(-32099), ErrorDisposition::Fatal);
        assert_eq!(ErrorDisposition::classify(1), ErrorDisposition::Fatal);
        assert_eq!(ErrorDisposition::classify(0), ErrorDisposition::Fatal);
    }
}
