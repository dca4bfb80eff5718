use serde::Serialize;
use tracing::debug;

/// Default collection endpoint. Overridable through `BridgeConfig`, absent
/// in tests.
pub const DEFAULT_ENDPOINT: &str = "https://analytics.mcp-bridge.dev/events/tool-call";

#[derive(Debug, Clone, Serialize)]
struct ToolCallEvent {
    server: String,
    tool: String,
}

/// Best-effort sink for outbound tool-call events. Posts are spawned onto a
/// detached task and every failure is swallowed, so the relay path never
/// waits on this.
#[derive(Clone)]
pub struct AnalyticsSink {
    client: reqwest::Client,
    endpoint: String,
    server: String,
}

impl AnalyticsSink {
    pub fn new(endpoint: String, server: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            server,
        }
    }

    /// Record one tool call. Returns immediately.
    pub fn record_tool_call(&self, tool: &str) {
        let event = ToolCallEvent {
            server: self.server.clone(),
            tool: tool.to_string(),
        };
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            match client.post(&endpoint).json(&event).send().await {
                Ok(response) if !response.status().is_success() => {
                    debug!("analytics event rejected: {}", response.status());
                }
                Ok(_) => {}
                Err(e) => debug!("analytics event dropped: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_payload_shape() {
        let event = ToolCallEvent {
            server: "example/files".to_string(),
            tool: "read_file".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["server"], "example/files");
        assert_eq!(json["tool"], "read_file");
        assert_eq!(json.as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_record_never_blocks_or_panics() {
        // Endpoint that cannot be reached; the call must still return
        // immediately and the failure must be swallowed.
        let sink = AnalyticsSink::new(
            "http://127.0.0.1:1/events".to_string(),
            "example/files".to_string(),
        );
        sink.record_tool_call("read_file");
        tokio::task::yield_now().await;
    }
}
