use crate::transport::{CONNECT_TIMEOUT, EVENT_CHANNEL_CAPACITY, Transport, TransportEvent};
use crate::{BridgeError, JsonRpcMessage};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reassembles Server-Sent-Events frames from an arbitrarily chunked byte
/// stream. Frames are delimited by a blank line; only the `data` field is
/// consumed, and a frame without a non-empty `data` field yields nothing.
#[derive(Debug, Default)]
struct SseFrameBuffer {
    residual: String,
}

impl SseFrameBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.residual.push_str(&String::from_utf8_lossy(chunk));

        let mut payloads = Vec::new();
        while let Some(pos) = self.residual.find("\n\n") {
            let frame: String = self.residual.drain(..pos + 2).collect();
            if let Some(data) = Self::extract_data(&frame) {
                payloads.push(data);
            }
        }
        payloads
    }

    fn extract_data(frame: &str) -> Option<String> {
        let mut parts = Vec::new();
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                parts.push(rest.trim());
            }
        }
        let data = parts.join("\n");
        let data = data.trim();
        if data.is_empty() {
            None
        } else {
            Some(data.to_string())
        }
    }
}

/// Transport that holds a long-lived event-stream response open for inbound
/// messages and issues one POST per outbound message against the same base
/// URL.
pub struct StreamingHttpTransport {
    base_url: String,
    config_values: HashMap<String, String>,
    client: reqwest::Client,
    cancel: CancellationToken,
    reader_handle: Option<tokio::task::JoinHandle<()>>,
    connected: bool,
}

impl StreamingHttpTransport {
    pub fn new(base_url: String, config_values: HashMap<String, String>) -> Self {
        Self {
            base_url: Self::normalize_url(&base_url),
            config_values,
            client: reqwest::Client::new(),
            cancel: CancellationToken::new(),
            reader_handle: None,
            connected: false,
        }
    }

    /// Strip trailing separators so path joins never double up.
    fn normalize_url(url: &str) -> String {
        url.trim_end_matches('/').to_string()
    }

    /// Caller-supplied config values ride along as a connection parameter.
    fn config_query(&self) -> Option<(&'static str, String)> {
        if self.config_values.is_empty() {
            return None;
        }
        serde_json::to_string(&self.config_values)
            .ok()
            .map(|json| ("config", json))
    }
}

#[async_trait]
impl Transport for StreamingHttpTransport {
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>, BridgeError> {
        let mut request = self
            .client
            .get(&self.base_url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(query) = self.config_query() {
            request = request.query(&[query]);
        }

        let response = tokio::time::timeout(CONNECT_TIMEOUT, request.send())
            .await
            .map_err(|_| {
                BridgeError::timeout(format!(
                    "no response from {} within {}s",
                    self.base_url,
                    CONNECT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| BridgeError::connection(format!("{}: {e}", self.base_url)))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(BridgeError::connection(format!(
                "unexpected status {status} from {}",
                self.base_url
            )));
        }
        info!("Event stream open: {}", self.base_url);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = self.cancel.clone();
        let mut byte_stream = response.bytes_stream();
        let reader_handle = tokio::spawn(async move {
            let mut buffer = SseFrameBuffer::default();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = byte_stream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            for payload in buffer.push(&bytes) {
                                match JsonRpcMessage::from_line(&payload) {
                                    Ok(message) => {
                                        if tx.send(TransportEvent::Message(message)).await.is_err() {
                                            return;
                                        }
                                    }
                                    // Malformed frame: drop, keep the stream.
                                    Err(e) => debug!("dropping malformed event frame: {e}"),
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!("Event stream read failed: {e}");
                            break;
                        }
                        None => break,
                    },
                }
            }
            let _ = tx.send(TransportEvent::Closed).await;
        });

        self.reader_handle = Some(reader_handle);
        self.connected = true;
        Ok(rx)
    }

    async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), BridgeError> {
        if !self.connected {
            return Err(BridgeError::not_connected());
        }

        let mut request = self.client.post(&self.base_url).json(&message.0);
        if let Some(query) = self.config_query() {
            request = request.query(&[query]);
        }

        // POST failures are send failures for this one message, never a
        // transport closure.
        let response = request
            .send()
            .await
            .map_err(|e| BridgeError::transport(format!("message post failed: {e}")))?;
        if !response.status().is_success() {
            return Err(BridgeError::transport(format!(
                "message post rejected with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.connected = false;
        self.cancel.cancel();
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for StreamingHttpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_normalization() {
        assert_eq!(
            StreamingHttpTransport::normalize_url("https://tools.example.com/sse/"),
            "https://tools.example.com/sse"
        );
        assert_eq!(
            StreamingHttpTransport::normalize_url("https://tools.example.com/sse"),
            "https://tools.example.com/sse"
        );
    }

    #[test]
    fn test_frame_data_extraction() {
        let mut buf = SseFrameBuffer::default();
        let payloads = buf.push(b"data: {\"jsonrpc\":\"2.0\",\"id\":1}\n\n");
        assert_eq!(payloads, vec!["{\"jsonrpc\":\"2.0\",\"id\":1}"]);
        assert!(buf.residual.is_empty());
    }

    #[test]
    fn test_frame_without_data_is_dropped() {
        let mut buf = SseFrameBuffer::default();
        assert!(buf.push(b": keep-alive\n\n").is_empty());
        assert!(buf.push(b"event: ping\n\n").is_empty());
        assert!(buf.push(b"data:\n\n").is_empty());
    }

    #[test]
    fn test_frame_spanning_chunks() {
        let mut buf = SseFrameBuffer::default();
        assert!(buf.push(b"data: {\"jsonrpc\":\"2.0\",").is_empty());
        assert!(buf.push(b"\"id\":7}\n").is_empty());
        let payloads = buf.push(b"\n");
        assert_eq!(payloads, vec!["{\"jsonrpc\":\"2.0\",\"id\":7}"]);
    }

    #[test]
    fn test_chunking_is_invisible() {
        let input: &[u8] = b"data: {\"id\":1}\n\nevent: ping\n\ndata: {\"id\":2}\n\n";

        let mut whole = SseFrameBuffer::default();
        let expected = whole.push(input);
        assert_eq!(expected, vec!["{\"id\":1}", "{\"id\":2}"]);

        for split in 0..input.len() {
            let mut buf = SseFrameBuffer::default();
            let mut payloads = buf.push(&input[..split]);
            payloads.extend(buf.push(&input[split..]));
            assert_eq!(payloads, expected, "split at {split}");
        }
    }

    #[test]
    fn test_multi_line_data_joined() {
        let mut buf = SseFrameBuffer::default();
        let payloads = buf.push(b"data: first\ndata: second\n\n");
        assert_eq!(payloads, vec!["first\nsecond"]);
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let mut transport =
            StreamingHttpTransport::new("http://127.0.0.1:1/sse".to_string(), HashMap::new());
        let msg = JsonRpcMessage(serde_json::json!({"jsonrpc": "2.0", "id": 1}));
        assert!(matches!(
            transport.send(&msg).await.unwrap_err(),
            BridgeError::Transport(_)
        ));
    }

    #[tokio::test]
    async fn test_connection_refused_is_a_start_error() {
        // Port 1 on loopback is never listening in the test environment.
        let mut transport =
            StreamingHttpTransport::new("http://127.0.0.1:1/sse".to_string(), HashMap::new());
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)), "{err}");
    }
}
