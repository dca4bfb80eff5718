use crate::framing::LineBuffer;
use crate::transport::{CONNECT_TIMEOUT, EVENT_CHANNEL_CAPACITY, Transport, TransportEvent};
use crate::{BridgeError, JsonRpcMessage};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Transport over a plain socket: line-framed JSON both directions, same
/// shape as the child-process wire apart from how the channel is
/// established.
pub struct SocketTransport {
    url: String,
    write_half: Option<OwnedWriteHalf>,
    reader_handle: Option<tokio::task::JoinHandle<()>>,
}

impl SocketTransport {
    pub fn new(url: String) -> Self {
        Self {
            url,
            write_half: None,
            reader_handle: None,
        }
    }

    /// Accepts `tcp://host:port` or a bare `host:port` authority.
    fn socket_addr(url: &str) -> Result<&str, BridgeError> {
        let addr = url.strip_prefix("tcp://").unwrap_or(url);
        if addr.is_empty() || !addr.contains(':') {
            return Err(BridgeError::configuration(format!(
                "socket URL must name host and port: {url:?}"
            )));
        }
        Ok(addr)
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>, BridgeError> {
        let addr = Self::socket_addr(&self.url)?.to_string();

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                BridgeError::timeout(format!(
                    "no connection to {addr} within {}s",
                    CONNECT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| BridgeError::connection(format!("{addr}: {e}")))?;
        info!("Socket open: {addr}");

        let (mut read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader_handle = tokio::spawn(async move {
            let mut buffer = LineBuffer::new();
            let mut chunk = [0u8; 8192];
            loop {
                match read_half.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in buffer.push(&chunk[..n]) {
                            match JsonRpcMessage::from_line(&line) {
                                Ok(message) => {
                                    if tx.send(TransportEvent::Message(message)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => debug!("dropping malformed socket line: {e}"),
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(TransportEvent::Error(BridgeError::Io(e))).await;
                        break;
                    }
                }
            }
            let _ = tx.send(TransportEvent::Closed).await;
        });

        self.write_half = Some(write_half);
        self.reader_handle = Some(reader_handle);
        Ok(rx)
    }

    async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), BridgeError> {
        let write_half = self
            .write_half
            .as_mut()
            .ok_or_else(BridgeError::not_connected)?;
        let mut line = message.to_wire();
        line.push('\n');
        write_half
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BridgeError::transport(format!("socket write failed: {e}")))?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut write_half) = self.write_half.take() {
            let _ = write_half.shutdown().await;
        }
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::{Duration, timeout};

    #[test]
    fn test_socket_addr_parsing() {
        assert_eq!(
            SocketTransport::socket_addr("tcp://127.0.0.1:4040").unwrap(),
            "127.0.0.1:4040"
        );
        assert_eq!(
            SocketTransport::socket_addr("127.0.0.1:4040").unwrap(),
            "127.0.0.1:4040"
        );
        assert!(SocketTransport::socket_addr("tcp://nohostport").is_err());
        assert!(SocketTransport::socket_addr("").is_err());
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let mut transport = SocketTransport::new("tcp://127.0.0.1:1".to_string());
        let msg = JsonRpcMessage(json!({"jsonrpc": "2.0", "id": 1}));
        assert!(matches!(
            transport.send(&msg).await.unwrap_err(),
            BridgeError::Transport(_)
        ));
    }

    #[tokio::test]
    async fn test_roundtrip_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Echo peer: reads one line, writes one response, hangs up.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            assert!(line.contains("\"method\":\"ping\""));
            write_half
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n")
                .await
                .unwrap();
        });

        let mut transport = SocketTransport::new(format!("tcp://{addr}"));
        let mut events = transport.start().await.unwrap();

        let msg = JsonRpcMessage(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}));
        transport.send(&msg).await.unwrap();

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match event {
            TransportEvent::Message(reply) => assert_eq!(reply.0["id"], 1),
            other => panic!("expected message, got {other:?}"),
        }

        // Peer hang-up surfaces as Closed.
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert!(matches!(event, TransportEvent::Closed));

        transport.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused_is_a_start_error() {
        let mut transport = SocketTransport::new("tcp://127.0.0.1:1".to_string());
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)), "{err}");
    }
}
