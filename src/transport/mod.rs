mod socket;
mod stdio;
mod streaming;

pub use socket::SocketTransport;
pub use stdio::StdioChildTransport;
pub use streaming::StreamingHttpTransport;

use crate::{BridgeConfig, BridgeError, ConnectionConfig, JsonRpcMessage};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Time allowed for a transport to become usable before `start` gives up.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the transport event channel. The runner drains it on a single
/// select loop, so this only absorbs short bursts.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Side-effect notifications a transport emits after a successful `start`.
/// Delivered over one channel and consumed on the runner's single loop, so
/// handlers never re-enter each other.
#[derive(Debug)]
pub enum TransportEvent {
    /// One inbound JSON-RPC document.
    Message(JsonRpcMessage),
    /// The underlying channel is gone. Fires exactly once, for both
    /// self-initiated and unexpected closure.
    Closed,
    /// A non-fatal runtime fault; the channel may still close on its own
    /// later.
    Error(BridgeError),
}

/// A channel to a tool server: can be started, can send a message, can be
/// closed. At most one instance is alive per session at any instant; across
/// a reconnect a brand-new instance is constructed only after the previous
/// one reported `Closed`.
#[async_trait]
pub trait Transport: Send {
    /// Establish the channel. Resolves with the event receiver once the
    /// channel is usable; fails with a connection, timeout, or process error
    /// otherwise.
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>, BridgeError>;

    /// Relay one outbound message. Fails with a not-connected transport
    /// error before a successful `start` or after `close`.
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), BridgeError>;

    /// Tear the channel down. Idempotent; a second call is a no-op.
    async fn close(&mut self);
}

/// Factory selecting the concrete transport for a connection descriptor.
/// The runner is the only caller; tests substitute their own factory.
pub fn connect(config: &BridgeConfig) -> Box<dyn Transport> {
    match &config.connection {
        ConnectionConfig::Stdio { command, args, env } => Box::new(StdioChildTransport::new(
            command.clone(),
            args.clone(),
            env.clone(),
            config.config_values.clone(),
        )),
        ConnectionConfig::Stream { base_url } => Box::new(StreamingHttpTransport::new(
            base_url.clone(),
            config.config_values.clone(),
        )),
        ConnectionConfig::Socket { url } => Box::new(SocketTransport::new(url.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn bridge_config(connection: ConnectionConfig) -> BridgeConfig {
        BridgeConfig::builder()
            .name("example/server")
            .connection(connection)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_factory_selects_by_kind() {
        // Each variant must refuse to send before start, through the same
        // trait surface.
        let configs = [
            ConnectionConfig::Stdio {
                command: "cat".to_string(),
                args: Vec::new(),
                env: HashMap::new(),
            },
            ConnectionConfig::Stream {
                base_url: "http://127.0.0.1:1/sse".to_string(),
            },
            ConnectionConfig::Socket {
                url: "tcp://127.0.0.1:1".to_string(),
            },
        ];

        for connection in configs {
            let mut transport = connect(&bridge_config(connection));
            let msg = JsonRpcMessage(serde_json::json!({"jsonrpc": "2.0", "id": 1}));
            let err = transport.send(&msg).await.unwrap_err();
            assert!(matches!(err, BridgeError::Transport(_)), "{err}");
        }
    }
}
