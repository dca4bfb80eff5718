//! Runner bridge for MCP tool servers
//!
//! Relays newline-delimited JSON-RPC traffic between the local process's
//! standard streams and a tool server reached over a child process, a
//! streaming-HTTP event channel, or a plain socket, and manages that
//! transport's lifecycle: startup, reconnect with backoff, and coordinated
//! shutdown.

pub mod analytics;
pub mod config;
pub mod error;
pub mod framing;
pub mod message;
pub mod runner;
pub mod transport;

pub use config::{BridgeConfig, BridgeConfigBuilder, ConnectionConfig};
pub use error::BridgeError;
pub use message::{ErrorDisposition, JsonRpcMessage};
pub use runner::{MAX_RETRIES, Runner, SessionState, TransportFactory, backoff_delay};
pub use transport::{Transport, TransportEvent};
