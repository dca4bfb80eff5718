use crate::BridgeError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resolved connection descriptor for one tool server. Produced by the
/// registry resolver, deserialized here, and immutable for the life of a
/// session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConnectionConfig {
    /// Spawn a child process and use its standard streams as the wire.
    #[serde(rename_all = "camelCase")]
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Long-lived event stream for inbound traffic, one POST per outbound
    /// message.
    #[serde(rename_all = "camelCase")]
    Stream { base_url: String },
    /// Line-framed JSON over a plain socket.
    #[serde(rename_all = "camelCase")]
    Socket { url: String },
}

impl ConnectionConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionConfig::Stdio { .. } => "stdio",
            ConnectionConfig::Stream { .. } => "stream",
            ConnectionConfig::Socket { .. } => "socket",
        }
    }

    /// Whether an unexpected post-ready closure of this connection is
    /// retried. A dead child process is final; a dropped network stream is
    /// re-dialed.
    pub fn reconnects_on_close(&self) -> bool {
        match self {
            ConnectionConfig::Stdio { .. } => false,
            ConnectionConfig::Stream { .. } | ConnectionConfig::Socket { .. } => true,
        }
    }

    /// Reject descriptors the resolver should never have produced.
    pub fn validate(&self) -> Result<(), BridgeError> {
        match self {
            ConnectionConfig::Stdio { command, .. } if command.is_empty() => Err(
                BridgeError::configuration("stdio connection is missing a command"),
            ),
            ConnectionConfig::Stream { base_url } if base_url.is_empty() => Err(
                BridgeError::configuration("stream connection is missing a deployment URL"),
            ),
            ConnectionConfig::Socket { url } if url.is_empty() => Err(
                BridgeError::configuration("socket connection is missing a URL"),
            ),
            _ => Ok(()),
        }
    }
}

/// Everything one bridge session needs: the server's qualified name, its
/// resolved connection, and the caller-supplied configuration values that
/// get layered into the child environment or the outbound connection
/// parameters.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct BridgeConfig {
    pub name: String,
    pub connection: ConnectionConfig,
    #[builder(default)]
    #[builder(setter(custom))]
    pub config_values: HashMap<String, String>,
    #[builder(default)]
    pub analytics_endpoint: Option<String>,
}

impl BridgeConfig {
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }
}

impl BridgeConfigBuilder {
    pub fn config_value<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.config_values.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn config_values_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(
        &mut self,
        iter: I,
    ) -> &mut Self {
        let map = self.config_values.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            map.insert(key.to_string(), value.to_string());
        }
        self
    }
}
