use thiserror::Error;

/// Core error types for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Not-connected send failure, shared by every transport.
    pub fn not_connected() -> Self {
        Self::Transport("not connected".to_string())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Connection(_) | BridgeError::Transport(_) | BridgeError::Timeout(_)
        )
    }

    /// Check if this error indicates a permanent failure
    pub fn is_permanent(&self) -> bool {
        matches!(self, BridgeError::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        // Retryable errors
        assert!(BridgeError::connection("refused").is_retryable());
        assert!(BridgeError::transport("broken pipe").is_retryable());
        assert!(BridgeError::timeout("connect").is_retryable());

        // Non-retryable errors
        assert!(!BridgeError::configuration("missing url").is_retryable());
        assert!(!BridgeError::process("spawn failed").is_retryable());
        assert!(!BridgeError::protocol("bad frame").is_retryable());
    }

    #[test]
    fn test_error_permanence() {
        assert!(BridgeError::configuration("missing url").is_permanent());
        assert!(!BridgeError::connection("503").is_permanent());
    }

    #[test]
    fn test_error_display() {
        let error = BridgeError::connection("unexpected status 503");
        let display = format!("{error}");
        assert!(display.contains("Connection failed"));
        assert!(display.contains("503"));

        let display = format!("{}", BridgeError::not_connected());
        assert!(display.contains("not connected"));
    }
}
