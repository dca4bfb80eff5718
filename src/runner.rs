use crate::analytics::AnalyticsSink;
use crate::framing::LineBuffer;
use crate::message::ErrorDisposition;
use crate::transport::{self, Transport, TransportEvent};
use crate::{BridgeConfig, BridgeError, JsonRpcMessage};
use rand::Rng;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Reconnect attempts after an unexpected post-ready closure, before the
/// session gives up with a non-zero exit.
pub const MAX_RETRIES: u32 = 3;

/// Time the shutdown path waits for `transport.close()` before proceeding
/// without it.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(3);

const BACKOFF_BASE_MS: u64 = 1000;
const BACKOFF_JITTER_MS: u64 = 1000;

/// Delay before reconnect attempt `attempt` (1-indexed): exponential with
/// uniform jitter, `1000·2^attempt + U(0, 1000)` ms.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS * 2u64.pow(attempt);
    let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
    Duration::from_millis(base + jitter)
}

/// Overall session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connecting,
    Ready,
    ShuttingDown,
    Closed,
}

/// What the local-input reader task reports.
enum LocalEvent {
    Message(JsonRpcMessage),
    Eof,
    Error(std::io::Error),
}

/// What to do after a transport closure has been handled.
enum AfterClosure {
    Exit(i32),
    Reconnected(mpsc::Receiver<TransportEvent>),
}

/// Builds the transport for a session. The default is
/// [`transport::connect`]; tests substitute scripted transports.
pub type TransportFactory = Box<dyn Fn(&BridgeConfig) -> Box<dyn Transport> + Send>;

/// Owns one session: exactly one live transport, the local line buffer and
/// readiness queue, the reconnect/backoff machine, and shutdown
/// coordination. Never touches process-global state; signals reach it only
/// through the token returned by [`Runner::shutdown_token`], and the exit
/// status is returned, not enacted.
pub struct Runner<R, W> {
    config: BridgeConfig,
    factory: TransportFactory,
    local_in: Option<R>,
    local_out: W,
    shutdown: CancellationToken,
    analytics: Option<AnalyticsSink>,
    state: SessionState,
    retry_count: u32,
    shutting_down: bool,
    client_initiated_close: bool,
}

impl<R, W> Runner<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(config: BridgeConfig, local_in: R, local_out: W) -> Self {
        Self::with_factory(config, Box::new(transport::connect), local_in, local_out)
    }

    pub fn with_factory(
        config: BridgeConfig,
        factory: TransportFactory,
        local_in: R,
        local_out: W,
    ) -> Self {
        let analytics = config
            .analytics_endpoint
            .clone()
            .map(|endpoint| AnalyticsSink::new(endpoint, config.name.clone()));
        Self {
            config,
            factory,
            local_in: Some(local_in),
            local_out,
            shutdown: CancellationToken::new(),
            analytics,
            state: SessionState::Init,
            retry_count: 0,
            shutting_down: false,
            client_initiated_close: false,
        }
    }

    /// The single shutdown entry point. Signal and stream-lifecycle
    /// adapters live outside the core and only ever cancel this token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Relay until the session ends; returns the process exit code. An
    /// initial connection failure is returned as the error itself so the
    /// caller can report it before exiting non-zero.
    pub async fn run(mut self) -> Result<i32, BridgeError> {
        self.config.connection.validate()?;

        // Local input is consumed from the first byte: lines are reassembled
        // and parsed immediately, but queue in the channel until the session
        // is ready, then drain in arrival order ahead of anything newer.
        let local_in = self
            .local_in
            .take()
            .ok_or_else(|| BridgeError::transport("session already consumed"))?;
        let (mut local_rx, _local_reader) = spawn_local_reader(local_in);
        let shutdown = self.shutdown.clone();

        self.state = SessionState::Connecting;
        info!(
            "Connecting to {} over {}",
            self.config.name,
            self.config.connection.kind()
        );
        let mut transport = (self.factory)(&self.config);
        let mut events = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested during connect");
                self.client_initiated_close = true;
                self.cleanup(transport.as_mut()).await;
                self.state = SessionState::Closed;
                return Ok(0);
            }
            started = transport.start() => started?,
        };
        self.state = SessionState::Ready;
        info!("Connection ready, relaying");

        let exit_code = loop {
            tokio::select! {
                _ = shutdown.cancelled(), if !self.shutting_down => {
                    info!("Shutdown requested");
                    self.client_initiated_close = true;
                    self.cleanup(transport.as_mut()).await;
                    break 0;
                }

                local = local_rx.recv(), if self.state == SessionState::Ready => {
                    match local {
                        Some(LocalEvent::Message(message)) => {
                            self.forward_outbound(transport.as_mut(), message).await;
                        }
                        Some(LocalEvent::Error(e)) => {
                            warn!("Local input failed: {e}");
                            self.client_initiated_close = true;
                            self.cleanup(transport.as_mut()).await;
                            break 0;
                        }
                        Some(LocalEvent::Eof) | None => {
                            info!("Local input closed");
                            self.client_initiated_close = true;
                            self.cleanup(transport.as_mut()).await;
                            break 0;
                        }
                    }
                }

                event = events.recv() => {
                    match event {
                        Some(TransportEvent::Message(message)) => {
                            if self.relay_inbound(&message).await.is_err() {
                                // Local output is gone; the client left.
                                self.client_initiated_close = true;
                                self.cleanup(transport.as_mut()).await;
                                break 0;
                            }
                            match message.error_code().map(ErrorDisposition::classify) {
                                None => {}
                                Some(ErrorDisposition::Continue) => {
                                    warn!(
                                        "Server reported JSON-RPC error {}; continuing",
                                        message.error_code().unwrap_or_default()
                                    );
                                }
                                Some(ErrorDisposition::Reconnect) => {
                                    info!("Server reported connection closed; cycling transport");
                                    transport.close().await;
                                }
                                Some(ErrorDisposition::Fatal) => {
                                    error!(
                                        "Unclassified JSON-RPC error code {}; terminating",
                                        message.error_code().unwrap_or_default()
                                    );
                                    self.cleanup(transport.as_mut()).await;
                                    break 1;
                                }
                            }
                        }
                        Some(TransportEvent::Error(e)) => {
                            warn!("Transport fault: {e}");
                        }
                        Some(TransportEvent::Closed) | None => {
                            match self.handle_closure(&mut transport).await {
                                AfterClosure::Exit(code) => break code,
                                AfterClosure::Reconnected(next_events) => events = next_events,
                            }
                        }
                    }
                }
            }
        };

        self.state = SessionState::Closed;
        Ok(exit_code)
    }

    /// One inbound document to local stdout: compact JSON, newline
    /// terminated.
    async fn relay_inbound(&mut self, message: &JsonRpcMessage) -> Result<(), std::io::Error> {
        let mut line = message.to_wire();
        line.push('\n');
        self.local_out.write_all(line.as_bytes()).await?;
        self.local_out.flush().await
    }

    /// One outbound document to the transport, with the analytics copy
    /// peeled off first so a slow sink can never delay the relay.
    async fn forward_outbound(&mut self, transport: &mut dyn Transport, message: JsonRpcMessage) {
        if let Some(sink) = &self.analytics
            && let Some(tool) = message.tool_call_name()
        {
            sink.record_tool_call(tool);
        }
        if let Err(e) = transport.send(&message).await {
            warn!("Failed to relay outbound message: {e}");
        }
    }

    async fn handle_closure(&mut self, transport: &mut Box<dyn Transport>) -> AfterClosure {
        if self.shutting_down || self.client_initiated_close {
            self.cleanup(transport.as_mut()).await;
            return AfterClosure::Exit(0);
        }

        if !self.config.connection.reconnects_on_close() {
            // A dead child process is final; only network streams re-dial.
            error!("Child process exited unexpectedly; shutting down");
            self.cleanup(transport.as_mut()).await;
            return AfterClosure::Exit(1);
        }

        loop {
            self.retry_count += 1;
            if self.retry_count > MAX_RETRIES {
                error!("Connection lost; giving up after {MAX_RETRIES} reconnect attempts");
                self.cleanup(transport.as_mut()).await;
                return AfterClosure::Exit(1);
            }

            let delay = backoff_delay(self.retry_count);
            warn!(
                "Connection closed unexpectedly; reconnect attempt {}/{} in {:?}",
                self.retry_count, MAX_RETRIES, delay
            );
            self.state = SessionState::Connecting;
            let shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested during reconnect");
                    self.client_initiated_close = true;
                    self.cleanup(transport.as_mut()).await;
                    return AfterClosure::Exit(0);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            // The previous transport has fully reported closure by the time
            // we get here, so at most one is ever alive.
            let mut next = (self.factory)(&self.config);
            match next.start().await {
                Ok(events) => {
                    *transport = next;
                    self.state = SessionState::Ready;
                    info!("Reconnected, relaying");
                    return AfterClosure::Reconnected(events);
                }
                Err(e) => {
                    // Counts like another closure; loop until exhausted.
                    warn!("Reconnect attempt failed: {e}");
                }
            }
        }
    }

    /// Idempotent cleanup shared by every shutdown trigger. The flag is the
    /// guard: a second trigger while cleanup is running is a no-op, so the
    /// transport is closed at most once.
    async fn cleanup(&mut self, transport: &mut dyn Transport) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.state = SessionState::ShuttingDown;
        info!("Shutting down");

        if tokio::time::timeout(CLEANUP_TIMEOUT, transport.close())
            .await
            .is_err()
        {
            warn!(
                "Transport close exceeded {}s; continuing shutdown",
                CLEANUP_TIMEOUT.as_secs()
            );
        }
    }
}

/// Reads raw local-input chunks, reassembles lines, and parses each into a
/// message. The unbounded channel is the readiness queue: the runner only
/// drains it once the session is ready, so early arrivals wait in order.
fn spawn_local_reader<R>(
    mut reader: R,
) -> (
    mpsc::UnboundedReceiver<LocalEvent>,
    tokio::task::JoinHandle<()>,
)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let mut buffer = LineBuffer::new();
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    let _ = tx.send(LocalEvent::Eof);
                    break;
                }
                Ok(n) => {
                    for line in buffer.push(&chunk[..n]) {
                        match JsonRpcMessage::from_line(&line) {
                            Ok(message) => {
                                if tx.send(LocalEvent::Message(message)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!("Dropping malformed local input line: {e}"),
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(LocalEvent::Error(e));
                    break;
                }
            }
        }
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds() {
        for attempt in 1..=MAX_RETRIES {
            let base = 1000 * 2u64.pow(attempt);
            for _ in 0..100 {
                let delay = backoff_delay(attempt).as_millis() as u64;
                assert!(delay >= base, "attempt {attempt}: {delay} < {base}");
                assert!(delay < base + 1000, "attempt {attempt}: {delay} too large");
            }
        }
    }

    #[test]
    fn test_backoff_minimums_strictly_increase() {
        // Lower bounds for the three permitted attempts: 2000, 4000, 8000 ms.
        let minimums: Vec<u64> = (1..=MAX_RETRIES).map(|n| 1000 * 2u64.pow(n)).collect();
        assert_eq!(minimums, vec![2000, 4000, 8000]);
    }
}
