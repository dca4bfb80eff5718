use crate::framing::LineBuffer;
use crate::transport::{EVENT_CHANNEL_CAPACITY, Transport, TransportEvent};
use crate::{BridgeError, JsonRpcMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Package registry mirror injected into `npx` invocations. Deployment
/// constant, not user-configurable.
const NPM_REGISTRY_MIRROR: &str = "https://registry.npmjs.org";

/// Transport that spawns a child process and treats its standard streams as
/// the wire: one JSON-RPC document per line in each direction.
pub struct StdioChildTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    config_values: HashMap<String, String>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    reader_handle: Option<tokio::task::JoinHandle<()>>,
}

impl StdioChildTransport {
    pub fn new(
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        config_values: HashMap<String, String>,
    ) -> Self {
        Self {
            command,
            args,
            env,
            config_values,
            child: None,
            stdin: None,
            reader_handle: None,
        }
    }

    /// Resolve the program and argument list actually handed to the OS.
    /// `npx` invocations get the registry mirror injected ahead of the
    /// caller's arguments; on Windows they additionally run through the
    /// system command shell.
    fn resolve_command(
        command: &str,
        args: &[String],
        windows: bool,
    ) -> (String, Vec<String>) {
        if command != "npx" {
            return (command.to_string(), args.to_vec());
        }

        let mut resolved = vec![
            "--registry".to_string(),
            NPM_REGISTRY_MIRROR.to_string(),
        ];
        resolved.extend(args.iter().cloned());

        if windows {
            let mut shell_args = vec!["/c".to_string(), "npx".to_string()];
            shell_args.extend(resolved);
            ("cmd".to_string(), shell_args)
        } else {
            ("npx".to_string(), resolved)
        }
    }

    fn build_command(&self) -> Command {
        let (program, args) = Self::resolve_command(&self.command, &self.args, cfg!(windows));
        let mut cmd = Command::new(program);
        cmd.args(args);

        // Lowest to highest precedence: inherited runtime environment, the
        // connection's declared environment, caller-supplied config values.
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        for (key, value) in &self.config_values {
            cmd.env(key, value);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::inherit());
        cmd
    }

    async fn terminate_child(child: &mut Child) {
        let pid_info = child
            .id()
            .map(|pid| format!(" (PID: {pid})"))
            .unwrap_or_default();

        if let Err(e) = child.kill().await {
            warn!("Failed to kill child process{}: {}", pid_info, e);
        }
        match child.wait().await {
            Ok(status) => info!("Child process{} exited with status: {}", pid_info, status),
            Err(e) => warn!("Error waiting for child process{} to exit: {}", pid_info, e),
        }
    }
}

#[async_trait]
impl Transport for StdioChildTransport {
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>, BridgeError> {
        let mut child = self.build_command().spawn().map_err(|e| {
            BridgeError::connection(format!("failed to spawn {}: {e}", self.command))
        })?;

        match child.id() {
            Some(pid) => info!(
                "Started child process: {} {:?}, PID: {}",
                self.command, self.args, pid
            ),
            None => warn!(
                "Started child process: {} {:?}, but PID is not available",
                self.command, self.args
            ),
        }

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::process("child stdin not piped"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::process("child stdout not piped"))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader_handle = tokio::spawn(async move {
            let mut buffer = LineBuffer::new();
            let mut chunk = [0u8; 8192];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in buffer.push(&chunk[..n]) {
                            match JsonRpcMessage::from_line(&line) {
                                Ok(message) => {
                                    // Method-not-found responses are routine
                                    // probe traffic; keep them out of the log
                                    // but forward them like anything else.
                                    if !message.is_method_not_found() {
                                        debug!("child message: {line}");
                                    }
                                    if tx.send(TransportEvent::Message(message)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(_) => debug!("skipping non-JSON child output: {line}"),
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(TransportEvent::Error(BridgeError::Io(e)))
                            .await;
                        break;
                    }
                }
            }
            let _ = tx.send(TransportEvent::Closed).await;
        });

        self.stdin = Some(stdin);
        self.child = Some(child);
        self.reader_handle = Some(reader_handle);
        Ok(rx)
    }

    async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), BridgeError> {
        let stdin = self.stdin.as_mut().ok_or_else(BridgeError::not_connected)?;
        let mut line = message.to_wire();
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BridgeError::transport(format!("child stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| BridgeError::transport(format!("child stdin flush failed: {e}")))?;
        Ok(())
    }

    async fn close(&mut self) {
        self.stdin.take();
        if let Some(mut child) = self.child.take() {
            Self::terminate_child(&mut child).await;
        }
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for StdioChildTransport {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
    }
}
