//! Server process adapter
//!
//! Abstracts how the language server is reached: a locally launched child
//! process wired over stdio, or an in-process pipe pair. Either way the
//! adapter hands out the two byte streams the connection runs on and exposes
//! process lifecycle (start, stop, an awaitable exit signal). Protocol-level
//! shutdown is the client's job, not the adapter's.

use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, trace, warn};

const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// The stream pair a connection runs on.
pub struct ServerStreams {
    /// Server-to-client bytes (reads come from the server)
    pub input: Box<dyn AsyncRead + Send + Sync + Unpin>,

    /// Client-to-server bytes (writes go to the server)
    pub output: Box<dyn AsyncWrite + Send + Sync + Unpin>,
}

/// Error types for server adapters
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("server not started")]
    NotStarted,

    #[error("server already started")]
    AlreadyStarted,

    #[error("server streams already taken")]
    StreamsTaken,

    #[error("stdin not available")]
    StdinNotAvailable,

    #[error("stdout not available")]
    StdoutNotAvailable,

    #[error("stderr not available")]
    StderrNotAvailable,
}

// ============================================================================
// Exit Latch
// ============================================================================

/// How the server terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerExit {
    /// Process exit code; `None` when killed by a signal or not observable.
    pub code: Option<i32>,
}

/// One-shot exit signal with multiple waiters.
///
/// Uses a watch channel so waiters that arrive after the exit still observe
/// it. Once triggered the latch stays triggered; later triggers are ignored.
#[derive(Clone)]
pub struct ExitLatch {
    state_tx: Arc<watch::Sender<Option<ServerExit>>>,
    state_rx: watch::Receiver<Option<ServerExit>>,
}

impl ExitLatch {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(None);
        Self {
            state_tx: Arc::new(state_tx),
            state_rx,
        }
    }

    /// Exit observed so far, if any.
    pub fn get(&self) -> Option<ServerExit> {
        self.state_rx.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.state_rx.borrow().is_some()
    }

    /// Wait until the server has exited.
    pub async fn wait(&self) -> ServerExit {
        let mut rx = self.state_rx.clone();
        loop {
            let current = rx.borrow().clone();
            if let Some(exit) = current {
                return exit;
            }
            if rx.changed().await.is_err() {
                // Sender gone without an exit; treat as an unobservable code.
                return ServerExit { code: None };
            }
        }
    }

    /// Record the exit (idempotent).
    pub fn trigger(&self, exit: ServerExit) {
        if self.state_rx.borrow().is_none() {
            let _ = self.state_tx.send(Some(exit));
        } else {
            trace!("exit latch already triggered, ignoring");
        }
    }
}

impl Default for ExitLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExitLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitLatch")
            .field("exited", &self.has_exited())
            .finish()
    }
}

// ============================================================================
// Adapter Trait
// ============================================================================

/// Trait for reaching a language server process
#[async_trait]
pub trait ServerAdapter: Send + Sync {
    /// Start the server.
    async fn start(&mut self) -> Result<(), AdapterError>;

    /// Terminate the server ungracefully if still running and resolve the
    /// exit latch.
    async fn stop(&mut self) -> Result<(), AdapterError>;

    /// Check if the server is currently running.
    fn is_running(&self) -> bool;

    /// Awaitable exit signal carrying the exit code.
    fn exit_latch(&self) -> ExitLatch;

    /// Take the client-side stream pair (once).
    fn take_streams(&mut self) -> Result<ServerStreams, AdapterError>;
}

// ============================================================================
// Child Process Adapter
// ============================================================================

/// Reaches the server by spawning a child process and wiring its stdio.
///
/// The environment is inherited, plus any user-specified variables. A
/// watcher task owns the `Child`, forwards its exit to the latch, and
/// services ungraceful kill requests from `stop()`.
pub struct ChildProcessServer {
    /// Command to execute
    command: String,

    /// Command arguments
    args: Vec<String>,

    /// Extra environment variables on top of the inherited environment
    env: Vec<(String, String)>,

    /// Client-side streams, available after start until taken
    streams: Option<ServerStreams>,

    /// Kill request channel into the watcher task
    kill_tx: Option<oneshot::Sender<()>>,

    /// Exit signal
    exit: ExitLatch,

    /// Stderr line handler; defaults to logging
    stderr_handler: Option<Arc<dyn Fn(String) + Send + Sync>>,

    started: bool,
}

impl ChildProcessServer {
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self {
            command,
            args,
            env: Vec::new(),
            streams: None,
            kill_tx: None,
            exit: ExitLatch::new(),
            stderr_handler: None,
            started: false,
        }
    }

    /// Add an environment variable for the spawned server.
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    /// Install a handler for server stderr lines.
    ///
    /// Only one handler is active at a time; without one, lines go to the
    /// log at debug level.
    pub fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Arc::new(handler));
    }
}

#[async_trait]
impl ServerAdapter for ChildProcessServer {
    async fn start(&mut self) -> Result<(), AdapterError> {
        if self.started {
            return Err(AdapterError::AlreadyStarted);
        }

        info!("starting server process: {} {:?}", self.command, self.args);

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (name, value) in &self.env {
            command.env(name, value);
        }

        let mut child = command.spawn()?;
        info!("server process started with PID: {:?}", child.id());

        let stdin = child.stdin.take().ok_or(AdapterError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(AdapterError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(AdapterError::StderrNotAvailable)?;

        // Stderr monitor task
        let handler = self.stderr_handler.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let content = line.trim().to_string();
                        if content.is_empty() {
                            continue;
                        }
                        match &handler {
                            Some(handler) => handler(content),
                            None => debug!("server stderr: {}", content),
                        }
                    }
                    Err(e) => {
                        error!("failed to read server stderr: {}", e);
                        break;
                    }
                }
            }
            trace!("stderr monitor finished");
        });

        // Exit watcher task: owns the child, forwards exit, services kills.
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let latch = self.exit.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => {
                        info!("server process exited with status: {}", status);
                        latch.trigger(ServerExit { code: status.code() });
                    }
                    Err(e) => {
                        error!("error waiting for server process: {}", e);
                        latch.trigger(ServerExit { code: None });
                    }
                },
                _ = &mut kill_rx => {
                    info!("killing server process");
                    if let Err(e) = child.start_kill() {
                        warn!("failed to kill server process: {}", e);
                    }
                    match child.wait().await {
                        Ok(status) => latch.trigger(ServerExit { code: status.code() }),
                        Err(e) => {
                            error!("error waiting for killed server process: {}", e);
                            latch.trigger(ServerExit { code: None });
                        }
                    }
                }
            }
        });

        self.streams = Some(ServerStreams {
            input: Box::new(stdout),
            output: Box::new(stdin),
        });
        self.kill_tx = Some(kill_tx);
        self.started = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AdapterError> {
        if !self.started {
            return Ok(());
        }
        if let Some(kill_tx) = self.kill_tx.take() {
            // Fails only if the watcher already observed the exit.
            let _ = kill_tx.send(());
        }
        self.exit.wait().await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.started && !self.exit.has_exited()
    }

    fn exit_latch(&self) -> ExitLatch {
        self.exit.clone()
    }

    fn take_streams(&mut self) -> Result<ServerStreams, AdapterError> {
        if !self.started {
            return Err(AdapterError::NotStarted);
        }
        self.streams.take().ok_or(AdapterError::StreamsTaken)
    }
}

// ============================================================================
// In-process Pipe Adapter
// ============================================================================

/// Reaches an in-process server through two anonymous pipe pairs.
///
/// One end is handed to the connection as the client streams; the matching
/// end is exposed through [`PipeServer::take_server_streams`] for the peer.
pub struct PipeServer {
    client: Option<ServerStreams>,
    server: Option<ServerStreams>,
    exit: ExitLatch,
    started: bool,
}

impl PipeServer {
    pub fn new() -> Self {
        let (client_out, server_in) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        let (server_out, client_in) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        Self {
            client: Some(ServerStreams {
                input: Box::new(client_in),
                output: Box::new(client_out),
            }),
            server: Some(ServerStreams {
                input: Box::new(server_in),
                output: Box::new(server_out),
            }),
            exit: ExitLatch::new(),
            started: false,
        }
    }

    /// Take the server-side stream pair (once).
    pub fn take_server_streams(&mut self) -> Result<ServerStreams, AdapterError> {
        self.server.take().ok_or(AdapterError::StreamsTaken)
    }
}

impl Default for PipeServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerAdapter for PipeServer {
    async fn start(&mut self) -> Result<(), AdapterError> {
        if self.started {
            return Err(AdapterError::AlreadyStarted);
        }
        self.started = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AdapterError> {
        // Dropping unclaimed ends closes the pipes.
        self.client.take();
        self.server.take();
        self.exit.trigger(ServerExit { code: None });
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.started && !self.exit.has_exited()
    }

    fn exit_latch(&self) -> ExitLatch {
        self.exit.clone()
    }

    fn take_streams(&mut self) -> Result<ServerStreams, AdapterError> {
        if !self.started {
            return Err(AdapterError::NotStarted);
        }
        self.client.take().ok_or(AdapterError::StreamsTaken)
    }
}

// ============================================================================
// Tests
// ============================================================================
