//! CRI streaming server for exec, attach, and port-forward.
//!
//! Kubernetes CRI uses a two-phase protocol for interactive operations:
//! 1. gRPC call registers the session and returns a streaming URL
//! 2. Kubelet connects to the URL for bidirectional I/O
//!
//! Tokens are single-use and expire; a second connection with the same
//! token gets 404, which also rules out re-entering an exec with the same
//! stream identity. Client disconnect cancels the manager-side operation
//! so the container process does not outlive its caller.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::time::Instant;

use podlx_core::error::{Result, ShimError};
use podlx_runtime::manager::client::ExecStreams;
use podlx_runtime::manager::types::ContainerExecPost;
use podlx_runtime::manager::{ExecSession, ManagerClient};

/// How long a registered token stays redeemable.
const TOKEN_TTL: Duration = Duration::from_secs(60);

/// Grace given to an exec operation to report its exit after streams close.
const EXIT_WAIT: Duration = Duration::from_secs(5);

/// A pending streaming session registered by a CRI gRPC call.
#[derive(Debug, Clone)]
pub struct StreamingSession {
    /// Type of streaming operation.
    pub kind: SessionKind,
    /// Manager container the session targets (the infra container for
    /// attach/port-forward).
    pub container_id: String,
    /// Command to execute (exec only).
    pub cmd: Vec<String>,
    /// Whether to allocate a TTY.
    pub tty: bool,
    /// Ports to forward (port-forward only).
    pub ports: Vec<i32>,
}

/// Type of CRI streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Exec,
    Attach,
    PortForward,
}

struct PendingSession {
    session: StreamingSession,
    registered_at: Instant,
}

/// CRI streaming server that handles HTTP connections from kubelet.
pub struct StreamingServer {
    addr: SocketAddr,
    manager: ManagerClient,
    sessions: Arc<RwLock<HashMap<String, PendingSession>>>,
}

impl StreamingServer {
    pub fn new(addr: SocketAddr, manager: ManagerClient) -> Self {
        Self {
            addr,
            manager,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get a handle for registering sessions.
    pub fn handle(&self) -> StreamingHandle {
        StreamingHandle {
            addr: self.addr,
            sessions: self.sessions.clone(),
        }
    }

    /// Start the streaming HTTP server.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, "CRI streaming server listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let sessions = self.sessions.clone();
            let manager = self.manager.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, sessions, manager).await {
                    tracing::warn!(peer = %peer, error = %e, "Streaming connection failed");
                }
            });
        }
    }
}

/// Handle for registering streaming sessions from the CRI gRPC service.
#[derive(Clone)]
pub struct StreamingHandle {
    addr: SocketAddr,
    sessions: Arc<RwLock<HashMap<String, PendingSession>>>,
}

impl StreamingHandle {
    /// Register a streaming session and return the URL kubelet dials.
    pub async fn register(&self, session: StreamingSession) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let kind = match session.kind {
            SessionKind::Exec => "exec",
            SessionKind::Attach => "attach",
            SessionKind::PortForward => "portforward",
        };

        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, pending| pending.registered_at.elapsed() < TOKEN_TTL);
        sessions.insert(
            token.clone(),
            PendingSession {
                session,
                registered_at: Instant::now(),
            },
        );

        format!("http://{}/{}/{}", self.addr, kind, token)
    }

    #[cfg(test)]
    async fn pending_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    #[cfg(test)]
    async fn consume(&self, token: &str) -> Option<StreamingSession> {
        consume_token(&self.sessions, token).await
    }
}

/// Redeem a token: single-use, and dead after its TTL.
async fn consume_token(
    sessions: &RwLock<HashMap<String, PendingSession>>,
    token: &str,
) -> Option<StreamingSession> {
    let pending = sessions.write().await.remove(token)?;
    if pending.registered_at.elapsed() >= TOKEN_TTL {
        return None;
    }
    Some(pending.session)
}

async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    peer: SocketAddr,
    sessions: Arc<RwLock<HashMap<String, PendingSession>>>,
    manager: ManagerClient,
) -> Result<()> {
    // Read the request head.
    let mut buf = vec![0u8; 8192];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    // Request line: GET /exec/<token> HTTP/1.1
    let first_line = request.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 2 {
        send_response(&mut stream, 400, "Bad Request").await?;
        return Ok(());
    }

    let segments: Vec<&str> = parts[1].trim_start_matches('/').split('/').collect();
    if segments.len() != 2 {
        send_response(&mut stream, 404, "Not Found").await?;
        return Ok(());
    }
    let token = segments[1];

    let session = match consume_token(&sessions, token).await {
        Some(session) => session,
        None => {
            send_response(&mut stream, 404, "Session not found or expired").await?;
            return Ok(());
        }
    };

    tracing::info!(
        peer = %peer,
        kind = ?session.kind,
        container = %session.container_id,
        "Streaming session started"
    );

    match session.kind {
        SessionKind::Exec => {
            let exec = open_exec(&manager, &session.container_id, session.cmd.clone(), session.tty)
                .await?;
            bridge(stream, exec).await
        }
        SessionKind::Attach => {
            // Attach binds to a shell in the container's namespaces; the
            // manager has no console takeover for a foreign init process.
            let exec =
                open_exec(&manager, &session.container_id, vec!["/bin/sh".to_string()], true)
                    .await?;
            bridge(stream, exec).await
        }
        SessionKind::PortForward => {
            let port = *session.ports.first().ok_or_else(|| {
                ShimError::Invalid("port-forward session without ports".to_string())
            })?;
            let cmd = vec![
                "socat".to_string(),
                "STDIO".to_string(),
                format!("TCP:127.0.0.1:{}", port),
            ];
            let exec = open_exec(&manager, &session.container_id, cmd, false).await?;
            bridge(stream, exec).await
        }
    }
}

async fn open_exec(
    manager: &ManagerClient,
    container_id: &str,
    cmd: Vec<String>,
    tty: bool,
) -> Result<ExecSession> {
    let request = ContainerExecPost {
        command: cmd,
        environment: HashMap::new(),
        interactive: tty,
        wait_for_websocket: true,
        width: tty.then_some(80),
        height: tty.then_some(24),
    };
    manager.exec(container_id, &request).await
}

/// Multiplex bytes between the kubelet connection and the exec streams
/// until either side closes. Client disconnect cancels the manager
/// operation; otherwise the exit code is collected from its completion.
///
/// Both sockets are split into owned halves so each direction is a pair
/// of (reader, unrelated writer) and the copy loops never contend.
async fn bridge(mut stream: tokio::net::TcpStream, exec: ExecSession) -> Result<()> {
    let upgrade =
        "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: SPDY/3.1\r\n\r\n";
    stream.write_all(upgrade.as_bytes()).await?;

    let operation = exec.operation.clone();
    let (mut client_read, mut client_write) = tokio::io::split(stream);
    let mut client_closed = false;

    match exec.streams {
        ExecStreams::Interactive { console } => {
            let (mut console_read, mut console_write) = tokio::io::split(console);
            let mut client_buf = vec![0u8; 4096];
            let mut console_buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    read = client_read.read(&mut client_buf) => {
                        match read {
                            Ok(0) | Err(_) => { client_closed = true; break; }
                            Ok(n) => console_write.write_all(&client_buf[..n]).await?,
                        }
                    }
                    read = console_read.read(&mut console_buf) => {
                        match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => client_write.write_all(&console_buf[..n]).await?,
                        }
                    }
                }
            }
        }
        ExecStreams::Pipes {
            mut stdin,
            mut stdout,
            mut stderr,
        } => {
            let mut client_buf = vec![0u8; 4096];
            let mut out_buf = vec![0u8; 4096];
            let mut err_buf = vec![0u8; 4096];
            let mut out_open = true;
            let mut err_open = true;
            loop {
                tokio::select! {
                    read = client_read.read(&mut client_buf) => {
                        match read {
                            Ok(0) | Err(_) => { client_closed = true; break; }
                            Ok(n) => stdin.write_all(&client_buf[..n]).await?,
                        }
                    }
                    read = stdout.read(&mut out_buf), if out_open => {
                        match read {
                            Ok(0) | Err(_) => out_open = false,
                            Ok(n) => client_write.write_all(&out_buf[..n]).await?,
                        }
                    }
                    read = stderr.read(&mut err_buf), if err_open => {
                        match read {
                            Ok(0) | Err(_) => err_open = false,
                            Ok(n) => client_write.write_all(&err_buf[..n]).await?,
                        }
                    }
                }
                if !out_open && !err_open {
                    break;
                }
            }
        }
    }

    if client_closed {
        tracing::debug!(operation = %operation.id(), "Client disconnected, cancelling exec");
        let _ = operation.cancel().await;
        return Ok(());
    }

    match operation.wait(EXIT_WAIT).await {
        Ok(op) => {
            let code =
                podlx_runtime::manager::operation::exec_exit_code(&op.metadata).unwrap_or(-1);
            tracing::debug!(operation = %op.id, exit_code = code, "Exec completed");
        }
        Err(e) => tracing::warn!(operation = %operation.id(), error = %e, "Exec wait failed"),
    }
    Ok(())
}

/// Send a simple HTTP response.
async fn send_response(
    stream: &mut tokio::net::TcpStream,
    status: u16,
    body: &str,
) -> std::io::Result<()> {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status, status_text, body.len(), body,
    );
    stream.write_all(response.as_bytes()).await
}
