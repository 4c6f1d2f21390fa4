//! Streaming endpoint for interactive exec.
//!
//! CRI interactive operations are two-phase: the gRPC verb registers a
//! session and returns a URL, then kubelet connects to that URL over HTTP
//! for the byte streams. This server owns the second phase, bridging the
//! upgraded connection to an ephemeral exec child.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::ShimConfig;
use crate::error::Result;
use crate::exec::{self, ExecSpec};

/// Streaming HTTP server handling kubelet connections.
pub struct StreamingServer {
    addr: SocketAddr,
    config: Arc<ShimConfig>,
    sessions: Arc<RwLock<HashMap<String, ExecSpec>>>,
}

/// Handle used by the gRPC service to register sessions.
#[derive(Clone)]
pub struct StreamingHandle {
    addr: SocketAddr,
    sessions: Arc<RwLock<HashMap<String, ExecSpec>>>,
}

impl StreamingServer {
    pub fn new(addr: SocketAddr, config: Arc<ShimConfig>) -> Self {
        StreamingServer {
            addr,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn handle(&self) -> StreamingHandle {
        StreamingHandle {
            addr: self.addr,
            sessions: self.sessions.clone(),
        }
    }

    /// Accept loop. Runs for the life of the process.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "streaming server listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let sessions = self.sessions.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, sessions, config).await {
                    warn!(peer = %peer, error = %err, "streaming connection failed");
                }
            });
        }
    }
}

impl StreamingHandle {
    /// Register an exec session; returns the URL kubelet should dial.
    /// Sessions are one-shot: the first connection consumes them.
    pub async fn register_exec(&self, spec: ExecSpec) -> String {
        let token: String = {
            let mut rng = rand::thread_rng();
            (0..16)
                .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
                .collect()
        };
        self.sessions.write().await.insert(token.clone(), spec);
        format!("http://{}/exec/{}", self.addr, token)
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    sessions: Arc<RwLock<HashMap<String, ExecSpec>>>,
    config: Arc<ShimConfig>,
) -> Result<()> {
    let mut buf = vec![0u8; 8192];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    // Request line: GET /exec/<token> HTTP/1.1
    let first_line = request.lines().next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let (_method, path) = (parts.next(), parts.next().unwrap_or(""));

    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    if segments.len() != 2 || segments[0] != "exec" {
        send_response(&mut stream, 404, "Not Found").await?;
        return Ok(());
    }

    let spec = sessions.write().await.remove(segments[1]);
    let Some(spec) = spec else {
        send_response(&mut stream, 404, "session not found or expired").await?;
        return Ok(());
    };

    info!(container = %spec.container_id, tty = spec.tty, "exec session started");

    let upgrade =
        "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: SPDY/3.1\r\n\r\n";
    stream.write_all(upgrade.as_bytes()).await?;

    exec::run(config, spec, stream).await
}

async fn send_response(stream: &mut TcpStream, status: u16, body: &str) -> std::io::Result<()> {
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
