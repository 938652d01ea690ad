//! Tor control-port client
//!
//! Speaks just enough of the control protocol to request a fresh circuit:
//! AUTHENTICATE, SIGNAL NEWNYM, QUIT. One TCP connection per request, so an
//! abandoned request dies with its connection instead of leaving the port
//! in an odd state.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Errors from circuit rotation
#[derive(Error, Debug)]
pub enum RotationError {
    #[error("Rotation request timed out after {0}ms")]
    Timeout(u64),

    #[error("Control endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Control endpoint rejected request: {0}")]
    Rejected(String),
}

impl RotationError {
    /// A rejection means misconfiguration (bad password, wrong port), not a
    /// transient failure. Timeouts and connect errors are worth retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RotationError::Rejected(_))
    }
}

/// Control endpoint configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlConfig {
    /// Control port host
    pub host: String,
    /// Control port (Tor default: 9051)
    pub port: u16,
    /// Control port password (empty if the port is unauthenticated)
    pub password: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9051,
            password: String::new(),
        }
    }
}

/// The transport a [`CircuitChannel`](super::CircuitChannel) rotates through.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    /// Ask the endpoint for a new circuit. Resolves once the endpoint
    /// acknowledges; circuit establishment itself is asynchronous.
    async fn signal_newnym(&self) -> Result<(), RotationError>;
}

/// Control-port client for a real Tor daemon
pub struct TorController {
    config: ControlConfig,
}

impl TorController {
    /// Create a client for the given control endpoint
    pub fn new(config: ControlConfig) -> Self {
        Self { config }
    }

    fn quoted_password(&self) -> String {
        // Control-port quoted strings escape backslash and double quote
        let escaped = self
            .config
            .password
            .replace('\\', "\\\\")
            .replace('"', "\\\"");
        format!("\"{}\"", escaped)
    }
}

/// Read a single reply line and strip the trailing CRLF
async fn read_reply<R>(reader: &mut BufReader<R>) -> std::io::Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(line.trim_end().to_string())
}

#[async_trait]
impl ControlTransport for TorController {
    async fn signal_newnym(&self) -> Result<(), RotationError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| RotationError::Unreachable(format!("{}: {}", addr, e)))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let auth = format!("AUTHENTICATE {}\r\n", self.quoted_password());
        write_half
            .write_all(auth.as_bytes())
            .await
            .map_err(|e| RotationError::Unreachable(e.to_string()))?;

        let reply = read_reply(&mut reader)
            .await
            .map_err(|e| RotationError::Unreachable(e.to_string()))?;
        if !reply.starts_with("250") {
            return Err(RotationError::Rejected(reply));
        }

        write_half
            .write_all(b"SIGNAL NEWNYM\r\n")
            .await
            .map_err(|e| RotationError::Unreachable(e.to_string()))?;

        let reply = read_reply(&mut reader)
            .await
            .map_err(|e| RotationError::Unreachable(e.to_string()))?;
        if !reply.starts_with("250") {
            return Err(RotationError::Rejected(reply));
        }

        // Best-effort goodbye; the connection is closing either way
        let _ = write_half.write_all(b"QUIT\r\n").await;

        debug!("Control endpoint acknowledged NEWNYM");
        Ok(())
    }
}
