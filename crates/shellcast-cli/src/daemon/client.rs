//! Control client for a running daemon.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use shellcast_core::protocol::{Command, Request, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use crate::daemon::paths;

/// Default time to wait for a response.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for communicating with the daemon.
pub struct DaemonClient {
    stream: UnixStream,
}

impl DaemonClient {
    /// Connect to the daemon of the current instance.
    ///
    /// Unlike sessions, the daemon is never started implicitly: it owns the
    /// public WebSocket listener and must be launched deliberately.
    pub async fn connect() -> Result<Self> {
        Self::connect_to(&paths::get_socket_path(None)).await
    }

    pub async fn connect_to(socket_path: &Path) -> Result<Self> {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => {
                debug!("Connected to daemon at {:?}", socket_path);
                Ok(Self { stream })
            }
            Err(e) => Err(e).with_context(|| {
                format!(
                    "Daemon is not running (no socket at {:?}); start it with 'shellcast daemon'",
                    socket_path
                )
            }),
        }
    }

    /// Send a command under a fresh request id.
    pub async fn send(&mut self, command: Command) -> Result<Response> {
        let request = Request {
            id: Uuid::new_v4().to_string(),
            command,
        };
        self.request(request).await
    }

    /// Send a request and wait for a response.
    pub async fn request(&mut self, request: Request) -> Result<Response> {
        self.request_with_timeout(request, REQUEST_TIMEOUT).await
    }

    /// Send a request and wait for a response with a custom timeout.
    pub async fn request_with_timeout(
        &mut self,
        request: Request,
        timeout_duration: Duration,
    ) -> Result<Response> {
        let request_json =
            serde_json::to_string(&request).context("Failed to serialize request")?;
        debug!("Sending: {}", request_json);

        self.stream
            .write_all(request_json.as_bytes())
            .await
            .context("Failed to write request")?;
        self.stream
            .write_all(b"\n")
            .await
            .context("Failed to write newline")?;
        self.stream.flush().await.context("Failed to flush")?;

        let (reader, _writer) = self.stream.split();
        let mut reader = BufReader::new(reader);
        let mut response_line = String::new();

        let bytes_read = timeout(timeout_duration, reader.read_line(&mut response_line))
            .await
            .context("Request timed out")?
            .context("Failed to read response")?;

        if bytes_read == 0 {
            bail!("Daemon closed connection unexpectedly");
        }

        debug!("Received: {}", response_line.trim());

        let response: Response =
            serde_json::from_str(&response_line).context("Failed to parse response")?;
        if response.id != request.id {
            bail!(
                "Response id {} does not match request id {}",
                response.id,
                request.id
            );
        }
        Ok(response)
    }
}
