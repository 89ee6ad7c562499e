//! Daemon server: WebSocket front door plus the Unix control socket.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use shellcast_core::error::ApiError;
use shellcast_core::protocol::{Command, Request, Response, ResponseData};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::daemon::paths;
use crate::daemon::recorder::RecordCommand;
use crate::daemon::registry::{SessionRegistry, DEFAULT_MAX_SESSIONS};
use crate::daemon::relay::{self, Connection, RelayConfig, RelayContext};
use crate::daemon::websocket;

/// Maximum number of concurrent control connections.
const MAX_CONNECTIONS: usize = 100;

/// How long to wait for in-flight control connections during shutdown.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long live sessions get to tear down (interrupt, finalize recordings)
/// before they are aborted.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the daemon needs to know at startup.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Address the WebSocket listener binds to.
    pub listen: SocketAddr,
    /// Required `Origin` host for upgrades; any origin when `None`.
    pub origin_host: Option<String>,
    /// Command every driven session runs.
    pub command: Vec<String>,
    pub records_dir: PathBuf,
    pub max_sessions: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            origin_host: None,
            command: vec!["bash".to_string()],
            records_dir: PathBuf::from(paths::DEFAULT_RECORDS_DIR),
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// State shared by every WebSocket connection handler.
#[derive(Clone)]
struct FrontDoor {
    relay: RelayContext,
    command: Arc<Vec<String>>,
    origin_host: Option<Arc<str>>,
}

/// The daemon server.
pub struct DaemonServer {
    listener: UnixListener,
    ws_listener: TcpListener,
    socket_path: PathBuf,
    pid_path: PathBuf,
    front_door: FrontDoor,
    connection_semaphore: Arc<Semaphore>,
    /// Signals the run loop to exit so Drop can clean up files.
    shutdown: Arc<Notify>,
}

impl DaemonServer {
    /// Bind the control socket at the default path and the WebSocket listener.
    pub async fn bind(config: DaemonConfig) -> Result<Self> {
        let socket_path = paths::get_socket_path(None);
        let pid_path = paths::get_pid_path(None);
        Self::bind_to(socket_path, pid_path, config).await
    }

    /// Bind to a specific control socket path.
    ///
    /// Binds first and only inspects an existing socket when the bind fails:
    /// a live daemon (per its PID file) is an error, a stale socket is removed.
    pub async fn bind_to(
        socket_path: PathBuf,
        pid_path: PathBuf,
        config: DaemonConfig,
    ) -> Result<Self> {
        paths::ensure_socket_dir().context("Failed to create socket directory")?;

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create socket directory for {:?}", socket_path)
            })?;
        }

        // Written right after bind so a live socket always has a PID file.
        let write_pid = |pid_path: &PathBuf| -> Result<()> {
            std::fs::write(pid_path, std::process::id().to_string())
                .with_context(|| format!("Failed to write PID file: {:?}", pid_path))
        };

        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => {
                write_pid(&pid_path)?;
                l
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if is_daemon_alive(&pid_path) {
                    anyhow::bail!(
                        "Daemon already running (socket {:?} in use, PID file valid)",
                        socket_path
                    );
                }

                // Never follow symlinks when removing
                let metadata = std::fs::symlink_metadata(&socket_path)
                    .with_context(|| format!("Failed to stat socket path: {:?}", socket_path))?;

                if metadata.file_type().is_symlink() {
                    anyhow::bail!(
                        "Socket path {:?} is a symlink, refusing to delete for safety",
                        socket_path
                    );
                }

                #[cfg(unix)]
                {
                    use std::os::unix::fs::FileTypeExt;
                    if !metadata.file_type().is_socket() {
                        anyhow::bail!(
                            "Path {:?} exists but is not a socket file (type: {:?})",
                            socket_path,
                            metadata.file_type()
                        );
                    }
                }

                info!("Removing stale socket from dead daemon");
                std::fs::remove_file(&socket_path)
                    .with_context(|| format!("Failed to remove stale socket: {:?}", socket_path))?;

                let l = UnixListener::bind(&socket_path)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path))?;
                write_pid(&pid_path)?;
                l
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path));
            }
        };

        let ws_listener = match TcpListener::bind(config.listen).await {
            Ok(l) => l,
            Err(e) => {
                // Nobody else will clean these up
                let _ = std::fs::remove_file(&socket_path);
                let _ = std::fs::remove_file(&pid_path);
                return Err(e)
                    .with_context(|| format!("Failed to listen on {}", config.listen));
            }
        };

        info!("Control socket listening on {:?}", socket_path);

        let registry = Arc::new(SessionRegistry::new(config.max_sessions));
        let relay = RelayContext::new(registry, RelayConfig::new(config.records_dir));

        Ok(Self {
            listener,
            ws_listener,
            socket_path,
            pid_path,
            front_door: FrontDoor {
                relay,
                command: Arc::new(config.command),
                origin_host: config.origin_host.map(Arc::from),
            },
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Address the WebSocket listener is bound to.
    pub fn ws_addr(&self) -> Result<SocketAddr> {
        self.ws_listener
            .local_addr()
            .context("Failed to read WebSocket listener address")
    }

    /// Handle that stops [`run`](Self::run) when notified.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Accept control and WebSocket connections until shutdown is signaled.
    ///
    /// On shutdown, every live session is told to tear down and in-flight
    /// control connections get a bounded drain. Sessions that miss their
    /// deadline are aborted, which force-kills their processes.
    pub async fn run(&self) -> Result<()> {
        info!("Accepting WebSocket connections on {}", self.ws_addr()?);

        let mut connection_tasks: JoinSet<()> = JoinSet::new();
        let mut session_tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        "Connection limit ({}) reached, rejecting new connection",
                                        MAX_CONNECTIONS
                                    );
                                    drop(stream);
                                    continue;
                                }
                            };

                            debug!("Accepted control connection");
                            let registry = self.front_door.relay.registry.clone();
                            let shutdown = self.shutdown.clone();
                            connection_tasks.spawn(async move {
                                let _permit = permit;
                                if let Err(e) = handle_connection(stream, registry, shutdown).await {
                                    error!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                result = self.ws_listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!("Accepted TCP connection from {}", peer);
                            session_tasks.spawn(handle_websocket(stream, peer, self.front_door.clone()));
                        }
                        Err(e) => {
                            error!("WebSocket accept error: {}", e);
                        }
                    }
                }
                Some(_) = connection_tasks.join_next(), if !connection_tasks.is_empty() => {}
                Some(_) = session_tasks.join_next(), if !session_tasks.is_empty() => {}
                _ = self.shutdown.notified() => {
                    info!("Shutdown signal received, waiting for in-flight connections");
                    break;
                }
            }
        }

        self.front_door.relay.shutdown.fire();

        if !connection_tasks.is_empty() {
            info!(
                "Waiting for {} in-flight connection(s) to complete",
                connection_tasks.len()
            );

            let drained = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, async {
                while connection_tasks.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    "Graceful shutdown timed out after {:?}, aborting {} connection(s)",
                    GRACEFUL_SHUTDOWN_TIMEOUT,
                    connection_tasks.len()
                );
                connection_tasks.abort_all();
            }
        }

        if !session_tasks.is_empty() {
            info!("Closing {} live connection(s)", session_tasks.len());

            let drained = tokio::time::timeout(SESSION_DRAIN_TIMEOUT, async {
                while session_tasks.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    "Sessions did not close within {:?}, aborting {} connection(s)",
                    SESSION_DRAIN_TIMEOUT,
                    session_tasks.len()
                );
                session_tasks.abort_all();
                while session_tasks.join_next().await.is_some() {}
            }
        }

        Ok(())
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        if self.socket_path.exists() && std::fs::remove_file(&self.socket_path).is_err() {
            warn!("Failed to remove socket on shutdown");
        }
        if self.pid_path.exists() && std::fs::remove_file(&self.pid_path).is_err() {
            warn!("Failed to remove PID file on shutdown");
        }
    }
}

/// Whether the daemon named in the PID file is still running.
fn is_daemon_alive(pid_path: &Path) -> bool {
    let pid_str = match std::fs::read_to_string(pid_path) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let pid: i32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => return false,
    };

    // SAFETY: signal 0 only checks that the process exists; nothing is delivered.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Upgrade one TCP connection and hand it to the relay.
async fn handle_websocket(stream: TcpStream, peer: SocketAddr, front_door: FrontDoor) {
    let Some((route, transport)) =
        websocket::accept(stream, peer, front_door.origin_host.as_deref()).await
    else {
        return;
    };

    let outcome = relay::connect(
        &front_door.relay,
        transport,
        route.is_observer(),
        route.session(),
        &front_door.command,
    )
    .await;

    match outcome {
        Connection::Attached => {}
        Connection::Refused(e) => {
            warn!("Refused {} for session {}: {}", peer, route.session(), e);
        }
        Connection::Finished(report) => {
            info!(
                "Session {} finished: {:?}, {} observer(s) closed",
                route.session(),
                report.termination,
                report.observers_closed
            );
            if let Some(path) = report.recording {
                info!("Recording saved to {}", path.display());
            }
        }
    }
}

/// Maximum control request size in bytes.
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Read one line, failing once `max_size` bytes pass without a newline.
///
/// Returns the number of bytes read (0 means EOF).
async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut String,
    max_size: usize,
) -> Result<usize> {
    use tokio::io::AsyncBufReadExt;

    let mut total = 0;
    let mut bytes = Vec::new();

    loop {
        let available = reader
            .fill_buf()
            .await
            .context("Failed to read from client")?;

        if available.is_empty() {
            if !bytes.is_empty() {
                let line = std::str::from_utf8(&bytes).context("Invalid UTF-8 in request")?;
                buf.push_str(line);
            }
            return Ok(total);
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let bytes_to_consume = newline_pos.map(|p| p + 1).unwrap_or(available.len());

        if total + bytes_to_consume > max_size {
            anyhow::bail!("Request too large: exceeded {} byte limit", max_size);
        }

        // UTF-8 is validated once at the end; chunks may split code points
        bytes.extend_from_slice(&available[..bytes_to_consume]);
        total += bytes_to_consume;

        reader.consume(bytes_to_consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let line = std::str::from_utf8(&bytes).context("Invalid UTF-8 in request")?;
    buf.push_str(line);
    Ok(total)
}

/// Serve newline-delimited JSON requests on one control connection.
async fn handle_connection(
    stream: UnixStream,
    registry: Arc<SessionRegistry>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();

        let bytes_read = read_line_bounded(&mut reader, &mut line, MAX_REQUEST_SIZE).await?;
        if bytes_read == 0 {
            debug!("Client disconnected");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        debug!("Received: {} bytes", trimmed.len());

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => handle_request(request, &registry, &shutdown).await,
            Err(e) => Response::error(
                "unknown",
                ApiError::invalid_input_with_suggestion(
                    format!("Invalid JSON request: {}", e),
                    "Ensure the request is valid JSON with 'id' and 'command' fields. Example: {\"id\":\"1\",\"command\":{\"action\":\"list_sessions\"}}",
                ),
            ),
        };

        let response_json =
            serde_json::to_string(&response).context("Failed to serialize response")?;
        debug!("Sending: {}", response_json);

        writer
            .write_all(response_json.as_bytes())
            .await
            .context("Failed to write response")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline")?;
        writer.flush().await.context("Failed to flush")?;
    }

    Ok(())
}

async fn handle_request(
    request: Request,
    registry: &SessionRegistry,
    shutdown: &Arc<Notify>,
) -> Response {
    debug!("Handling command: {:?}", request.command);

    match request.command {
        Command::ListSessions => Response::success(
            &request.id,
            ResponseData::Sessions {
                sessions: registry.list().await,
            },
        ),

        Command::StartRecording { session } => {
            handle_recording(&request.id, registry, &session, RecordCommand::Start).await
        }

        Command::StopRecording { session } => {
            handle_recording(&request.id, registry, &session, RecordCommand::Stop).await
        }

        Command::Shutdown => handle_shutdown(&request.id, shutdown.clone()),
    }
}

/// Forward a recording command to the session's fan-out loop.
async fn handle_recording(
    request_id: &str,
    registry: &SessionRegistry,
    session: &str,
    command: RecordCommand,
) -> Response {
    if !registry.send_record_command(session, command).await {
        return Response::error(request_id, ApiError::session_not_found(session));
    }

    let message = match command {
        RecordCommand::Start => format!("Recording requested for session {}", session),
        RecordCommand::Stop => format!("Stop requested for session {}", session),
    };
    info!("{}", message);
    Response::success(request_id, ResponseData::Ok { message })
}

/// Respond first, then signal the run loop so Drop removes the socket files.
fn handle_shutdown(request_id: &str, shutdown: Arc<Notify>) -> Response {
    info!("Received shutdown command, stopping daemon");

    tokio::spawn(async move {
        // Let the response flush before the loop exits
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_one();
    });

    Response::success(
        request_id,
        ResponseData::Ok {
            message: "Daemon shutting down".to_string(),
        },
    )
}
