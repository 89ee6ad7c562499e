//! WebSocket front door using tokio-tungstenite.
//!
//! Accepts upgrades on `/ws_new/<id>` (driver) and `/ws_view/<id>`
//! (observer), enforces the origin policy during the handshake, and adapts
//! the resulting stream to the [`FrameSink`]/[`FrameSource`] traits.

use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::daemon::paths::is_valid_name;
use crate::daemon::transport::{FrameSink, FrameSource, Inbound, Transport, TransportError};

/// Largest message accepted from a peer.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// What an upgrade request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Create and drive a new session.
    Driver(String),
    /// Watch an existing session.
    Observer(String),
}

impl Route {
    pub fn session(&self) -> &str {
        match self {
            Route::Driver(id) | Route::Observer(id) => id,
        }
    }

    pub fn is_observer(&self) -> bool {
        matches!(self, Route::Observer(_))
    }
}

/// Map a request path to a route. Query strings are ignored.
pub fn parse_route(path: &str) -> Option<Route> {
    let path = path.split('?').next().unwrap_or(path);

    if let Some(id) = path.strip_prefix("/ws_new/") {
        is_valid_name(id).then(|| Route::Driver(id.to_string()))
    } else if let Some(id) = path.strip_prefix("/ws_view/") {
        is_valid_name(id).then(|| Route::Observer(id.to_string()))
    } else {
        None
    }
}

/// Origin predicate applied before a connection is accepted.
///
/// With no expected host every origin is accepted. Otherwise the `Origin`
/// header must be present and name that host (with or without a port).
pub fn origin_allowed(origin: Option<&str>, expected_host: Option<&str>) -> bool {
    let Some(expected) = expected_host else {
        return true;
    };
    let Some(origin) = origin else {
        return false;
    };

    let authority = origin
        .split_once("://")
        .map_or(origin, |(_, rest)| rest)
        .split('/')
        .next()
        .unwrap_or_default();
    let host = authority
        .rsplit_once(':')
        .map_or(authority, |(host, _)| host);

    authority.eq_ignore_ascii_case(expected) || host.eq_ignore_ascii_case(expected)
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Complete the WebSocket handshake on an accepted TCP connection.
///
/// Returns the route and a transport, or `None` when the request was
/// refused (bad route, bad origin) or the handshake failed.
pub async fn accept(
    stream: TcpStream,
    peer: SocketAddr,
    origin_host: Option<&str>,
) -> Option<(Route, Transport)> {
    let mut route = None;
    let callback = |request: &Request, response: Response| {
        let origin = request
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok());
        if !origin_allowed(origin, origin_host) {
            warn!("Rejected connection from {} with origin {:?}", peer, origin);
            return Err(reject(StatusCode::FORBIDDEN, "Origin not allowed"));
        }

        match parse_route(request.uri().path()) {
            Some(parsed) => {
                route = Some(parsed);
                Ok(response)
            }
            None => {
                debug!("No route for {} from {}", request.uri().path(), peer);
                Err(reject(StatusCode::NOT_FOUND, "Not found"))
            }
        }
    };

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_MESSAGE_SIZE);

    let ws = match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config))
        .await
    {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {} failed: {}", peer, e);
            return None;
        }
    };

    let route = route?;
    debug!("Accepted {:?} from {}", route, peer);
    Some((route, into_transport(ws, peer.to_string())))
}

/// Split a WebSocket stream into a [`Transport`].
pub fn into_transport<S>(ws: WebSocketStream<S>, peer: String) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = ws.split();
    Transport::new(peer, Box::new(WsSink { sink }), Box::new(WsSource { source }))
}

struct WsSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

fn protocol_error(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        other => TransportError::Protocol(other.to_string()),
    }
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(protocol_error)
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(protocol_error)
    }

    async fn send_close(&mut self, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(protocol_error)
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!("WebSocket close: {}", e);
        }
    }
}

struct WsSource<S> {
    source: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            let payload = match self.source.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Pong(_))) => return Ok(Some(Inbound::Pong)),
                // tungstenite queues the pong reply itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => return Err(protocol_error(e)),
            };

            if payload.len() > MAX_MESSAGE_SIZE {
                return Err(TransportError::Oversized {
                    size: payload.len(),
                    limit: MAX_MESSAGE_SIZE,
                });
            }
            return Ok(Some(Inbound::Data(payload)));
        }
    }
}
