//! WebSocket transport
//!
//! A [`Connection`] is one duplex text-frame channel. It splits into a sending
//! half, driven by the session's writer task, and a receiving half, driven by
//! its receive loop. Closure is signalled by `receive()` returning `None`,
//! never by an error.

use std::future::Future;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    accept_hdr_async_with_config, connect_async_with_config,
    tungstenite::{
        self,
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
        Message as WsMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

/// OCPP 2.0.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

/// Errors raised while establishing or writing to a connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
}

/// Sending half of a connection
pub trait FrameSender: Send + 'static {
    /// Write one complete frame
    fn send(&mut self, frame: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the connection; later sends fail
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Receiving half of a connection
pub trait FrameReceiver: Send + 'static {
    /// Next text frame, or `None` once the connection is gone
    fn receive(&mut self) -> impl Future<Output = Option<String>> + Send;
}

/// A duplex frame connection
pub trait Connection: Send + 'static {
    type Sender: FrameSender;
    type Receiver: FrameReceiver;

    fn split(self) -> (Self::Sender, Self::Receiver);
}

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(64 * 1024),
        max_frame_size: Some(16 * 1024),
        ..Default::default()
    }
}

// ============================================================================
// tokio-tungstenite
// ============================================================================

/// Connection over a tokio-tungstenite WebSocket stream
pub struct WsConnection<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsConnection<S> {
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

pub struct WsSender<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
}

pub struct WsReceiver<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> Connection for WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Sender = WsSender<S>;
    type Receiver = WsReceiver<S>;

    fn split(self) -> (Self::Sender, Self::Receiver) {
        let (sink, stream) = self.stream.split();
        (WsSender { sink }, WsReceiver { stream })
    }
}

impl<S> FrameSender for WsSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.sink.send(WsMessage::Text(frame.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!("WebSocket close: {}", e);
        }
    }
}

impl<S> FrameReceiver for WsReceiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn receive(&mut self) -> Option<String> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Some(text.to_string()),
                Some(Ok(WsMessage::Binary(data))) => {
                    warn!("Ignoring {} byte binary frame", data.len());
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!("WebSocket closed by peer: {:?}", frame);
                    return None;
                }
                // Pongs are queued by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    return None;
                }
                None => return None,
            }
        }
    }
}

/// Client-side connection as produced by [`connect`]
pub type ClientConnection = WsConnection<MaybeTlsStream<TcpStream>>;

/// Open a WebSocket to `url`, offering `subprotocol`
pub async fn connect(url: &str, subprotocol: &str) -> Result<ClientConnection, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
    let protocol = HeaderValue::from_str(subprotocol)
        .map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
    request
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);

    let (stream, response) = connect_async_with_config(request, Some(ws_config()), false).await?;

    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());

    if accepted != Some(subprotocol) {
        warn!(
            "Server did not accept subprotocol {}, got: {:?}",
            subprotocol, accepted
        );
    }

    info!("WebSocket connected to {}", url);
    Ok(WsConnection::new(stream))
}

/// An inbound connection after a successful handshake
pub struct Accepted<S> {
    pub connection: WsConnection<S>,
    /// Request path without slashes, the charge point id
    pub path: String,
}

/// Run the server side of the handshake on an accepted TCP stream.
///
/// Clients that do not offer `subprotocol` are refused with 400.
pub async fn accept<S>(stream: S, subprotocol: &str) -> Result<Accepted<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut path = String::new();

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().path().trim_matches('/').to_string();

        let offered = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());

        match offered {
            Some(list) if list.split(',').any(|p| p.trim() == subprotocol) => {
                let value = HeaderValue::from_str(subprotocol)
                    .map_err(|_| reject("unsupported subprotocol"))?;
                response
                    .headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                Ok(response)
            }
            Some(list) => {
                warn!(
                    "Protocols mismatched, expected {} but client offers {}",
                    subprotocol, list
                );
                Err(reject("unsupported subprotocol"))
            }
            None => {
                warn!("Client did not request any subprotocol");
                Err(reject("missing subprotocol"))
            }
        }
    };

    let stream = accept_hdr_async_with_config(stream, callback, Some(ws_config())).await?;
    debug!("Accepted WebSocket for path /{}", path);

    Ok(Accepted {
        connection: WsConnection::new(stream),
        path,
    })
}

fn reject(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

// ============================================================================
// In-process
// ============================================================================

/// In-process connections over tokio channels
pub mod memory {
    use tokio::sync::mpsc;

    use super::{Connection, FrameReceiver, FrameSender, TransportError};

    const CAPACITY: usize = 64;

    pub struct MemoryConnection {
        tx: mpsc::Sender<String>,
        rx: mpsc::Receiver<String>,
    }

    pub struct MemorySender {
        tx: Option<mpsc::Sender<String>>,
    }

    pub struct MemoryReceiver {
        rx: mpsc::Receiver<String>,
    }

    /// Two connected ends; what one sends the other receives
    pub fn pair() -> (MemoryConnection, MemoryConnection) {
        let (a_tx, b_rx) = mpsc::channel(CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(CAPACITY);

        (
            MemoryConnection { tx: a_tx, rx: a_rx },
            MemoryConnection { tx: b_tx, rx: b_rx },
        )
    }

    impl Connection for MemoryConnection {
        type Sender = MemorySender;
        type Receiver = MemoryReceiver;

        fn split(self) -> (Self::Sender, Self::Receiver) {
            (MemorySender { tx: Some(self.tx) }, MemoryReceiver { rx: self.rx })
        }
    }

    impl FrameSender for MemorySender {
        async fn send(&mut self, frame: String) -> Result<(), TransportError> {
            let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
            tx.send(frame).await.map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) {
            self.tx = None;
        }
    }

    impl FrameReceiver for MemoryReceiver {
        async fn receive(&mut self) -> Option<String> {
            self.rx.recv().await
        }
    }
}
