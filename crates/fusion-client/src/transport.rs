//! Socket transport seam.
//!
//! A [`Transport`] opens one full-duplex text channel per publisher and
//! exposes it as a pair of unbounded channels. The production implementation
//! is [`TungsteniteTransport`]; tests substitute an in-memory one.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};

use fusion_core::{ClientId, FusionError, PublisherId, Result};

/// Close code reported when the socket ended without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Something the peer did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text frame.
    Text(String),
    /// The socket is gone. Always the last event.
    Closed {
        /// Close code (`1006` when none was received).
        code: u16,
        /// Close reason or transport error text.
        reason: String,
    },
}

/// Something we ask the socket to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutgoingFrame {
    /// Send a text frame.
    Text(String),
    /// Start the closing handshake.
    Close {
        /// Close code to send.
        code: u16,
    },
}

/// The two halves of an open socket.
#[derive(Debug)]
pub struct SocketChannels {
    /// Frames to send.
    pub outgoing: mpsc::UnboundedSender<OutgoingFrame>,
    /// Frames received, terminated by [`SocketEvent::Closed`].
    pub incoming: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens publisher sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a socket to `url`, resolving once the handshake completed.
    async fn open(&self, url: &str) -> Result<SocketChannels>;
}

/// Build the socket URL for a publisher: `uri?publisherId=..&clientId=..`.
///
/// Existing query parameters on `uri` are preserved.
pub fn socket_url(uri: &str, publisher_id: &PublisherId, client_id: &ClientId) -> Result<String> {
    let mut url = reqwest::Url::parse(uri)
        .map_err(|e| FusionError::InvalidEndpoint(format!("{uri}: {e}")))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(FusionError::InvalidEndpoint(format!(
            "{uri}: scheme must be ws or wss"
        )));
    }
    let _ = url
        .query_pairs_mut()
        .append_pair("publisherId", publisher_id)
        .append_pair("clientId", client_id);
    Ok(url.into())
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteTransport;

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn open(&self, url: &str) -> Result<SocketChannels> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| FusionError::ConnectionFailed(e.to_string()))?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        drop(tokio::spawn(socket_pump(ws, out_rx, in_tx)));

        Ok(SocketChannels {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

async fn socket_pump<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    mut out_rx: mpsc::UnboundedReceiver<OutgoingFrame>,
    in_tx: mpsc::UnboundedSender<SocketEvent>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut closing = false;

    let (code, reason) = loop {
        tokio::select! {
            frame = out_rx.recv(), if !closing => {
                let sent = match frame {
                    Some(OutgoingFrame::Text(text)) => ws_tx.send(Message::Text(text.into())).await,
                    Some(OutgoingFrame::Close { code }) => {
                        closing = true;
                        let frame = CloseFrame { code: CloseCode::from(code), reason: String::new().into() };
                        ws_tx.send(Message::Close(Some(frame))).await
                    }
                    // Owner went away without closing.
                    None => {
                        closing = true;
                        ws_tx.close().await
                    }
                };
                if let Err(e) = sent {
                    warn!(error = %e, "socket write failed");
                    break (ABNORMAL_CLOSE_CODE, e.to_string());
                }
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = in_tx.send(SocketEvent::Text(text.as_str().to_owned()));
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame.map_or((ABNORMAL_CLOSE_CODE, String::new()), |f| {
                        (u16::from(f.code), f.reason.as_str().to_owned())
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break (ABNORMAL_CLOSE_CODE, e.to_string()),
                None => break (ABNORMAL_CLOSE_CODE, String::new()),
            },
        }
    };

    debug!(code, %reason, "socket closed");
    let _ = in_tx.send(SocketEvent::Closed { code, reason });
}
