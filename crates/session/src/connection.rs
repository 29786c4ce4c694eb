//! One live transport instance bound to a session
//!
//! A `Connection` owns the WebSocket plus two pumps: a writer task draining
//! the outbound frame channel, and a reader task decoding inbound frames
//! and forwarding them to the session actor. Frames queued on the outbound
//! channel before the handshake completes are drained once the writer
//! attaches — sends are never silently dropped.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};

use gangway_protocol::{decode, decode_frame, ClientFrame, Envelope};

use crate::error::SessionError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of the transport bound to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Events flowing from connection plumbing into the session actor.
/// Every variant is stamped with the connection epoch so events from a
/// superseded connection are discarded instead of corrupting the current
/// one.
pub(crate) enum Link {
    Opened {
        epoch: u64,
        connection: Connection,
        cached: Option<String>,
    },
    OpenFailed {
        epoch: u64,
        error: SessionError,
    },
    Inbound {
        epoch: u64,
        envelope: Envelope,
    },
    /// The socket dropped (EOF, error, or server close)
    Dropped {
        epoch: u64,
    },
    /// The history grace window elapsed for this connection
    GraceElapsed {
        epoch: u64,
    },
    /// The reconnect delay elapsed; attempt to open again
    Retry {
        epoch: u64,
    },
}

pub(crate) struct Connection {
    outbound_tx: mpsc::Sender<ClientFrame>,
    /// Present until the session actor attaches the reader pump
    stream: Option<SplitStream<WsStream>>,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    /// Dial the backend and start the writer pump. The reader is not
    /// started here: the session actor attaches it once it has installed
    /// this connection, so no inbound envelope can arrive before the
    /// connection-scoped state exists.
    pub(crate) async fn establish(url: &str, epoch: u64) -> Result<Self, SessionError> {
        debug!(
            component = "connection",
            event = "connection.dial",
            epoch = epoch,
            "Opening WebSocket"
        );
        let (ws, _response) = connect_async(url).await?;
        let (sink, stream) = ws.split();

        let (outbound_tx, outbound_rx) = mpsc::channel::<ClientFrame>(256);
        tokio::spawn(writer_loop(sink, outbound_rx));

        Ok(Self {
            outbound_tx,
            stream: Some(stream),
            reader: None,
        })
    }

    /// Start the reader pump, forwarding decoded envelopes to the actor.
    pub(crate) fn start_reader(&mut self, link_tx: mpsc::Sender<Link>, epoch: u64) {
        if let Some(stream) = self.stream.take() {
            self.reader = Some(tokio::spawn(reader_loop(stream, link_tx, epoch)));
        }
    }

    /// Queue a frame for the writer. Fails only if the connection is gone.
    pub(crate) async fn send(&self, frame: ClientFrame) -> Result<(), SessionError> {
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }

    /// Close the socket and stop both pumps. Dropping the outbound sender
    /// ends the writer loop, which sends a close frame on its way out.
    pub(crate) fn shutdown(self) {
        drop(self.outbound_tx);
        if let Some(reader) = self.reader {
            reader.abort();
        }
    }
}

async fn writer_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::Receiver<ClientFrame>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                error!(
                    component = "connection",
                    event = "connection.encode_failed",
                    error = %e,
                    "Failed to encode outbound frame"
                );
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            warn!(
                component = "connection",
                event = "connection.write_failed",
                error = %e,
                "Failed to write frame"
            );
            break;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    debug!(
        component = "connection",
        event = "connection.writer_ended",
        "Writer pump ended"
    );
}

async fn reader_loop(mut stream: SplitStream<WsStream>, link_tx: mpsc::Sender<Link>, epoch: u64) {
    while let Some(message) = stream.next().await {
        let envelope = match message {
            Ok(Message::Text(text)) => decode(text.as_str()),
            Ok(Message::Binary(bytes)) => decode_frame(&bytes),
            Ok(Message::Close(_)) => break,
            // Ping/pong are answered by the protocol layer
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "connection",
                    event = "connection.read_failed",
                    error = %e,
                    "WebSocket read error"
                );
                break;
            }
        };
        if link_tx.send(Link::Inbound { epoch, envelope }).await.is_err() {
            return;
        }
    }
    let _ = link_tx.send(Link::Dropped { epoch }).await;
}
