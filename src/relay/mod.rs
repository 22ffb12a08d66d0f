use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::errors::Error;
use crate::relay::protocol::{ClientFrame, PresenceEvent, ServerFrame};
use crate::token::TokenGrant;

pub mod protocol;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Sink = futures_util::stream::SplitSink<Socket, Message>;
type Stream = futures_util::stream::SplitStream<Socket>;

/// Inbound channel traffic, flattened to the one channel this session is
/// attached to.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Message {
        topic: String,
        client_id: String,
        data: serde_json::Value,
    },
    PresenceEnter {
        client_id: String,
    },
    PresenceLeave {
        client_id: String,
    },
    /// The socket dropped. No reconnect is attempted.
    Closed,
}

enum WriterCmd {
    Frame(ClientFrame),
    Shutdown,
}

/// Fire-and-forget publishing half of a relay connection. Cheap to clone;
/// all clones feed the same writer task.
#[derive(Clone)]
pub struct Publisher {
    channel: String,
    tx: mpsc::UnboundedSender<WriterCmd>,
}

impl Publisher {
    /// Broadcast a payload on a topic. No acknowledgment, no retry; a dead
    /// writer is logged and the payload dropped.
    pub fn publish<T: Serialize>(&self, topic: &str, payload: &T) {
        let data = match serde_json::to_value(payload) {
            Ok(data) => data,
            Err(err) => {
                warn!("failed to encode {topic} payload: {err}");
                return;
            }
        };
        let frame = ClientFrame::Publish {
            channel: self.channel.clone(),
            topic: topic.to_string(),
            data,
        };
        if self.tx.send(WriterCmd::Frame(frame)).is_err() {
            warn!("relay writer gone, dropping {topic} publish");
        }
    }

    /// Ask the writer task to close the socket.
    pub fn shutdown(&self) {
        let _ = self.tx.send(WriterCmd::Shutdown);
    }
}

/// An authenticated relay connection attached to one channel.
pub struct Relay {
    pub client_id: String,
    pub publisher: Publisher,
    pub events: mpsc::Receiver<RelayEvent>,
}

/// Authenticate, attach to `channel` and split the socket into a writer task
/// and a reader task. The returned client id is relay-assigned and
/// authoritative for this session.
pub async fn join(url: &str, channel: &str, grant: TokenGrant) -> Result<Relay> {
    let (ws, _) = timeout(HANDSHAKE_TIMEOUT, connect_async(url)).await??;
    let (mut sink, mut stream) = ws.split();

    send_frame(
        &mut sink,
        &ClientFrame::Auth {
            token: grant.token,
            client_id: grant.client_id,
        },
    )
    .await?;
    let client_id = match recv_frame(&mut stream).await? {
        ServerFrame::Welcome { client_id } => client_id,
        ServerFrame::Denied { reason } => return Err(Error::Denied(reason).into()),
        _ => return Err(Error::Handshake.into()),
    };

    send_frame(
        &mut sink,
        &ClientFrame::Attach {
            channel: channel.to_string(),
        },
    )
    .await?;
    match recv_frame(&mut stream).await? {
        ServerFrame::Attached { .. } => {}
        ServerFrame::Denied { reason } => return Err(Error::Denied(reason).into()),
        _ => return Err(Error::Handshake.into()),
    }
    debug!("attached to channel {channel} as {client_id}");

    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(sink, frame_rx));

    let (event_tx, event_rx) = mpsc::channel(64);
    tokio::spawn(read_loop(stream, channel.to_string(), event_tx));

    Ok(Relay {
        client_id,
        publisher: Publisher {
            channel: channel.to_string(),
            tx: frame_tx,
        },
        events: event_rx,
    })
}

async fn send_frame(sink: &mut Sink, frame: &ClientFrame) -> Result<()> {
    let data = serde_json::to_vec(frame)?;
    timeout(HANDSHAKE_TIMEOUT, sink.send(Message::binary(data))).await??;
    Ok(())
}

async fn recv_frame(stream: &mut Stream) -> Result<ServerFrame> {
    let msg = timeout(HANDSHAKE_TIMEOUT, stream.next())
        .await?
        .ok_or(Error::RelayClosed)??;
    Ok(serde_json::from_slice(&msg.into_data())?)
}

async fn write_loop(mut sink: Sink, mut frames: mpsc::UnboundedReceiver<WriterCmd>) {
    while let Some(cmd) = frames.recv().await {
        let frame = match cmd {
            WriterCmd::Frame(frame) => frame,
            WriterCmd::Shutdown => break,
        };
        let data = match serde_json::to_vec(&frame) {
            Ok(data) => data,
            Err(err) => {
                warn!("failed to encode relay frame: {err}");
                continue;
            }
        };
        if let Err(err) = sink.send(Message::binary(data)).await {
            warn!("relay send failed: {err}");
            break;
        }
    }
    let _ = sink.close().await;
    debug!("relay writer exiting");
}

async fn read_loop(mut stream: Stream, channel: String, events: mpsc::Sender<RelayEvent>) {
    loop {
        let msg = match stream.next().await {
            None => break,
            Some(Err(err)) => {
                warn!("relay recv failed: {err}");
                break;
            }
            Some(Ok(msg)) => msg,
        };
        if msg.is_close() {
            break;
        }
        if !(msg.is_binary() || msg.is_text()) {
            continue;
        }
        let frame: ServerFrame = match serde_json::from_slice(&msg.into_data()) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("malformed relay frame: {err}");
                continue;
            }
        };
        let event = match frame {
            ServerFrame::Message {
                channel: ch,
                topic,
                client_id,
                data,
            } if ch == channel => RelayEvent::Message {
                topic,
                client_id,
                data,
            },
            ServerFrame::Presence {
                channel: ch,
                event,
                client_id,
            } if ch == channel => match event {
                PresenceEvent::Enter => RelayEvent::PresenceEnter { client_id },
                PresenceEvent::Leave => RelayEvent::PresenceLeave { client_id },
            },
            other => {
                debug!("ignoring relay frame: {other:?}");
                continue;
            }
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
    let _ = events.send(RelayEvent::Closed).await;
    debug!("relay reader exiting");
}
