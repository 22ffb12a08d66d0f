use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::{AudioConfig, Capture};
use crate::config::{Config, Credentials};
use crate::errors::Error;
use crate::relay::{self, Publisher, RelayEvent};
use crate::room::{Room, RoomEvent};
use crate::signal::{
    ChatEntry, ChatPayload, SENDER_SELF, SENDER_SYSTEM, SignalPayload, TOPIC_CHAT, TOPIC_SIGNAL,
};
use crate::token::{self, TokenGrant};

/// Events surfaced to the presentation layer.
#[derive(Clone, derive_more::Debug)]
pub enum SessionEvent {
    /// Relay connection status changed.
    Connected(bool),
    /// A line was appended to the chat history.
    Chat(ChatEntry),
    PeerJoined(String),
    PeerLeft(String),
    PeerState {
        client_id: String,
        state: RTCPeerConnectionState,
    },
    /// A remote audio track arrived, one per remote participant.
    #[debug("RemoteAudio")]
    RemoteAudio {
        client_id: String,
        track: Arc<TrackRemote>,
    },
}

/// One participant's end of the room: owns the relay connection, the peer
/// map, the chat history, the shared local track and the mute flag.
pub struct Session {
    username: String,
    client_id: String,
    audio: AudioConfig,
    publisher: Publisher,
    room: Room,
    roster: HashSet<String>,
    history: Vec<ChatEntry>,
    muted: Arc<AtomicBool>,
    capture: Option<Capture>,
    connected: bool,
    events: broadcast::Sender<SessionEvent>,
    stop: mpsc::UnboundedSender<()>,
}

impl Session {
    /// Resolve credentials, join the relay channel, announce ourselves and
    /// start the dispatch loop.
    pub async fn join(config: Config) -> Result<Arc<Mutex<Session>>> {
        let grant = match &config.credentials {
            Credentials::Endpoint(url) => token::fetch_grant(url).await?,
            Credentials::Static { token, client_id } => TokenGrant {
                token: token.clone(),
                client_id: client_id.clone(),
            },
        };
        let relay = relay::join(&config.relay_url, &config.channel, grant).await?;
        let relay::Relay {
            client_id,
            publisher,
            events: mut relay_events,
        } = relay;
        info!("joined {} as {client_id}", config.channel);

        let local_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                ..Default::default()
            },
            "audio".to_string(),
            config.channel.clone(),
        ));

        let (room_tx, mut room_rx) = mpsc::channel(64);
        let room = Room::new(
            client_id.clone(),
            config.ice_servers.clone(),
            local_track,
            publisher.clone(),
            room_tx,
        );

        let (stop_tx, mut stop_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(64);

        publisher.publish(
            TOPIC_CHAT,
            &ChatPayload {
                text: format!("{} joined the room", config.username),
                username: SENDER_SYSTEM.to_string(),
            },
        );

        let session = Arc::new(Mutex::new(Session {
            username: config.username,
            client_id,
            audio: config.audio,
            publisher,
            room,
            roster: HashSet::new(),
            history: Vec::new(),
            // sessions start muted; unmuting is a deliberate act
            muted: Arc::new(AtomicBool::new(true)),
            capture: None,
            connected: true,
            events: event_tx,
            stop: stop_tx,
        }));

        let dispatch = session.clone();
        tokio::spawn(async move {
            let mut relay_open = true;
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    event = relay_events.recv(), if relay_open => {
                        match event {
                            None | Some(RelayEvent::Closed) => {
                                relay_open = false;
                                dispatch.lock().await.mark_disconnected();
                            }
                            Some(event) => {
                                let mut session = dispatch.lock().await;
                                if let Err(err) = session.handle_relay_event(event).await {
                                    warn!("failed to handle relay event: {err}");
                                }
                            }
                        }
                    },
                    event = room_rx.recv() => {
                        let Some(event) = event else { break; };
                        dispatch.lock().await.handle_room_event(event).await;
                    },
                }
            }
            debug!("session dispatch loop exiting");
        });

        Ok(session)
    }

    /// Acquire the configured audio source and call every participant we
    /// know about. Fails without side effects when no input device exists.
    pub async fn connect(&mut self) -> Result<()> {
        if self.capture.is_none() {
            let track = self.room.local_track();
            let capture = Capture::start(&self.audio, track, self.muted.clone())?;
            self.capture = Some(capture);
        }
        let targets: Vec<String> = self
            .roster
            .iter()
            .filter(|id| !self.room.contains(id))
            .cloned()
            .collect();
        for remote_id in targets {
            if let Err(err) = self.room.call(&remote_id).await {
                warn!("failed to call {remote_id}: {err}");
            }
        }
        Ok(())
    }

    /// Flip the mute flag. Local only: nothing is broadcast, remote peers
    /// just stop receiving frames. Returns the new state.
    pub fn toggle_mute(&mut self) -> bool {
        let muted = !self.muted.load(Ordering::Relaxed);
        self.muted.store(muted, Ordering::Relaxed);
        muted
    }

    /// Broadcast one chat line and append it to the local history.
    pub fn send_message(&mut self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::EmptyMessage.into());
        }
        self.publisher.publish(
            TOPIC_CHAT,
            &ChatPayload {
                text: text.to_string(),
                username: self.username.clone(),
            },
        );
        self.push_history(ChatEntry {
            text: text.to_string(),
            sender: SENDER_SELF.to_string(),
        });
        Ok(())
    }

    /// Tear everything down: dispatch loop, capture, peer connections and
    /// the relay socket. Safe to call more than once.
    pub async fn stop(&mut self) {
        let _ = self.stop.send(());
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        self.room.close_all().await;
        self.publisher.shutdown();
        self.mark_disconnected();
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.as_ref().is_some_and(|c| c.is_running())
    }

    pub fn history(&self) -> Vec<ChatEntry> {
        self.history.clone()
    }

    /// Current peer connections and their native states.
    pub fn peers(&self) -> Vec<(String, RTCPeerConnectionState)> {
        self.room.peer_states()
    }

    /// Client ids currently present on the channel (excluding ourselves).
    pub fn roster(&self) -> Vec<String> {
        self.roster.iter().cloned().collect()
    }

    /// Whether the offer/answer exchange with `client_id` has completed.
    pub async fn peer_negotiated(&self, client_id: &str) -> bool {
        self.room.negotiated(client_id).await
    }

    async fn handle_relay_event(&mut self, event: RelayEvent) -> Result<()> {
        match event {
            RelayEvent::Message {
                topic,
                client_id,
                data,
            } => match topic.as_str() {
                TOPIC_CHAT => {
                    // the relay echoes our own publications; drop them so a
                    // sent line lands in history exactly once
                    if client_id == self.client_id {
                        return Ok(());
                    }
                    let chat: ChatPayload = serde_json::from_value(data)?;
                    self.push_history(ChatEntry {
                        text: chat.text,
                        sender: chat.username,
                    });
                }
                TOPIC_SIGNAL => {
                    let payload: SignalPayload = serde_json::from_value(data)?;
                    if client_id == self.client_id || payload.sender() == self.client_id {
                        // never negotiate with ourselves
                        return Ok(());
                    }
                    if payload.target() != self.client_id {
                        // addressed to another participant
                        return Ok(());
                    }
                    self.room.handle_signal(&payload).await?;
                }
                other => debug!("message on unknown topic {other}, ignoring"),
            },
            RelayEvent::PresenceEnter { client_id } => {
                if client_id != self.client_id && self.roster.insert(client_id.clone()) {
                    self.emit(SessionEvent::PeerJoined(client_id));
                }
            }
            RelayEvent::PresenceLeave { client_id } => {
                if self.roster.remove(&client_id) {
                    self.room.remove(&client_id).await;
                    self.emit(SessionEvent::PeerLeft(client_id));
                }
            }
            RelayEvent::Closed => self.mark_disconnected(),
        }
        Ok(())
    }

    async fn handle_room_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::RemoteTrack { client_id, track } => {
                debug!("remote audio track from {client_id}");
                self.emit(SessionEvent::RemoteAudio { client_id, track });
            }
            RoomEvent::State { client_id, state } => {
                use RTCPeerConnectionState::{Closed, Failed};
                if matches!(state, Failed | Closed) {
                    // presence-leave normally prunes first; this catches
                    // peers that died without the relay noticing
                    self.room.remove(&client_id).await;
                }
                self.emit(SessionEvent::PeerState { client_id, state });
            }
        }
    }

    fn push_history(&mut self, entry: ChatEntry) {
        self.history.push(entry.clone());
        self.emit(SessionEvent::Chat(entry));
    }

    fn mark_disconnected(&mut self) {
        if self.connected {
            self.connected = false;
            self.emit(SessionEvent::Connected(false));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
