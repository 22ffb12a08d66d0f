use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::relay::Publisher;
use crate::room::conn::PeerConn;
use crate::signal::{SignalPayload, TOPIC_SIGNAL};

pub mod conn;

/// Notifications from per-connection background tasks, consumed by the
/// session dispatch loop.
#[derive(derive_more::Debug)]
pub enum RoomEvent {
    #[debug("RemoteTrack")]
    RemoteTrack {
        client_id: String,
        track: Arc<TrackRemote>,
    },
    State {
        client_id: String,
        state: RTCPeerConnectionState,
    },
}

/// Keeps at most one peer connection per remote client id and routes
/// signaling payloads to them. Sender/target filtering happens before
/// payloads get here.
pub struct Room {
    client_id: String,
    ice_servers: Vec<RTCIceServer>,
    local_track: Arc<TrackLocalStaticSample>,
    publisher: Publisher,
    peers: HashMap<String, PeerConn>,
    events: mpsc::Sender<RoomEvent>,
}

impl Room {
    pub fn new(
        client_id: String,
        ice_servers: Vec<RTCIceServer>,
        local_track: Arc<TrackLocalStaticSample>,
        publisher: Publisher,
        events: mpsc::Sender<RoomEvent>,
    ) -> Self {
        Room {
            client_id,
            ice_servers,
            local_track,
            publisher,
            peers: HashMap::new(),
            events,
        }
    }

    pub fn local_track(&self) -> Arc<TrackLocalStaticSample> {
        self.local_track.clone()
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.peers.contains_key(remote_id)
    }

    pub fn peer_states(&self) -> Vec<(String, RTCPeerConnectionState)> {
        self.peers
            .iter()
            .map(|(id, conn)| (id.clone(), conn.state()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Whether the connection to `remote_id` has a remote description
    /// applied, i.e. the offer/answer exchange completed.
    pub async fn negotiated(&self, remote_id: &str) -> bool {
        match self.peers.get(remote_id) {
            Some(conn) => conn.has_remote_description().await,
            None => false,
        }
    }

    /// Handle one signaling payload addressed to this client.
    pub async fn handle_signal(&mut self, payload: &SignalPayload) -> Result<()> {
        match payload {
            SignalPayload::Offer {
                sdp,
                sender_client_id,
                ..
            } => {
                let answer = {
                    let conn = self.ensure_peer(sender_client_id).await?;
                    conn.answer(sdp).await?
                };
                self.publisher.publish(
                    TOPIC_SIGNAL,
                    &SignalPayload::Answer {
                        sdp: answer,
                        sender_client_id: self.client_id.clone(),
                        target_client_id: sender_client_id.clone(),
                    },
                );
            }
            SignalPayload::Answer {
                sdp,
                sender_client_id,
                ..
            } => {
                let Some(conn) = self.peers.get(sender_client_id) else {
                    warn!("answer from unknown client {sender_client_id}, ignoring");
                    return Ok(());
                };
                conn.answered(sdp).await?;
            }
            SignalPayload::Candidate {
                candidate,
                sender_client_id,
                ..
            } => {
                let Some(conn) = self.peers.get(sender_client_id) else {
                    warn!("candidate from unknown client {sender_client_id}, ignoring");
                    return Ok(());
                };
                conn.add_ice_candidate(candidate.clone()).await?;
            }
        }
        Ok(())
    }

    /// Start an outbound call: create the connection and publish the offer.
    /// A remote id that already has a connection is left alone.
    pub async fn call(&mut self, remote_id: &str) -> Result<()> {
        if self.peers.contains_key(remote_id) {
            return Ok(());
        }
        let offer = {
            let conn = self.ensure_peer(remote_id).await?;
            conn.offer().await?
        };
        self.publisher.publish(
            TOPIC_SIGNAL,
            &SignalPayload::Offer {
                sdp: offer,
                sender_client_id: self.client_id.clone(),
                target_client_id: remote_id.to_string(),
            },
        );
        Ok(())
    }

    /// Drop and close the connection for a departed peer.
    pub async fn remove(&mut self, remote_id: &str) {
        if let Some(conn) = self.peers.remove(remote_id) {
            debug!("removing peer connection for {remote_id}");
            conn.close().await;
        }
    }

    pub async fn close_all(&mut self) {
        for (_, conn) in self.peers.drain() {
            conn.close().await;
        }
    }

    async fn ensure_peer(&mut self, remote_id: &str) -> Result<&PeerConn> {
        if !self.peers.contains_key(remote_id) {
            debug!("creating peer connection for {remote_id}");
            let conn = PeerConn::new(&self.ice_servers, self.local_track.clone()).await?;
            self.spawn_peer_tasks(remote_id, &conn);
            self.peers.insert(remote_id.to_string(), conn);
        }
        Ok(&self.peers[remote_id])
    }

    fn spawn_peer_tasks(&self, remote_id: &str, conn: &PeerConn) {
        // trickle: every locally discovered candidate is broadcast, tagged
        // with the pair it belongs to
        let mut candidates = conn.subscribe_candidates();
        let publisher = self.publisher.clone();
        let local_id = self.client_id.clone();
        let target = remote_id.to_string();
        tokio::spawn(async move {
            loop {
                let candidate = match candidates.recv().await {
                    Ok(candidate) => candidate,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                debug!("sending candidate to {target}");
                publisher.publish(
                    TOPIC_SIGNAL,
                    &SignalPayload::Candidate {
                        candidate,
                        sender_client_id: local_id.clone(),
                        target_client_id: target.clone(),
                    },
                );
            }
        });

        let mut tracks = conn.subscribe_tracks();
        let events = self.events.clone();
        let remote = remote_id.to_string();
        tokio::spawn(async move {
            loop {
                let track = match tracks.recv().await {
                    Ok(track) => track,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                let event = RoomEvent::RemoteTrack {
                    client_id: remote.clone(),
                    track,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });

        let mut state = conn.subscribe_state();
        let events = self.events.clone();
        let remote = remote_id.to_string();
        tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let current = *state.borrow_and_update();
                let event = RoomEvent::State {
                    client_id: remote.clone(),
                    state: current,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });
    }
}
