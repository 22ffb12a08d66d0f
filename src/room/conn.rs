use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::warn;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::rtc::create_rtc_connection;

/// One native connection to a remote participant. The shared local track is
/// attached at construction so a connection never needs renegotiation.
pub struct PeerConn {
    peer: Arc<RTCPeerConnection>,
    state_watcher: watch::Receiver<RTCPeerConnectionState>,
    candidate_tx: broadcast::Sender<RTCIceCandidateInit>,
    track_tx: broadcast::Sender<Arc<TrackRemote>>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

impl PeerConn {
    pub async fn new(
        ice_servers: &[RTCIceServer],
        local_track: Arc<TrackLocalStaticSample>,
    ) -> Result<Self> {
        let peer = Arc::new(create_rtc_connection(ice_servers).await?);
        peer.add_track(local_track).await?;

        let (state_tx, state_rx) = watch::channel(RTCPeerConnectionState::New);
        peer.on_peer_connection_state_change(Box::new(move |state| {
            let _ = state_tx.send(state);
            Box::pin(async {})
        }));

        let (candidate_tx, _) = broadcast::channel(64);
        let trickle_tx = candidate_tx.clone();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let trickle_tx = trickle_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = trickle_tx.send(init);
                        }
                        Err(err) => warn!("failed to encode local candidate: {err}"),
                    }
                }
            })
        }));

        let (track_tx, _) = broadcast::channel(4);
        let remote_tx = track_tx.clone();
        peer.on_track(Box::new(move |track, _, _| {
            let _ = remote_tx.send(track);
            Box::pin(async {})
        }));

        Ok(PeerConn {
            peer,
            state_watcher: state_rx,
            candidate_tx,
            track_tx,
            pending_candidates: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> RTCPeerConnectionState {
        *self.state_watcher.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RTCPeerConnectionState> {
        self.state_watcher.clone()
    }

    pub fn subscribe_candidates(&self) -> broadcast::Receiver<RTCIceCandidateInit> {
        self.candidate_tx.subscribe()
    }

    pub fn subscribe_tracks(&self) -> broadcast::Receiver<Arc<TrackRemote>> {
        self.track_tx.subscribe()
    }

    pub async fn has_remote_description(&self) -> bool {
        self.peer.remote_description().await.is_some()
    }

    /// Create and install the local offer for an outbound call.
    pub async fn offer(&self) -> Result<String> {
        let offer = self.peer.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.peer.set_local_description(offer).await?;
        Ok(sdp)
    }

    /// Apply a remote offer and produce the answer.
    pub async fn answer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())?;
        self.peer.set_remote_description(offer).await?;
        self.drain_pending().await;
        let answer = self.peer.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.peer.set_local_description(answer).await?;
        Ok(sdp)
    }

    /// Apply the remote answer to a previously sent offer.
    pub async fn answered(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())?;
        self.peer.set_remote_description(answer).await?;
        self.drain_pending().await;
        Ok(())
    }

    /// Candidates may arrive before the remote description in any order;
    /// buffer the early ones and apply them once the description lands.
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        if self.peer.remote_description().await.is_none() {
            self.pending_candidates.lock().await.push(candidate);
            return Ok(());
        }
        self.peer.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn drain_pending(&self) {
        let pending = std::mem::take(&mut *self.pending_candidates.lock().await);
        for candidate in pending {
            if let Err(err) = self.peer.add_ice_candidate(candidate).await {
                warn!("failed to apply buffered candidate: {err}");
            }
        }
    }

    pub async fn close(&self) {
        if let Err(err) = self.peer.close().await {
            warn!("failed to close peer connection: {err}");
        }
    }
}
