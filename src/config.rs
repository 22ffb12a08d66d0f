use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::audio::AudioConfig;

/// Channel every participant of the room attaches to.
pub const DEFAULT_CHANNEL: &str = "kiss-voice-chat";

/// Everything a session needs to join a room. Built once by the caller and
/// handed to [`crate::Session::join`]; nothing is read from ambient state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name shown to other participants in chat.
    pub username: String,
    /// WebSocket URL of the relay service.
    pub relay_url: String,
    pub channel: String,
    pub credentials: Credentials,
    pub ice_servers: Vec<RTCIceServer>,
    pub audio: AudioConfig,
}

/// How the relay credential is obtained.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Fetch a short-lived grant from a token endpoint before joining.
    Endpoint(String),
    /// Use a pre-issued token directly. The relay assigns a client id when
    /// none is given.
    Static {
        token: String,
        client_id: Option<String>,
    },
}

impl Config {
    pub fn new(
        username: impl Into<String>,
        relay_url: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Config {
            username: username.into(),
            relay_url: relay_url.into(),
            channel: DEFAULT_CHANNEL.to_string(),
            credentials,
            ice_servers: default_ice_servers(),
            audio: AudioConfig::default(),
        }
    }
}

pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}
