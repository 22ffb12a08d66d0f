use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Topic carrying chat lines.
pub const TOPIC_CHAT: &str = "chat-message";
/// Topic carrying WebRTC negotiation traffic.
pub const TOPIC_SIGNAL: &str = "webrtc-signal";

/// Sender marker for locally authored chat entries.
pub const SENDER_SELF: &str = "me";
/// Sender marker for join announcements and other non-user lines.
pub const SENDER_SYSTEM: &str = "system";

/// A `webrtc-signal` payload. Every message is broadcast to the whole
/// channel and carries both the author and the intended recipient; receivers
/// discard anything not addressed to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    #[serde(rename_all = "camelCase")]
    Offer {
        sdp: String,
        sender_client_id: String,
        target_client_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        sdp: String,
        sender_client_id: String,
        target_client_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Candidate {
        candidate: RTCIceCandidateInit,
        sender_client_id: String,
        target_client_id: String,
    },
}

impl SignalPayload {
    pub fn sender(&self) -> &str {
        match self {
            SignalPayload::Offer {
                sender_client_id, ..
            }
            | SignalPayload::Answer {
                sender_client_id, ..
            }
            | SignalPayload::Candidate {
                sender_client_id, ..
            } => sender_client_id,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            SignalPayload::Offer {
                target_client_id, ..
            }
            | SignalPayload::Answer {
                target_client_id, ..
            }
            | SignalPayload::Candidate {
                target_client_id, ..
            } => target_client_id,
        }
    }
}

/// A `chat-message` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    pub text: String,
    pub username: String,
}

/// One line of a session's chat history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub text: String,
    pub sender: String,
}
