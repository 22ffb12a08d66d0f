use serde::{Deserialize, Serialize};

/// Frames sent by a client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientFrame {
    Auth {
        token: String,
        client_id: Option<String>,
    },
    Attach {
        channel: String,
    },
    Publish {
        channel: String,
        topic: String,
        data: serde_json::Value,
    },
}

/// Frames sent by the relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerFrame {
    Welcome {
        client_id: String,
    },
    Denied {
        reason: String,
    },
    Attached {
        channel: String,
    },
    /// A publication on an attached channel. The relay echoes a client's own
    /// publications back to it; `client_id` identifies the publisher.
    Message {
        channel: String,
        topic: String,
        client_id: String,
        data: serde_json::Value,
    },
    Presence {
        channel: String,
        event: PresenceEvent,
        client_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceEvent {
    Enter,
    Leave,
}
