use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("relay rejected credentials: {0}")]
    Denied(String),
    #[error("unexpected relay frame during handshake")]
    Handshake,
    #[error("relay connection closed")]
    RelayClosed,
    #[error("token endpoint error: {0}")]
    Token(String),
    #[error("no audio input device available")]
    NoInputDevice,
    #[error("no audio output device available")]
    NoOutputDevice,
    #[error("chat message is empty")]
    EmptyMessage,
}
