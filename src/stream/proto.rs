//! Wire protocol of the notification socket.
//!
//! The client writes exactly one text frame, the login line. Everything
//! after that flows from server to client as single-byte binary frames.

use secrecy::ExposeSecret;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::session::DeviceCredentials;

/// Meaningful server frames.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Frame {
    /// `#`: keep-alive, no content.
    KeepAlive,
    /// `!`: new messages are waiting.
    NewMessages,
    /// `R`: drop the connection and reconnect.
    Reload,
    /// `E`: permanent problem, do not reconnect automatically.
    ServiceError,
}

impl Frame {
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match payload {
            b"#" => Some(Self::KeepAlive),
            b"!" => Some(Self::NewMessages),
            b"R" => Some(Self::Reload),
            b"E" => Some(Self::ServiceError),
            _ => None,
        }
    }

    pub fn token(self) -> u8 {
        match self {
            Self::KeepAlive => b'#',
            Self::NewMessages => b'!',
            Self::Reload => b'R',
            Self::ServiceError => b'E',
        }
    }
}

/// What the stream controller must do with one received frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FrameAction {
    /// Non-binary frame; carries no protocol meaning.
    Ignore,
    KeepAlive,
    Sync,
    Reconnect,
    PermanentError,
    /// Binary payload outside the known token set.
    ProtocolViolation(Vec<u8>),
}

/// Decides the action for a frame. Pure: the result depends on this frame
/// alone, never on earlier ones.
pub fn interpret(message: &WsMessage) -> FrameAction {
    let WsMessage::Binary(payload) = message else {
        return FrameAction::Ignore;
    };

    match Frame::from_payload(payload) {
        Some(Frame::KeepAlive) => FrameAction::KeepAlive,
        Some(Frame::NewMessages) => FrameAction::Sync,
        Some(Frame::Reload) => FrameAction::Reconnect,
        Some(Frame::ServiceError) => FrameAction::PermanentError,
        None => FrameAction::ProtocolViolation(payload.clone()),
    }
}

/// The single text line that authenticates a socket:
/// `login:<device_id>:<secret>\n`.
pub fn login_line(device: &DeviceCredentials) -> String {
    format!(
        "login:{}:{}\n",
        device.device_id,
        device.secret.expose_secret()
    )
}
