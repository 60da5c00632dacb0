//! Wire protocol for the plaza realtime transport.
//!
//! This crate owns the message types spoken over the WebSocket: the closed
//! set of client commands, the server event frames, and the stable error
//! codes. Both the server and any bot/client tooling depend on it.
//!
//! DESIGN
//! ======
//! Every frame is a single JSON object carrying a `type` discriminator.
//! Decoding is deliberately tolerant: unknown extra fields are ignored for
//! forward compatibility, while a missing or non-string `type` and an
//! unrecognized `type` are distinguished so the server can report precise
//! `INVALID_MESSAGE` reasons. Timestamps serialize as RFC 3339 strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Stable error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed JSON, missing `type`, or an unrecognized `type`.
    InvalidMessage,
    /// `join` named a room that does not exist.
    RoomNotFound,
    /// Command requires room membership the socket does not have.
    NotInRoom,
    /// Movement target rejected (out of bounds, blocked, or unreachable).
    InvalidMove,
    /// Server-side failure; the command was treated as a no-op.
    InternalError,
    /// Per-socket command ceiling exceeded.
    RateLimited,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::RoomNotFound => "ROOM_NOT_FOUND",
            Self::NotInRoom => "NOT_IN_ROOM",
            Self::InvalidMove => "INVALID_MOVE",
            Self::InternalError => "INTERNAL_ERROR",
            Self::RateLimited => "RATE_LIMITED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CLIENT → SERVER
// =============================================================================

/// A command frame sent by a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Present a bearer token; promotes the socket to a participant identity.
    Auth { token: String },
    /// Attach to a room by slug or id. Switches rooms when already attached.
    Join {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    /// Detach from the current room without closing the socket.
    Leave,
    /// Walk to a tile. Coordinates may be out of bounds; the engine validates.
    Move { x: i32, y: i32 },
    /// Broadcast a chat message to the current room.
    Chat { message: String },
    /// Liveness probe; answered with `pong`.
    Ping,
}

/// Error returned by [`decode_client`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The text was not valid JSON, or the fields did not match the `type`.
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame has no string `type` field.
    #[error("frame has no string `type` field")]
    MissingType,
    /// The `type` value is not one of the recognized commands.
    #[error("unknown message type `{0}`")]
    UnknownType(String),
}

/// Decode one inbound text frame into a [`ClientMessage`].
///
/// Extra fields are tolerated; a missing/non-string `type` and an unknown
/// `type` are reported separately from field-level decode failures.
///
/// # Errors
///
/// Returns a [`DecodeError`] describing why the frame was rejected.
pub fn decode_client(text: &str) -> Result<ClientMessage, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err(DecodeError::MissingType);
    };
    match kind {
        "auth" | "join" | "leave" | "move" | "chat" | "ping" => {
            serde_json::from_value(value).map_err(DecodeError::Json)
        }
        other => Err(DecodeError::UnknownType(other.to_owned())),
    }
}

// =============================================================================
// SERVER → CLIENT: PAYLOAD TYPES
// =============================================================================

/// Full avatar record echoed by `auth_ok`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Avatar {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub body_color: String,
}

/// The rendered subset of an avatar, snapshotted onto chat messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarConfig {
    pub body_color: String,
}

/// A participant as seen inside a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub avatar: AvatarConfig,
    pub x: i32,
    pub y: i32,
}

/// One step of a walk path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPoint {
    pub x: i32,
    pub y: i32,
}

/// Room metadata delivered with `room_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_username: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Row-major H×W grid; `0` walkable, `1` blocked.
    pub tiles: Vec<Vec<u8>>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub is_public: bool,
}

/// A chat message with its author snapshot.
///
/// `agent_id` is `None` when the author account has since been deleted; the
/// name and avatar snapshots still render the message as it was sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub agent_name: String,
    pub avatar_config: AvatarConfig,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

// =============================================================================
// SERVER → CLIENT
// =============================================================================

/// An event frame emitted by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake succeeded; the socket now carries this identity.
    AuthOk {
        #[serde(rename = "agentId")]
        agent_id: Uuid,
        name: String,
        avatar: Avatar,
    },
    /// Handshake failed; the socket stays connected and unauthenticated.
    AuthError { error: String },
    /// Snapshot delivered on attach: the room, its occupants, recent chat.
    RoomState {
        room: RoomInfo,
        agents: Vec<Agent>,
        messages: Vec<ChatMessage>,
    },
    /// A participant attached to the room.
    AgentJoined { agent: Agent },
    /// A participant detached from the room.
    AgentLeft {
        #[serde(rename = "agentId")]
        agent_id: Uuid,
    },
    /// Position snap without a walk animation.
    AgentMoved {
        #[serde(rename = "agentId")]
        agent_id: Uuid,
        x: i32,
        y: i32,
    },
    /// A walk: the full path, animated client-side at `speed` tiles/second.
    AgentPath {
        #[serde(rename = "agentId")]
        agent_id: Uuid,
        path: Vec<PathPoint>,
        speed: f64,
    },
    /// A chat message fanned out to the room.
    ChatMessage(ChatMessage),
    /// A command was rejected; `code` is one of [`ErrorCode`].
    Error { code: String, message: String },
    /// Reply to `ping`.
    Pong,
}

impl ServerMessage {
    /// Build an `error` frame from a typed code and a human-readable reason.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error { code: code.as_str().to_owned(), message: message.into() }
    }
}

/// Encode a server frame as a JSON text frame.
///
/// # Errors
///
/// Returns the underlying `serde_json` error; this only fails on
/// non-serializable payloads, which the frame types rule out.
pub fn encode_server(msg: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
