//! MP wire protocol
//!
//! Opcode table, envelope codec, and typed facades over the open JSON
//! payloads the MP cloud exchanges. Everything on the wire is a single
//! envelope shape (see [`frame::Frame`]); payload contents vary by opcode.

pub mod frame;
pub mod types;

use serde::{Deserialize, Serialize};

/// Protocol version carried in every frame.
pub const PROTOCOL_VERSION: i32 = 11;

/// Default MP WebSocket endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://ws-api.oneme.ru/websocket";

/// Origin header expected by the MP cloud.
pub const DEFAULT_ORIGIN: &str = "https://web.max.ru";

/// Opcodes for request/response and server notifications.
///
/// Ranges: system 1-6, auth 16-23, contact 32-46, chat 48-77, message 64-73,
/// file 80-89, session 96-97, notification 128-159, reaction 178-181,
/// folder 272-277.
pub mod opcode {
    // System
    pub const PING: i32 = 1;
    pub const RECONNECT: i32 = 3;
    pub const SESSION_INIT: i32 = 6;

    // Auth
    pub const PROFILE: i32 = 16;
    pub const AUTH_REQUEST: i32 = 17;
    pub const AUTH: i32 = 18;
    pub const LOGIN: i32 = 19;
    pub const LOGOUT: i32 = 20;
    pub const SYNC: i32 = 21;
    pub const AUTH_CONFIRM: i32 = 23;

    // Contacts
    pub const CONTACT_INFO: i32 = 32;
    pub const CONTACT_UPDATE: i32 = 34;
    pub const CONTACT_PRESENCE: i32 = 35;
    pub const CONTACT_LIST: i32 = 36;
    pub const CONTACT_SEARCH: i32 = 37;
    pub const CONTACT_INFO_BY_PHONE: i32 = 46;

    // Chats
    pub const CHAT_INFO: i32 = 48;
    pub const CHAT_HISTORY: i32 = 49;
    pub const CHAT_MARK: i32 = 50;
    pub const CHAT_DELETE: i32 = 52;
    pub const CHAT_CLEAR: i32 = 54;
    pub const CHAT_UPDATE: i32 = 55;
    pub const CHAT_JOIN: i32 = 57;
    pub const CHAT_LEAVE: i32 = 58;
    pub const CHAT_MEMBERS: i32 = 59;
    pub const CHAT_MEMBERS_UPDATE: i32 = 77;

    // Messages
    pub const MSG_SEND: i32 = 64;
    pub const MSG_TYPING: i32 = 65;
    pub const MSG_DELETE: i32 = 66;
    pub const MSG_EDIT: i32 = 67;
    pub const MSG_GET: i32 = 71;

    // Files
    pub const PHOTO_UPLOAD: i32 = 80;
    pub const VIDEO_UPLOAD: i32 = 82;
    pub const VIDEO_PLAY: i32 = 83;
    pub const FILE_UPLOAD: i32 = 87;
    pub const FILE_DOWNLOAD: i32 = 88;

    // Sessions
    pub const SESSIONS_INFO: i32 = 96;

    // Notifications (server-initiated)
    pub const NOTIF_MESSAGE: i32 = 128;
    pub const NOTIF_TYPING: i32 = 129;
    pub const NOTIF_MARK: i32 = 130;
    pub const NOTIF_CONTACT: i32 = 131;
    pub const NOTIF_PRESENCE: i32 = 132;
    pub const NOTIF_CHAT: i32 = 135;
    pub const NOTIF_ATTACH: i32 = 136;
    pub const NOTIF_MSG_REACTIONS_CHANGED: i32 = 155;

    // Reactions
    pub const MSG_REACTION: i32 = 178;
    pub const MSG_CANCEL_REACTION: i32 = 179;
    pub const MSG_GET_REACTIONS: i32 = 180;
}

/// Auth exchange discriminators sent in auth payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthType {
    StartAuth,
    CheckCode,
    Register,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartAuth => "START_AUTH",
            Self::CheckCode => "CHECK_CODE",
            Self::Register => "REGISTER",
        }
    }
}

/// Chat categories as reported in sync payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatType {
    Dialog,
    Chat,
    Channel,
}

/// Message lifecycle status carried on NOTIF_MESSAGE payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Edited,
    Removed,
}

/// Attachment discriminator (`_type` on attach objects).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachType {
    Photo,
    Video,
    File,
    Sticker,
    Audio,
    Control,
}

impl AttachType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "PHOTO",
            Self::Video => "VIDEO",
            Self::File => "FILE",
            Self::Sticker => "STICKER",
            Self::Audio => "AUDIO",
            Self::Control => "CONTROL",
        }
    }
}

/// Device class reported during sessionInit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    Web,
    Android,
    Ios,
}

/// Dialog id between two users: bitwise XOR of their MP user ids.
///
/// Symmetric, and `dialog_id(a, b) ^ a == b`.
pub fn dialog_id(a: i64, b: i64) -> i64 {
    a ^ b
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialog_id_symmetric() {
        assert_eq!(dialog_id(123, 456), dialog_id(456, 123));
    }

    #[test]
    fn test_dialog_id_recovers_peer() {
        let a = 987654321;
        let b = 123456789;
        assert_eq!(dialog_id(a, b) ^ a, b);
        assert_eq!(dialog_id(a, b) ^ b, a);
    }

    #[test]
    fn test_auth_type_round_trip() {
        let json = serde_json::to_string(&AuthType::StartAuth).unwrap();
        assert_eq!(json, "\"START_AUTH\"");
        assert_eq!(AuthType::StartAuth.as_str(), "START_AUTH");
    }

    #[test]
    fn test_chat_type_deserializes_from_wire() {
        let t: ChatType = serde_json::from_str("\"DIALOG\"").unwrap();
        assert_eq!(t, ChatType::Dialog);
    }
}
