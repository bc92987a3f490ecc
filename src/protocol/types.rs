//! Typed facades for known payload shapes.
//!
//! MP payloads are open-ended JSON; unknown fields must round-trip verbatim
//! when forwarded to webhooks, so the session layer works on raw
//! `serde_json::Value` and deserializes into these structs only where it
//! needs typed access.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{AttachType, ChatType, DeviceType};

/// Client identification sent during sessionInit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAgent {
    pub device_type: DeviceType,
    pub locale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    pub app_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl Default for UserAgent {
    fn default() -> Self {
        Self {
            device_type: DeviceType::Web,
            locale: "ru".to_string(),
            os_version: None,
            device_name: None,
            app_version: "25.10.13".to_string(),
            timezone: None,
        }
    }
}

/// One entry in a user's name list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Name {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub first_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_name: String,
}

/// An MP user as returned by contact-info calls and sync payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub account_status: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<Name>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_raw_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link: String,
    #[serde(default)]
    pub update_time: i64,
}

impl User {
    /// Avatar URL, preferring the raw (original-quality) variant.
    pub fn avatar_url(&self) -> &str {
        if !self.base_raw_url.is_empty() {
            &self.base_raw_url
        } else {
            &self.base_url
        }
    }
}

/// The authenticated account's own profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Me {
    pub id: i64,
    #[serde(default)]
    pub account_status: i32,
    #[serde(default)]
    pub phone: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<Name>,
    #[serde(default)]
    pub update_time: i64,
}

/// Presence record (last-seen timestamp).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Presence {
    #[serde(default)]
    pub seen: i64,
}

/// A chat member as returned by member listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub contact: User,
    #[serde(default)]
    pub presence: Presence,
    #[serde(default)]
    pub read_mark: i64,
}

/// Text formatting span.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: i32,
    pub length: i32,
}

/// Per-emoji reaction tally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionCounter {
    pub reaction: String,
    pub count: i32,
}

/// Reaction summary attached to a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionInfo {
    #[serde(default)]
    pub total_count: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub your_reaction: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub counters: Vec<ReactionCounter>,
}

/// Reply/forward link on a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageLink {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Any attachment, flattened across the per-kind shapes the server emits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "_type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<AttachType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<i64>>,
}

/// An MP message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub chat_id: i64,
    #[serde(default)]
    pub sender: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub time: i64,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub elements: Vec<Element>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attaches: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<MessageLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_info: Option<ReactionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<i64>,
}

/// An MP chat, dialog, or channel. Dialogs omit most group fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: ChatType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub owner: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link: String,
    /// Participant user-id → join timestamp.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub participants: HashMap<String, i64>,
    #[serde(default)]
    pub participants_count: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admins: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub modified: i64,
    #[serde(default)]
    pub messages_count: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

/// One slot returned by an upload-slot request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSlot {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub file_id: Option<i64>,
    #[serde(default)]
    pub video_id: Option<i64>,
    #[serde(default)]
    pub token: Option<String>,
}

/// A device session as reported by the sessions-info call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub current: bool,
}

/// Parse a message out of a response or notification payload.
///
/// The message may live under a `message` key or be the payload itself; a
/// missing chatId is backfilled from the enclosing payload.
pub fn message_from_payload(payload: &Value) -> Option<Message> {
    let msg_value = payload.get("message").unwrap_or(payload);
    let mut message: Message = serde_json::from_value(msg_value.clone()).ok()?;
    if message.chat_id == 0 {
        if let Some(chat_id) = payload.get("chatId").and_then(Value::as_i64) {
            message.chat_id = chat_id;
        }
    }
    Some(message)
}

/// Parse a chat out of a response payload's `chat` key.
pub fn chat_from_payload(payload: &Value) -> Option<Chat> {
    serde_json::from_value(payload.get("chat")?.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_from_nested_payload_backfills_chat_id() {
        let payload = json!({
            "chatId": 99,
            "message": {"id": "m1", "sender": 5, "text": "hello", "time": 1}
        });
        let msg = message_from_payload(&payload).unwrap();
        assert_eq!(msg.chat_id, 99);
        assert_eq!(msg.text, "hello");
    }

    #[test]
    fn test_message_from_flat_payload() {
        let payload = json!({"id": "m2", "chatId": 7, "text": "hi", "time": 2});
        let msg = message_from_payload(&payload).unwrap();
        assert_eq!(msg.chat_id, 7);
        assert_eq!(msg.id, "m2");
    }

    #[test]
    fn test_attachment_kind_discriminator() {
        let attach: Attachment =
            serde_json::from_value(json!({"_type": "FILE", "fileId": 42, "name": "a.pdf"}))
                .unwrap();
        assert_eq!(attach.kind, Some(AttachType::File));
        assert_eq!(attach.file_id, Some(42));
    }

    #[test]
    fn test_chat_participant_ids() {
        let chat: Chat = serde_json::from_value(json!({
            "id": 1, "type": "CHAT", "title": "team",
            "participants": {"100": 0, "200": 0}
        }))
        .unwrap();
        assert_eq!(chat.participants.len(), 2);
        assert!(chat.participants.contains_key("100"));
    }

    #[test]
    fn test_user_avatar_prefers_raw() {
        let user = User {
            id: 1,
            base_url: "small".into(),
            base_raw_url: "raw".into(),
            ..Default::default()
        };
        assert_eq!(user.avatar_url(), "raw");
    }
}
