//! Event classification.
//!
//! Maps server-initiated notification opcodes (plus payload shape, for
//! message notifications) to symbolic event kinds. NOTIF_ATTACH never
//! reaches this layer: the receive loop routes it to the upload-waiter
//! table instead.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::protocol::opcode;

/// Closed set of event kinds delivered to webhooks.
///
/// `Connected`, `Sync`, `Reconnecting`, `AuthCodeSent`, `FileReady` and
/// `HistorySync` are synthesized by the gateway itself rather than mapped
/// from a notification opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Message,
    MessageEdit,
    MessageDelete,
    ReadReceipt,
    ChatUpdate,
    Typing,
    ReactionChange,
    ContactUpdate,
    PresenceUpdate,
    Disconnected,
    LoggedOut,
    /// Successful login (deprecated in favor of `Sync`).
    Connected,
    Sync,
    Reconnecting,
    AuthCodeSent,
    FileReady,
    HistorySync,
    /// Notification opcode with no mapping; dropped by the dispatcher.
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "Message",
            Self::MessageEdit => "MessageEdit",
            Self::MessageDelete => "MessageDelete",
            Self::ReadReceipt => "ReadReceipt",
            Self::ChatUpdate => "ChatUpdate",
            Self::Typing => "Typing",
            Self::ReactionChange => "ReactionChange",
            Self::ContactUpdate => "ContactUpdate",
            Self::PresenceUpdate => "PresenceUpdate",
            Self::Disconnected => "Disconnected",
            Self::LoggedOut => "LoggedOut",
            Self::Connected => "Connected",
            Self::Sync => "Sync",
            Self::Reconnecting => "Reconnecting",
            Self::AuthCodeSent => "AuthCodeSent",
            Self::FileReady => "FileReady",
            Self::HistorySync => "HistorySync",
            Self::Unknown => "Unknown",
        }
    }

    /// Every kind a tenant may subscribe to, in webhook-name form.
    pub fn subscribable() -> &'static [&'static str] {
        &[
            "Message",
            "MessageEdit",
            "MessageDelete",
            "ReadReceipt",
            "ChatUpdate",
            "Typing",
            "ReactionChange",
            "ContactUpdate",
            "PresenceUpdate",
            "Disconnected",
            "LoggedOut",
            "Connected",
            "Sync",
            "Reconnecting",
            "AuthCodeSent",
            "FileReady",
            "HistorySync",
        ]
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified server notification or gateway-synthesized event.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub opcode: i32,
    pub payload: Value,
}

impl Event {
    /// Gateway-synthesized event with no wire opcode.
    pub fn synthetic(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            opcode: 0,
            payload,
        }
    }

    /// The webhook body shape: `{type, opcode, event}`.
    pub fn webhook_payload(&self) -> Value {
        json!({
            "type": self.kind.as_str(),
            "opcode": self.opcode,
            "event": self.payload,
        })
    }
}

/// Classify an inbound notification by opcode and payload shape.
pub fn classify(op: i32, payload: &Value) -> EventKind {
    match op {
        opcode::NOTIF_MESSAGE => message_kind(payload),
        opcode::NOTIF_MARK => EventKind::ReadReceipt,
        opcode::NOTIF_CHAT => EventKind::ChatUpdate,
        opcode::NOTIF_TYPING => EventKind::Typing,
        opcode::NOTIF_MSG_REACTIONS_CHANGED => EventKind::ReactionChange,
        opcode::NOTIF_CONTACT => EventKind::ContactUpdate,
        opcode::NOTIF_PRESENCE => EventKind::PresenceUpdate,
        opcode::RECONNECT => EventKind::Disconnected,
        opcode::LOGOUT => EventKind::LoggedOut,
        _ => EventKind::Unknown,
    }
}

/// NOTIF_MESSAGE splits into new/edit/delete on the message status field.
fn message_kind(payload: &Value) -> EventKind {
    let message = payload.get("message").unwrap_or(payload);
    match message.get("status").and_then(Value::as_str) {
        Some("EDITED") => EventKind::MessageEdit,
        Some("REMOVED") => EventKind::MessageDelete,
        _ => EventKind::Message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_plain_message() {
        let payload = json!({"chatId": 1, "message": {"id": "m", "text": "hi"}});
        assert_eq!(classify(opcode::NOTIF_MESSAGE, &payload), EventKind::Message);
    }

    #[test]
    fn test_classify_edited_and_removed() {
        let edited = json!({"message": {"status": "EDITED"}});
        let removed = json!({"message": {"status": "REMOVED"}});
        assert_eq!(
            classify(opcode::NOTIF_MESSAGE, &edited),
            EventKind::MessageEdit
        );
        assert_eq!(
            classify(opcode::NOTIF_MESSAGE, &removed),
            EventKind::MessageDelete
        );
    }

    #[test]
    fn test_classify_status_on_flat_payload() {
        let flat = json!({"status": "EDITED"});
        assert_eq!(classify(opcode::NOTIF_MESSAGE, &flat), EventKind::MessageEdit);
    }

    #[test]
    fn test_classify_table() {
        let p = Value::Null;
        assert_eq!(classify(opcode::NOTIF_MARK, &p), EventKind::ReadReceipt);
        assert_eq!(classify(opcode::NOTIF_CHAT, &p), EventKind::ChatUpdate);
        assert_eq!(classify(opcode::NOTIF_TYPING, &p), EventKind::Typing);
        assert_eq!(
            classify(opcode::NOTIF_MSG_REACTIONS_CHANGED, &p),
            EventKind::ReactionChange
        );
        assert_eq!(classify(opcode::NOTIF_CONTACT, &p), EventKind::ContactUpdate);
        assert_eq!(
            classify(opcode::NOTIF_PRESENCE, &p),
            EventKind::PresenceUpdate
        );
        assert_eq!(classify(opcode::RECONNECT, &p), EventKind::Disconnected);
        assert_eq!(classify(opcode::LOGOUT, &p), EventKind::LoggedOut);
        assert_eq!(classify(999, &p), EventKind::Unknown);
    }

    #[test]
    fn test_webhook_payload_shape() {
        let event = Event {
            kind: EventKind::Typing,
            opcode: opcode::NOTIF_TYPING,
            payload: json!({"chatId": 3, "userId": 8}),
        };
        let body = event.webhook_payload();
        assert_eq!(body["type"], "Typing");
        assert_eq!(body["opcode"], opcode::NOTIF_TYPING);
        assert_eq!(body["event"]["chatId"], 3);
    }
}
