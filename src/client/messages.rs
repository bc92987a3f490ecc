//! Message operations: send, edit, delete, read marks, typing, reactions.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::client::error::ClientError;
use crate::client::SessionClient;
use crate::protocol::types::{message_from_payload, Attachment, Element, Message, ReactionInfo};
use crate::protocol::{now_millis, opcode};

/// Options for sending a message.
#[derive(Debug, Clone, Default)]
pub struct SendMessageOptions {
    /// Chat id 0 is valid: it addresses the account's saved-messages chat.
    pub chat_id: i64,
    pub text: String,
    pub notify: bool,
    pub reply_to: Option<String>,
    pub attachments: Vec<Attachment>,
    pub elements: Vec<Element>,
}

impl SessionClient {
    pub async fn send_message(&self, opts: SendMessageOptions) -> Result<Message, ClientError> {
        let mut message = json!({
            "text": opts.text,
            "cid": now_millis(),
        });

        if !opts.elements.is_empty() {
            message["elements"] = json!(opts.elements);
        }
        if !opts.attachments.is_empty() {
            message["attaches"] = json!(opts.attachments);
        }
        if let Some(reply_to) = &opts.reply_to {
            message["link"] = json!({"type": "REPLY", "messageId": reply_to});
        }

        info!(chat_id = opts.chat_id, "sending message");
        let payload = json!({
            "chatId": opts.chat_id,
            "message": message,
            "notify": opts.notify,
        });
        let response = self.call(opcode::MSG_SEND, payload).await?;

        message_from_payload(&response)
            .ok_or_else(|| ClientError::protocol("invalid_response", "no message in response"))
    }

    pub async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        notify: bool,
    ) -> Result<Message, ClientError> {
        self.send_message(SendMessageOptions {
            chat_id,
            text: text.to_string(),
            notify,
            ..Default::default()
        })
        .await
    }

    pub async fn edit_message(
        &self,
        chat_id: i64,
        message_id: &str,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<Message, ClientError> {
        let mut payload = json!({
            "chatId": chat_id,
            "messageId": message_id,
            "text": text,
        });
        if !attachments.is_empty() {
            payload["attaches"] = json!(attachments);
        }

        info!(chat_id, message_id, "editing message");
        let response = self.call(opcode::MSG_EDIT, payload).await?;

        message_from_payload(&response)
            .ok_or_else(|| ClientError::protocol("invalid_response", "no message in response"))
    }

    pub async fn delete_messages(
        &self,
        chat_id: i64,
        message_ids: &[String],
        for_me: bool,
    ) -> Result<(), ClientError> {
        info!(chat_id, count = message_ids.len(), "deleting messages");
        self.call(
            opcode::MSG_DELETE,
            json!({"chatId": chat_id, "messageIds": message_ids, "forMe": for_me}),
        )
        .await?;
        Ok(())
    }

    pub async fn mark_read(&self, chat_id: i64, message_id: &str) -> Result<(), ClientError> {
        debug!(chat_id, message_id, "marking as read");
        self.call(
            opcode::CHAT_MARK,
            json!({"chatId": chat_id, "messageId": message_id}),
        )
        .await?;
        Ok(())
    }

    pub async fn send_typing(&self, chat_id: i64) -> Result<(), ClientError> {
        self.call(opcode::MSG_TYPING, json!({"chatId": chat_id}))
            .await?;
        Ok(())
    }

    pub async fn get_message(
        &self,
        chat_id: i64,
        message_id: &str,
    ) -> Result<Message, ClientError> {
        let response = self
            .call(
                opcode::MSG_GET,
                json!({"chatId": chat_id, "messageId": message_id}),
            )
            .await?;

        message_from_payload(&response)
            .ok_or_else(|| ClientError::protocol("invalid_response", "no message in response"))
    }

    pub async fn add_reaction(
        &self,
        chat_id: i64,
        message_id: &str,
        reaction: &str,
    ) -> Result<Option<ReactionInfo>, ClientError> {
        info!(chat_id, message_id, reaction, "adding reaction");
        let response = self
            .call(
                opcode::MSG_REACTION,
                json!({
                    "chatId": chat_id,
                    "messageId": message_id,
                    "reaction": {"reactionType": "EMOJI", "id": reaction},
                }),
            )
            .await?;

        Ok(reaction_info(&response))
    }

    pub async fn remove_reaction(
        &self,
        chat_id: i64,
        message_id: &str,
    ) -> Result<Option<ReactionInfo>, ClientError> {
        info!(chat_id, message_id, "removing reaction");
        let response = self
            .call(
                opcode::MSG_CANCEL_REACTION,
                json!({"chatId": chat_id, "messageId": message_id}),
            )
            .await?;

        Ok(reaction_info(&response))
    }

    /// Reaction summaries for a batch of messages, keyed by message id.
    pub async fn get_reactions(
        &self,
        chat_id: i64,
        message_ids: &[String],
    ) -> Result<HashMap<String, ReactionInfo>, ClientError> {
        let response = self
            .call(
                opcode::MSG_GET_REACTIONS,
                json!({"chatId": chat_id, "messageIds": message_ids}),
            )
            .await?;

        let mut result = HashMap::new();
        if let Some(map) = response
            .get("messagesReactions")
            .and_then(Value::as_object)
        {
            for (message_id, raw) in map {
                if let Ok(info) = serde_json::from_value::<ReactionInfo>(raw.clone()) {
                    result.insert(message_id.clone(), info);
                }
            }
        }
        Ok(result)
    }

    pub async fn pin_message(
        &self,
        chat_id: i64,
        message_id: &str,
        notify_pin: bool,
    ) -> Result<(), ClientError> {
        info!(chat_id, message_id, "pinning message");
        self.call(
            opcode::CHAT_UPDATE,
            json!({
                "chatId": chat_id,
                "pinMessageId": message_id,
                "notifyPin": notify_pin,
            }),
        )
        .await?;
        Ok(())
    }
}

fn reaction_info(payload: &Value) -> Option<ReactionInfo> {
    serde_json::from_value(payload.get("reactionInfo")?.clone()).ok()
}
