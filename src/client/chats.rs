//! Chat and group operations.

use serde_json::{json, Value};
use tracing::info;

use crate::client::error::ClientError;
use crate::client::SessionClient;
use crate::protocol::types::{
    chat_from_payload, message_from_payload, Chat, Member, Message,
};
use crate::protocol::{now_millis, opcode, AttachType, ChatType};

/// Direction of a group membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberOperation {
    Add,
    Remove,
}

impl SessionClient {
    /// Fetch message history around `from` (defaults to now), newest-first
    /// windows controlled by `forward`/`backward`.
    pub async fn chat_history(
        &self,
        chat_id: i64,
        from: i64,
        forward: i32,
        backward: i32,
    ) -> Result<Vec<Message>, ClientError> {
        let from = if from == 0 { now_millis() } else { from };
        let backward = if backward == 0 { 200 } else { backward };

        info!(chat_id, backward, "fetching chat history");
        let response = self
            .call(
                opcode::CHAT_HISTORY,
                json!({
                    "chatId": chat_id,
                    "from": from,
                    "forward": forward,
                    "backward": backward,
                    "getMessages": true,
                }),
            )
            .await?;

        let mut messages = Vec::new();
        if let Some(raw) = response.get("messages").and_then(Value::as_array) {
            for value in raw {
                if let Ok(msg) = serde_json::from_value::<Message>(value.clone()) {
                    messages.push(msg);
                }
            }
        }
        info!(count = messages.len(), "fetched messages");
        Ok(messages)
    }

    pub async fn chat_info(&self, chat_ids: &[i64]) -> Result<Vec<Chat>, ClientError> {
        let response = self
            .call(opcode::CHAT_INFO, json!({"chatIds": chat_ids}))
            .await?;

        let mut chats = Vec::new();
        if let Some(raw) = response.get("chats").and_then(Value::as_array) {
            for value in raw {
                if let Ok(chat) = serde_json::from_value::<Chat>(value.clone()) {
                    chats.push(chat);
                }
            }
        }
        Ok(chats)
    }

    pub async fn get_chat(&self, chat_id: i64) -> Result<Chat, ClientError> {
        let chats = self.chat_info(&[chat_id]).await?;
        chats
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::protocol("chat_not_found", "chat not found"))
    }

    /// Create a group chat. MP models this as a message with a CONTROL
    /// attachment carrying the title and initial members.
    pub async fn create_group(
        &self,
        name: &str,
        participant_ids: &[i64],
        notify: bool,
    ) -> Result<(Option<Chat>, Option<Message>), ClientError> {
        if name.is_empty() {
            return Err(ClientError::validation("group name is required"));
        }

        info!(name, participants = participant_ids.len(), "creating group");
        let payload = json!({
            "notify": notify,
            "message": {
                "cid": now_millis(),
                "attaches": [{
                    "_type": AttachType::Control.as_str(),
                    "event": "new",
                    "chatType": ChatType::Chat,
                    "title": name,
                    "userIds": participant_ids,
                }],
            },
        });
        let response = self.call(opcode::MSG_SEND, payload).await?;

        Ok((
            chat_from_payload(&response),
            message_from_payload(&response),
        ))
    }

    /// Join a chat by invite link; only the `join/...` suffix is sent.
    pub async fn join_chat(&self, link: &str) -> Result<Chat, ClientError> {
        let join_path = match link.find("join/") {
            Some(idx) => &link[idx..],
            None => link,
        };

        info!(link, "joining chat");
        let response = self
            .call(opcode::CHAT_JOIN, json!({"link": join_path}))
            .await?;

        chat_from_payload(&response)
            .ok_or_else(|| ClientError::protocol("chat_not_found", "no chat in response"))
    }

    pub async fn leave_chat(&self, chat_id: i64) -> Result<(), ClientError> {
        info!(chat_id, "leaving chat");
        self.call(opcode::CHAT_LEAVE, json!({"chatId": chat_id}))
            .await?;
        Ok(())
    }

    pub async fn update_members(
        &self,
        chat_id: i64,
        user_ids: &[i64],
        operation: MemberOperation,
        show_history: bool,
        clean_msg_period: i32,
    ) -> Result<Option<Chat>, ClientError> {
        let mut payload = json!({
            "chatId": chat_id,
            "userIds": user_ids,
        });
        match operation {
            MemberOperation::Add => {
                payload["operation"] = json!("add");
                payload["showHistory"] = json!(show_history);
            }
            MemberOperation::Remove => {
                payload["operation"] = json!("remove");
                payload["cleanMsgPeriod"] = json!(clean_msg_period);
            }
        }

        info!(chat_id, ?operation, count = user_ids.len(), "updating members");
        let response = self.call(opcode::CHAT_MEMBERS_UPDATE, payload).await?;
        Ok(chat_from_payload(&response))
    }

    /// Update title (`theme` on the wire) and/or description.
    pub async fn update_chat_profile(
        &self,
        chat_id: i64,
        name: &str,
        description: &str,
    ) -> Result<Option<Chat>, ClientError> {
        let mut payload = json!({"chatId": chat_id});
        if !name.is_empty() {
            payload["theme"] = json!(name);
        }
        if !description.is_empty() {
            payload["description"] = json!(description);
        }

        info!(chat_id, name, "updating chat profile");
        let response = self.call(opcode::CHAT_UPDATE, payload).await?;
        Ok(chat_from_payload(&response))
    }

    /// Page through chat members. Returns the page and the next marker.
    pub async fn chat_members(
        &self,
        chat_id: i64,
        marker: i64,
        count: i32,
    ) -> Result<(Vec<Member>, Option<i64>), ClientError> {
        let count = if count == 0 { 50 } else { count };
        let response = self
            .call(
                opcode::CHAT_MEMBERS,
                json!({"chatId": chat_id, "type": "MEMBER", "marker": marker, "count": count}),
            )
            .await?;

        let members = parse_members(&response);
        let next_marker = response.get("marker").and_then(Value::as_i64);
        Ok((members, next_marker))
    }

    pub async fn search_chat_members(
        &self,
        chat_id: i64,
        query: &str,
    ) -> Result<Vec<Member>, ClientError> {
        let response = self
            .call(
                opcode::CHAT_MEMBERS,
                json!({"chatId": chat_id, "type": "MEMBER", "query": query}),
            )
            .await?;
        Ok(parse_members(&response))
    }

    pub async fn revoke_invite_link(&self, chat_id: i64) -> Result<Option<Chat>, ClientError> {
        info!(chat_id, "revoking invite link");
        let response = self
            .call(
                opcode::CHAT_UPDATE,
                json!({"chatId": chat_id, "revokePrivateLink": true}),
            )
            .await?;
        Ok(chat_from_payload(&response))
    }

    pub async fn delete_chat(&self, chat_id: i64) -> Result<(), ClientError> {
        info!(chat_id, "deleting chat");
        self.call(opcode::CHAT_DELETE, json!({"chatId": chat_id}))
            .await?;
        Ok(())
    }

    pub async fn clear_chat_history(&self, chat_id: i64) -> Result<(), ClientError> {
        info!(chat_id, "clearing chat history");
        self.call(opcode::CHAT_CLEAR, json!({"chatId": chat_id}))
            .await?;
        Ok(())
    }
}

fn parse_members(payload: &Value) -> Vec<Member> {
    let mut members = Vec::new();
    if let Some(raw) = payload.get("members").and_then(Value::as_array) {
        for value in raw {
            if let Ok(member) = serde_json::from_value::<Member>(value.clone()) {
                members.push(member);
            }
        }
    }
    members
}
