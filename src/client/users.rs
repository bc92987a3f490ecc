//! User, contact, presence and device-session operations.
//!
//! Contact lookups are cache-first: the per-session user cache is consulted
//! before issuing a batch contact-info request for the missing ids.

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::client::auth::validate_phone;
use crate::client::error::ClientError;
use crate::client::SessionClient;
use crate::protocol::opcode;
use crate::protocol::types::{Presence, SessionInfo, User};

impl SessionClient {
    /// Fetch users by id, returning them in the requested order. Cached
    /// entries are served locally; only the misses go to the server.
    pub async fn get_users(&self, user_ids: &[i64]) -> Result<Vec<User>, ClientError> {
        let mut cached = Vec::new();
        let mut missing = Vec::new();
        for &id in user_ids {
            match self.cached_user(id) {
                Some(user) => cached.push(user),
                None => missing.push(id),
            }
        }

        let mut fetched = Vec::new();
        if !missing.is_empty() {
            info!(count = missing.len(), "fetching users");
            let response = self
                .call(opcode::CONTACT_INFO, json!({"contactIds": missing}))
                .await?;

            if let Some(raw) = response.get("contacts").and_then(Value::as_array) {
                for value in raw {
                    if let Ok(user) = serde_json::from_value::<User>(value.clone()) {
                        self.cache_user(user.clone());
                        fetched.push(user);
                    }
                }
            }
        }

        let mut result = Vec::with_capacity(user_ids.len());
        for &id in user_ids {
            if let Some(user) = cached
                .iter()
                .chain(fetched.iter())
                .find(|u| u.id == id)
            {
                result.push(user.clone());
            }
        }
        Ok(result)
    }

    pub async fn get_user(&self, user_id: i64) -> Result<User, ClientError> {
        if let Some(user) = self.cached_user(user_id) {
            return Ok(user);
        }
        let users = self.get_users(&[user_id]).await?;
        users
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::protocol("user_not_found", "user not found"))
    }

    pub async fn search_by_phone(&self, phone: &str) -> Result<User, ClientError> {
        if !validate_phone(phone) {
            return Err(ClientError::validation("invalid phone number format"));
        }

        info!(phone, "searching user by phone");
        let response = self
            .call(opcode::CONTACT_INFO_BY_PHONE, json!({"phone": phone}))
            .await?;

        match response.get("contact") {
            Some(raw) => {
                let user: User = serde_json::from_value(raw.clone())
                    .map_err(|_| ClientError::protocol("invalid_response", "bad contact shape"))?;
                self.cache_user(user.clone());
                Ok(user)
            }
            None => Err(ClientError::protocol("user_not_found", "user not found")),
        }
    }

    pub async fn add_contact(&self, contact_id: i64) -> Result<Option<User>, ClientError> {
        info!(contact_id, "adding contact");
        let response = self
            .call(
                opcode::CONTACT_UPDATE,
                json!({"contactId": contact_id, "action": "ADD"}),
            )
            .await?;
        Ok(response
            .get("contact")
            .and_then(|raw| serde_json::from_value(raw.clone()).ok()))
    }

    pub async fn remove_contact(&self, contact_id: i64) -> Result<(), ClientError> {
        info!(contact_id, "removing contact");
        self.call(
            opcode::CONTACT_UPDATE,
            json!({"contactId": contact_id, "action": "REMOVE"}),
        )
        .await?;
        Ok(())
    }

    pub async fn get_presence(&self, user_id: i64) -> Result<Option<Presence>, ClientError> {
        debug!(user_id, "getting presence");
        let response = self
            .call(opcode::CONTACT_PRESENCE, json!({"contactId": user_id}))
            .await?;
        Ok(response
            .get("presence")
            .and_then(|raw| serde_json::from_value(raw.clone()).ok()))
    }

    pub async fn get_contacts(&self) -> Result<Vec<User>, ClientError> {
        info!("getting contacts");
        let response = self.call(opcode::CONTACT_LIST, json!({})).await?;
        Ok(parse_contacts(&response))
    }

    pub async fn search_contacts(&self, query: &str) -> Result<Vec<User>, ClientError> {
        info!(query, "searching contacts");
        let response = self
            .call(opcode::CONTACT_SEARCH, json!({"query": query}))
            .await?;
        Ok(parse_contacts(&response))
    }

    /// Update the authenticated account's profile.
    pub async fn update_profile(
        &self,
        first_name: &str,
        last_name: &str,
        description: &str,
    ) -> Result<(), ClientError> {
        let mut payload = json!({"firstName": first_name});
        if !last_name.is_empty() {
            payload["lastName"] = json!(last_name);
        }
        if !description.is_empty() {
            payload["description"] = json!(description);
        }

        info!(first_name, "updating profile");
        self.call(opcode::PROFILE, payload).await?;
        Ok(())
    }

    /// List the account's active device sessions.
    pub async fn get_sessions(&self) -> Result<Vec<SessionInfo>, ClientError> {
        info!("getting sessions");
        let response = self.call(opcode::SESSIONS_INFO, json!({})).await?;

        let mut sessions = Vec::new();
        if let Some(raw) = response.get("sessions").and_then(Value::as_array) {
            for value in raw {
                if let Ok(session) = serde_json::from_value::<SessionInfo>(value.clone()) {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }
}

fn parse_contacts(payload: &Value) -> Vec<User> {
    let mut contacts = Vec::new();
    if let Some(raw) = payload.get("contacts").and_then(Value::as_array) {
        for value in raw {
            if let Ok(user) = serde_json::from_value::<User>(value.clone()) {
                contacts.push(user);
            }
        }
    }
    contacts
}
