//! Scripted auth and sync exchanges.
//!
//! Ordering contract: `session_init` must succeed on a fresh transport
//! before any credentialed call; `confirm_code` must follow a
//! `request_code` on the same client, because the temp token is bound to
//! that transport.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::client::error::ClientError;
use crate::client::SessionClient;
use crate::protocol::opcode;
use crate::protocol::types::{Chat, Me, User, UserAgent};
use crate::protocol::AuthType;

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?\d{10,15}$").expect("phone regex"));

/// Check the tenant-supplied phone number format.
pub fn validate_phone(phone: &str) -> bool {
    PHONE_RE.is_match(phone)
}

/// Outcome of a code confirmation: either a persistent credential for an
/// existing account, or a registration ticket for a new one.
#[derive(Debug, Clone, PartialEq)]
pub enum CodeConfirmation {
    LoggedIn { auth_token: String },
    RegistrationRequired { register_token: String },
}

impl SessionClient {
    /// Initialize the server session. Must precede any credentialed request
    /// on a new transport.
    pub async fn session_init(&self, user_agent: Option<UserAgent>) -> Result<(), ClientError> {
        let user_agent = user_agent.unwrap_or_default();
        let payload = json!({
            "deviceId": self.device_id(),
            "userAgent": user_agent,
        });

        // The response carries server config data the gateway does not need.
        self.call(opcode::SESSION_INIT, payload).await?;
        info!("session initialized");
        Ok(())
    }

    /// Request an SMS verification code. Returns the temp token that binds
    /// the rest of the flow to this client.
    pub async fn request_code(&self, phone: &str, language: &str) -> Result<String, ClientError> {
        if !validate_phone(phone) {
            return Err(ClientError::validation("invalid phone number format"));
        }
        let language = if language.is_empty() { "ru" } else { language };

        info!(phone, "requesting auth code");
        let payload = json!({
            "phone": phone,
            "type": AuthType::StartAuth.as_str(),
            "language": language,
        });
        let response = self.call(opcode::AUTH_REQUEST, payload).await?;

        match response.get("token").and_then(Value::as_str) {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            _ => Err(ClientError::protocol("no_token", "no token in response")),
        }
    }

    /// Submit the SMS code. The server answers with either a LOGIN token
    /// (existing account) or a REGISTER token (registration needed).
    pub async fn confirm_code(
        &self,
        code: &str,
        temp_token: &str,
    ) -> Result<CodeConfirmation, ClientError> {
        if code.len() != 6 {
            return Err(ClientError::validation("verification code must be 6 digits"));
        }

        info!("submitting verification code");
        let payload = json!({
            "token": temp_token,
            "verifyCode": code,
            "authTokenType": AuthType::CheckCode.as_str(),
        });
        let response = self.call(opcode::AUTH, payload).await?;

        let attrs = response
            .get("tokenAttrs")
            .ok_or_else(|| ClientError::protocol("invalid_response", "no tokenAttrs in response"))?;

        if let Some(token) = attrs
            .pointer("/LOGIN/token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
        {
            info!("login successful, existing account");
            return Ok(CodeConfirmation::LoggedIn {
                auth_token: token.to_string(),
            });
        }

        if let Some(token) = attrs
            .pointer("/REGISTER/token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
        {
            info!("registration required, new account");
            return Ok(CodeConfirmation::RegistrationRequired {
                register_token: token.to_string(),
            });
        }

        Err(ClientError::protocol("no_token", "no valid token in response"))
    }

    /// Complete registration for a new account; returns the persistent
    /// credential.
    pub async fn register(
        &self,
        first_name: &str,
        last_name: &str,
        register_token: &str,
    ) -> Result<String, ClientError> {
        if first_name.is_empty() {
            return Err(ClientError::validation("first name is required"));
        }

        let mut payload = json!({
            "firstName": first_name,
            "token": register_token,
            "tokenType": AuthType::Register.as_str(),
        });
        if !last_name.is_empty() {
            payload["lastName"] = json!(last_name);
        }

        info!(first_name, "completing registration");
        let response = self.call(opcode::AUTH_CONFIRM, payload).await?;

        match response.get("token").and_then(Value::as_str) {
            Some(token) if !token.is_empty() => {
                info!("registration completed");
                Ok(token.to_string())
            }
            _ => Err(ClientError::protocol("no_token", "no token in response")),
        }
    }

    /// Log in with the persistent credential and return the server's sync
    /// payload, augmented with hydrated contacts for chat participants the
    /// sync left partial.
    pub async fn login(self: &Arc<Self>, auth_token: &str) -> Result<Value, ClientError> {
        *self.auth_token.write() = auth_token.to_string();

        info!("logging in with auth token");
        let payload = self.sync_payload(auth_token);
        let response = self.call(opcode::LOGIN, payload).await?;
        self.absorb_sync(response).await
    }

    /// Re-sync an already-authenticated session after a reconnect. Same
    /// shape as login, distinct opcode.
    pub async fn sync(self: &Arc<Self>) -> Result<Value, ClientError> {
        let token = self.auth_token();
        if token.is_empty() {
            return Err(ClientError::state("no credential to sync with"));
        }

        info!("syncing session");
        let payload = self.sync_payload(&token);
        let response = self.call(opcode::SYNC, payload).await?;
        self.absorb_sync(response).await
    }

    /// Best-effort logout: send LOGOUT, clear identity, close the client.
    pub async fn logout(&self) {
        if self.is_connected() {
            info!("logging out");
            if let Err(e) = self.call(opcode::LOGOUT, json!({})).await {
                warn!(error = %e, "logout request failed");
            }
        }

        *self.auth_token.write() = String::new();
        *self.me.write() = None;
        self.user_id.store(0, std::sync::atomic::Ordering::SeqCst);

        self.close().await;
    }

    /// Connect, initialize the session, log in and start the keepalive loop.
    pub async fn connect_and_login(
        self: &Arc<Self>,
        auth_token: &str,
        user_agent: Option<UserAgent>,
    ) -> Result<Value, ClientError> {
        self.connect().await?;

        if let Err(e) = self.session_init(user_agent).await {
            self.close().await;
            return Err(e);
        }

        match self.login(auth_token).await {
            Ok(sync) => {
                self.start_ping_loop();
                Ok(sync)
            }
            Err(e) => {
                self.close().await;
                Err(e)
            }
        }
    }

    /// Reconnect path: connect, initialize, sync with the retained
    /// credential, restart the keepalive loop.
    pub async fn connect_and_sync(
        self: &Arc<Self>,
        user_agent: Option<UserAgent>,
    ) -> Result<Value, ClientError> {
        self.connect().await?;

        if let Err(e) = self.session_init(user_agent).await {
            self.close().await;
            return Err(e);
        }

        match self.sync().await {
            Ok(sync) => {
                self.start_ping_loop();
                Ok(sync)
            }
            Err(e) => {
                self.close().await;
                Err(e)
            }
        }
    }

    fn sync_payload(&self, token: &str) -> Value {
        json!({
            "token": token,
            "interactive": true,
            "chatsSync": 0,
            "contactsSync": 0,
            "presenceSync": 0,
            "draftsSync": 0,
            "chatsCount": 40,
        })
    }

    /// Record the profile, cache sync contacts, and hydrate chat
    /// participants missing from the contact list. The (augmented) payload
    /// is returned verbatim for the Sync webhook.
    async fn absorb_sync(self: &Arc<Self>, mut response: Value) -> Result<Value, ClientError> {
        if let Some(contact) = response.pointer("/profile/contact") {
            if let Ok(me) = serde_json::from_value::<Me>(contact.clone()) {
                info!(user_id = me.id, "authenticated");
                self.user_id.store(me.id, std::sync::atomic::Ordering::SeqCst);
                *self.me.write() = Some(me);
            }
        }

        if let Some(contacts) = response.get("contacts").and_then(Value::as_array) {
            for raw in contacts {
                if let Ok(user) = serde_json::from_value::<User>(raw.clone()) {
                    self.cache_user(user);
                }
            }
        }

        let missing = self.uncached_participants(&response);
        if !missing.is_empty() {
            match self.get_users(&missing).await {
                Ok(hydrated) => {
                    let has_contacts = response
                        .get("contacts")
                        .map(Value::is_array)
                        .unwrap_or(false);
                    if has_contacts {
                        if let Some(contacts) =
                            response.get_mut("contacts").and_then(Value::as_array_mut)
                        {
                            for user in &hydrated {
                                if let Ok(value) = serde_json::to_value(user) {
                                    contacts.push(value);
                                }
                            }
                        }
                    } else if let Some(map) = response.as_object_mut() {
                        map.insert(
                            "contacts".to_string(),
                            serde_json::to_value(&hydrated).unwrap_or(Value::Null),
                        );
                    }
                }
                Err(e) => warn!(error = %e, "failed to hydrate sync contacts"),
            }
        }

        Ok(response)
    }

    /// Participant ids referenced by the sync chats but absent from the
    /// contact cache.
    fn uncached_participants(&self, sync: &Value) -> Vec<i64> {
        let mut missing = Vec::new();
        let Some(chats) = sync.get("chats").and_then(Value::as_array) else {
            return missing;
        };
        for raw in chats {
            let Ok(chat) = serde_json::from_value::<Chat>(raw.clone()) else {
                continue;
            };
            for key in chat.participants.keys() {
                let Ok(id) = key.parse::<i64>() else { continue };
                if self.cached_user(id).is_none() && !missing.contains(&id) {
                    missing.push(id);
                }
            }
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_phone() {
        assert!(validate_phone("+79001234567"));
        assert!(validate_phone("79001234567"));
        assert!(validate_phone("1234567890"));
        assert!(!validate_phone("+abc"));
        assert!(!validate_phone("123"));
        assert!(!validate_phone("+1234567890123456"));
        assert!(!validate_phone(""));
    }

    #[tokio::test]
    async fn test_request_code_rejects_bad_phone_locally() {
        let client = SessionClient::new(crate::client::SessionConfig::default(), "dev");
        let err = client.request_code("+abc", "ru").await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[tokio::test]
    async fn test_confirm_code_rejects_short_code_locally() {
        let client = SessionClient::new(crate::client::SessionConfig::default(), "dev");
        let err = client.confirm_code("1234", "T").await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[tokio::test]
    async fn test_register_requires_first_name() {
        let client = SessionClient::new(crate::client::SessionConfig::default(), "dev");
        let err = client.register("", "Doe", "R").await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[tokio::test]
    async fn test_sync_without_credential_is_a_state_error() {
        let client = SessionClient::new(crate::client::SessionConfig::default(), "dev");
        let err = client.sync().await.unwrap_err();
        assert!(matches!(err, ClientError::State(_)));
    }
}
