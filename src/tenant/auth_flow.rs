//! Interactive SMS authentication flow.
//!
//! `request_code` opens a pre-login session client, holds it in the
//! registry, and arms a 5-minute window; `confirm_code` and `register`
//! consume the window. An expired window unilaterally closes the client,
//! so later calls observe a missing auth session. Timers are keyed by
//! tenant id and serialized under one mutex, so a re-armed window cannot
//! race its own expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::auth::CodeConfirmation;
use crate::client::{ClientError, Event, EventKind, SessionClient, SessionConfig};
use crate::dispatch::Dispatcher;
use crate::tenant::registry::TenantRegistry;
use crate::tenant::{TenantCatalog, TenantPatch};

/// Window for completing an interactive code flow.
pub const AUTH_WINDOW: Duration = Duration::from_secs(300);

/// Result of a code confirmation as seen by the HTTP adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    LoggedIn { auth_token: String },
    RegistrationRequired { register_token: String },
}

/// Orchestrates pre-login clients and their expiry timers.
pub struct AuthFlow {
    session_config: SessionConfig,
    catalog: Arc<dyn TenantCatalog>,
    registry: Arc<TenantRegistry>,
    dispatcher: Arc<Dispatcher>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    window: Duration,
}

impl AuthFlow {
    pub fn new(
        session_config: SessionConfig,
        catalog: Arc<dyn TenantCatalog>,
        registry: Arc<TenantRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            session_config,
            catalog,
            registry,
            dispatcher,
            timers: Mutex::new(HashMap::new()),
            window: AUTH_WINDOW,
        }
    }

    /// Shorten the auth window (tests exercise expiry without a 5-minute
    /// sleep).
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Start the SMS flow: fresh device id, pre-login client, code request.
    /// Returns the temp token. Re-arming replaces any prior window.
    pub async fn request_code(
        self: &Arc<Self>,
        tenant_id: &str,
        phone: &str,
        language: &str,
    ) -> Result<String, ClientError> {
        let device_id = Uuid::new_v4().to_string();
        let client = SessionClient::new(self.session_config.clone(), device_id.clone());

        client.connect().await?;
        if let Err(e) = client.session_init(None).await {
            client.close().await;
            return Err(e);
        }
        let temp_token = match client.request_code(phone, language).await {
            Ok(token) => token,
            Err(e) => {
                client.close().await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .catalog
            .update(
                tenant_id,
                TenantPatch {
                    temp_token: Some(temp_token.clone()),
                    device_id: Some(device_id),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(tenant_id, error = %e, "failed to store temp token");
        }
        self.refresh_identity(tenant_id).await;

        // Hold the client open for the rest of the flow, replacing any
        // client from an earlier, unfinished attempt.
        if let Some(previous) = self.registry.client(tenant_id) {
            if previous.auth_token().is_empty() {
                previous.close().await;
            }
        }
        self.registry.set_client(tenant_id, client.clone());
        client.start_ping_loop();
        self.arm_timer(tenant_id);

        if let Some(link) = self.registry.link(tenant_id) {
            self.dispatcher
                .deliver(
                    &link,
                    &Event::synthetic(EventKind::AuthCodeSent, json!({"phone": phone})),
                )
                .await;
        }

        Ok(temp_token)
    }

    /// Verify the SMS code. Existing accounts yield the persistent
    /// credential and the pre-login client is closed; new accounts yield a
    /// registration ticket and the client stays open for `register`.
    pub async fn confirm_code(
        self: &Arc<Self>,
        tenant_id: &str,
        code: &str,
    ) -> Result<AuthOutcome, ClientError> {
        self.cancel_timer(tenant_id);

        if code.len() != 6 {
            return Err(ClientError::validation("verification code must be 6 digits"));
        }

        let tenant = self.pending_tenant(tenant_id, "no pending auth request").await?;
        let client = self
            .registry
            .client(tenant_id)
            .ok_or_else(|| ClientError::state("no active auth session"))?;

        match client.confirm_code(code, &tenant.temp_token).await? {
            CodeConfirmation::LoggedIn { auth_token } => {
                if let Err(e) = self
                    .catalog
                    .update(
                        tenant_id,
                        TenantPatch {
                            auth_token: Some(auth_token.clone()),
                            temp_token: Some(String::new()),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    warn!(tenant_id, error = %e, "failed to save auth token");
                }
                self.refresh_identity(tenant_id).await;

                // A fresh session client is built on the next connect; the
                // temp one is not reusable for a credentialed login.
                client.close().await;
                self.registry.delete_client(tenant_id);

                Ok(AuthOutcome::LoggedIn { auth_token })
            }
            CodeConfirmation::RegistrationRequired { register_token } => {
                if let Err(e) = self
                    .catalog
                    .update(
                        tenant_id,
                        TenantPatch {
                            temp_token: Some(register_token.clone()),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    warn!(tenant_id, error = %e, "failed to save register token");
                }
                self.refresh_identity(tenant_id).await;

                Ok(AuthOutcome::RegistrationRequired { register_token })
            }
        }
    }

    /// Complete registration for a new account; returns the persistent
    /// credential and closes the pre-login client.
    pub async fn register(
        self: &Arc<Self>,
        tenant_id: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<String, ClientError> {
        self.cancel_timer(tenant_id);

        let tenant = self.pending_tenant(tenant_id, "no pending registration").await?;
        let client = self
            .registry
            .client(tenant_id)
            .ok_or_else(|| ClientError::state("no active auth session"))?;

        let auth_token = client
            .register(first_name, last_name, &tenant.temp_token)
            .await?;

        if let Err(e) = self
            .catalog
            .update(
                tenant_id,
                TenantPatch {
                    auth_token: Some(auth_token.clone()),
                    temp_token: Some(String::new()),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(tenant_id, error = %e, "failed to save auth token");
        }
        self.refresh_identity(tenant_id).await;

        client.close().await;
        self.registry.delete_client(tenant_id);

        Ok(auth_token)
    }

    /// Abort an in-progress flow: cancel the window and close the
    /// pre-login client if one is held.
    pub async fn cancel(&self, tenant_id: &str) {
        self.cancel_timer(tenant_id);
        if let Some(client) = self.registry.client(tenant_id) {
            if client.auth_token().is_empty() {
                client.close().await;
                self.registry.delete_client(tenant_id);
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, tenant_id: &str) {
        let mut timers = self.timers.lock();
        if let Some(previous) = timers.remove(tenant_id) {
            previous.abort();
        }

        let flow = Arc::clone(self);
        let id = tenant_id.to_string();
        let window = self.window;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            info!(tenant_id = %id, "auth session timed out");
            if let Some(client) = flow.registry.client(&id) {
                client.close().await;
                flow.registry.delete_client(&id);
            }
            flow.timers.lock().remove(&id);
        });
        timers.insert(tenant_id.to_string(), handle);
    }

    fn cancel_timer(&self, tenant_id: &str) {
        if let Some(handle) = self.timers.lock().remove(tenant_id) {
            handle.abort();
        }
    }

    /// Tenant row with a live temp token, or the given state error.
    async fn pending_tenant(
        &self,
        tenant_id: &str,
        missing: &str,
    ) -> Result<crate::tenant::Tenant, ClientError> {
        let tenant = self
            .catalog
            .get_by_id(tenant_id)
            .await
            .map_err(|e| ClientError::state(format!("catalog read failed: {e}")))?
            .ok_or_else(|| ClientError::state(missing.to_string()))?;
        if tenant.temp_token.is_empty() {
            return Err(ClientError::state(missing.to_string()));
        }
        Ok(tenant)
    }

    /// Re-cache the identity row after a catalog mutation.
    async fn refresh_identity(&self, tenant_id: &str) {
        if let Ok(Some(tenant)) = self.catalog.get_by_id(tenant_id).await {
            self.registry.cache_identity(tenant);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::tenant::{MemoryCatalog, MemoryHistory, Tenant};

    fn flow(tenant: Option<Tenant>) -> (Arc<AuthFlow>, Arc<MemoryCatalog>) {
        let catalog = Arc::new(MemoryCatalog::new());
        if let Some(tenant) = tenant {
            catalog.insert(tenant);
        }
        let registry = Arc::new(TenantRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            catalog.clone(),
            registry.clone(),
            Arc::new(MemoryHistory::new()),
        ));
        let flow = Arc::new(AuthFlow::new(
            SessionConfig::default(),
            catalog.clone(),
            registry,
            dispatcher,
        ));
        (flow, catalog)
    }

    #[tokio::test]
    async fn test_confirm_without_request_is_a_state_error() {
        let (flow, _catalog) = flow(Some(Tenant {
            id: "t1".to_string(),
            ..Default::default()
        }));

        let err = flow.confirm_code("t1", "123456").await.unwrap_err();
        assert!(matches!(err, ClientError::State(_)));
    }

    #[tokio::test]
    async fn test_confirm_with_token_but_no_client_is_a_state_error() {
        let (flow, _catalog) = flow(Some(Tenant {
            id: "t1".to_string(),
            temp_token: "T".to_string(),
            ..Default::default()
        }));

        let err = flow.confirm_code("t1", "123456").await.unwrap_err();
        assert_eq!(err, ClientError::state("no active auth session"));
    }

    #[tokio::test]
    async fn test_confirm_rejects_short_code_before_state_checks() {
        let (flow, _catalog) = flow(None);
        let err = flow.confirm_code("ghost", "1234").await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[tokio::test]
    async fn test_register_without_pending_registration() {
        let (flow, _catalog) = flow(None);
        let err = flow.register("ghost", "John", "Doe").await.unwrap_err();
        assert!(matches!(err, ClientError::State(_)));
    }

    #[tokio::test]
    async fn test_cancel_without_flow_is_a_noop() {
        let (flow, _catalog) = flow(None);
        flow.cancel("nobody").await;
    }
}
