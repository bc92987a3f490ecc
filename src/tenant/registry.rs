//! Tenant registry.
//!
//! The only process-wide mutable state in the gateway: active session
//! clients, their dispatch links, the kill channels for the supervisors,
//! and the identity cache (access-token → tenant row) that spares the
//! catalog a read on every inbound call.
//!
//! Lock order when more than one is needed: registry → session-internal.
//! Nothing here is held across network I/O.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use crate::client::SessionClient;
use crate::tenant::Tenant;

/// Dispatcher-ready metadata for one tenant session.
pub struct TenantLink {
    pub tenant_id: String,
    pub access_token: String,
    subscriptions: RwLock<Vec<String>>,
}

impl TenantLink {
    pub fn new(
        tenant_id: impl Into<String>,
        access_token: impl Into<String>,
        subscriptions: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tenant_id: tenant_id.into(),
            access_token: access_token.into(),
            subscriptions: RwLock::new(subscriptions),
        })
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().clone()
    }

    pub fn set_subscriptions(&self, subscriptions: Vec<String>) {
        *self.subscriptions.write() = subscriptions;
    }
}

/// Concurrent map of active tenants, plus the identity cache.
#[derive(Default)]
pub struct TenantRegistry {
    clients: RwLock<HashMap<String, Arc<SessionClient>>>,
    links: RwLock<HashMap<String, Arc<TenantLink>>>,
    kills: RwLock<HashMap<String, watch::Sender<bool>>>,
    identities: RwLock<HashMap<String, Tenant>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_client(&self, tenant_id: &str, client: Arc<SessionClient>) {
        self.clients.write().insert(tenant_id.to_string(), client);
    }

    pub fn client(&self, tenant_id: &str) -> Option<Arc<SessionClient>> {
        self.clients.read().get(tenant_id).cloned()
    }

    pub fn delete_client(&self, tenant_id: &str) -> Option<Arc<SessionClient>> {
        self.clients.write().remove(tenant_id)
    }

    pub fn set_link(&self, tenant_id: &str, link: Arc<TenantLink>) {
        self.links.write().insert(tenant_id.to_string(), link);
    }

    pub fn link(&self, tenant_id: &str) -> Option<Arc<TenantLink>> {
        self.links.read().get(tenant_id).cloned()
    }

    /// Replace a live session's subscription set without reconnecting.
    pub fn update_subscriptions(&self, tenant_id: &str, subscriptions: Vec<String>) {
        if let Some(link) = self.link(tenant_id) {
            link.set_subscriptions(subscriptions);
        }
    }

    /// Create and register the kill channel for a supervisor. Replaces any
    /// prior channel for the tenant.
    pub fn create_kill_channel(&self, tenant_id: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.kills.write().insert(tenant_id.to_string(), tx);
        rx
    }

    /// Non-blocking, best-effort kill signal. A missed send is tolerated:
    /// the supervisor also polls the connected flag.
    pub fn kill(&self, tenant_id: &str) {
        if let Some(tx) = self.kills.read().get(tenant_id) {
            let _ = tx.send(true);
            debug!(tenant_id, "kill signal sent");
        }
    }

    pub fn is_connected(&self, tenant_id: &str) -> bool {
        self.client(tenant_id)
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// Drop every registry entry for a tenant. Idempotent.
    pub fn cleanup(&self, tenant_id: &str) {
        self.clients.write().remove(tenant_id);
        self.links.write().remove(tenant_id);
        self.kills.write().remove(tenant_id);
    }

    pub fn active_tenants(&self) -> Vec<String> {
        self.kills.read().keys().cloned().collect()
    }

    /// Cache an identity row keyed by its access token.
    pub fn cache_identity(&self, tenant: Tenant) {
        if tenant.access_token.is_empty() {
            return;
        }
        self.identities
            .write()
            .insert(tenant.access_token.clone(), tenant);
    }

    pub fn identity(&self, access_token: &str) -> Option<Tenant> {
        self.identities.read().get(access_token).cloned()
    }

    /// Mutate a cached identity in place (admin mutations update the cache
    /// rather than invalidating it).
    pub fn update_identity(&self, access_token: &str, update: impl FnOnce(&mut Tenant)) {
        if let Some(tenant) = self.identities.write().get_mut(access_token) {
            update(tenant);
        }
    }

    pub fn invalidate_identity(&self, access_token: &str) {
        self.identities.write().remove(access_token);
    }
}
