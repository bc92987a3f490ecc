//! Per-tenant supervised sessions.
//!
//! One supervisor task per tenant owns the session lifecycle: initial
//! connect+login, then a 1-second tick loop over {kill signal, connected
//! flag} that reconnects with a bounded retry budget. A companion drain
//! task consumes the session's event channel and feeds the dispatcher, so
//! per-tenant webhook delivery preserves the server's emission order.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::client::{Event, EventKind, SessionClient, SessionConfig};
use crate::dispatch::Dispatcher;
use crate::tenant::registry::{TenantLink, TenantRegistry};
use crate::tenant::{normalize_subscriptions, Tenant, TenantCatalog, TenantPatch};

/// Reconnect budget before the supervisor gives up on a tenant.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 120;

/// Pause between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const SUPERVISE_TICK: Duration = Duration::from_secs(1);

/// Supervisor states; each loop turn performs exactly one transition.
#[derive(Debug)]
enum Supervision {
    Connecting,
    Live,
    Reconnecting { attempt: u32 },
    Draining,
    Dead,
}

/// Owns the map of supervised sessions.
pub struct SessionManager {
    session_config: SessionConfig,
    catalog: Arc<dyn TenantCatalog>,
    registry: Arc<TenantRegistry>,
    dispatcher: Arc<Dispatcher>,
    reconnect_delay: Duration,
    supervise_tick: Duration,
}

impl SessionManager {
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
            reconnect_delay: RECONNECT_DELAY,
            supervise_tick: SUPERVISE_TICK,
        }
    }

    /// Shorten the retry pause (tests exercise the reconnect path without
    /// waiting out the production delay).
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn catalog(&self) -> &Arc<dyn TenantCatalog> {
        &self.catalog
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.session_config
    }

    /// Spawn supervised sessions for every tenant holding a credential.
    pub async fn bootstrap(self: &Arc<Self>) {
        let tenants = match self.catalog.list_with_credential().await {
            Ok(tenants) => tenants,
            Err(e) => {
                error!(error = %e, "failed to enumerate tenants on startup");
                return;
            }
        };

        info!(count = tenants.len(), "connecting saved sessions on startup");
        for tenant in tenants {
            self.registry.cache_identity(tenant.clone());
            self.spawn_session(tenant);
        }
    }

    /// Connect a tenant on request, replacing its subscription set.
    pub async fn connect(
        self: &Arc<Self>,
        tenant_id: &str,
        subscribe: Vec<String>,
    ) -> Result<(), crate::client::ClientError> {
        use crate::client::ClientError;

        if self.registry.is_connected(tenant_id) {
            return Err(ClientError::state("already connected"));
        }

        let tenant = self
            .catalog
            .get_by_id(tenant_id)
            .await
            .map_err(|e| ClientError::state(format!("catalog read failed: {e}")))?
            .ok_or_else(|| ClientError::state("tenant not found"))?;
        if tenant.auth_token.is_empty() {
            return Err(ClientError::state(
                "no auth token found, authenticate first",
            ));
        }

        let subscriptions = normalize_subscriptions(&subscribe);
        if let Err(e) = self
            .catalog
            .update(
                tenant_id,
                TenantPatch {
                    events: Some(subscriptions.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(tenant_id, error = %e, "could not persist subscriptions");
        }
        self.registry
            .update_identity(&tenant.access_token, |t| t.events = subscriptions.clone());

        let mut tenant = tenant;
        tenant.events = subscriptions;
        self.registry.cache_identity(tenant.clone());

        info!(tenant_id, "connecting to MP");
        self.spawn_session(tenant);
        Ok(())
    }

    /// Signal the supervisor to tear the session down, keeping the tenant.
    pub async fn disconnect(&self, tenant_id: &str) {
        self.registry.kill(tenant_id);
        if let Err(e) = self
            .catalog
            .update(
                tenant_id,
                TenantPatch {
                    connected: Some(false),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(tenant_id, error = %e, "failed to persist disconnected flag");
        }
    }

    /// Tenant-requested logout: best-effort LOGOUT upstream, then delete.
    /// The LoggedOut webhook is left to the server's own notification.
    pub async fn logout(self: &Arc<Self>, tenant_id: &str) {
        if let Some(client) = self.registry.client(tenant_id) {
            if client.is_connected() {
                client.logout().await;
            }
        }
        self.safe_delete(tenant_id, false).await;
    }

    /// Remove a tenant everywhere. Idempotent; safe against concurrent
    /// invocations from the logout path and the server-initiated path.
    pub async fn safe_delete(self: &Arc<Self>, tenant_id: &str, send_webhook: bool) {
        info!(tenant_id, send_webhook, "safe delete tenant");

        let tenant = match self.catalog.get_by_id(tenant_id).await {
            Ok(Some(tenant)) => Some(tenant),
            Ok(None) => None,
            Err(e) => {
                error!(tenant_id, error = %e, "failed to check tenant existence");
                None
            }
        };

        let Some(tenant) = tenant else {
            info!(tenant_id, "tenant already deleted");
            self.registry.cleanup(tenant_id);
            return;
        };

        // Webhook goes out while the identity is still cached.
        if send_webhook {
            if let Some(link) = self.registry.link(tenant_id) {
                self.dispatcher
                    .deliver(&link, &Event::synthetic(EventKind::LoggedOut, json!({})))
                    .await;
            }
        }

        self.registry.invalidate_identity(&tenant.access_token);

        if let Err(e) = self.catalog.delete(tenant_id).await {
            error!(tenant_id, error = %e, "failed to delete tenant from catalog");
        }

        // Best-effort kill before the channel is dropped; the supervisor
        // also observes the dropped channel and the connected flag.
        self.registry.kill(tenant_id);
        self.registry.cleanup(tenant_id);
    }

    /// Kill every active supervisor (process shutdown).
    pub fn shutdown(&self) {
        for tenant_id in self.registry.active_tenants() {
            self.registry.kill(&tenant_id);
        }
    }

    /// Spawn the supervised session task for a tenant.
    pub fn spawn_session(self: &Arc<Self>, tenant: Tenant) {
        let kill_rx = self.registry.create_kill_channel(&tenant.id);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_session(tenant, kill_rx).await;
        });
    }

    async fn run_session(self: Arc<Self>, tenant: Tenant, mut kill_rx: watch::Receiver<bool>) {
        let tenant_id = tenant.id.clone();
        info!(tenant_id, "starting MP session");

        let device_id = self.stable_device_id(&tenant).await;
        let client = SessionClient::new(self.session_config.clone(), device_id);
        let link = TenantLink::new(
            tenant.id.clone(),
            tenant.access_token.clone(),
            normalize_subscriptions(&tenant.events),
        );

        self.registry.set_client(&tenant_id, client.clone());
        self.registry.set_link(&tenant_id, link.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        client.set_event_sink(events_tx.clone());

        {
            let manager = Arc::clone(&self);
            let link = link.clone();
            tokio::spawn(async move {
                manager.drain_events(link, events_rx).await;
            });
        }

        let mut state = Supervision::Connecting;
        loop {
            state = match state {
                Supervision::Connecting => {
                    match client.connect_and_login(&tenant.auth_token, None).await {
                        Ok(sync) => {
                            self.persist_connected(
                                &tenant_id,
                                &tenant.access_token,
                                client.user_id(),
                            )
                            .await;
                            let _ = events_tx.send(sync_event(false, client.user_id(), sync));
                            info!(tenant_id, user_id = client.user_id(), "connected to MP");
                            Supervision::Live
                        }
                        Err(e) => {
                            error!(tenant_id, error = %e, "failed to connect to MP");
                            self.registry.cleanup(&tenant_id);
                            return;
                        }
                    }
                }

                Supervision::Live => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.supervise_tick) => {
                            if *kill_rx.borrow() {
                                Supervision::Draining
                            } else if client.is_connected() {
                                Supervision::Live
                            } else {
                                Supervision::Reconnecting { attempt: 1 }
                            }
                        }
                        changed = kill_rx.changed() => {
                            // A dropped channel means the registry entry is
                            // gone out from under us: treat as kill.
                            if changed.is_err() || *kill_rx.borrow() {
                                Supervision::Draining
                            } else {
                                Supervision::Live
                            }
                        }
                    }
                }

                Supervision::Reconnecting { attempt } if attempt > MAX_RECONNECT_ATTEMPTS => {
                    error!(tenant_id, attempt, "max reconnect attempts reached, giving up");
                    let _ = events_tx.send(Event::synthetic(
                        EventKind::Disconnected,
                        json!({"reason": "max_reconnect_attempts"}),
                    ));
                    Supervision::Dead
                }

                Supervision::Reconnecting { attempt } => {
                    warn!(
                        tenant_id,
                        attempt,
                        max = MAX_RECONNECT_ATTEMPTS,
                        "connection lost, attempting reconnect"
                    );

                    // Every 10th attempt (and the 1st) to avoid webhook flood.
                    if attempt == 1 || attempt % 10 == 0 {
                        let _ = events_tx.send(Event::synthetic(
                            EventKind::Reconnecting,
                            json!({"attempt": attempt, "max": MAX_RECONNECT_ATTEMPTS}),
                        ));
                    }

                    let killed = tokio::select! {
                        _ = tokio::time::sleep(self.reconnect_delay) => false,
                        changed = kill_rx.changed() => changed.is_err() || *kill_rx.borrow(),
                    };
                    if killed {
                        Supervision::Draining
                    } else {
                        // The account is already authenticated; reconnect
                        // via sync rather than a fresh login handshake.
                        match client.connect_and_sync(None).await {
                            Ok(sync) => {
                                info!(tenant_id, attempt, "reconnected successfully");
                                self.persist_connected(
                                    &tenant_id,
                                    &tenant.access_token,
                                    client.user_id(),
                                )
                                .await;
                                let _ =
                                    events_tx.send(sync_event(true, client.user_id(), sync));
                                Supervision::Live
                            }
                            Err(e) => {
                                error!(tenant_id, attempt, error = %e, "reconnect failed");
                                Supervision::Reconnecting {
                                    attempt: attempt + 1,
                                }
                            }
                        }
                    }
                }

                Supervision::Draining => {
                    info!(tenant_id, "received kill signal");
                    client.disconnect().await;
                    Supervision::Dead
                }

                Supervision::Dead => {
                    self.persist_disconnected(&tenant_id).await;
                    self.registry.cleanup(&tenant_id);
                    return;
                }
            };
        }
    }

    /// Drain a session's events into the dispatcher, in order. A
    /// server-initiated LoggedOut funnels into the delete path.
    async fn drain_events(
        self: Arc<Self>,
        link: Arc<TenantLink>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        while let Some(event) = events.recv().await {
            if event.kind == EventKind::LoggedOut && event.opcode != 0 {
                info!(tenant_id = %link.tenant_id, "session terminated by MP");
                self.safe_delete(&link.tenant_id, true).await;
                continue;
            }
            self.dispatcher.deliver(&link, &event).await;
        }
    }

    /// Mint and persist a device id on first use; stable afterwards.
    async fn stable_device_id(&self, tenant: &Tenant) -> String {
        if !tenant.device_id.is_empty() {
            return tenant.device_id.clone();
        }
        let device_id = Uuid::new_v4().to_string();
        if let Err(e) = self
            .catalog
            .update(
                &tenant.id,
                TenantPatch {
                    device_id: Some(device_id.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            error!(tenant_id = %tenant.id, error = %e, "failed to save device id");
        }
        device_id
    }

    async fn persist_connected(&self, tenant_id: &str, access_token: &str, mp_user_id: i64) {
        if let Err(e) = self
            .catalog
            .update(
                tenant_id,
                TenantPatch {
                    connected: Some(true),
                    mp_user_id: Some(mp_user_id),
                    ..Default::default()
                },
            )
            .await
        {
            error!(tenant_id, error = %e, "failed to persist connected flag");
        }
        self.registry.update_identity(access_token, |t| {
            t.connected = true;
            t.mp_user_id = mp_user_id;
        });
    }

    async fn persist_disconnected(&self, tenant_id: &str) {
        if let Err(e) = self
            .catalog
            .update(
                tenant_id,
                TenantPatch {
                    connected: Some(false),
                    ..Default::default()
                },
            )
            .await
        {
            error!(tenant_id, error = %e, "failed to persist disconnected flag");
        }
    }
}

/// The Sync event carries the raw sync payload plus the reconnect flag and
/// the authenticated MP user id.
fn sync_event(reconnect: bool, mp_user_id: i64, sync: Value) -> Event {
    let mut payload = match sync {
        Value::Object(map) => Value::Object(map),
        other => json!({"sync": other}),
    };
    payload["reconnect"] = json!(reconnect);
    payload["maxUserID"] = json!(mp_user_id);
    Event::synthetic(EventKind::Sync, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::{MemoryCatalog, MemoryHistory};

    fn manager_with(tenant: Option<Tenant>) -> (Arc<SessionManager>, Arc<MemoryCatalog>) {
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
        let manager = Arc::new(SessionManager::new(
            SessionConfig::default(),
            catalog.clone(),
            registry,
            dispatcher,
        ));
        (manager, catalog)
    }

    fn tenant(id: &str) -> Tenant {
        Tenant {
            id: id.to_string(),
            access_token: format!("tok-{id}"),
            auth_token: "AUTH".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_safe_delete_is_idempotent() {
        let (manager, catalog) = manager_with(Some(tenant("t1")));

        manager.safe_delete("t1", false).await;
        assert!(catalog.get_by_id("t1").await.unwrap().is_none());
        assert!(manager.registry().client("t1").is_none());

        // Second call sees the same terminal state.
        manager.safe_delete("t1", false).await;
        assert!(catalog.get_by_id("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_safe_delete_clears_identity_cache() {
        let (manager, _catalog) = manager_with(Some(tenant("t1")));
        manager.registry().cache_identity(tenant("t1"));

        manager.safe_delete("t1", false).await;

        assert!(manager.registry().identity("tok-t1").is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_credential() {
        let mut t = tenant("t1");
        t.auth_token = String::new();
        let (manager, _catalog) = manager_with(Some(t));

        let err = manager.connect("t1", vec![]).await.unwrap_err();
        assert!(matches!(err, crate::client::ClientError::State(_)));
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_tenant() {
        let (manager, _catalog) = manager_with(None);
        let err = manager.connect("ghost", vec![]).await.unwrap_err();
        assert!(matches!(err, crate::client::ClientError::State(_)));
    }

    #[tokio::test]
    async fn test_disconnect_persists_flag() {
        let mut t = tenant("t1");
        t.connected = true;
        let (manager, catalog) = manager_with(Some(t));

        manager.disconnect("t1").await;

        assert!(!catalog.get_by_id("t1").await.unwrap().unwrap().connected);
    }

    #[test]
    fn test_sync_event_shape() {
        let event = sync_event(true, 42, json!({"chats": [], "profile": {}}));
        assert_eq!(event.kind, EventKind::Sync);
        assert_eq!(event.payload["reconnect"], true);
        assert_eq!(event.payload["maxUserID"], 42);
        assert!(event.payload.get("chats").is_some());
    }

    #[test]
    fn test_sync_event_wraps_non_object_payload() {
        let event = sync_event(false, 1, Value::Null);
        assert_eq!(event.payload["reconnect"], false);
        assert_eq!(event.payload["sync"], Value::Null);
    }
}
