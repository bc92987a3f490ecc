//! Event dispatch and webhook delivery.
//!
//! For every classified event the dispatcher resolves the tenant's
//! subscriptions and webhook URL (identity cache first, catalog as
//! fallback), filters, and POSTs the serialized event to the tenant
//! webhook. Global webhook and queue fanout are fire-and-forget; a webhook
//! failure is logged and never aborts anything.
//!
//! Per tenant, events arriving from one receive task are delivered to the
//! tenant webhook in source order: the manager drains one event channel per
//! tenant and awaits each delivery. Fanout ordering across tenants is
//! unspecified.

pub mod history;
pub mod media;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::{Event, EventKind};
use crate::protocol::types::message_from_payload;
use crate::tenant::registry::{TenantLink, TenantRegistry};
use crate::tenant::{normalize_subscriptions, HistoryStore, Tenant, TenantCatalog};

/// Bound on webhook POSTs.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Tuple published to the global webhook and queue.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutEnvelope {
    pub json_data: String,
    pub token: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    pub instance_name: String,
}

/// Object-store side-channel for message media. The store returns the
/// reference object embedded into the webhook payload.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn store(
        &self,
        tenant_id: &str,
        chat_id: &str,
        message_id: &str,
        filename: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> Result<Value, String>;
}

/// Global message-queue fanout.
#[async_trait]
pub trait QueueSink: Send + Sync {
    async fn publish(&self, envelope: &FanoutEnvelope) -> Result<(), String>;
}

/// The webhook delivery pipeline.
pub struct Dispatcher {
    http: reqwest::Client,
    catalog: Arc<dyn TenantCatalog>,
    registry: Arc<TenantRegistry>,
    history: Arc<dyn HistoryStore>,
    object_store: Option<Arc<dyn ObjectStore>>,
    queue: Option<Arc<dyn QueueSink>>,
    global_webhook: Option<String>,
    skip_media: bool,
}

impl Dispatcher {
    pub fn new(
        catalog: Arc<dyn TenantCatalog>,
        registry: Arc<TenantRegistry>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            catalog,
            registry,
            history,
            object_store: None,
            queue: None,
            global_webhook: None,
            skip_media: false,
        }
    }

    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn QueueSink>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_global_webhook(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        if !url.is_empty() {
            self.global_webhook = Some(url);
        }
        self
    }

    pub fn with_skip_media(mut self, skip: bool) -> Self {
        self.skip_media = skip;
        self
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn object_store(&self) -> Option<&Arc<dyn ObjectStore>> {
        self.object_store.as_ref()
    }

    /// Deliver one event for one tenant. Never fails; all errors are
    /// logged and swallowed.
    pub async fn deliver(&self, link: &TenantLink, event: &Event) {
        if event.kind == EventKind::Unknown {
            debug!(opcode = event.opcode, "dropping unmapped event");
            return;
        }

        let Some(identity) = self.resolve_identity(link).await else {
            warn!(tenant_id = %link.tenant_id, "no identity for tenant, dropping event");
            return;
        };

        // The catalog is the source of truth for subscriptions; refresh the
        // live link so admin mutations apply without a reconnect.
        let subscriptions = normalize_subscriptions(&identity.events);
        link.set_subscriptions(subscriptions.clone());

        if !is_subscribed(&subscriptions, event.kind) {
            debug!(
                tenant_id = %link.tenant_id,
                kind = %event.kind,
                "skipping webhook, tenant not subscribed"
            );
            return;
        }

        let mut body = event.webhook_payload();

        if event.kind == EventKind::Message {
            if let Some(message) = message_from_payload(&event.payload) {
                if !self.skip_media && !message.attaches.is_empty() {
                    media::augment(self, &identity, &message, &mut body).await;
                }
                if identity.history_limit > 0 && !message.text.is_empty() {
                    history::record(self.history.as_ref(), &identity, &message).await;
                }
            }
        }

        if identity.webhook_url.is_empty() {
            warn!(tenant_id = %link.tenant_id, "no webhook set for tenant");
        } else {
            self.post_tenant_webhook(&identity, &body).await;
        }

        self.fanout(&identity, &body);
    }

    /// Identity cache first, catalog fallback (which repopulates the cache).
    async fn resolve_identity(&self, link: &TenantLink) -> Option<Tenant> {
        if let Some(tenant) = self.registry.identity(&link.access_token) {
            return Some(tenant);
        }
        match self.catalog.get_by_token(&link.access_token).await {
            Ok(Some(tenant)) => {
                self.registry.cache_identity(tenant.clone());
                Some(tenant)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(tenant_id = %link.tenant_id, error = %e, "catalog lookup failed");
                None
            }
        }
    }

    async fn post_tenant_webhook(&self, identity: &Tenant, body: &Value) {
        if let Err(e) = url::Url::parse(&identity.webhook_url) {
            warn!(tenant_id = %identity.id, error = %e, "invalid tenant webhook URL");
            return;
        }

        info!(tenant_id = %identity.id, url = %identity.webhook_url, "calling tenant webhook");
        let result = self
            .http
            .post(&identity.webhook_url)
            .header("X-Tenant-Id", identity.id.as_str())
            .header("X-Instance-Name", identity.name.as_str())
            .json(body)
            .timeout(WEBHOOK_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(
                    tenant_id = %identity.id,
                    status = %response.status(),
                    "tenant webhook returned failure status"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(tenant_id = %identity.id, error = %e, "tenant webhook call failed");
            }
        }
    }

    /// Fire-and-forget fanout to the global webhook and queue.
    fn fanout(&self, identity: &Tenant, body: &Value) {
        if self.global_webhook.is_none() && self.queue.is_none() {
            return;
        }

        let envelope = FanoutEnvelope {
            json_data: body.to_string(),
            token: identity.access_token.clone(),
            user_id: identity.id.clone(),
            instance_name: identity.name.clone(),
        };

        if let Some(url) = self.global_webhook.clone() {
            let http = self.http.clone();
            let envelope = envelope.clone();
            tokio::spawn(async move {
                info!(url = %url, "calling global webhook");
                let result = http
                    .post(&url)
                    .json(&envelope)
                    .timeout(WEBHOOK_TIMEOUT)
                    .send()
                    .await;
                if let Err(e) = result {
                    warn!(error = %e, "global webhook call failed");
                }
            });
        }

        if let Some(queue) = self.queue.clone() {
            tokio::spawn(async move {
                if let Err(e) = queue.publish(&envelope).await {
                    warn!(error = %e, "queue publish failed");
                }
            });
        }
    }
}

/// Subscription check: explicit kind or the `All` wildcard.
pub fn is_subscribed(subscriptions: &[String], kind: EventKind) -> bool {
    subscriptions
        .iter()
        .any(|s| s == kind.as_str() || s == "All")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::{MemoryCatalog, MemoryHistory};
    use serde_json::json;

    fn tenant(events: &[&str], history_limit: u32) -> Tenant {
        Tenant {
            id: "t1".to_string(),
            name: "alpha".to_string(),
            access_token: "tok".to_string(),
            events: events.iter().map(|s| s.to_string()).collect(),
            history_limit,
            ..Default::default()
        }
    }

    fn pipeline(
        t: Tenant,
    ) -> (Dispatcher, Arc<TenantRegistry>, Arc<MemoryHistory>, Arc<TenantLink>) {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert(t.clone());
        let registry = Arc::new(TenantRegistry::new());
        let history = Arc::new(MemoryHistory::new());
        let link = TenantLink::new(t.id.clone(), t.access_token.clone(), vec![]);
        let dispatcher = Dispatcher::new(catalog, registry.clone(), history.clone());
        (dispatcher, registry, history, link)
    }

    fn message_event(chat_id: i64, message_id: &str, text: &str) -> Event {
        Event {
            kind: EventKind::Message,
            opcode: crate::protocol::opcode::NOTIF_MESSAGE,
            payload: json!({
                "chatId": chat_id,
                "message": {"id": message_id, "sender": 9, "text": text, "time": 1000}
            }),
        }
    }

    #[test]
    fn test_is_subscribed() {
        let subs = vec!["Message".to_string(), "ReadReceipt".to_string()];
        assert!(is_subscribed(&subs, EventKind::Message));
        assert!(!is_subscribed(&subs, EventKind::Typing));
        assert!(is_subscribed(&["All".to_string()], EventKind::Typing));
        assert!(!is_subscribed(&[], EventKind::Message));
    }

    #[tokio::test]
    async fn test_deliver_writes_history_for_subscribed_message() {
        let (dispatcher, _registry, history, link) = pipeline(tenant(&["Message"], 5));

        dispatcher.deliver(&link, &message_event(7, "m1", "hello")).await;

        let records = history.records_for("t1", "7");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "hello");
        assert_eq!(records[0].sender_id, "9");
    }

    #[tokio::test]
    async fn test_deliver_skips_unsubscribed_kind() {
        let (dispatcher, _registry, history, link) = pipeline(tenant(&["ReadReceipt"], 5));

        dispatcher.deliver(&link, &message_event(7, "m1", "hello")).await;

        assert!(history.records_for("t1", "7").is_empty());
    }

    #[tokio::test]
    async fn test_deliver_refreshes_link_subscriptions() {
        let (dispatcher, _registry, _history, link) = pipeline(tenant(&["Message"], 0));
        assert!(link.subscriptions().is_empty());

        dispatcher.deliver(&link, &message_event(1, "m", "x")).await;

        assert_eq!(link.subscriptions(), vec!["Message"]);
    }

    #[tokio::test]
    async fn test_history_limit_zero_disables_persistence() {
        let (dispatcher, _registry, history, link) = pipeline(tenant(&["All"], 0));

        dispatcher.deliver(&link, &message_event(7, "m1", "hello")).await;

        assert!(history.records_for("t1", "7").is_empty());
    }

    #[tokio::test]
    async fn test_deliver_drops_unknown_kind() {
        let (dispatcher, _registry, history, link) = pipeline(tenant(&["All"], 5));
        let event = Event {
            kind: EventKind::Unknown,
            opcode: 999,
            payload: json!({}),
        };

        dispatcher.deliver(&link, &event).await;
        assert!(history.records_for("t1", "7").is_empty());
    }

    #[tokio::test]
    async fn test_identity_cache_populated_on_first_delivery() {
        let (dispatcher, registry, _history, link) = pipeline(tenant(&["Message"], 0));
        assert!(registry.identity("tok").is_none());

        dispatcher.deliver(&link, &message_event(1, "m", "x")).await;

        assert!(registry.identity("tok").is_some());
    }
}
