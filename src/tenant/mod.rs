//! Tenant model and persistence contracts.
//!
//! The core treats tenant persistence as cache-like operational state: it
//! only requires a key-value contract ([`TenantCatalog`]) and a bounded
//! message-history contract ([`HistoryStore`]). SQL adapters live outside
//! the core; in-memory implementations are provided for bootstrap and tests.

pub mod auth_flow;
pub mod manager;
pub mod registry;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::EventKind;

/// How message media is embedded into webhook payloads for a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaMode {
    None,
    #[default]
    Base64,
    /// Upload to the configured object store and embed a reference.
    #[serde(rename = "s3")]
    ObjectStore,
    Both,
}

impl MediaMode {
    pub fn parse(value: &str) -> Self {
        match value {
            "none" => Self::None,
            "s3" => Self::ObjectStore,
            "both" => Self::Both,
            _ => Self::Base64,
        }
    }

    pub fn wants_base64(&self) -> bool {
        matches!(self, Self::Base64 | Self::Both)
    }

    pub fn wants_object_store(&self) -> bool {
        matches!(self, Self::ObjectStore | Self::Both)
    }
}

/// One API consumer: a logical MP account served by the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    /// Bearer token used by the HTTP adapter.
    pub access_token: String,
    /// Persistent MP credential; empty until the SMS flow completes.
    pub auth_token: String,
    /// Stable across reconnects and restarts.
    pub device_id: String,
    /// Short-lived token between requestCode and confirmCode.
    pub temp_token: String,
    pub webhook_url: String,
    /// Subscribed event kinds; `"All"` is a wildcard.
    pub events: Vec<String>,
    pub connected: bool,
    /// MP user id once authenticated.
    pub mp_user_id: i64,
    /// Messages kept per chat; 0 disables history persistence.
    pub history_limit: u32,
    pub media_mode: MediaMode,
}

/// Partial update applied to a tenant row. Unset fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct TenantPatch {
    pub auth_token: Option<String>,
    pub device_id: Option<String>,
    pub temp_token: Option<String>,
    pub webhook_url: Option<String>,
    pub events: Option<Vec<String>>,
    pub connected: Option<bool>,
    pub mp_user_id: Option<i64>,
    pub history_limit: Option<u32>,
    pub media_mode: Option<MediaMode>,
}

impl TenantPatch {
    pub fn apply(&self, tenant: &mut Tenant) {
        if let Some(v) = &self.auth_token {
            tenant.auth_token = v.clone();
        }
        if let Some(v) = &self.device_id {
            tenant.device_id = v.clone();
        }
        if let Some(v) = &self.temp_token {
            tenant.temp_token = v.clone();
        }
        if let Some(v) = &self.webhook_url {
            tenant.webhook_url = v.clone();
        }
        if let Some(v) = &self.events {
            tenant.events = v.clone();
        }
        if let Some(v) = self.connected {
            tenant.connected = v;
        }
        if let Some(v) = self.mp_user_id {
            tenant.mp_user_id = v;
        }
        if let Some(v) = self.history_limit {
            tenant.history_limit = v;
        }
        if let Some(v) = self.media_mode {
            tenant.media_mode = v;
        }
    }
}

/// Persistence errors. The owning operation logs these; a catalog failure
/// never fails a gateway operation whose MP side succeeded.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("tenant not found: {0}")]
    NotFound(String),

    #[error("duplicate record")]
    Duplicate,

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Key-value contract over the tenant catalog.
#[async_trait]
pub trait TenantCatalog: Send + Sync {
    async fn get_by_token(&self, access_token: &str) -> Result<Option<Tenant>, PersistenceError>;
    async fn get_by_id(&self, tenant_id: &str) -> Result<Option<Tenant>, PersistenceError>;
    async fn update(&self, tenant_id: &str, patch: TenantPatch) -> Result<(), PersistenceError>;
    /// Tenants whose persistent credential is non-empty.
    async fn list_with_credential(&self) -> Result<Vec<Tenant>, PersistenceError>;
    async fn delete(&self, tenant_id: &str) -> Result<(), PersistenceError>;
}

/// One persisted history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub tenant_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub message_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub message_type: String,
    pub text: String,
    pub media_link: String,
    pub reply_to_id: String,
}

/// Bounded per-chat message history. Uniqueness on (tenant, message id).
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: HistoryRecord) -> Result<(), PersistenceError>;
    /// Keep only the `limit` newest rows by timestamp for this tenant+chat.
    async fn trim(&self, tenant_id: &str, chat_id: &str, limit: usize)
        -> Result<(), PersistenceError>;
}

/// Validate and normalize a subscription list: unknown kinds are dropped,
/// duplicates removed, `"All"` passes through as the wildcard.
pub fn normalize_subscriptions(requested: &[String]) -> Vec<String> {
    let mut subscriptions = Vec::new();
    for raw in requested {
        let kind = raw.trim();
        if kind.is_empty() {
            continue;
        }
        let valid = kind == "All" || EventKind::subscribable().contains(&kind);
        if valid && !subscriptions.iter().any(|s| s == kind) {
            subscriptions.push(kind.to_string());
        }
    }
    subscriptions
}

/// Comma-joined form used at the catalog boundary.
pub fn events_to_string(events: &[String]) -> String {
    events.join(",")
}

pub fn events_from_string(value: &str) -> Vec<String> {
    normalize_subscriptions(
        &value
            .split(',')
            .map(|s| s.to_string())
            .collect::<Vec<_>>(),
    )
}

/// In-memory tenant catalog.
#[derive(Default)]
pub struct MemoryCatalog {
    tenants: RwLock<HashMap<String, Tenant>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant: Tenant) {
        self.tenants.write().insert(tenant.id.clone(), tenant);
    }
}

#[async_trait]
impl TenantCatalog for MemoryCatalog {
    async fn get_by_token(&self, access_token: &str) -> Result<Option<Tenant>, PersistenceError> {
        Ok(self
            .tenants
            .read()
            .values()
            .find(|t| t.access_token == access_token)
            .cloned())
    }

    async fn get_by_id(&self, tenant_id: &str) -> Result<Option<Tenant>, PersistenceError> {
        Ok(self.tenants.read().get(tenant_id).cloned())
    }

    async fn update(&self, tenant_id: &str, patch: TenantPatch) -> Result<(), PersistenceError> {
        let mut tenants = self.tenants.write();
        match tenants.get_mut(tenant_id) {
            Some(tenant) => {
                patch.apply(tenant);
                Ok(())
            }
            None => Err(PersistenceError::NotFound(tenant_id.to_string())),
        }
    }

    async fn list_with_credential(&self) -> Result<Vec<Tenant>, PersistenceError> {
        Ok(self
            .tenants
            .read()
            .values()
            .filter(|t| !t.auth_token.is_empty())
            .cloned()
            .collect())
    }

    async fn delete(&self, tenant_id: &str) -> Result<(), PersistenceError> {
        self.tenants.write().remove(tenant_id);
        Ok(())
    }
}

/// In-memory history store.
#[derive(Default)]
pub struct MemoryHistory {
    records: RwLock<Vec<HistoryRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records_for(&self, tenant_id: &str, chat_id: &str) -> Vec<HistoryRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.chat_id == chat_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn append(&self, record: HistoryRecord) -> Result<(), PersistenceError> {
        let mut records = self.records.write();
        let duplicate = records
            .iter()
            .any(|r| r.tenant_id == record.tenant_id && r.message_id == record.message_id);
        if duplicate {
            return Err(PersistenceError::Duplicate);
        }
        records.push(record);
        Ok(())
    }

    async fn trim(
        &self,
        tenant_id: &str,
        chat_id: &str,
        limit: usize,
    ) -> Result<(), PersistenceError> {
        let mut records = self.records.write();
        let mut matching: Vec<(usize, i64)> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.tenant_id == tenant_id && r.chat_id == chat_id)
            .map(|(i, r)| (i, r.timestamp))
            .collect();
        if matching.len() <= limit {
            return Ok(());
        }

        // Newest first; everything past `limit` goes.
        matching.sort_by(|a, b| b.1.cmp(&a.1));
        let mut doomed: Vec<usize> = matching.into_iter().skip(limit).map(|(i, _)| i).collect();
        doomed.sort_unstable_by(|a, b| b.cmp(a));
        for index in doomed {
            records.remove(index);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tenant: &str, chat: &str, message: &str, ts: i64) -> HistoryRecord {
        HistoryRecord {
            tenant_id: tenant.to_string(),
            chat_id: chat.to_string(),
            sender_id: "s".to_string(),
            message_id: message.to_string(),
            timestamp: ts,
            message_type: "TEXT".to_string(),
            text: "hello".to_string(),
            media_link: String::new(),
            reply_to_id: String::new(),
        }
    }

    #[test]
    fn test_normalize_subscriptions_filters_unknown() {
        let requested = vec![
            "Message".to_string(),
            "Bogus".to_string(),
            " ReadReceipt ".to_string(),
            "Message".to_string(),
            "All".to_string(),
        ];
        assert_eq!(
            normalize_subscriptions(&requested),
            vec!["Message", "ReadReceipt", "All"]
        );
    }

    #[test]
    fn test_events_string_round_trip() {
        let events = vec!["Message".to_string(), "Typing".to_string()];
        let joined = events_to_string(&events);
        assert_eq!(joined, "Message,Typing");
        assert_eq!(events_from_string(&joined), events);
        assert!(events_from_string("").is_empty());
    }

    #[test]
    fn test_media_mode_parse() {
        assert_eq!(MediaMode::parse("none"), MediaMode::None);
        assert_eq!(MediaMode::parse("s3"), MediaMode::ObjectStore);
        assert_eq!(MediaMode::parse("both"), MediaMode::Both);
        assert_eq!(MediaMode::parse("base64"), MediaMode::Base64);
        assert_eq!(MediaMode::parse("anything"), MediaMode::Base64);
    }

    #[tokio::test]
    async fn test_catalog_update_and_lookup() {
        let catalog = MemoryCatalog::new();
        catalog.insert(Tenant {
            id: "t1".to_string(),
            access_token: "tok".to_string(),
            ..Default::default()
        });

        catalog
            .update(
                "t1",
                TenantPatch {
                    auth_token: Some("AUTH".to_string()),
                    connected: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let tenant = catalog.get_by_token("tok").await.unwrap().unwrap();
        assert_eq!(tenant.auth_token, "AUTH");
        assert!(tenant.connected);

        let with_credential = catalog.list_with_credential().await.unwrap();
        assert_eq!(with_credential.len(), 1);

        catalog.delete("t1").await.unwrap();
        assert!(catalog.get_by_id("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_catalog_update_missing_tenant() {
        let catalog = MemoryCatalog::new();
        let err = catalog
            .update("ghost", TenantPatch::default())
            .await
            .unwrap_err();
        assert_eq!(err, PersistenceError::NotFound("ghost".to_string()));
    }

    #[tokio::test]
    async fn test_history_rejects_duplicate_message_id() {
        let store = MemoryHistory::new();
        store.append(record("t", "c", "m1", 1)).await.unwrap();
        let err = store.append(record("t", "c2", "m1", 2)).await.unwrap_err();
        assert_eq!(err, PersistenceError::Duplicate);

        // Same message id under a different tenant is fine.
        store.append(record("t2", "c", "m1", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_history_trim_keeps_newest() {
        let store = MemoryHistory::new();
        for i in 0..5 {
            store
                .append(record("t", "c", &format!("m{i}"), i))
                .await
                .unwrap();
        }
        store.trim("t", "c", 2).await.unwrap();

        let kept = store.records_for("t", "c");
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|r| r.timestamp >= 3));
    }

    #[tokio::test]
    async fn test_history_trim_scoped_to_chat() {
        let store = MemoryHistory::new();
        store.append(record("t", "a", "m1", 1)).await.unwrap();
        store.append(record("t", "b", "m2", 1)).await.unwrap();
        store.trim("t", "a", 0).await.unwrap();

        assert!(store.records_for("t", "a").is_empty());
        assert_eq!(store.records_for("t", "b").len(), 1);
    }
}
