//! Bounded message-history persistence.
//!
//! Gated on the tenant's history limit by the dispatcher; a persistence
//! failure is logged and never fails event delivery.

use tracing::{debug, warn};

use crate::protocol::now_millis;
use crate::protocol::types::Message;
use crate::tenant::{HistoryRecord, HistoryStore, PersistenceError, Tenant};

/// Append the message and trim the tenant+chat window to the limit.
pub async fn record(store: &dyn HistoryStore, identity: &Tenant, message: &Message) {
    let timestamp = if message.time != 0 {
        message.time
    } else {
        now_millis()
    };

    let reply_to_id = message
        .link
        .as_ref()
        .and_then(|link| link.message_id.clone())
        .unwrap_or_default();

    let record = HistoryRecord {
        tenant_id: identity.id.clone(),
        chat_id: message.chat_id.to_string(),
        sender_id: message.sender.to_string(),
        message_id: message.id.clone(),
        timestamp,
        message_type: message.message_type.clone(),
        text: message.text.clone(),
        media_link: String::new(),
        reply_to_id,
    };
    let chat_id = record.chat_id.clone();

    match store.append(record).await {
        Ok(()) => {
            if let Err(e) = store
                .trim(&identity.id, &chat_id, identity.history_limit as usize)
                .await
            {
                warn!(tenant_id = %identity.id, error = %e, "failed to trim message history");
            }
        }
        // The unique (tenant, message-id) index makes redelivery harmless.
        Err(PersistenceError::Duplicate) => {
            debug!(tenant_id = %identity.id, "history row already present");
        }
        Err(e) => {
            warn!(tenant_id = %identity.id, error = %e, "failed to save message to history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::MemoryHistory;

    fn identity(limit: u32) -> Tenant {
        Tenant {
            id: "t1".to_string(),
            history_limit: limit,
            ..Default::default()
        }
    }

    fn message(id: &str, time: i64) -> Message {
        Message {
            id: id.to_string(),
            chat_id: 5,
            sender: 2,
            text: "hi".to_string(),
            time,
            message_type: "TEXT".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_record_appends_and_trims() {
        let store = MemoryHistory::new();
        let identity = identity(2);

        for i in 0..4 {
            record(&store, &identity, &message(&format!("m{i}"), 100 + i)).await;
        }

        let kept = store.records_for("t1", "5");
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|r| r.timestamp >= 102));
    }

    #[tokio::test]
    async fn test_record_redelivery_is_harmless() {
        let store = MemoryHistory::new();
        let identity = identity(10);

        record(&store, &identity, &message("m1", 100)).await;
        record(&store, &identity, &message("m1", 100)).await;

        assert_eq!(store.records_for("t1", "5").len(), 1);
    }

    #[tokio::test]
    async fn test_record_backfills_missing_timestamp() {
        let store = MemoryHistory::new();
        record(&store, &identity(10), &message("m1", 0)).await;

        let kept = store.records_for("t1", "5");
        assert!(kept[0].timestamp > 0);
    }
}
