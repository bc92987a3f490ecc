//! Media side-channel for message events.
//!
//! Per-tenant delivery mode decides whether media bytes are embedded as
//! base64, uploaded to the object store and referenced, both, or neither.
//! Only photos carry a direct URL; videos, files and audio are forwarded as
//! ids the consumer can resolve through the download endpoints.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tracing::warn;

use crate::dispatch::Dispatcher;
use crate::protocol::types::Message;
use crate::protocol::AttachType;
use crate::tenant::Tenant;

const MEDIA_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Annotate the webhook body with attachment metadata and, depending on the
/// tenant's media mode, the media bytes or an object-store reference.
pub async fn augment(
    dispatcher: &Dispatcher,
    identity: &Tenant,
    message: &Message,
    body: &mut Value,
) {
    for attach in &message.attaches {
        match attach.kind {
            Some(AttachType::Photo) => {
                let Some(base_url) = attach.base_url.as_deref().filter(|u| !u.is_empty()) else {
                    continue;
                };
                body["mediaUrl"] = json!(base_url);
                body["mediaType"] = json!("image");

                let mode = identity.media_mode;
                let store = dispatcher.object_store();
                if !mode.wants_base64() && !(mode.wants_object_store() && store.is_some()) {
                    continue;
                }

                let data = match fetch(dispatcher, base_url).await {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(tenant_id = %identity.id, error = %e, "failed to download photo");
                        continue;
                    }
                };

                if mode.wants_object_store() {
                    if let Some(store) = store {
                        let filename =
                            format!("{}.jpg", attach.photo_id.unwrap_or_default());
                        match store
                            .store(
                                &identity.id,
                                &message.chat_id.to_string(),
                                &message.id,
                                &filename,
                                "image/jpeg",
                                data.clone(),
                            )
                            .await
                        {
                            Ok(reference) => body["s3"] = reference,
                            Err(e) => {
                                warn!(tenant_id = %identity.id, error = %e, "object store upload failed");
                            }
                        }
                    }
                }

                if mode.wants_base64() {
                    body["base64"] = json!(BASE64.encode(&data));
                    body["mimeType"] = json!("image/jpeg");
                }
            }
            Some(AttachType::Video) => {
                body["mediaType"] = json!("video");
                body["videoId"] = json!(attach.video_id.unwrap_or_default());
                if let Some(token) = attach.token.as_deref().filter(|t| !t.is_empty()) {
                    body["videoToken"] = json!(token);
                }
            }
            Some(AttachType::File) => {
                body["mediaType"] = json!("file");
                body["fileId"] = json!(attach.file_id.unwrap_or_default());
                body["fileName"] = json!(attach.name.clone().unwrap_or_default());
                body["fileSize"] = json!(attach.size.unwrap_or_default());
            }
            Some(AttachType::Audio) => {
                body["mediaType"] = json!("audio");
                body["audioId"] = json!(attach.audio_id.unwrap_or_default());
                if let Some(url) = attach.url.as_deref().filter(|u| !u.is_empty()) {
                    body["audioUrl"] = json!(url);
                }
            }
            _ => {}
        }
    }
}

async fn fetch(dispatcher: &Dispatcher, url: &str) -> Result<Vec<u8>, String> {
    let response = dispatcher
        .http()
        .get(url)
        .timeout(MEDIA_FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("status {}", response.status()));
    }
    let bytes = response.bytes().await.map_err(|e| e.to_string())?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::Attachment;
    use crate::tenant::{MediaMode, MemoryCatalog, MemoryHistory, TenantCatalog};
    use crate::tenant::registry::TenantRegistry;
    use std::sync::Arc;

    fn dispatcher() -> Dispatcher {
        let catalog: Arc<dyn TenantCatalog> = Arc::new(MemoryCatalog::new());
        Dispatcher::new(
            catalog,
            Arc::new(TenantRegistry::new()),
            Arc::new(MemoryHistory::new()),
        )
    }

    fn identity(mode: MediaMode) -> Tenant {
        Tenant {
            id: "t1".to_string(),
            media_mode: mode,
            ..Default::default()
        }
    }

    fn message_with(attach: Attachment) -> Message {
        Message {
            id: "m1".to_string(),
            chat_id: 3,
            attaches: vec![attach],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_file_attachment_annotations() {
        let message = message_with(Attachment {
            kind: Some(AttachType::File),
            file_id: Some(42),
            name: Some("a.pdf".to_string()),
            size: Some(1234),
            ..Default::default()
        });
        let mut body = json!({});

        augment(&dispatcher(), &identity(MediaMode::None), &message, &mut body).await;

        assert_eq!(body["mediaType"], "file");
        assert_eq!(body["fileId"], 42);
        assert_eq!(body["fileName"], "a.pdf");
        assert_eq!(body["fileSize"], 1234);
    }

    #[tokio::test]
    async fn test_video_attachment_annotations() {
        let message = message_with(Attachment {
            kind: Some(AttachType::Video),
            video_id: Some(7),
            token: Some("vt".to_string()),
            ..Default::default()
        });
        let mut body = json!({});

        augment(&dispatcher(), &identity(MediaMode::None), &message, &mut body).await;

        assert_eq!(body["mediaType"], "video");
        assert_eq!(body["videoId"], 7);
        assert_eq!(body["videoToken"], "vt");
    }

    #[tokio::test]
    async fn test_photo_with_mode_none_skips_download() {
        // An unreachable URL proves no fetch is attempted when neither
        // base64 nor object-store delivery is wanted.
        let message = message_with(Attachment {
            kind: Some(AttachType::Photo),
            photo_id: Some(1),
            base_url: Some("http://192.0.2.1:1/p.jpg".to_string()),
            ..Default::default()
        });
        let mut body = json!({});

        augment(&dispatcher(), &identity(MediaMode::None), &message, &mut body).await;

        assert_eq!(body["mediaUrl"], "http://192.0.2.1:1/p.jpg");
        assert_eq!(body["mediaType"], "image");
        assert!(body.get("base64").is_none());
    }
}
