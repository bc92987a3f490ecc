//! Media upload and download helpers.
//!
//! All three asset kinds share the same template: request an upload slot
//! over the protocol, POST the bytes to the returned URL over HTTP, then
//! block on a NOTIF_ATTACH waiter until the server finishes processing the
//! asset. The wait is best-effort: a missing completion push yields the
//! attachment anyway with a warning, and the caller decides whether that is
//! fatal.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::client::error::ClientError;
use crate::client::SessionClient;
use crate::protocol::opcode;
use crate::protocol::types::{Attachment, UploadSlot};
use crate::protocol::AttachType;

/// Processing wait for photos and files.
pub const UPLOAD_WAIT: Duration = Duration::from_secs(30);

/// Videos transcode server-side and need a longer wait.
pub const VIDEO_UPLOAD_WAIT: Duration = Duration::from_secs(120);

/// Bound on media downloads.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Download URL for a video; the URL key in the response is dynamic.
#[derive(Debug, Clone, Default)]
pub struct VideoSource {
    pub url: String,
    pub external: String,
    pub cache: bool,
}

/// Download URL for a file.
#[derive(Debug, Clone, Default)]
pub struct FileSource {
    pub url: String,
    pub unsafe_flag: bool,
}

impl SessionClient {
    /// Upload a photo. Photos return their token synchronously in the HTTP
    /// upload response; no completion push is involved.
    pub async fn upload_photo(
        &self,
        data: Vec<u8>,
        filename: &str,
    ) -> Result<Attachment, ClientError> {
        info!(filename, "requesting photo upload slot");
        let response = self.call(opcode::PHOTO_UPLOAD, json!({"count": 1})).await?;

        let url = response
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ClientError::protocol("no_upload_url", "no upload URL in response"))?
            .to_string();

        let part = reqwest::multipart::Part::bytes(data).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);

        let http_response = self
            .http()
            .post(&url)
            .multipart(form)
            .timeout(UPLOAD_WAIT)
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("photo upload failed: {e}")))?;
        if !http_response.status().is_success() {
            return Err(ClientError::protocol(
                "upload_failed",
                format!("upload failed with status {}", http_response.status()),
            ));
        }

        let body: Value = http_response
            .json()
            .await
            .map_err(|e| ClientError::Transport(format!("bad upload response: {e}")))?;

        let photo_token = body
            .get("photos")
            .and_then(Value::as_object)
            .and_then(|photos| photos.values().next())
            .and_then(|photo| photo.get("token"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ClientError::protocol("no_photo_token", "no photo token in response"))?;

        info!("photo uploaded");
        Ok(Attachment {
            kind: Some(AttachType::Photo),
            photo_token: Some(photo_token.to_string()),
            ..Default::default()
        })
    }

    pub async fn upload_file(
        &self,
        data: Vec<u8>,
        filename: &str,
    ) -> Result<Attachment, ClientError> {
        self.upload_file_with_wait(data, filename, UPLOAD_WAIT).await
    }

    /// `upload_file` with an explicit processing wait.
    pub async fn upload_file_with_wait(
        &self,
        data: Vec<u8>,
        filename: &str,
        wait: Duration,
    ) -> Result<Attachment, ClientError> {
        info!(filename, "requesting file upload slot");
        let response = self.call(opcode::FILE_UPLOAD, json!({"count": 1})).await?;
        let slot = upload_slot(&response)?;
        let file_id = slot
            .file_id
            .filter(|&id| id != 0)
            .ok_or_else(|| ClientError::protocol("no_upload_url", "no file id in slot"))?;

        let waiter = self.register_upload_waiter(file_id);
        let size = data.len() as i64;

        let result = self
            .post_asset(&slot.url, data, filename, UPLOAD_WAIT)
            .await;
        if let Err(e) = result {
            self.remove_upload_waiter(file_id);
            return Err(e);
        }

        if self.await_upload(waiter, wait).await.is_some() {
            info!(file_id, "file processed");
        } else {
            warn!(file_id, "timeout waiting for file processing");
        }
        self.remove_upload_waiter(file_id);

        Ok(Attachment {
            kind: Some(AttachType::File),
            file_id: Some(file_id),
            name: Some(filename.to_string()),
            size: Some(size),
            ..Default::default()
        })
    }

    pub async fn upload_video(
        &self,
        data: Vec<u8>,
        filename: &str,
    ) -> Result<Attachment, ClientError> {
        self.upload_video_with_wait(data, filename, VIDEO_UPLOAD_WAIT)
            .await
    }

    /// `upload_video` with an explicit processing wait.
    pub async fn upload_video_with_wait(
        &self,
        data: Vec<u8>,
        filename: &str,
        wait: Duration,
    ) -> Result<Attachment, ClientError> {
        info!(filename, "requesting video upload slot");
        let response = self.call(opcode::VIDEO_UPLOAD, json!({"count": 1})).await?;
        let slot = upload_slot(&response)?;
        let video_id = slot
            .video_id
            .filter(|&id| id != 0)
            .ok_or_else(|| ClientError::protocol("no_upload_url", "no video id in slot"))?;

        let waiter = self.register_upload_waiter(video_id);

        let result = self
            .post_asset(&slot.url, data, filename, VIDEO_UPLOAD_WAIT)
            .await;
        if let Err(e) = result {
            self.remove_upload_waiter(video_id);
            return Err(e);
        }

        if self.await_upload(waiter, wait).await.is_some() {
            info!(video_id, "video processed");
        } else {
            warn!(video_id, "timeout waiting for video processing");
        }
        self.remove_upload_waiter(video_id);

        Ok(Attachment {
            kind: Some(AttachType::Video),
            video_id: Some(video_id),
            token: slot.token,
            ..Default::default()
        })
    }

    /// Audio is carried as a FILE attachment by MP.
    pub async fn upload_audio(
        &self,
        data: Vec<u8>,
        filename: &str,
    ) -> Result<Attachment, ClientError> {
        self.upload_file(data, filename).await
    }

    /// Resolve the download URL for a video. The URL sits under a dynamic
    /// key in the response payload.
    pub async fn video_download_url(
        &self,
        chat_id: i64,
        message_id: &str,
        video_id: i64,
    ) -> Result<VideoSource, ClientError> {
        info!(video_id, "getting video download URL");
        let response = self
            .call(
                opcode::VIDEO_PLAY,
                json!({"chatId": chat_id, "messageId": message_id, "videoId": video_id}),
            )
            .await?;

        let mut source = VideoSource::default();
        if let Some(map) = response.as_object() {
            for (key, value) in map {
                match key.as_str() {
                    "EXTERNAL" => source.external = value.as_str().unwrap_or_default().to_string(),
                    "cache" => source.cache = value.as_bool().unwrap_or(false),
                    "error" | "message" => {}
                    _ => {
                        if let Some(url) = value.as_str() {
                            source.url = url.to_string();
                        }
                    }
                }
            }
        }

        if source.url.is_empty() {
            return Err(ClientError::protocol("no_video_url", "no video URL in response"));
        }
        Ok(source)
    }

    pub async fn file_download_url(
        &self,
        chat_id: i64,
        message_id: &str,
        file_id: i64,
    ) -> Result<FileSource, ClientError> {
        info!(file_id, "getting file download URL");
        let response = self
            .call(
                opcode::FILE_DOWNLOAD,
                json!({"chatId": chat_id, "messageId": message_id, "fileId": file_id}),
            )
            .await?;

        let url = response
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ClientError::protocol("no_file_url", "no file URL in response"))?;

        Ok(FileSource {
            url: url.to_string(),
            unsafe_flag: response
                .get("unsafe")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    /// Download a media object with a bounded timeout.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        let response = self
            .http()
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("download failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ClientError::protocol(
                "download_failed",
                format!("download failed with status {}", response.status()),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(format!("download read failed: {e}")))?;
        Ok(bytes.to_vec())
    }

    /// Raw-body POST used for file and video bytes.
    async fn post_asset(
        &self,
        url: &str,
        data: Vec<u8>,
        filename: &str,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let basename = filename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(filename);
        let len = data.len();
        let content_range = format!("0-{}/{}", len.saturating_sub(1), len);

        let response = self
            .http()
            .post(url)
            .header(
                "Content-Disposition",
                format!("attachment; filename={basename}"),
            )
            .header("Content-Range", content_range)
            .body(data)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("upload failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ClientError::protocol(
                "upload_failed",
                format!("upload failed with status {}", response.status()),
            ));
        }
        Ok(())
    }
}

/// Pull the first slot out of an upload-slot response (`info[0]`).
fn upload_slot(payload: &Value) -> Result<UploadSlot, ClientError> {
    let slot_value = payload
        .get("info")
        .and_then(Value::as_array)
        .and_then(|info| info.first())
        .ok_or_else(|| ClientError::protocol("no_upload_info", "no upload info in response"))?;

    let slot: UploadSlot = serde_json::from_value(slot_value.clone())
        .map_err(|_| ClientError::protocol("invalid_upload_info", "invalid upload info format"))?;

    if slot.url.is_empty() {
        return Err(ClientError::protocol("no_upload_url", "no upload URL in slot"));
    }
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upload_slot_parses_first_entry() {
        let payload = json!({"info": [{"url": "https://up.example", "fileId": 42}]});
        let slot = upload_slot(&payload).unwrap();
        assert_eq!(slot.url, "https://up.example");
        assert_eq!(slot.file_id, Some(42));
    }

    #[test]
    fn test_upload_slot_rejects_missing_info() {
        assert!(upload_slot(&json!({})).is_err());
        assert!(upload_slot(&json!({"info": []})).is_err());
    }

    #[test]
    fn test_upload_slot_rejects_empty_url() {
        let payload = json!({"info": [{"fileId": 42}]});
        assert!(upload_slot(&payload).is_err());
    }
}
