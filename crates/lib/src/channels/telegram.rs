//! Telegram channel: long-poll getUpdates and Bot API calls via reqwest.
//! Implements `Messenger` for the bot (text, photo, animation placeholder,
//! attachment download).

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::inbound::{InboundMessage, MessageKind, PhotoAttachment};
use super::messenger::Messenger;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

/// Telegram update payload (getUpdates result item or webhook POST body).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    #[serde(default)]
    pub text: Option<String>,
    /// Photo variants, smallest first; the last entry is the largest.
    #[serde(default)]
    pub photo: Option<Vec<TelegramPhotoSize>>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramPhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    ok: bool,
    #[serde(default)]
    result: Option<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct GetFileResponse {
    ok: bool,
    #[serde(default)]
    result: Option<TelegramFile>,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    #[serde(default)]
    file_path: Option<String>,
}

/// Classify a Telegram message: photo wins over caption text, then text,
/// then unsupported (stickers, voice, documents, ...).
pub fn message_kind(msg: &TelegramMessage) -> MessageKind {
    if let Some(photos) = msg.photo.as_ref().filter(|p| !p.is_empty()) {
        // Largest-resolution variant is last.
        let largest = &photos[photos.len() - 1];
        return MessageKind::Photo(PhotoAttachment {
            file_id: largest.file_id.clone(),
        });
    }
    if let Some(ref text) = msg.text {
        return MessageKind::Text(text.clone());
    }
    MessageKind::Other
}

/// Convert a webhook/poll update into an inbound message, when it carries one.
pub fn inbound_from_update(update: &TelegramUpdate) -> Option<InboundMessage> {
    let msg = update.message.as_ref()?;
    Some(InboundMessage {
        channel_id: "telegram".to_string(),
        conversation_id: msg.chat.id.to_string(),
        kind: message_kind(msg),
    })
}

/// Telegram channel connector: long-polls for updates and serves Bot API sends.
pub struct TelegramChannel {
    token: Option<String>,
    running: AtomicBool,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token,
            running: AtomicBool::new(false),
            client: reqwest::Client::new(),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the long-poll loop after the current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn token(&self) -> Result<&str, String> {
        self.token
            .as_deref()
            .ok_or_else(|| "telegram bot token not configured".to_string())
    }

    fn method_url(&self, method: &str) -> Result<String, String> {
        Ok(format!(
            "{}/bot{}/{}",
            TELEGRAM_API_BASE,
            self.token()?,
            method
        ))
    }

    /// Start the getUpdates long-poll loop and forward messages to the bot.
    /// Returns a handle to await on shutdown.
    pub fn start_inbound(
        self: Arc<Self>,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("telegram channel: starting getUpdates long-poll loop");
        tokio::spawn(async move {
            run_get_updates_loop(self, inbound_tx).await;
        })
    }

    /// Call Telegram getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(
        &self,
        offset: Option<i64>,
    ) -> Result<(Vec<TelegramUpdate>, Option<i64>), String> {
        let url = format!(
            "{}?timeout={}",
            self.method_url("getUpdates")?,
            LONG_POLL_TIMEOUT
        );
        let url = if let Some(off) = offset {
            format!("{}&offset={}", url, off)
        } else {
            url
        };
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("getUpdates failed: {} {}", status, body));
        }
        let data: GetUpdatesResponse = res.json().await.map_err(|e| e.to_string())?;
        if !data.ok {
            return Err("getUpdates returned ok: false".to_string());
        }
        let next_offset = data
            .result
            .iter()
            .map(|u| u.update_id)
            .max()
            .map(|id| id + 1);
        Ok((data.result, next_offset))
    }

    /// Set webhook URL (and optional secret). When set, Telegram POSTs updates to the URL instead of getUpdates.
    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), String> {
        let api_url = self.method_url("setWebhook")?;
        let mut body = serde_json::json!({ "url": url });
        if let Some(s) = secret {
            body["secret_token"] = serde_json::Value::String(s.to_string());
        }
        let res = self
            .client
            .post(&api_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("setWebhook failed: {} {}", status, body));
        }
        Ok(())
    }

    /// Remove webhook so the bot can use getUpdates again.
    pub async fn delete_webhook(&self) -> Result<(), String> {
        let url = self.method_url("deleteWebhook")?;
        let res = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("deleteWebhook failed: {} {}", status, body));
        }
        Ok(())
    }

    /// Send a text message to a chat via sendMessage API.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), String> {
        let url = self.method_url("sendMessage")?;
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });
        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("sendMessage failed: {} {}", status, body));
        }
        Ok(())
    }

    /// Send a local file via a multipart Bot API method ("sendPhoto" or
    /// "sendAnimation"); returns the sent message id.
    async fn send_file(
        &self,
        method: &str,
        field: &str,
        chat_id: &str,
        path: &Path,
    ) -> Result<i64, String> {
        let url = self.method_url(method)?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| format!("reading {}: {}", path.display(), e))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(
                field.to_string(),
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );
        let res = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("{} failed: {} {}", method, status, body));
        }
        let data: SendMessageResponse = res.json().await.map_err(|e| e.to_string())?;
        if !data.ok {
            return Err(format!("{} returned ok: false", method));
        }
        data.result
            .map(|m| m.message_id)
            .ok_or_else(|| format!("{} returned no message", method))
    }

    /// Delete a message (e.g. the loading-animation placeholder).
    pub async fn delete_message(&self, chat_id: &str, message_id: i64) -> Result<(), String> {
        let url = self.method_url("deleteMessage")?;
        let body = serde_json::json!({ "chat_id": chat_id, "message_id": message_id });
        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("deleteMessage failed: {} {}", status, body));
        }
        Ok(())
    }

    /// Download a file from Telegram's transient storage into `staging_dir`,
    /// keyed by the file's basename. Returns the local path.
    pub async fn download_file(
        &self,
        file_id: &str,
        staging_dir: &Path,
    ) -> Result<PathBuf, String> {
        let url = format!("{}?file_id={}", self.method_url("getFile")?, file_id);
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("getFile failed: {} {}", status, body));
        }
        let data: GetFileResponse = res.json().await.map_err(|e| e.to_string())?;
        let file_path = data
            .result
            .and_then(|f| f.file_path)
            .filter(|_| data.ok)
            .ok_or_else(|| "getFile returned no file_path".to_string())?;

        let download_url = format!(
            "{}/file/bot{}/{}",
            TELEGRAM_API_BASE,
            self.token()?,
            file_path
        );
        let res = self
            .client
            .get(&download_url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            return Err(format!("file download failed: {}", res.status()));
        }
        let bytes = res.bytes().await.map_err(|e| e.to_string())?;

        let basename = Path::new(&file_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.bin", file_id));
        let local = staging_dir.join(basename);
        tokio::fs::create_dir_all(staging_dir)
            .await
            .map_err(|e| format!("creating staging dir: {}", e))?;
        tokio::fs::write(&local, &bytes)
            .await
            .map_err(|e| format!("writing {}: {}", local.display(), e))?;
        Ok(local)
    }
}

async fn run_get_updates_loop(
    channel: Arc<TelegramChannel>,
    inbound_tx: mpsc::Sender<InboundMessage>,
) {
    let mut offset: Option<i64> = None;
    while channel.running() {
        match channel.get_updates(offset).await {
            Ok((updates, next)) => {
                offset = next;
                for u in updates {
                    if let Some(inbound) = inbound_from_update(&u) {
                        if inbound_tx.send(inbound).await.is_err() {
                            log::debug!("telegram: inbound channel closed, stopping loop");
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
            }
        }
    }
    log::info!("telegram channel: getUpdates loop stopped");
}

#[async_trait]
impl Messenger for TelegramChannel {
    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<(), String> {
        self.send_message(conversation_id, text).await
    }

    async fn send_photo(&self, conversation_id: &str, image: &Path) -> Result<(), String> {
        self.send_file("sendPhoto", "photo", conversation_id, image)
            .await
            .map(|_| ())
    }

    async fn send_placeholder(
        &self,
        conversation_id: &str,
        animation: &Path,
    ) -> Result<i64, String> {
        self.send_file("sendAnimation", "animation", conversation_id, animation)
            .await
    }

    async fn delete_placeholder(
        &self,
        conversation_id: &str,
        message_id: i64,
    ) -> Result<(), String> {
        self.delete_message(conversation_id, message_id).await
    }

    async fn fetch_attachment(
        &self,
        attachment: &PhotoAttachment,
        staging_dir: &Path,
    ) -> Result<PathBuf, String> {
        self.download_file(&attachment.file_id, staging_dir).await
    }
}
