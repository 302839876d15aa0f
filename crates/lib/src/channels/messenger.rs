//! The chat-transport capability the bot drives.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::inbound::PhotoAttachment;

/// Outbound side of a chat channel plus attachment retrieval. String errors,
/// matching the channel send convention; the bot decides the user-visible
/// consequence of each failure.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send a text message to a conversation.
    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<(), String>;

    /// Send a local image file as a photo.
    async fn send_photo(&self, conversation_id: &str, image: &Path) -> Result<(), String>;

    /// Send an animation as an interim "processing" indicator; returns the
    /// message id needed to delete it later.
    async fn send_placeholder(&self, conversation_id: &str, animation: &Path)
        -> Result<i64, String>;

    /// Delete a previously sent placeholder.
    async fn delete_placeholder(&self, conversation_id: &str, message_id: i64)
        -> Result<(), String>;

    /// Download an attachment from the messenger's transient storage into the
    /// staging directory; returns the local path.
    async fn fetch_attachment(
        &self,
        attachment: &PhotoAttachment,
        staging_dir: &Path,
    ) -> Result<PathBuf, String>;
}
