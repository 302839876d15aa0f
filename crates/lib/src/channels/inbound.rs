//! Inbound message from a channel: delivered to the bot for pipeline handling.

/// Reference to a photo in the messenger's transient storage. Carries the
/// largest-resolution variant's file id.
#[derive(Debug, Clone)]
pub struct PhotoAttachment {
    pub file_id: String,
}

/// What kind of content the message carries.
#[derive(Debug, Clone)]
pub enum MessageKind {
    Text(String),
    Photo(PhotoAttachment),
    Other,
}

/// A message from a channel, constructed once per received event.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel_id: String,
    pub conversation_id: String,
    pub kind: MessageKind,
}
