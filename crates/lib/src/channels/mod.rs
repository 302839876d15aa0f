//! Communication channels (Telegram).
//!
//! The `Messenger` trait is the chat-transport boundary the bot drives;
//! inbound messages are pushed to the server's dispatch queue.

mod inbound;
mod messenger;
mod telegram;

pub use inbound::{InboundMessage, MessageKind, PhotoAttachment};
pub use messenger::Messenger;
pub use telegram::{inbound_from_update, TelegramChannel, TelegramUpdate};
