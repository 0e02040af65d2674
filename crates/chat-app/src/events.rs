use tokio::sync::broadcast;
use trellis_core::{ChatId, MessageId, MessageState};

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Change notifications published by the engine. Subscribers re-read state from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    MessageUpdated {
        chat_id: ChatId,
        message_id: MessageId,
    },
    StreamStarted {
        chat_id: ChatId,
        message_id: MessageId,
    },
    StreamFinished {
        chat_id: ChatId,
        message_id: MessageId,
        state: MessageState,
    },
    /// Chats were created, removed, renamed, or had their branch layout changed.
    ChatsChanged,
    /// Transient user-facing notification.
    Notice { level: NoticeLevel, text: String },
}

pub fn event_channel() -> (broadcast::Sender<ChatEvent>, broadcast::Receiver<ChatEvent>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}
