use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use trellis_core::{ChatId, MessageId};
use trellis_llm::{StreamSessionId, StreamTarget};

/// Registry key: one in-flight generation per (chat, message).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

impl StreamKey {
    pub fn new(chat_id: &ChatId, message_id: &MessageId) -> Self {
        Self {
            chat_id: chat_id.clone(),
            message_id: message_id.clone(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}-{}", self.chat_id, self.message_id)
    }
}

/// Handle returned to whoever started a stream.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub session: StreamSessionId,
    pub token: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl StreamSession {
    pub fn target(&self) -> StreamTarget {
        StreamTarget::new(self.chat_id.clone(), self.message_id.clone(), self.session)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub session: StreamSessionId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ActiveStream {
    session: StreamSessionId,
    token: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Process-wide registry of in-flight generations and their cancellation tokens.
///
/// Every mutation happens under one lock, so a restart for a key is observed atomically.
#[derive(Debug, Default)]
pub struct StreamManager {
    streams: Mutex<HashMap<StreamKey, ActiveStream>>,
    next_session: AtomicU64,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh session, cancelling any session already running for the key.
    pub fn start_stream(&self, chat_id: &ChatId, message_id: &MessageId) -> StreamSession {
        let key = StreamKey::new(chat_id, message_id);
        let session = StreamSessionId::new(self.next_session.fetch_add(1, Ordering::Relaxed) + 1);
        let token = CancellationToken::new();
        let started_at = Utc::now();

        let previous = self.streams.lock().insert(
            key.clone(),
            ActiveStream {
                session,
                token: token.clone(),
                started_at,
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
            tracing::debug!(
                stream_key = %key,
                previous_session = %previous.session,
                session = %session,
                "restarted stream; previous session cancelled"
            );
        } else {
            tracing::debug!(stream_key = %key, session = %session, "started stream");
        }

        StreamSession {
            chat_id: chat_id.clone(),
            message_id: message_id.clone(),
            session,
            token,
            started_at,
        }
    }

    /// Cancels and forgets the session for the key. Returns false when nothing was running.
    pub fn stop_stream(&self, chat_id: &ChatId, message_id: &MessageId) -> bool {
        let key = StreamKey::new(chat_id, message_id);
        let Some(stream) = self.streams.lock().remove(&key) else {
            return false;
        };
        stream.token.cancel();
        tracing::debug!(stream_key = %key, session = %stream.session, "stopped stream");
        true
    }

    pub fn stop_all_streams_for_chat(&self, chat_id: &ChatId) -> usize {
        let mut streams = self.streams.lock();
        let before = streams.len();
        streams.retain(|key, stream| {
            if &key.chat_id == chat_id {
                stream.token.cancel();
                false
            } else {
                true
            }
        });
        let stopped = before - streams.len();
        if stopped > 0 {
            tracing::debug!(chat_id = %chat_id, stopped, "stopped all streams for chat");
        }
        stopped
    }

    pub fn is_streaming_in_chat(&self, chat_id: &ChatId) -> bool {
        self.streams
            .lock()
            .keys()
            .any(|key| &key.chat_id == chat_id)
    }

    pub fn is_message_streaming(&self, chat_id: &ChatId, message_id: &MessageId) -> bool {
        self.streams
            .lock()
            .contains_key(&StreamKey::new(chat_id, message_id))
    }

    /// Most recently started message streaming in the chat.
    pub fn current_streaming_message_id(&self, chat_id: &ChatId) -> Option<MessageId> {
        self.stream_info(chat_id).map(|info| info.message_id)
    }

    pub fn active_streaming_chats(&self) -> Vec<ChatId> {
        let mut chats = self
            .streams
            .lock()
            .keys()
            .map(|key| key.chat_id.clone())
            .collect::<Vec<_>>();
        chats.sort();
        chats.dedup();
        chats
    }

    /// Most recent session of the chat, if any.
    pub fn stream_info(&self, chat_id: &ChatId) -> Option<StreamInfo> {
        self.streams
            .lock()
            .iter()
            .filter(|(key, _)| &key.chat_id == chat_id)
            .max_by_key(|(_, stream)| stream.session)
            .map(|(key, stream)| StreamInfo {
                chat_id: key.chat_id.clone(),
                message_id: key.message_id.clone(),
                session: stream.session,
                started_at: stream.started_at,
            })
    }

    pub fn active_stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// True when a newer session now owns the target's key.
    ///
    /// A key with no session at all (stopped by the user) is not superseded: the owner still
    /// has to record the pause.
    pub fn is_superseded(&self, target: &StreamTarget) -> bool {
        self.streams
            .lock()
            .get(&StreamKey::new(&target.chat_id, &target.message_id))
            .is_some_and(|stream| stream.session != target.session)
    }

    /// Forgets a session that ended on its own. A newer session for the key is left alone.
    pub fn finish_stream(&self, target: &StreamTarget) -> bool {
        let key = StreamKey::new(&target.chat_id, &target.message_id);
        let mut streams = self.streams.lock();
        if streams
            .get(&key)
            .is_some_and(|stream| stream.session == target.session)
        {
            streams.remove(&key);
            return true;
        }
        false
    }

    /// Cancels and clears everything; used on shutdown.
    pub fn cleanup(&self) -> usize {
        let drained = self.streams.lock().drain().collect::<Vec<_>>();
        for (_, stream) in &drained {
            stream.token.cancel();
        }
        if !drained.is_empty() {
            tracing::info!(cancelled = drained.len(), "cancelled all active streams");
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (ChatId, MessageId) {
        (ChatId::new("chat-a"), MessageId::new("msg-a"))
    }

    #[test]
    fn restarting_a_key_cancels_the_first_token() {
        let manager = StreamManager::new();
        let (chat_id, message_id) = ids();

        let first = manager.start_stream(&chat_id, &message_id);
        let second = manager.start_stream(&chat_id, &message_id);

        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        assert_eq!(manager.active_stream_count(), 1);
        assert!(manager.is_superseded(&first.target()));
        assert!(!manager.is_superseded(&second.target()));
    }

    #[test]
    fn stop_is_a_noop_when_absent() {
        let manager = StreamManager::new();
        let (chat_id, message_id) = ids();
        assert!(!manager.stop_stream(&chat_id, &message_id));

        let session = manager.start_stream(&chat_id, &message_id);
        assert!(manager.stop_stream(&chat_id, &message_id));
        assert!(session.token.is_cancelled());
        assert!(!manager.is_message_streaming(&chat_id, &message_id));
        // Stopped, not superseded: the owner still records the pause.
        assert!(!manager.is_superseded(&session.target()));
    }

    #[test]
    fn chat_wide_queries_and_stop() {
        let manager = StreamManager::new();
        let chat = ChatId::new("chat-a");
        let other = ChatId::new("chat-b");
        let first = manager.start_stream(&chat, &MessageId::new("msg-1"));
        manager.start_stream(&chat, &MessageId::new("msg-2"));
        let untouched = manager.start_stream(&other, &MessageId::new("msg-3"));

        assert!(manager.is_streaming_in_chat(&chat));
        assert_eq!(
            manager.current_streaming_message_id(&chat),
            Some(MessageId::new("msg-2"))
        );
        assert_eq!(manager.active_streaming_chats(), vec![chat.clone(), other.clone()]);

        assert_eq!(manager.stop_all_streams_for_chat(&chat), 2);
        assert!(first.token.is_cancelled());
        assert!(!untouched.token.is_cancelled());
        assert!(!manager.is_streaming_in_chat(&chat));
        assert_eq!(manager.current_streaming_message_id(&chat), None);
    }

    #[test]
    fn finish_only_removes_matching_session() {
        let manager = StreamManager::new();
        let (chat_id, message_id) = ids();
        let stale = manager.start_stream(&chat_id, &message_id);
        let fresh = manager.start_stream(&chat_id, &message_id);

        assert!(!manager.finish_stream(&stale.target()));
        assert_eq!(
            manager.stream_info(&chat_id).map(|info| info.session),
            Some(fresh.session)
        );
        assert!(manager.finish_stream(&fresh.target()));
        assert!(!fresh.token.is_cancelled());
        assert_eq!(manager.active_stream_count(), 0);
    }

    #[test]
    fn cleanup_cancels_everything() {
        let manager = StreamManager::new();
        let session = manager.start_stream(&ChatId::new("chat-x"), &MessageId::new("msg-x"));
        manager.start_stream(&ChatId::new("chat-y"), &MessageId::new("msg-y"));

        assert_eq!(manager.cleanup(), 2);
        assert!(session.token.is_cancelled());
        assert_eq!(manager.active_stream_count(), 0);
    }

    #[test]
    fn key_display_joins_chat_and_message() {
        let (chat_id, message_id) = ids();
        assert_eq!(StreamKey::new(&chat_id, &message_id).to_string(), "chat-a-msg-a");
    }
}
