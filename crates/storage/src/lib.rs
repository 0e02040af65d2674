pub mod dump;
pub mod error;
pub mod sqlite;
pub mod types;

pub use dump::{ChatDump, DUMP_VERSION};
pub use error::{StorageError, StorageResult};
pub use sqlite::SqliteStorage;
pub use types::ChatSummary;
use trellis_core::{Chat, ChatId};

/// Durable home for chat snapshots. Every call is synchronous.
pub trait ChatRepository: Send + Sync {
    /// Replaces the stored snapshot of `chat`, inserting it when new.
    fn save_chat(&self, chat: &Chat) -> StorageResult<()>;
    fn load_chat(&self, chat_id: &ChatId) -> StorageResult<Option<Chat>>;
    /// Most recently updated first.
    fn list_chats(&self) -> StorageResult<Vec<ChatSummary>>;
    fn load_all_chats(&self) -> StorageResult<Vec<Chat>>;
    fn delete_chat(&self, chat_id: &ChatId) -> StorageResult<bool>;
    fn clear_all(&self) -> StorageResult<()>;
}
