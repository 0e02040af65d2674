use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection, SqlitePool};
use trellis_core::{BranchId, BranchModel, BranchNode, Chat, ChatId, Message, MessageId, Sender};

use super::ChatRepository;
use super::error::{
    CreateSqliteDirectorySnafu, DecodeJsonSnafu, EncodeJsonSnafu, InvalidTimestampSnafu,
    InvariantViolationSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu,
    StorageResult,
};
use super::types::ChatSummary;

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // The pooled connection is never retired, so a shared in-memory database outlives
        // the short-lived connections opened per repository call.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(database_url = %database_url, "opened chat database");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Repository calls are sync, so each one runs on its own thread with a
        // current-thread runtime; blocking inside the caller's runtime would panic.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl ChatRepository for SqliteStorage {
    fn save_chat(&self, chat: &Chat) -> StorageResult<()> {
        let rows = ChatRows::encode(chat)?;
        let database_url = self.database_url.clone();
        self.run_db_call("chat-save", async move {
            let mut connection =
                connect_store_connection(&database_url, "chat-save-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "chat-save-begin",
            })?;

            sqlx::query(
                "INSERT INTO chats (id, title, active_branch_path, created_at, updated_at) VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET title = excluded.title, active_branch_path = excluded.active_branch_path, updated_at = excluded.updated_at",
            )
            .bind(&rows.chat_id)
            .bind(&rows.title)
            .bind(&rows.active_branch_path)
            .bind(&rows.created_at)
            .bind(&rows.updated_at)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-save-upsert-chat",
            })?;

            // Snapshots replace the whole message bag; the chat row itself is kept.
            for (statement, stage) in [
                ("DELETE FROM messages WHERE chat_id = ?", "chat-save-clear-messages"),
                ("DELETE FROM branches WHERE chat_id = ?", "chat-save-clear-branches"),
                (
                    "DELETE FROM message_branches WHERE chat_id = ?",
                    "chat-save-clear-message-branches",
                ),
            ] {
                sqlx::query(statement)
                    .bind(&rows.chat_id)
                    .execute(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu { stage })?;
            }

            for (position, message) in rows.messages.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO messages (chat_id, id, position, branch_id, sender, sent_at, payload_json) VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&rows.chat_id)
                .bind(&message.id)
                .bind(position as i64)
                .bind(&message.branch_id)
                .bind(message.sender)
                .bind(&message.sent_at)
                .bind(&message.payload_json)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "chat-save-insert-message",
                })?;
            }

            for branch in &rows.branches {
                sqlx::query(
                    "INSERT INTO branches (chat_id, id, divergence_message_id, depth, child_branches_json) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&rows.chat_id)
                .bind(&branch.id)
                .bind(&branch.divergence_message_id)
                .bind(branch.depth)
                .bind(&branch.child_branches_json)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "chat-save-insert-branch",
                })?;
            }

            for entry in &rows.message_branches {
                sqlx::query(
                    "INSERT INTO message_branches (chat_id, message_id, branch_id, position) VALUES (?, ?, ?, ?)",
                )
                .bind(&rows.chat_id)
                .bind(&entry.message_id)
                .bind(&entry.branch_id)
                .bind(entry.position)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "chat-save-insert-message-branch",
                })?;
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "chat-save-commit",
            })?;

            tracing::debug!(
                chat_id = %rows.chat_id,
                message_count = rows.messages.len(),
                branch_count = rows.branches.len(),
                "saved chat snapshot"
            );
            Ok(())
        })
    }

    fn load_chat(&self, chat_id: &ChatId) -> StorageResult<Option<Chat>> {
        let database_url = self.database_url.clone();
        let chat_id = chat_id.clone();
        self.run_db_call("chat-load", async move {
            let mut connection =
                connect_store_connection(&database_url, "chat-load-connect").await?;
            load_chat_with(&mut connection, chat_id.as_str()).await
        })
    }

    fn list_chats(&self) -> StorageResult<Vec<ChatSummary>> {
        let database_url = self.database_url.clone();
        self.run_db_call("chat-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "chat-list-connect").await?;
            let rows = sqlx::query_as::<_, ChatSummaryRow>(
                "SELECT c.id, c.title, c.created_at, c.updated_at, COUNT(m.id) AS message_count
                 FROM chats c LEFT JOIN messages m ON m.chat_id = c.id
                 GROUP BY c.id ORDER BY c.updated_at DESC, c.id DESC",
            )
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-list-query",
            })?;

            rows.into_iter().map(summary_row_to_record).collect()
        })
    }

    fn load_all_chats(&self) -> StorageResult<Vec<Chat>> {
        let database_url = self.database_url.clone();
        self.run_db_call("chat-load-all", async move {
            let mut connection =
                connect_store_connection(&database_url, "chat-load-all-connect").await?;
            let ids = sqlx::query_scalar::<_, String>(
                "SELECT id FROM chats ORDER BY updated_at DESC, id DESC",
            )
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-load-all-ids",
            })?;

            let mut chats = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(chat) = load_chat_with(&mut connection, &id).await? {
                    chats.push(chat);
                }
            }
            Ok(chats)
        })
    }

    fn delete_chat(&self, chat_id: &ChatId) -> StorageResult<bool> {
        let database_url = self.database_url.clone();
        let chat_id = chat_id.clone();
        self.run_db_call("chat-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "chat-delete-connect").await?;
            let result = sqlx::query("DELETE FROM chats WHERE id = ?")
                .bind(chat_id.as_str())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "chat-delete-query",
                })?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn clear_all(&self) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("chat-clear-all", async move {
            let mut connection =
                connect_store_connection(&database_url, "chat-clear-all-connect").await?;
            sqlx::query("DELETE FROM chats")
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "chat-clear-all-query",
                })?;
            Ok(())
        })
    }
}

/// Owned, pre-encoded rows so the write future can be `'static`.
struct ChatRows {
    chat_id: String,
    title: String,
    active_branch_path: String,
    created_at: String,
    updated_at: String,
    messages: Vec<MessageRowInput>,
    branches: Vec<BranchRowInput>,
    message_branches: Vec<MessageBranchRowInput>,
}

struct MessageRowInput {
    id: String,
    branch_id: String,
    sender: &'static str,
    sent_at: String,
    payload_json: String,
}

struct BranchRowInput {
    id: String,
    divergence_message_id: String,
    depth: i64,
    child_branches_json: String,
}

struct MessageBranchRowInput {
    message_id: String,
    branch_id: String,
    position: i64,
}

impl ChatRows {
    fn encode(chat: &Chat) -> StorageResult<Self> {
        let messages = chat
            .messages
            .iter()
            .map(|message| {
                Ok(MessageRowInput {
                    id: message.id.to_string(),
                    branch_id: message.branch_id.to_string(),
                    sender: sender_to_sql(message.sender),
                    sent_at: format_timestamp(message.timestamp),
                    payload_json: serde_json::to_string(message).context(EncodeJsonSnafu {
                        stage: "chat-save-encode-message",
                        entity: "message",
                    })?,
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let branches = chat
            .branches
            .branch_tree
            .values()
            .map(|node| {
                Ok(BranchRowInput {
                    id: node.id.to_string(),
                    divergence_message_id: node.message_id.to_string(),
                    depth: node.depth as i64,
                    child_branches_json: serde_json::to_string(&node.child_branches).context(
                        EncodeJsonSnafu {
                            stage: "chat-save-encode-child-branches",
                            entity: "child branch list",
                        },
                    )?,
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let message_branches = chat
            .branches
            .message_branches
            .iter()
            .flat_map(|(message_id, branch_ids)| {
                branch_ids
                    .iter()
                    .enumerate()
                    .map(move |(position, branch_id)| MessageBranchRowInput {
                        message_id: message_id.to_string(),
                        branch_id: branch_id.to_string(),
                        position: position as i64,
                    })
            })
            .collect();

        Ok(Self {
            chat_id: chat.id.to_string(),
            title: chat.title.clone(),
            active_branch_path: serde_json::to_string(&chat.branches.active_branch_path)
                .context(EncodeJsonSnafu {
                    stage: "chat-save-encode-active-path",
                    entity: "active branch path",
                })?,
            created_at: format_timestamp(chat.created_at),
            updated_at: format_timestamp(chat.updated_at),
            messages,
            branches,
            message_branches,
        })
    }
}

#[derive(Debug, FromRow)]
struct ChatRow {
    id: String,
    title: String,
    active_branch_path: String,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct ChatSummaryRow {
    id: String,
    title: String,
    created_at: String,
    updated_at: String,
    message_count: i64,
}

#[derive(Debug, FromRow)]
struct BranchRow {
    id: String,
    divergence_message_id: String,
    depth: i64,
    child_branches_json: String,
}

#[derive(Debug, FromRow)]
struct MessageBranchRow {
    message_id: String,
    branch_id: String,
}

async fn load_chat_with(
    connection: &mut SqliteConnection,
    chat_id: &str,
) -> StorageResult<Option<Chat>> {
    let Some(row) = sqlx::query_as::<_, ChatRow>(
        "SELECT id, title, active_branch_path, created_at, updated_at FROM chats WHERE id = ?",
    )
    .bind(chat_id)
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "chat-load-chat-row",
    })?
    else {
        return Ok(None);
    };

    let payloads = sqlx::query_scalar::<_, String>(
        "SELECT payload_json FROM messages WHERE chat_id = ? ORDER BY position ASC",
    )
    .bind(chat_id)
    .fetch_all(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "chat-load-messages",
    })?;

    let branch_rows = sqlx::query_as::<_, BranchRow>(
        "SELECT id, divergence_message_id, depth, child_branches_json FROM branches WHERE chat_id = ?",
    )
    .bind(chat_id)
    .fetch_all(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "chat-load-branches",
    })?;

    let index_rows = sqlx::query_as::<_, MessageBranchRow>(
        "SELECT message_id, branch_id FROM message_branches WHERE chat_id = ? ORDER BY message_id ASC, position ASC",
    )
    .bind(chat_id)
    .fetch_all(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "chat-load-message-branches",
    })?;

    let messages = payloads
        .iter()
        .map(|payload| {
            serde_json::from_str::<Message>(payload).context(DecodeJsonSnafu {
                stage: "chat-load-decode-message",
                entity: "message",
            })
        })
        .collect::<StorageResult<Vec<_>>>()?;

    let mut branch_tree = BTreeMap::new();
    for branch in branch_rows {
        let depth = usize::try_from(branch.depth).map_err(|_| {
            super::error::StorageError::InvariantViolation {
                stage: "chat-load-branch-depth",
                details: format!("negative branch depth '{}'", branch.depth),
            }
        })?;
        let child_branches = serde_json::from_str::<Vec<BranchId>>(&branch.child_branches_json)
            .context(DecodeJsonSnafu {
                stage: "chat-load-decode-child-branches",
                entity: "child branch list",
            })?;
        let id = BranchId::new(branch.id);
        branch_tree.insert(
            id.clone(),
            BranchNode {
                id,
                message_id: MessageId::new(branch.divergence_message_id),
                depth,
                child_branches,
            },
        );
    }

    let mut message_branches: BTreeMap<MessageId, Vec<BranchId>> = BTreeMap::new();
    for entry in index_rows {
        message_branches
            .entry(MessageId::new(entry.message_id))
            .or_default()
            .push(BranchId::new(entry.branch_id));
    }

    let active_branch_path = serde_json::from_str::<Vec<BranchId>>(&row.active_branch_path)
        .context(DecodeJsonSnafu {
            stage: "chat-load-decode-active-path",
            entity: "active branch path",
        })?;

    let mut chat = Chat::new(ChatId::new(row.id), row.title);
    chat.messages = messages;
    chat.branches = BranchModel {
        active_branch_path,
        branch_tree,
        message_branches,
    };
    chat.branches.normalize();
    chat.created_at = parse_timestamp(&row.created_at, "chat-load-created-at")?;
    chat.updated_at = parse_timestamp(&row.updated_at, "chat-load-updated-at")?;
    Ok(Some(chat))
}

fn summary_row_to_record(row: ChatSummaryRow) -> StorageResult<ChatSummary> {
    Ok(ChatSummary {
        id: ChatId::new(row.id),
        title: row.title,
        message_count: u64::try_from(row.message_count).map_err(|_| {
            super::error::StorageError::InvariantViolation {
                stage: "chat-summary-message-count",
                details: format!("negative message count '{}'", row.message_count),
            }
        })?,
        created_at: parse_timestamp(&row.created_at, "chat-summary-created-at")?,
        updated_at: parse_timestamp(&row.updated_at, "chat-summary-updated-at")?,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection = SqliteConnection::connect(database_url)
        .await
        .context(SqliteConnectSnafu {
            stage,
            database_url: database_url.to_string(),
        })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn sender_to_sql(sender: Sender) -> &'static str {
    match sender {
        Sender::User => "user",
        Sender::Ai => "ai",
    }
}

// Fixed-width UTC form so text ordering in SQL matches time ordering.
fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str, stage: &'static str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .context(InvalidTimestampSnafu {
            stage,
            raw: raw.to_string(),
        })
}

static IN_MEMORY_DATABASE_SEQ: AtomicU64 = AtomicU64::new(0);

fn is_in_memory_location(database_location: &str) -> bool {
    matches!(database_location, ":memory:" | "sqlite::memory:" | "sqlite://:memory:")
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || is_in_memory_location(database_location) {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

/// In-memory locations get a unique named shared-cache database. Every connection opened
/// from the returned url sees the same tables for as long as the pool lives.
fn normalize_database_url(database_location: &str) -> String {
    if is_in_memory_location(database_location) {
        let seq = IN_MEMORY_DATABASE_SEQ.fetch_add(1, Ordering::Relaxed);
        return format!(
            "sqlite:file:trellis-memory-{}-{seq}?mode=memory&cache=shared",
            std::process::id()
        );
    }

    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use trellis_core::{
        BranchId, Message, create_branch_from_message, resolve_visible_messages,
        switch_to_branch,
    };

    use super::*;

    fn branched_chat() -> Chat {
        let mut chat = Chat::new(ChatId::generate(), "persisted");
        let start = Utc::now();
        let question = Message::user("hello").with_timestamp(start);
        let question_id = question.id.clone();
        chat.push_message(question);
        let mut answer =
            Message::ai_placeholder().with_timestamp(start + ChronoDuration::seconds(1));
        answer.text = "hi".to_string();
        answer.is_complete = Some(true);
        chat.push_message(answer);

        let branch = create_branch_from_message(
            &mut chat,
            &question_id,
            Message::user("hello again").with_timestamp(start + ChronoDuration::seconds(2)),
        )
        .expect("branch");
        switch_to_branch(&mut chat, &branch).expect("switch");
        chat
    }

    async fn open_temp(dir: &tempfile::TempDir) -> SqliteStorage {
        let path = dir.path().join("chats.sqlite");
        SqliteStorage::open(&path.display().to_string())
            .await
            .expect("open sqlite storage")
    }

    #[tokio::test]
    async fn saved_chat_reloads_with_same_visible_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = open_temp(&dir).await;
        let chat = branched_chat();

        storage.save_chat(&chat).expect("save chat");
        let loaded = storage
            .load_chat(&chat.id)
            .expect("load chat")
            .expect("chat exists");

        assert_eq!(loaded.messages, chat.messages);
        assert_eq!(loaded.branches, chat.branches);
        assert_eq!(loaded.updated_at, chat.updated_at);
        assert_eq!(
            resolve_visible_messages(&loaded, loaded.active_branch_path()),
            resolve_visible_messages(&chat, chat.active_branch_path())
        );
    }

    #[tokio::test]
    async fn resaving_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = open_temp(&dir).await;
        let mut chat = branched_chat();
        storage.save_chat(&chat).expect("first save");

        let branch = chat.branches.leaf_branch();
        trellis_core::delete_branch(&mut chat, &branch).expect("delete branch");
        storage.save_chat(&chat).expect("second save");

        let loaded = storage
            .load_chat(&chat.id)
            .expect("load chat")
            .expect("chat exists");
        assert_eq!(loaded.messages.len(), 2);
        assert!(loaded.branches.branch_tree.is_empty());
        assert_eq!(loaded.active_branch_path(), &[BranchId::main()]);
    }

    #[tokio::test]
    async fn list_orders_by_recency_and_delete_cascades() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = open_temp(&dir).await;

        let older = branched_chat();
        let mut newer = Chat::new(ChatId::generate(), "newer");
        newer.push_message(Message::user("fresh"));
        newer.updated_at = older.updated_at + ChronoDuration::seconds(5);

        storage.save_chat(&older).expect("save older");
        storage.save_chat(&newer).expect("save newer");

        let summaries = storage.list_chats().expect("list chats");
        assert_eq!(
            summaries.iter().map(|summary| summary.id.clone()).collect::<Vec<_>>(),
            vec![newer.id.clone(), older.id.clone()]
        );
        assert_eq!(summaries[1].message_count, 3);

        assert!(storage.delete_chat(&older.id).expect("delete"));
        assert!(!storage.delete_chat(&older.id).expect("second delete"));
        assert!(storage.load_chat(&older.id).expect("load").is_none());
        let orphaned =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE chat_id = ?")
                .bind(older.id.as_str())
                .fetch_one(storage.pool())
                .await
                .expect("count messages");
        assert_eq!(orphaned, 0);

        storage.clear_all().expect("clear");
        assert!(storage.load_all_chats().expect("load all").is_empty());
    }

    #[tokio::test]
    async fn in_memory_database_keeps_saved_chats() {
        let storage = SqliteStorage::open(":memory:")
            .await
            .expect("open in-memory storage");
        let chat = branched_chat();

        storage.save_chat(&chat).expect("save chat");
        let loaded = storage
            .load_chat(&chat.id)
            .expect("load chat")
            .expect("chat exists");

        assert_eq!(loaded.messages, chat.messages);
        assert_eq!(loaded.branches, chat.branches);
        assert_eq!(storage.list_chats().expect("list chats").len(), 1);
    }

    #[tokio::test]
    async fn in_memory_databases_are_isolated() {
        let first = SqliteStorage::open(":memory:").await.expect("open first");
        let second = SqliteStorage::open("sqlite::memory:")
            .await
            .expect("open second");

        first
            .save_chat(&Chat::new(ChatId::new("chat-only-first"), "first"))
            .expect("save chat");

        assert_eq!(first.load_all_chats().expect("load first").len(), 1);
        assert!(second.load_all_chats().expect("load second").is_empty());
    }
}
