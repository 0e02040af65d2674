use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use trellis_core::{BranchId, ChatId, Message, MessageFile, MessageId, MessageState};
use trellis_llm::{ChatAdapter, FileUpload, MockAdapter, create_adapter};
use trellis_storage::{ChatRepository, SqliteStorage};

use crate::command::{Command, HELP_TEXT};
use crate::engine::ChatEngine;
use crate::error::{BranchSnafu, EngineResult};
use crate::events::{ChatEvent, NoticeLevel};
use crate::settings::AppSettings;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ReplError {
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type ReplResult<T> = Result<T, ReplError>;

/// Builds the engine described by `settings`. Backend or database problems degrade to the
/// mock adapter and in-memory chats instead of failing startup.
pub async fn build_engine(settings: &AppSettings) -> Arc<ChatEngine> {
    let adapter: Arc<dyn ChatAdapter> = if settings.is_valid() {
        match create_adapter(settings.to_adapter_config()) {
            Ok(adapter) => adapter,
            Err(error) => {
                tracing::warn!(
                    adapter_id = %settings.adapter_id,
                    error = %error,
                    "failed to create adapter, falling back to mock"
                );
                Arc::new(MockAdapter::new())
            }
        }
    } else {
        tracing::warn!(
            adapter_id = %settings.adapter_id,
            "no API key configured, falling back to mock"
        );
        Arc::new(MockAdapter::new())
    };

    let mut engine = ChatEngine::new(adapter).with_response_mode(settings.response_mode);
    if let Some(path) = &settings.database_path {
        match SqliteStorage::open(&path.to_string_lossy()).await {
            Ok(storage) => {
                let repository: Arc<dyn ChatRepository> = Arc::new(storage);
                engine = engine.with_repository(repository);
            }
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to open chat database, chats stay in memory"
                );
            }
        }
    }

    if let Err(error) = engine.load_from_repository() {
        tracing::warn!(error = %error, "failed to load stored chats");
    }
    Arc::new(engine)
}

/// Line-oriented front end over a [`ChatEngine`].
pub struct Repl {
    engine: Arc<ChatEngine>,
    active_chat: ChatId,
    generation: Option<JoinHandle<()>>,
    attachments: Vec<MessageFile>,
    listed_chats: Vec<ChatId>,
}

impl Repl {
    pub fn new(engine: Arc<ChatEngine>) -> Self {
        let active_chat = engine
            .store()
            .active_chat_id()
            .or_else(|| engine.store().list_chats().first().map(|chat| chat.id.clone()))
            .unwrap_or_else(|| engine.create_chat(None));
        Self {
            engine,
            active_chat,
            generation: None,
            attachments: Vec::new(),
            listed_chats: Vec::new(),
        }
    }

    pub async fn run(mut self) -> ReplResult<()> {
        let printer = tokio::spawn(print_events(
            Arc::clone(&self.engine),
            self.engine.subscribe(),
        ));
        println!(
            "trellis ({} adapter), /help for commands",
            self.engine.adapter_id()
        );
        self.print_conversation();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
            stage: "read-line",
        })? {
            match Command::parse(&line) {
                Ok(None) => {}
                Ok(Some(Command::Quit)) => break,
                Ok(Some(command)) => {
                    if let Err(error) = self.execute(command).await {
                        println!("error: {error}");
                    }
                }
                Err(error) => println!("{error}"),
            }
        }

        let cancelled = self.engine.shutdown();
        tracing::debug!(cancelled, "shutting down");
        if let Some(generation) = self.generation.take() {
            join_generation(generation).await;
        }
        printer.abort();
        Ok(())
    }

    async fn execute(&mut self, command: Command) -> EngineResult<()> {
        let chat_id = self.active_chat.clone();
        match command {
            Command::Send(text) => {
                let files = std::mem::take(&mut self.attachments);
                self.spawn_generation(move |engine| async move {
                    engine.send_message(&chat_id, &text, files).await.map(|_| ())
                });
            }
            Command::Regenerate => {
                self.spawn_generation(move |engine| async move {
                    engine.regenerate_response(&chat_id, None).await.map(|_| ())
                });
            }
            Command::Edit { index, text } => {
                let Some(message_id) = self.visible_message_id(index)? else {
                    return Ok(());
                };
                self.spawn_generation(move |engine| async move {
                    engine
                        .edit_message(&chat_id, &message_id, &text)
                        .await
                        .map(|_| ())
                });
            }
            Command::Branch { index, text } => {
                let Some(message_id) = self.visible_message_id(index)? else {
                    return Ok(());
                };
                self.spawn_generation(move |engine| async move {
                    let edit = engine.create_branch(&chat_id, &message_id, &text).await?;
                    println!("[on branch {}]", edit.branch_id);
                    Ok(())
                });
            }
            Command::Versions { index } => {
                let Some(message_id) = self.visible_message_id(index)? else {
                    return Ok(());
                };
                let options = self
                    .engine
                    .store()
                    .branch_options(&chat_id, &message_id)
                    .context(BranchSnafu {
                        stage: "repl-versions",
                    })?;
                if options.is_empty() {
                    println!("message {index} has a single version");
                }
                for option in options {
                    let text = self
                        .engine
                        .store()
                        .message(&chat_id, &option.message_id)
                        .map(|message| preview(&message.text))
                        .unwrap_or_default();
                    let marker = if option.is_current { "*" } else { " " };
                    println!("{marker} {}: {text}", option.branch_id);
                }
            }
            Command::Switch { branch } => {
                self.engine
                    .switch_branch(&chat_id, &BranchId::new(branch))?;
                self.print_conversation();
            }
            Command::Prune { branch } => {
                self.engine
                    .delete_branch(&chat_id, &BranchId::new(branch))?;
                self.print_conversation();
            }
            Command::Path => self.print_conversation(),
            Command::Stop => {
                if self.engine.pause_chat_request(&chat_id) == 0 {
                    println!("nothing is being generated");
                }
            }
            Command::Attach { path } => self.attach(&path).await,
            Command::New { title } => {
                self.active_chat = self.engine.create_chat(title.as_deref());
                self.print_conversation();
            }
            Command::Chats => {
                let chats = self.engine.store().list_chats();
                self.listed_chats = chats.iter().map(|chat| chat.id.clone()).collect();
                for (position, chat) in chats.iter().enumerate() {
                    let marker = if chat.id == self.active_chat { "*" } else { " " };
                    println!(
                        "{marker} {}. {} ({} messages)",
                        position + 1,
                        chat.title,
                        chat.message_count
                    );
                }
            }
            Command::Open { index } => {
                let Some(target) = self.listed_chats.get(index - 1).cloned() else {
                    println!("no chat {index}, run /chats first");
                    return Ok(());
                };
                self.engine
                    .store()
                    .set_active_chat(&target)
                    .context(BranchSnafu { stage: "repl-open" })?;
                self.active_chat = target;
                self.print_conversation();
            }
            Command::Rename { title } => self.engine.rename_chat(&chat_id, &title)?,
            Command::Delete => {
                self.engine.delete_chat(&chat_id)?;
                self.active_chat = match self.engine.store().active_chat_id() {
                    Some(next) => next,
                    None => self.engine.create_chat(None),
                };
                self.print_conversation();
            }
            Command::Export { path } => {
                let exported = self.engine.export_to_path(None, &path)?;
                println!("exported {exported} chats to {}", path.display());
            }
            Command::Import { path } => {
                let imported = self.engine.import_from_path(&path, true)?;
                println!("imported {imported} chats from {}", path.display());
            }
            Command::Help => println!("{HELP_TEXT}"),
            Command::Quit => {}
        }
        Ok(())
    }

    /// Generations run in the background so `/stop` stays responsive. Only one runs at a time.
    fn spawn_generation<F, Fut>(&mut self, work: F)
    where
        F: FnOnce(Arc<ChatEngine>) -> Fut,
        Fut: Future<Output = EngineResult<()>> + Send + 'static,
    {
        if self
            .generation
            .as_ref()
            .is_some_and(|generation| !generation.is_finished())
        {
            println!("a reply is still being generated, /stop to pause it");
            return;
        }

        let task = work(Arc::clone(&self.engine));
        self.generation = Some(tokio::spawn(async move {
            if let Err(error) = task.await {
                println!("error: {error}");
            }
        }));
    }

    fn visible_message_id(&self, index: usize) -> EngineResult<Option<MessageId>> {
        let visible = self
            .engine
            .store()
            .visible_messages(&self.active_chat)
            .context(BranchSnafu {
                stage: "repl-visible-message",
            })?;
        let message_id = visible.get(index - 1).map(|message| message.id.clone());
        if message_id.is_none() {
            println!("no message {index}");
        }
        Ok(message_id)
    }

    async fn attach(&mut self, path: &Path) {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(error) => {
                println!("cannot read {}: {error}", path.display());
                return;
            }
        };
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let upload = FileUpload {
            mime_type: guess_mime_type(path).to_string(),
            name,
            bytes,
        };

        let report = self.engine.upload_files(vec![upload]).await;
        for file in report.uploaded {
            println!("attached {} ({} bytes)", file.name, file.size);
            self.attachments.push(file);
        }
    }

    fn print_conversation(&self) {
        let store = self.engine.store();
        let Some(chat) = store.get_chat(&self.active_chat) else {
            return;
        };
        let path = store
            .breadcrumb(&self.active_chat)
            .unwrap_or_default()
            .iter()
            .map(|segment| segment.branch_id.to_string())
            .collect::<Vec<_>>()
            .join(" > ");
        println!("== {} [{path}]", chat.title);

        let visible = store.visible_messages(&self.active_chat).unwrap_or_default();
        for (position, message) in visible.iter().enumerate() {
            let versions = store
                .branch_options(&self.active_chat, &message.id)
                .map(|options| options.len())
                .unwrap_or_default();
            let versions = if versions > 1 {
                format!(" ({versions} versions)")
            } else {
                String::new()
            };
            println!("{:>3}. {}{versions}", position + 1, describe(message));
        }
    }
}

/// Echoes streaming replies as they grow.
async fn print_events(engine: Arc<ChatEngine>, mut events: broadcast::Receiver<ChatEvent>) {
    let mut shown: HashMap<MessageId, String> = HashMap::new();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "output fell behind generation events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            ChatEvent::StreamStarted { message_id, .. } => {
                shown.insert(message_id, String::new());
                print!("ai> ");
                flush_stdout();
            }
            ChatEvent::MessageUpdated {
                chat_id,
                message_id,
            } => {
                let Some(printed) = shown.get_mut(&message_id) else {
                    continue;
                };
                if let Some(message) = engine.store().message(&chat_id, &message_id) {
                    print_growth(printed, &message.text);
                }
            }
            ChatEvent::StreamFinished {
                chat_id,
                message_id,
                state,
            } => {
                let Some(mut printed) = shown.remove(&message_id) else {
                    continue;
                };
                if let Some(message) = engine.store().message(&chat_id, &message_id) {
                    print_growth(&mut printed, &message.text);
                    if let Some(image_url) = &message.image_url {
                        print!("\n     [image] {image_url}");
                    }
                }
                match state {
                    MessageState::CompleteButPaused => println!(" [paused]"),
                    _ => println!(),
                }
            }
            ChatEvent::Notice { level, text } => match level {
                NoticeLevel::Info => println!("[info] {text}"),
                NoticeLevel::Warning => println!("[warning] {text}"),
                NoticeLevel::Error => println!("[error] {text}"),
            },
            ChatEvent::ChatsChanged => {}
        }
    }
}

fn print_growth(printed: &mut String, current: &str) {
    match current.strip_prefix(printed.as_str()) {
        Some(delta) => print!("{delta}"),
        // Replaced rather than grown, e.g. by the failure text.
        None => print!("\n     {current}"),
    }
    flush_stdout();
    *printed = current.to_string();
}

fn flush_stdout() {
    let _ = std::io::stdout().flush();
}

fn describe(message: &Message) -> String {
    let speaker = if message.is_user() { "you" } else { "ai" };
    let mut line = format!("{speaker}: {}", preview(&message.text));
    if !message.files.is_empty() {
        let names = message
            .files
            .iter()
            .map(|file| file.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        line.push_str(&format!(" [files: {names}]"));
    }
    match message.state() {
        MessageState::CompleteButPaused => line.push_str(" [paused]"),
        MessageState::Pending | MessageState::Streaming if message.is_ai() => {
            line.push_str(" [generating]")
        }
        _ => {}
    }
    line
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 120;
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= LIMIT {
        return single_line;
    }
    let truncated = single_line.chars().take(LIMIT).collect::<String>();
    format!("{truncated}...")
}

fn guess_mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|extension| extension.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Waits for a background generation, logging a panicked or aborted task instead of dropping it.
async fn join_generation(generation: JoinHandle<()>) -> bool {
    match generation.await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(error = %error, "generation task ended abnormally");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_prints_only_the_new_suffix() {
        let mut printed = "Hi".to_string();
        print_growth(&mut printed, "Hi there");
        assert_eq!(printed, "Hi there");
    }

    #[test]
    fn preview_truncates_long_text_on_char_boundaries() {
        let long = "é".repeat(200);
        let shown = preview(&long);
        assert!(shown.ends_with("..."));
        assert_eq!(shown.chars().count(), 123);
        assert_eq!(preview("short\nline"), "short line");
    }

    #[test]
    fn mime_type_follows_extension() {
        assert_eq!(guess_mime_type(Path::new("notes.MD")), "text/markdown");
        assert_eq!(guess_mime_type(Path::new("photo.jpeg")), "image/jpeg");
        assert_eq!(guess_mime_type(Path::new("blob")), "application/octet-stream");
    }

    #[tokio::test]
    async fn panicked_generation_is_reported_not_propagated() {
        let finished = tokio::spawn(async {});
        assert!(join_generation(finished).await);

        let panicked = tokio::spawn(async { panic!("generation blew up") });
        assert!(!join_generation(panicked).await);
    }

    #[tokio::test]
    async fn missing_key_for_remote_adapter_falls_back_to_mock() {
        let settings = AppSettings {
            adapter_id: "openai".to_string(),
            ..AppSettings::default()
        };
        let engine = build_engine(&settings).await;
        assert_eq!(engine.adapter_id(), trellis_llm::MOCK_ADAPTER_ID);
    }
}
