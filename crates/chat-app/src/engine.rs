use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use snafu::{ResultExt, ensure};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use trellis_core::{
    BranchError, BranchId, ChatId, ConversationMessage, Message, MessageFile, MessageId,
    MessagePatch, history_before,
};
use trellis_llm::{ChatAdapter, FileUpload, StreamFailure};
use trellis_storage::{ChatDump, ChatRepository};

use crate::error::{
    BranchSnafu, EmptyMessageSnafu, EngineError, EngineResult, MessageNotEditableSnafu,
    NothingToRegenerateSnafu, StorageSnafu,
};
use crate::events::{ChatEvent, NoticeLevel, event_channel};
use crate::store::ChatStore;
use crate::stream::{
    ResponseMode, StreamManager, StreamOutcome, StreamingCallbacks, StreamingContext,
    StreamingMessageHandler,
};

/// Result of a branch-creating edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchEdit {
    pub branch_id: BranchId,
    pub user_message_id: MessageId,
    pub ai_message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
    pub file_name: String,
    pub message: String,
}

/// Per-file upload results; one failure never hides the others.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UploadReport {
    pub uploaded: Vec<MessageFile>,
    pub failed: Vec<UploadFailure>,
}

/// Coordinates the store, the stream registry and the backend adapter.
///
/// Every generation ends with its AI message in a terminal state; adapter and transport
/// failures surface on the message and as a [`ChatEvent::Notice`], never as an error here.
pub struct ChatEngine {
    store: Arc<ChatStore>,
    streams: Arc<StreamManager>,
    adapter: RwLock<Arc<dyn ChatAdapter>>,
    mode: RwLock<ResponseMode>,
    repository: Option<Arc<dyn ChatRepository>>,
    events: broadcast::Sender<ChatEvent>,
    shutdown: CancellationToken,
}

impl ChatEngine {
    pub fn new(adapter: Arc<dyn ChatAdapter>) -> Self {
        let streams = Arc::new(StreamManager::new());
        let (events, _) = event_channel();
        Self {
            store: Arc::new(ChatStore::new(Arc::clone(&streams))),
            streams,
            adapter: RwLock::new(adapter),
            mode: RwLock::new(ResponseMode::default()),
            repository: None,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_repository(mut self, repository: Arc<dyn ChatRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_response_mode(self, mode: ResponseMode) -> Self {
        *self.mode.write() = mode;
        self
    }

    pub fn store(&self) -> &Arc<ChatStore> {
        &self.store
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn response_mode(&self) -> ResponseMode {
        *self.mode.read()
    }

    pub fn set_response_mode(&self, mode: ResponseMode) {
        *self.mode.write() = mode;
    }

    pub fn adapter_id(&self) -> String {
        self.adapter.read().id().to_string()
    }

    /// Swaps the backend. Generations already running keep the adapter they started with.
    pub fn set_adapter(&self, adapter: Arc<dyn ChatAdapter>) {
        tracing::info!(adapter_id = %adapter.id(), "switched chat adapter");
        *self.adapter.write() = adapter;
    }

    pub fn is_generating(&self, chat_id: &ChatId) -> bool {
        self.streams.is_streaming_in_chat(chat_id)
    }

    pub fn create_chat(&self, title: Option<&str>) -> ChatId {
        let chat_id = self.store.create_chat(title);
        self.persist(&chat_id);
        self.publish(ChatEvent::ChatsChanged);
        chat_id
    }

    pub fn rename_chat(&self, chat_id: &ChatId, title: &str) -> EngineResult<()> {
        self.store
            .rename_chat(chat_id, title)
            .context(BranchSnafu {
                stage: "rename-chat",
            })?;
        self.persist(chat_id);
        self.publish(ChatEvent::ChatsChanged);
        Ok(())
    }

    /// Stops the chat's streams, then removes it from memory and storage.
    pub fn delete_chat(&self, chat_id: &ChatId) -> EngineResult<bool> {
        let existed = self.store.delete_chat(chat_id);
        if let Some(repository) = &self.repository {
            repository.delete_chat(chat_id).context(StorageSnafu {
                stage: "delete-chat",
            })?;
        }
        self.publish(ChatEvent::ChatsChanged);
        Ok(existed)
    }

    pub fn clear_all_chats(&self) -> EngineResult<usize> {
        let cleared = self.store.clear_all_chats();
        if let Some(repository) = &self.repository {
            repository.clear_all().context(StorageSnafu {
                stage: "clear-all-chats",
            })?;
        }
        self.publish(ChatEvent::ChatsChanged);
        Ok(cleared)
    }

    /// Appends the user turn and an AI placeholder, then generates into the placeholder.
    /// Returns the AI message id.
    pub async fn send_message(
        &self,
        chat_id: &ChatId,
        text: &str,
        files: Vec<MessageFile>,
    ) -> EngineResult<MessageId> {
        let text = text.trim();
        ensure!(
            !text.is_empty() || !files.is_empty(),
            EmptyMessageSnafu {
                stage: "send-message",
            }
        );

        let user = Message::user(text).with_files(files.clone());
        let user_message_id = self
            .store
            .add_message_to_chat(chat_id, user)
            .context(BranchSnafu {
                stage: "send-message-user",
            })?;
        let ai_message_id = self
            .store
            .add_message_to_chat(chat_id, Message::ai_placeholder())
            .context(BranchSnafu {
                stage: "send-message-placeholder",
            })?;
        self.publish_message_updated(chat_id, &user_message_id);
        self.publish_message_updated(chat_id, &ai_message_id);
        self.persist(chat_id);

        let history = self.history_for(chat_id, &ai_message_id)?;
        self.generate(StreamingContext {
            chat_id: chat_id.clone(),
            message_id: ai_message_id.clone(),
            user_text: text.to_string(),
            user_files: files,
            history,
        })
        .await;
        Ok(ai_message_id)
    }

    /// Regenerates an AI message: the given one, the AI reply following a given user
    /// message, or the last visible AI message when `message_id` is `None`.
    pub async fn regenerate_response(
        &self,
        chat_id: &ChatId,
        message_id: Option<&MessageId>,
    ) -> EngineResult<MessageId> {
        let visible = self.visible_messages(chat_id, "regenerate-visible")?;
        let target = match message_id {
            None => visible.iter().rev().find(|message| message.is_ai()),
            Some(message_id) => {
                let position = visible
                    .iter()
                    .position(|message| &message.id == message_id)
                    .ok_or_else(|| message_not_found("regenerate-target", chat_id, message_id))?;
                visible[position..].iter().find(|message| message.is_ai())
            }
        };
        let Some(target) = target else {
            return NothingToRegenerateSnafu {
                stage: "regenerate-target",
                chat_id: chat_id.clone(),
            }
            .fail();
        };

        let ai_message_id = target.id.clone();
        self.regenerate_visible(chat_id, &visible, &ai_message_id).await?;
        Ok(ai_message_id)
    }

    /// In-place edit of a user message followed by regeneration of the reply after it.
    ///
    /// When the edited message is the last visible one a fresh AI placeholder is appended.
    /// Returns the regenerated AI message, if any.
    pub async fn edit_message(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        new_text: &str,
    ) -> EngineResult<Option<MessageId>> {
        let new_text = new_text.trim();
        ensure!(
            !new_text.is_empty(),
            EmptyMessageSnafu {
                stage: "edit-message",
            }
        );
        self.ensure_user_message(chat_id, message_id, "edit-message")?;

        self.store
            .update_message_in_chat(chat_id, message_id, &MessagePatch::text_edit(new_text))
            .context(BranchSnafu {
                stage: "edit-message-text",
            })?;
        self.publish_message_updated(chat_id, message_id);

        let visible = self.visible_messages(chat_id, "edit-message-visible")?;
        let position = visible
            .iter()
            .position(|message| &message.id == message_id)
            .ok_or_else(|| message_not_found("edit-message-visible", chat_id, message_id))?;

        match visible.get(position + 1) {
            Some(next) if next.is_ai() => {
                let ai_message_id = next.id.clone();
                self.regenerate_visible(chat_id, &visible, &ai_message_id).await?;
                Ok(Some(ai_message_id))
            }
            Some(_) => {
                self.persist(chat_id);
                Ok(None)
            }
            None => {
                let ai_message_id = self
                    .store
                    .add_message_to_chat(chat_id, Message::ai_placeholder())
                    .context(BranchSnafu {
                        stage: "edit-message-placeholder",
                    })?;
                self.publish_message_updated(chat_id, &ai_message_id);
                let visible = self.visible_messages(chat_id, "edit-message-visible")?;
                self.regenerate_visible(chat_id, &visible, &ai_message_id).await?;
                Ok(Some(ai_message_id))
            }
        }
    }

    /// Branch-creating edit: the edited text becomes a new sibling version of `source`,
    /// the active path moves to it and a fresh reply is generated in that branch.
    pub async fn create_branch(
        &self,
        chat_id: &ChatId,
        source: &MessageId,
        new_text: &str,
    ) -> EngineResult<BranchEdit> {
        let new_text = new_text.trim();
        ensure!(
            !new_text.is_empty(),
            EmptyMessageSnafu {
                stage: "create-branch",
            }
        );
        let original = self.ensure_user_message(chat_id, source, "create-branch")?;

        let draft = Message::user(new_text).with_files(original.files.clone());
        let user_message_id = draft.id.clone();
        let branch_id = self
            .store
            .create_branch(chat_id, source, draft)
            .context(BranchSnafu {
                stage: "create-branch",
            })?;
        self.store
            .switch_branch(chat_id, &branch_id)
            .context(BranchSnafu {
                stage: "create-branch-switch",
            })?;
        let ai_message_id = self
            .store
            .add_message_to_chat(chat_id, Message::ai_placeholder())
            .context(BranchSnafu {
                stage: "create-branch-placeholder",
            })?;
        tracing::debug!(
            chat_id = %chat_id,
            source_message_id = %source,
            branch_id = %branch_id,
            "created branch from edit"
        );
        self.persist(chat_id);
        self.publish(ChatEvent::ChatsChanged);
        self.publish_message_updated(chat_id, &ai_message_id);

        let history = self.history_for(chat_id, &ai_message_id)?;
        self.generate(StreamingContext {
            chat_id: chat_id.clone(),
            message_id: ai_message_id.clone(),
            user_text: new_text.to_string(),
            user_files: original.files,
            history,
        })
        .await;

        Ok(BranchEdit {
            branch_id,
            user_message_id,
            ai_message_id,
        })
    }

    pub fn switch_branch(
        &self,
        chat_id: &ChatId,
        branch_id: &BranchId,
    ) -> EngineResult<Vec<BranchId>> {
        let path = self
            .store
            .switch_branch(chat_id, branch_id)
            .context(BranchSnafu {
                stage: "switch-branch",
            })?;
        self.persist(chat_id);
        self.publish(ChatEvent::ChatsChanged);
        Ok(path)
    }

    pub fn delete_branch(&self, chat_id: &ChatId, branch_id: &BranchId) -> EngineResult<()> {
        self.store
            .delete_branch(chat_id, branch_id)
            .context(BranchSnafu {
                stage: "delete-branch",
            })?;
        self.persist(chat_id);
        self.publish(ChatEvent::ChatsChanged);
        Ok(())
    }

    /// Pauses every generation running in the chat. The messages end up paused with their
    /// partial text kept.
    pub fn pause_chat_request(&self, chat_id: &ChatId) -> usize {
        let stopped = self.streams.stop_all_streams_for_chat(chat_id);
        tracing::debug!(chat_id = %chat_id, stopped, "pause requested");
        stopped
    }

    pub fn stop_message(&self, chat_id: &ChatId, message_id: &MessageId) -> bool {
        self.streams.stop_stream(chat_id, message_id)
    }

    /// Uploads each file independently. Failures are reported per file and as notices.
    pub async fn upload_files(&self, uploads: Vec<FileUpload>) -> UploadReport {
        let adapter = self.adapter.read().clone();
        let cancel = self.shutdown.child_token();

        let results = futures::future::join_all(uploads.into_iter().map(|upload| {
            let adapter = Arc::clone(&adapter);
            let cancel = cancel.clone();
            async move {
                let file_name = upload.name.clone();
                (file_name, adapter.upload_file(upload, cancel).await)
            }
        }))
        .await;

        let mut report = UploadReport::default();
        for (file_name, result) in results {
            match result {
                Ok(file) => report.uploaded.push(file),
                Err(error) => {
                    tracing::warn!(file_name = %file_name, error = %error, "file upload failed");
                    self.publish(ChatEvent::Notice {
                        level: NoticeLevel::Warning,
                        text: format!("Failed to upload {file_name}: {error}"),
                    });
                    report.failed.push(UploadFailure {
                        file_name,
                        message: error.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Cancels uploads and every running generation.
    pub fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        self.streams.cleanup()
    }

    /// Replaces in-memory chats with the repository's. Returns how many were loaded.
    pub fn load_from_repository(&self) -> EngineResult<usize> {
        let Some(repository) = &self.repository else {
            return Ok(0);
        };
        let chats = repository.load_all_chats().context(StorageSnafu {
            stage: "load-from-repository",
        })?;
        let loaded = self.store.load(ChatDump::new(chats), true, None);
        tracing::info!(loaded, "loaded chats from storage");
        self.publish(ChatEvent::ChatsChanged);
        Ok(loaded)
    }

    pub fn dump(&self, chat_id: Option<&ChatId>) -> EngineResult<ChatDump> {
        self.store.dump(chat_id).context(BranchSnafu { stage: "dump" })
    }

    /// Loads chats from a dump and persists every chat that was taken over.
    pub fn load(&self, dump: ChatDump, replace_existing: bool, only: Option<&ChatId>) -> usize {
        let chat_ids = dump
            .chats
            .iter()
            .map(|chat| chat.id.clone())
            .filter(|chat_id| only.is_none_or(|only| only == chat_id))
            .collect::<Vec<_>>();
        let before = chat_ids
            .iter()
            .map(|chat_id| self.store.get_chat(chat_id))
            .collect::<Vec<_>>();

        let loaded = self.store.load(dump, replace_existing, only);
        for (chat_id, previous) in chat_ids.iter().zip(before) {
            if previous.is_none() || replace_existing {
                self.persist(chat_id);
            }
        }
        self.publish(ChatEvent::ChatsChanged);
        loaded
    }

    pub fn export_to_path(&self, chat_id: Option<&ChatId>, path: &Path) -> EngineResult<usize> {
        let dump = self.dump(chat_id)?;
        dump.write_to_path(path).context(StorageSnafu {
            stage: "export-to-path",
        })?;
        tracing::info!(path = ?path, chats = dump.chats.len(), "exported chats");
        Ok(dump.chats.len())
    }

    pub fn import_from_path(&self, path: &Path, replace_existing: bool) -> EngineResult<usize> {
        let dump = ChatDump::read_from_path(path).context(StorageSnafu {
            stage: "import-from-path",
        })?;
        let loaded = self.load(dump, replace_existing, None);
        tracing::info!(path = ?path, loaded, "imported chats");
        Ok(loaded)
    }

    async fn regenerate_visible(
        &self,
        chat_id: &ChatId,
        visible: &[Message],
        ai_message_id: &MessageId,
    ) -> EngineResult<()> {
        let history = history_before(visible, ai_message_id);
        // The prompt being answered is the last user turn before the reply.
        let prompt = visible
            .iter()
            .take_while(|message| &message.id != ai_message_id)
            .filter(|message| message.is_user())
            .last();
        let user_text = prompt
            .map(|message| message.text.clone())
            .unwrap_or_default();
        let user_files = prompt
            .map(|message| message.files.clone())
            .unwrap_or_default();

        self.store
            .update_message_in_chat(chat_id, ai_message_id, &MessagePatch::ai_reset())
            .context(BranchSnafu {
                stage: "regenerate-reset",
            })?;
        self.publish_message_updated(chat_id, ai_message_id);

        self.generate(StreamingContext {
            chat_id: chat_id.clone(),
            message_id: ai_message_id.clone(),
            user_text,
            user_files,
            history,
        })
        .await;
        Ok(())
    }

    async fn generate(&self, context: StreamingContext) -> StreamOutcome {
        let adapter = self.adapter.read().clone();
        let mode = self.response_mode();
        let handler = StreamingMessageHandler::new(adapter, Arc::clone(&self.streams));
        let chat_id = context.chat_id.clone();
        let message_id = context.message_id.clone();

        self.publish(ChatEvent::StreamStarted {
            chat_id: chat_id.clone(),
            message_id: message_id.clone(),
        });
        let mut callbacks = StoreCallbacks {
            store: Arc::clone(&self.store),
            events: self.events.clone(),
            chat_id: chat_id.clone(),
            message_id: message_id.clone(),
        };
        let outcome = handler.handle(context, &mut callbacks, mode).await;

        if outcome != StreamOutcome::Superseded {
            self.persist(&chat_id);
            if let Some(message) = self.store.message(&chat_id, &message_id) {
                self.publish(ChatEvent::StreamFinished {
                    chat_id,
                    message_id,
                    state: message.state(),
                });
            }
        }
        outcome
    }

    fn history_for(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
    ) -> EngineResult<Vec<ConversationMessage>> {
        let visible = self.visible_messages(chat_id, "history")?;
        Ok(history_before(&visible, message_id))
    }

    fn visible_messages(
        &self,
        chat_id: &ChatId,
        stage: &'static str,
    ) -> EngineResult<Vec<Message>> {
        self.store
            .visible_messages(chat_id)
            .context(BranchSnafu { stage })
    }

    fn ensure_user_message(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        stage: &'static str,
    ) -> EngineResult<Message> {
        let message = self
            .store
            .message(chat_id, message_id)
            .ok_or_else(|| message_not_found(stage, chat_id, message_id))?;
        ensure!(
            message.is_user(),
            MessageNotEditableSnafu {
                stage,
                chat_id: chat_id.clone(),
                message_id: message_id.clone(),
            }
        );
        Ok(message)
    }

    fn persist(&self, chat_id: &ChatId) {
        let Some(repository) = &self.repository else {
            return;
        };
        let Some(chat) = self.store.get_chat(chat_id) else {
            return;
        };
        if let Err(error) = repository.save_chat(&chat) {
            tracing::error!(chat_id = %chat_id, error = %error, "failed to persist chat");
            self.publish(ChatEvent::Notice {
                level: NoticeLevel::Error,
                text: format!("Failed to save chat: {error}"),
            });
        }
    }

    fn publish_message_updated(&self, chat_id: &ChatId, message_id: &MessageId) {
        self.publish(ChatEvent::MessageUpdated {
            chat_id: chat_id.clone(),
            message_id: message_id.clone(),
        });
    }

    fn publish(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Writes relayed output into the store and announces each change.
struct StoreCallbacks {
    store: Arc<ChatStore>,
    events: broadcast::Sender<ChatEvent>,
    chat_id: ChatId,
    message_id: MessageId,
}

impl StoreCallbacks {
    fn apply(&self, patch: &MessagePatch) {
        match self
            .store
            .update_message_in_chat(&self.chat_id, &self.message_id, patch)
        {
            Ok(()) => {
                let _ = self.events.send(ChatEvent::MessageUpdated {
                    chat_id: self.chat_id.clone(),
                    message_id: self.message_id.clone(),
                });
            }
            Err(error) => {
                // The message or chat was deleted while the reply was still arriving.
                tracing::warn!(
                    chat_id = %self.chat_id,
                    message_id = %self.message_id,
                    error = %error,
                    "dropped generation update"
                );
            }
        }
    }
}

impl StreamingCallbacks for StoreCallbacks {
    fn on_text_chunk(&mut self, text: &str, image_url: Option<&str>) {
        self.apply(&MessagePatch::text(text, image_url.map(str::to_string)));
    }

    fn on_thinking_chunk(&mut self, fragment: &str, is_complete: bool) {
        self.apply(&MessagePatch::thinking(fragment, is_complete));
    }

    fn on_complete(&mut self) {
        self.apply(&MessagePatch::completed());
    }

    fn on_error(&mut self, failure: StreamFailure) {
        if failure.is_abort() {
            self.apply(&MessagePatch::paused());
            return;
        }

        self.apply(&MessagePatch::failed());
        let _ = self.events.send(ChatEvent::Notice {
            level: NoticeLevel::Error,
            text: format!("Generation failed: {failure}"),
        });
    }
}

fn message_not_found(
    stage: &'static str,
    chat_id: &ChatId,
    message_id: &MessageId,
) -> EngineError {
    EngineError::Branch {
        stage,
        source: BranchError::MessageNotFound {
            stage,
            chat_id: chat_id.clone(),
            message_id: message_id.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use trellis_core::{ConversationRole, GENERATION_ERROR_TEXT, MessageState};
    use trellis_llm::{
        AdapterResult, AdapterStreamHandle, BoxFuture, MessageRequest, MessageResponse,
        MockAdapter, MockStep, StreamRequest,
    };

    use super::*;

    /// Mock backend that remembers every request it was handed.
    struct RecordingAdapter {
        inner: MockAdapter,
        requests: Mutex<Vec<MessageRequest>>,
    }

    impl RecordingAdapter {
        fn new(inner: MockAdapter) -> Arc<Self> {
            Arc::new(Self {
                inner,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn last_request(&self) -> MessageRequest {
            self.requests.lock().last().cloned().expect("a recorded request")
        }
    }

    impl ChatAdapter for RecordingAdapter {
        fn id(&self) -> &str {
            self.inner.id()
        }

        fn name(&self) -> &str {
            self.inner.name()
        }

        fn send_message<'a>(
            &'a self,
            request: MessageRequest,
        ) -> BoxFuture<'a, AdapterResult<MessageResponse>> {
            self.requests.lock().push(request.clone());
            self.inner.send_message(request)
        }

        fn stream_message(
            &self,
            request: StreamRequest,
            cancel: CancellationToken,
        ) -> AdapterResult<AdapterStreamHandle> {
            self.requests.lock().push(request.request.clone());
            self.inner.stream_message(request, cancel)
        }
    }

    fn text(chunk: &str) -> MockStep {
        MockStep::Text(chunk.to_string())
    }

    fn scripted(steps: impl IntoIterator<Item = MockStep>) -> ChatEngine {
        ChatEngine::new(Arc::new(MockAdapter::scripted(steps)))
    }

    async fn wait_for_stream_start(events: &mut broadcast::Receiver<ChatEvent>) -> MessageId {
        loop {
            if let ChatEvent::StreamStarted { message_id, .. } =
                events.recv().await.expect("engine event")
            {
                return message_id;
            }
        }
    }

    #[tokio::test]
    async fn streamed_chunks_accumulate_into_complete_reply() {
        let engine = scripted([text("Hi"), text(" there")]);
        let chat_id = engine.create_chat(None);

        let ai_message_id = engine
            .send_message(&chat_id, "hello", Vec::new())
            .await
            .expect("send");

        let reply = engine
            .store()
            .message(&chat_id, &ai_message_id)
            .expect("reply");
        assert_eq!(reply.text, "Hi there");
        assert_eq!(reply.state(), MessageState::Complete);
        assert!(!reply.was_paused);
        assert!(!engine.is_generating(&chat_id));

        let visible = engine.store().visible_messages(&chat_id).expect("visible");
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].text, "hello");
    }

    #[tokio::test]
    async fn pausing_keeps_partial_text() {
        let engine = Arc::new(scripted([text("Hi"), MockStep::Hold]));
        let chat_id = engine.create_chat(None);
        let mut events = engine.subscribe();

        let send = tokio::spawn({
            let engine = Arc::clone(&engine);
            let chat_id = chat_id.clone();
            async move { engine.send_message(&chat_id, "hello", Vec::new()).await }
        });

        loop {
            if let ChatEvent::MessageUpdated {
                chat_id: updated_chat,
                message_id,
            } = events.recv().await.expect("engine event")
                && engine
                    .store()
                    .message(&updated_chat, &message_id)
                    .is_some_and(|message| message.is_ai() && message.text == "Hi")
            {
                break;
            }
        }

        assert_eq!(engine.pause_chat_request(&chat_id), 1);
        let ai_message_id = send.await.expect("join").expect("send");

        let reply = engine
            .store()
            .message(&chat_id, &ai_message_id)
            .expect("reply");
        assert_eq!(reply.text, "Hi");
        assert_eq!(reply.state(), MessageState::CompleteButPaused);
        assert!(!engine.is_generating(&chat_id));
    }

    #[tokio::test]
    async fn backend_failure_shows_error_text_and_notice() {
        let engine = scripted([text("partial"), MockStep::Fail("boom".to_string())]);
        let chat_id = engine.create_chat(None);
        let mut events = engine.subscribe();

        let ai_message_id = engine
            .send_message(&chat_id, "hello", Vec::new())
            .await
            .expect("failures do not error the call");

        let reply = engine
            .store()
            .message(&chat_id, &ai_message_id)
            .expect("reply");
        assert_eq!(reply.text, GENERATION_ERROR_TEXT);
        assert_eq!(reply.state(), MessageState::CompleteWithErrorText);

        let mut notices = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ChatEvent::Notice { level, text } = event {
                notices.push((level, text));
            }
        }
        assert!(
            notices
                .iter()
                .any(|(level, text)| *level == NoticeLevel::Error && text.contains("boom"))
        );
    }

    #[tokio::test]
    async fn branch_from_first_message_sends_only_the_new_text() {
        let adapter = RecordingAdapter::new(MockAdapter::scripted([text("ok")]));
        let engine = ChatEngine::new(adapter.clone());
        let chat_id = engine.create_chat(None);

        engine
            .send_message(&chat_id, "first", Vec::new())
            .await
            .expect("first send");
        engine
            .send_message(&chat_id, "second", Vec::new())
            .await
            .expect("second send");
        let first_user = engine.store().visible_messages(&chat_id).expect("visible")[0]
            .id
            .clone();

        let edit = engine
            .create_branch(&chat_id, &first_user, "Edited")
            .await
            .expect("branch");

        let path = engine.store().active_branch_path(&chat_id).expect("path");
        assert_eq!(path, vec![BranchId::main(), edit.branch_id.clone()]);

        let visible = engine.store().visible_messages(&chat_id).expect("visible");
        let texts = visible
            .iter()
            .map(|message| message.text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["Edited", "ok"]);
        assert_eq!(visible[1].id, edit.ai_message_id);

        let request = adapter.last_request();
        assert_eq!(request.text, "Edited");
        assert_eq!(request.history.len(), 1);
        assert_eq!(request.history[0].role, ConversationRole::User);
        assert_eq!(request.history[0].content, "Edited");

        let options = engine
            .store()
            .branch_options(&chat_id, &edit.user_message_id)
            .expect("options");
        assert_eq!(options.len(), 2);
        assert!(!options[0].is_current);
        assert!(options[1].is_current);
        assert_eq!(options[1].message_id, edit.user_message_id);

        // The original conversation is intact on main.
        engine
            .switch_branch(&chat_id, &BranchId::main())
            .expect("switch back");
        assert_eq!(
            engine
                .store()
                .visible_messages(&chat_id)
                .expect("visible")
                .len(),
            4
        );
    }

    #[tokio::test]
    async fn branch_placeholder_is_pending_while_generating() {
        let engine = Arc::new(scripted([text("ok")]));
        let chat_id = engine.create_chat(None);
        let mut events = engine.subscribe();
        engine
            .send_message(&chat_id, "first", Vec::new())
            .await
            .expect("send");
        let first_user = engine.store().visible_messages(&chat_id).expect("visible")[0]
            .id
            .clone();

        engine.set_adapter(Arc::new(MockAdapter::scripted([MockStep::Hold])));
        while events.try_recv().is_ok() {}
        let branch = tokio::spawn({
            let engine = Arc::clone(&engine);
            let chat_id = chat_id.clone();
            async move { engine.create_branch(&chat_id, &first_user, "Edited").await }
        });
        let placeholder_id = wait_for_stream_start(&mut events).await;

        let visible = engine.store().visible_messages(&chat_id).expect("visible");
        let shown = visible
            .iter()
            .map(|message| (message.text.as_str(), message.state()))
            .collect::<Vec<_>>();
        assert_eq!(
            shown,
            vec![("Edited", MessageState::Complete), ("", MessageState::Pending)]
        );
        assert_eq!(visible[1].id, placeholder_id);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.pause_chat_request(&chat_id), 1);
        let edit = branch.await.expect("join").expect("branch");
        assert_eq!(edit.ai_message_id, placeholder_id);
    }

    #[tokio::test]
    async fn branching_from_an_ai_message_is_refused() {
        let engine = scripted([text("ok")]);
        let chat_id = engine.create_chat(None);
        let ai_message_id = engine
            .send_message(&chat_id, "hello", Vec::new())
            .await
            .expect("send");

        let error = engine
            .create_branch(&chat_id, &ai_message_id, "nope")
            .await
            .expect_err("ai messages are not editable");
        assert!(matches!(error, EngineError::MessageNotEditable { .. }));
    }

    #[tokio::test]
    async fn regenerate_reuses_the_last_reply() {
        let adapter = RecordingAdapter::new(MockAdapter::scripted([text("again")]));
        let engine = ChatEngine::new(adapter.clone());
        let chat_id = engine.create_chat(None);
        let ai_message_id = engine
            .send_message(&chat_id, "question", Vec::new())
            .await
            .expect("send");

        let regenerated = engine
            .regenerate_response(&chat_id, None)
            .await
            .expect("regenerate");

        assert_eq!(regenerated, ai_message_id);
        let reply = engine
            .store()
            .message(&chat_id, &ai_message_id)
            .expect("reply");
        assert_eq!(reply.text, "again");
        assert_eq!(reply.state(), MessageState::Complete);
        assert_eq!(adapter.requests.lock().len(), 2);
        assert_eq!(adapter.last_request().text, "question");
    }

    #[tokio::test]
    async fn regenerated_reply_is_cleared_to_pending_while_generating() {
        let engine = Arc::new(scripted([text("first answer")]));
        let chat_id = engine.create_chat(None);
        let mut events = engine.subscribe();
        let ai_message_id = engine
            .send_message(&chat_id, "question", Vec::new())
            .await
            .expect("send");

        engine.set_adapter(Arc::new(MockAdapter::scripted([MockStep::Hold])));
        while events.try_recv().is_ok() {}
        let regenerate = tokio::spawn({
            let engine = Arc::clone(&engine);
            let chat_id = chat_id.clone();
            async move { engine.regenerate_response(&chat_id, None).await }
        });
        assert_eq!(wait_for_stream_start(&mut events).await, ai_message_id);

        let reply = engine
            .store()
            .message(&chat_id, &ai_message_id)
            .expect("reply");
        assert_eq!(reply.text, "");
        assert_eq!(reply.state(), MessageState::Pending);
        assert!(!reply.was_paused);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.pause_chat_request(&chat_id), 1);
        let regenerated = regenerate.await.expect("join").expect("regenerate");
        assert_eq!(regenerated, ai_message_id);
    }

    #[tokio::test]
    async fn regenerate_without_reply_is_an_error() {
        let engine = scripted([text("ok")]);
        let chat_id = engine.create_chat(None);

        let error = engine
            .regenerate_response(&chat_id, None)
            .await
            .expect_err("nothing to regenerate");
        assert!(matches!(error, EngineError::NothingToRegenerate { .. }));
    }

    #[tokio::test]
    async fn in_place_edit_regenerates_following_reply() {
        let engine = scripted([text("ok")]);
        let chat_id = engine.create_chat(None);
        let ai_message_id = engine
            .send_message(&chat_id, "first", Vec::new())
            .await
            .expect("send");
        let user_message_id = engine.store().visible_messages(&chat_id).expect("visible")[0]
            .id
            .clone();

        let regenerated = engine
            .edit_message(&chat_id, &user_message_id, "changed")
            .await
            .expect("edit");

        assert_eq!(regenerated, Some(ai_message_id));
        let visible = engine.store().visible_messages(&chat_id).expect("visible");
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].text, "changed");
        assert_eq!(
            engine.store().active_branch_path(&chat_id).expect("path"),
            vec![BranchId::main()]
        );
    }

    #[tokio::test]
    async fn newer_generation_supersedes_older_one_for_same_message() {
        let engine = Arc::new(scripted([MockStep::Hold]));
        let chat_id = engine.create_chat(None);
        let mut events = engine.subscribe();

        let send = tokio::spawn({
            let engine = Arc::clone(&engine);
            let chat_id = chat_id.clone();
            async move { engine.send_message(&chat_id, "hello", Vec::new()).await }
        });
        let ai_message_id = wait_for_stream_start(&mut events).await;

        let regenerate = tokio::spawn({
            let engine = Arc::clone(&engine);
            let chat_id = chat_id.clone();
            let ai_message_id = ai_message_id.clone();
            async move {
                engine
                    .regenerate_response(&chat_id, Some(&ai_message_id))
                    .await
            }
        });
        assert_eq!(wait_for_stream_start(&mut events).await, ai_message_id);

        // Let the superseded relay notice before asserting on the registry.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.streams().active_stream_count(), 1);
        assert_eq!(engine.pause_chat_request(&chat_id), 1);

        send.await.expect("join send").expect("send");
        regenerate
            .await
            .expect("join regenerate")
            .expect("regenerate");

        let reply = engine
            .store()
            .message(&chat_id, &ai_message_id)
            .expect("reply");
        assert_eq!(reply.state(), MessageState::CompleteButPaused);
        assert_eq!(engine.streams().active_stream_count(), 0);
    }

    #[tokio::test]
    async fn dump_loads_into_a_fresh_engine() {
        let source = scripted([text("ok")]);
        let chat_id = source.create_chat(Some("Saved"));
        source
            .send_message(&chat_id, "hello", Vec::new())
            .await
            .expect("send");

        let dump = source.dump(None).expect("dump");
        let target = scripted(Vec::<MockStep>::new());
        assert_eq!(target.load(dump.clone(), false, None), 1);
        assert_eq!(target.load(dump, false, None), 0);

        let restored = target.store().get_chat(&chat_id).expect("restored chat");
        assert_eq!(restored.title, "Saved");
        assert_eq!(
            target.store().visible_messages(&chat_id).expect("visible"),
            source.store().visible_messages(&chat_id).expect("visible")
        );
    }

    #[tokio::test]
    async fn export_and_import_through_a_file() {
        let directory = tempfile::tempdir().expect("temp dir");
        let path = directory.path().join("chats.json");

        let source = scripted([text("ok")]);
        let chat_id = source.create_chat(None);
        source
            .send_message(&chat_id, "hello", Vec::new())
            .await
            .expect("send");
        assert_eq!(source.export_to_path(None, &path).expect("export"), 1);

        let target = scripted(Vec::<MockStep>::new());
        assert_eq!(target.import_from_path(&path, true).expect("import"), 1);
        assert!(target.store().contains_chat(&chat_id));
    }

    #[tokio::test]
    async fn one_failed_upload_does_not_block_the_rest() {
        let engine = ChatEngine::new(Arc::new(
            MockAdapter::new().with_step_delay(Duration::ZERO),
        ));

        let report = engine
            .upload_files(vec![
                FileUpload {
                    name: "empty.txt".to_string(),
                    mime_type: "text/plain".to_string(),
                    bytes: Vec::new(),
                },
                FileUpload {
                    name: "notes.txt".to_string(),
                    mime_type: "text/plain".to_string(),
                    bytes: b"notes".to_vec(),
                },
            ])
            .await;

        assert_eq!(report.uploaded.len(), 1);
        assert_eq!(report.uploaded[0].name, "notes.txt");
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].file_name, "empty.txt");
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let engine = scripted([text("ok")]);
        let chat_id = engine.create_chat(None);

        let error = engine
            .send_message(&chat_id, "   ", Vec::new())
            .await
            .expect_err("empty");
        assert!(matches!(error, EngineError::EmptyMessage { .. }));
        assert!(
            engine
                .store()
                .visible_messages(&chat_id)
                .expect("visible")
                .is_empty()
        );
    }
}
