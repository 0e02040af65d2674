use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use trellis_core::{
    BranchError, BranchId, BranchOption, BranchResult, BreadcrumbSegment, Chat, ChatId, Message,
    MessageId, MessagePatch, ResolverCache, branching_points, breadcrumb,
    create_branch_from_message, delete_branch, resolve_branch_options, switch_to_branch,
};
use trellis_storage::{ChatDump, ChatSummary};

use crate::stream::StreamManager;

#[derive(Default)]
struct StoreState {
    chats: HashMap<ChatId, Chat>,
    active_chat: Option<ChatId>,
    cache: ResolverCache,
    next_chat_number: usize,
}

impl StoreState {
    fn chat(&self, stage: &'static str, chat_id: &ChatId) -> BranchResult<&Chat> {
        self.chats.get(chat_id).ok_or_else(|| chat_not_found(stage, chat_id))
    }

    fn chat_mut(&mut self, stage: &'static str, chat_id: &ChatId) -> BranchResult<&mut Chat> {
        self.chats
            .get_mut(chat_id)
            .ok_or_else(|| chat_not_found(stage, chat_id))
    }

    fn most_recent_chat(&self) -> Option<ChatId> {
        self.chats
            .values()
            .max_by(|left, right| {
                left.updated_at
                    .cmp(&right.updated_at)
                    .then_with(|| left.id.cmp(&right.id))
            })
            .map(|chat| chat.id.clone())
    }
}

/// In-memory owner of every chat and its branch model.
///
/// Each public method takes the lock once, so callers never observe a half-applied mutation.
pub struct ChatStore {
    state: RwLock<StoreState>,
    streams: Arc<StreamManager>,
}

impl ChatStore {
    pub fn new(streams: Arc<StreamManager>) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            streams,
        }
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    /// Creates an empty chat on `main` and makes it active. A blank title becomes `Chat N`.
    pub fn create_chat(&self, title: Option<&str>) -> ChatId {
        let mut state = self.state.write();
        state.next_chat_number += 1;
        let title = title
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Chat {}", state.next_chat_number));

        let chat = Chat::new(ChatId::generate(), title);
        let chat_id = chat.id.clone();
        tracing::debug!(chat_id = %chat_id, title = %chat.title, "created chat");
        state.chats.insert(chat_id.clone(), chat);
        state.active_chat = Some(chat_id.clone());
        chat_id
    }

    pub fn get_chat(&self, chat_id: &ChatId) -> Option<Chat> {
        self.state.read().chats.get(chat_id).cloned()
    }

    pub fn contains_chat(&self, chat_id: &ChatId) -> bool {
        self.state.read().chats.contains_key(chat_id)
    }

    pub fn chat_count(&self) -> usize {
        self.state.read().chats.len()
    }

    /// Most recently updated first.
    pub fn list_chats(&self) -> Vec<ChatSummary> {
        let state = self.state.read();
        let mut summaries = state
            .chats
            .values()
            .map(|chat| ChatSummary {
                id: chat.id.clone(),
                title: chat.title.clone(),
                message_count: chat.messages.len() as u64,
                created_at: chat.created_at,
                updated_at: chat.updated_at,
            })
            .collect::<Vec<_>>();
        summaries.sort_by(|left, right| {
            right
                .updated_at
                .cmp(&left.updated_at)
                .then_with(|| right.id.cmp(&left.id))
        });
        summaries
    }

    /// Removes the chat and stops every stream it owns. Returns false when it did not exist.
    pub fn delete_chat(&self, chat_id: &ChatId) -> bool {
        self.streams.stop_all_streams_for_chat(chat_id);

        let mut state = self.state.write();
        if state.chats.remove(chat_id).is_none() {
            return false;
        }
        state.cache.invalidate(chat_id);
        if state.active_chat.as_ref() == Some(chat_id) {
            state.active_chat = state.most_recent_chat();
        }
        tracing::debug!(chat_id = %chat_id, "deleted chat");
        true
    }

    pub fn clear_all_chats(&self) -> usize {
        let mut state = self.state.write();
        for chat_id in state.chats.keys() {
            self.streams.stop_all_streams_for_chat(chat_id);
        }
        let cleared = state.chats.len();
        state.chats.clear();
        state.cache.clear();
        state.active_chat = None;
        state.next_chat_number = 0;
        cleared
    }

    pub fn set_active_chat(&self, chat_id: &ChatId) -> BranchResult<()> {
        let mut state = self.state.write();
        state.chat("set-active-chat", chat_id)?;
        state.active_chat = Some(chat_id.clone());
        Ok(())
    }

    pub fn active_chat_id(&self) -> Option<ChatId> {
        self.state.read().active_chat.clone()
    }

    pub fn rename_chat(&self, chat_id: &ChatId, title: &str) -> BranchResult<()> {
        let mut state = self.state.write();
        let chat = state.chat_mut("rename-chat", chat_id)?;
        chat.title = title.trim().to_string();
        chat.touch();
        Ok(())
    }

    /// Appends to the end of the active path: the message is stamped with the leaf branch.
    pub fn add_message_to_chat(
        &self,
        chat_id: &ChatId,
        mut message: Message,
    ) -> BranchResult<MessageId> {
        let mut state = self.state.write();
        let chat = state.chat_mut("add-message", chat_id)?;
        message.branch_id = chat.branches.leaf_branch();
        let message_id = message.id.clone();
        chat.push_message(message);
        Ok(message_id)
    }

    pub fn update_message_in_chat(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        patch: &MessagePatch,
    ) -> BranchResult<()> {
        let mut state = self.state.write();
        let chat = state.chat_mut("update-message", chat_id)?;
        if chat.update_message(message_id, patch) {
            return Ok(());
        }
        Err(BranchError::MessageNotFound {
            stage: "update-message",
            chat_id: chat_id.clone(),
            message_id: message_id.clone(),
        })
    }

    pub fn message(&self, chat_id: &ChatId, message_id: &MessageId) -> Option<Message> {
        self.state
            .read()
            .chats
            .get(chat_id)
            .and_then(|chat| chat.message(message_id).cloned())
    }

    /// Linear conversation along the chat's active path.
    pub fn visible_messages(&self, chat_id: &ChatId) -> BranchResult<Vec<Message>> {
        let mut state = self.state.write();
        let StoreState { chats, cache, .. } = &mut *state;
        let chat = chats
            .get(chat_id)
            .ok_or_else(|| chat_not_found("visible-messages", chat_id))?;
        Ok(cache.visible_messages(chat, chat.active_branch_path()))
    }

    pub fn active_branch_path(&self, chat_id: &ChatId) -> BranchResult<Vec<BranchId>> {
        let state = self.state.read();
        Ok(state
            .chat("active-branch-path", chat_id)?
            .active_branch_path()
            .to_vec())
    }

    pub fn branch_options(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
    ) -> BranchResult<Vec<BranchOption>> {
        let state = self.state.read();
        let chat = state.chat("branch-options", chat_id)?;
        Ok(resolve_branch_options(chat, message_id))
    }

    /// Adds `draft` as a new sibling version of `source`. The active path is left alone.
    pub fn create_branch(
        &self,
        chat_id: &ChatId,
        source: &MessageId,
        draft: Message,
    ) -> BranchResult<BranchId> {
        let mut state = self.state.write();
        let chat = state.chat_mut("create-branch", chat_id)?;
        create_branch_from_message(chat, source, draft)
    }

    pub fn switch_branch(
        &self,
        chat_id: &ChatId,
        branch_id: &BranchId,
    ) -> BranchResult<Vec<BranchId>> {
        let mut state = self.state.write();
        let chat = state.chat_mut("switch-branch", chat_id)?;
        switch_to_branch(chat, branch_id)
    }

    /// Deletes the branch and cancels any generation still writing into its messages.
    pub fn delete_branch(&self, chat_id: &ChatId, branch_id: &BranchId) -> BranchResult<()> {
        let removed = {
            let mut state = self.state.write();
            let chat = state.chat_mut("delete-branch", chat_id)?;
            let before = chat
                .messages
                .iter()
                .map(|message| message.id.clone())
                .collect::<Vec<_>>();
            delete_branch(chat, branch_id)?;
            before
                .into_iter()
                .filter(|message_id| !chat.contains_message(message_id))
                .collect::<Vec<_>>()
        };

        for message_id in &removed {
            self.streams.stop_stream(chat_id, message_id);
        }
        Ok(())
    }

    pub fn breadcrumb(&self, chat_id: &ChatId) -> BranchResult<Vec<BreadcrumbSegment>> {
        let state = self.state.read();
        Ok(breadcrumb(state.chat("breadcrumb", chat_id)?))
    }

    pub fn branching_points(&self, chat_id: &ChatId) -> BranchResult<Vec<MessageId>> {
        let state = self.state.read();
        Ok(branching_points(state.chat("branching-points", chat_id)?))
    }

    /// One chat, or every chat oldest first.
    pub fn dump(&self, chat_id: Option<&ChatId>) -> BranchResult<ChatDump> {
        let state = self.state.read();
        let chats = match chat_id {
            Some(chat_id) => vec![state.chat("dump", chat_id)?.clone()],
            None => {
                let mut chats = state.chats.values().cloned().collect::<Vec<_>>();
                chats.sort_by(|left, right| {
                    left.created_at
                        .cmp(&right.created_at)
                        .then_with(|| left.id.cmp(&right.id))
                });
                chats
            }
        };
        Ok(ChatDump::new(chats))
    }

    /// Merges chats from a dump.
    ///
    /// With `replace_existing` a dumped chat overwrites the in-memory chat of the same id;
    /// without it such chats are skipped. Chats absent from the dump are never touched.
    /// `only` restricts the load to one chat id. Returns how many chats were loaded.
    pub fn load(&self, dump: ChatDump, replace_existing: bool, only: Option<&ChatId>) -> usize {
        let mut state = self.state.write();
        let mut loaded = 0;
        for mut chat in dump.chats {
            if only.is_some_and(|only| only != &chat.id) {
                continue;
            }
            if !replace_existing && state.chats.contains_key(&chat.id) {
                tracing::debug!(chat_id = %chat.id, "skipped existing chat during load");
                continue;
            }

            chat.branches.normalize();
            state.cache.invalidate(&chat.id);
            if state.active_chat.is_none() {
                state.active_chat = Some(chat.id.clone());
            }
            state.chats.insert(chat.id.clone(), chat);
            loaded += 1;
        }
        state.next_chat_number = state.next_chat_number.max(state.chats.len());
        loaded
    }
}

fn chat_not_found(stage: &'static str, chat_id: &ChatId) -> BranchError {
    BranchError::ChatNotFound {
        stage,
        chat_id: chat_id.clone(),
    }
}
