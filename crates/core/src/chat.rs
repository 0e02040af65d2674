use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BranchId, ChatId, MessageId};
use super::message::{Message, MessagePatch};

/// Title used when a chat is created without a name and has no position hint.
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

/// Metadata for one non-root branch.
///
/// `message_id` is the divergence point: the message all sibling versions share as parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchNode {
    pub id: BranchId,
    pub message_id: MessageId,
    pub depth: usize,
    #[serde(default)]
    pub child_branches: Vec<BranchId>,
}

/// Per-chat branch bookkeeping. The root branch `main` is implicit and never stored as a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchModel {
    #[serde(default = "default_active_path")]
    pub active_branch_path: Vec<BranchId>,
    #[serde(default)]
    pub branch_tree: BTreeMap<BranchId, BranchNode>,
    #[serde(default)]
    pub message_branches: BTreeMap<MessageId, Vec<BranchId>>,
}

impl Default for BranchModel {
    fn default() -> Self {
        Self {
            active_branch_path: default_active_path(),
            branch_tree: BTreeMap::new(),
            message_branches: BTreeMap::new(),
        }
    }
}

impl BranchModel {
    /// Branch new messages are appended to.
    pub fn leaf_branch(&self) -> BranchId {
        self.active_branch_path
            .last()
            .cloned()
            .unwrap_or_else(BranchId::main)
    }

    pub fn node(&self, branch_id: &BranchId) -> Option<&BranchNode> {
        self.branch_tree.get(branch_id)
    }

    pub fn branch_count(&self) -> usize {
        self.branch_tree.len()
    }

    /// Restores `path[0] == main` after loading hand-edited or truncated data.
    pub fn normalize(&mut self) {
        if self.active_branch_path.first().is_none_or(|head| !head.is_main()) {
            self.active_branch_path.insert(0, BranchId::main());
        }
    }
}

/// A conversation: the message bag plus the branch model that orders it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub branches: BranchModel,
    // Bumped on every mutation; `updated_at` alone can repeat within one clock tick.
    #[serde(skip)]
    revision: u64,
}

impl Chat {
    pub fn new(id: ChatId, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            branches: BranchModel::default(),
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Marks the chat as modified.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.revision = self.revision.wrapping_add(1);
    }

    pub fn message(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == message_id)
    }

    pub fn message_mut(&mut self, message_id: &MessageId) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| &message.id == message_id)
    }

    pub fn contains_message(&self, message_id: &MessageId) -> bool {
        self.message(message_id).is_some()
    }

    pub fn active_branch_path(&self) -> &[BranchId] {
        &self.branches.active_branch_path
    }

    /// Appends to the bag; a message with an id already present replaces the old instance.
    pub fn push_message(&mut self, message: Message) {
        if let Some(existing) = self.message_mut(&message.id) {
            *existing = message;
        } else {
            self.messages.push(message);
        }
        self.touch();
    }

    pub fn update_message(&mut self, message_id: &MessageId, patch: &MessagePatch) -> bool {
        let Some(message) = self.message_mut(message_id) else {
            return false;
        };
        message.apply(patch);
        self.touch();
        true
    }
}

fn default_active_path() -> Vec<BranchId> {
    vec![BranchId::main()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_chat_starts_on_main() {
        let chat = Chat::new(ChatId::generate(), "demo");
        assert_eq!(chat.active_branch_path(), &[BranchId::main()]);
        assert!(chat.branches.branch_tree.is_empty());
        assert_eq!(chat.branches.leaf_branch(), BranchId::main());
    }

    #[test]
    fn push_with_known_id_replaces_instead_of_duplicating() {
        let mut chat = Chat::new(ChatId::generate(), "demo");
        let mut message = Message::user("first");
        chat.push_message(message.clone());

        message.text = "second".to_string();
        chat.push_message(message.clone());

        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].text, "second");
        assert_eq!(chat.revision(), 2);
    }

    #[test]
    fn normalize_restores_root_segment() {
        let mut model = BranchModel {
            active_branch_path: vec![BranchId::new("branch-a")],
            ..BranchModel::default()
        };
        model.normalize();
        assert_eq!(
            model.active_branch_path,
            vec![BranchId::main(), BranchId::new("branch-a")]
        );
    }
}
