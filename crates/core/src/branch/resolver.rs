use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::Chat;
use crate::ids::{BranchId, ChatId, MessageId};
use crate::message::Message;

/// One navigable version of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchOption {
    pub branch_id: BranchId,
    pub message_id: MessageId,
    pub is_current: bool,
}

/// Rebuilds the linear conversation visible along `path`.
///
/// Each non-final segment contributes its messages up to the divergence point of the next
/// segment. A divergence point that cannot be found in its branch keeps the whole branch.
pub fn resolve_visible_messages(chat: &Chat, path: &[BranchId]) -> Vec<Message> {
    let mut grouped: HashMap<&BranchId, Vec<&Message>> = HashMap::new();
    for message in &chat.messages {
        grouped.entry(&message.branch_id).or_default().push(message);
    }
    for group in grouped.values_mut() {
        // Stable: equal timestamps keep insertion order.
        group.sort_by_key(|message| message.timestamp);
    }

    let mut visible = Vec::new();
    for (index, segment) in path.iter().enumerate() {
        let Some(group) = grouped.get(segment) else {
            continue;
        };

        let next_divergence = path
            .get(index + 1)
            .map(|next| chat.branches.node(next).map(|node| &node.message_id));

        let take = match next_divergence {
            None => group.len(),
            Some(Some(divergence)) => {
                match group.iter().position(|message| &message.id == divergence) {
                    Some(position) => position,
                    None => {
                        tracing::warn!(
                            chat_id = %chat.id,
                            branch_id = %segment,
                            divergence_message_id = %divergence,
                            "divergence point missing from branch; keeping entire branch"
                        );
                        group.len()
                    }
                }
            }
            Some(None) => {
                tracing::warn!(
                    chat_id = %chat.id,
                    branch_id = %segment,
                    "next path segment has no branch node; keeping entire branch"
                );
                group.len()
            }
        };

        visible.extend(group[..take].iter().map(|message| (*message).clone()));
    }
    visible
}

/// Sibling versions of `message_id` for prev/next navigation; empty when there is nothing to
/// navigate between.
pub fn resolve_branch_options(chat: &Chat, message_id: &MessageId) -> Vec<BranchOption> {
    let Some(message) = chat.message(message_id) else {
        return Vec::new();
    };

    let divergence = match &message.parent_id {
        Some(parent_id) => match chat.message(parent_id) {
            Some(parent) => parent,
            None => return Vec::new(),
        },
        None if message.branch_point => message,
        None => return Vec::new(),
    };

    let active = chat.active_branch_path();
    let mut options: Vec<BranchOption> = chat
        .messages
        .iter()
        .filter(|candidate| candidate.parent_id.as_ref() == Some(&divergence.id))
        .map(|candidate| BranchOption {
            branch_id: candidate.branch_id.clone(),
            message_id: candidate.id.clone(),
            is_current: active.contains(&candidate.branch_id),
        })
        .collect();

    if options.is_empty() {
        return Vec::new();
    }

    let sibling_active = options.iter().any(|option| option.is_current);
    options.insert(
        0,
        BranchOption {
            branch_id: divergence.branch_id.clone(),
            message_id: divergence.id.clone(),
            is_current: !sibling_active,
        },
    );
    options
}

/// One segment of the active path as shown in a breadcrumb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreadcrumbSegment {
    pub branch_id: BranchId,
    /// Earliest message of the segment; `None` for a branch with no messages yet.
    pub first_message_id: Option<MessageId>,
}

/// The active path root first, each segment with the message it opens with.
pub fn breadcrumb(chat: &Chat) -> Vec<BreadcrumbSegment> {
    chat.active_branch_path()
        .iter()
        .map(|segment| BreadcrumbSegment {
            branch_id: segment.clone(),
            first_message_id: chat
                .messages
                .iter()
                .filter(|message| &message.branch_id == segment)
                .min_by_key(|message| message.timestamp)
                .map(|message| message.id.clone()),
        })
        .collect()
}

/// Messages that have at least one alternate version, in chat order.
pub fn branching_points(chat: &Chat) -> Vec<MessageId> {
    chat.messages
        .iter()
        .filter(|message| message.branch_point)
        .map(|message| message.id.clone())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheKey {
    path: String,
    updated_at: DateTime<Utc>,
    revision: u64,
}

impl CacheKey {
    fn of(chat: &Chat, path: &[BranchId]) -> Self {
        Self {
            path: path
                .iter()
                .map(BranchId::as_str)
                .collect::<Vec<_>>()
                .join("/"),
            updated_at: chat.updated_at,
            revision: chat.revision(),
        }
    }
}

/// Per-chat memo of [`resolve_visible_messages`]; safe to clear at any time.
#[derive(Debug, Default)]
pub struct ResolverCache {
    entries: HashMap<ChatId, (CacheKey, Vec<Message>)>,
}

impl ResolverCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visible_messages(&mut self, chat: &Chat, path: &[BranchId]) -> Vec<Message> {
        let key = CacheKey::of(chat, path);
        match self.entries.get(&chat.id) {
            Some((cached_key, messages)) if cached_key == &key => return messages.clone(),
            _ => {}
        }

        let messages = resolve_visible_messages(chat, path);
        self.entries.insert(chat.id.clone(), (key, messages.clone()));
        messages
    }

    pub fn invalidate(&mut self, chat_id: &ChatId) {
        self.entries.remove(chat_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
