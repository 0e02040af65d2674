use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BranchId, FileId, MessageId};

/// Text shown in place of an AI reply when generation fails for any reason other than a pause.
pub const GENERATION_ERROR_TEXT: &str = "Sorry, there was an error processing your request.";

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

/// A file attached to a user message after it has been uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFile {
    pub id: FileId,
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
    pub url: String,
}

/// One message instance inside a chat.
///
/// Messages live in an unordered bag on the chat; the visible order is rebuilt from
/// `branch_id`, `timestamp` and the active branch path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<MessageFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub branch_id: BranchId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default)]
    pub children: Vec<MessageId>,
    #[serde(default)]
    pub branch_point: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_complete: Option<bool>,
    #[serde(default)]
    pub was_paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_content: Option<String>,
    #[serde(default)]
    pub is_thinking_complete: bool,
    #[serde(default = "default_thinking_collapsed")]
    pub thinking_collapsed: bool,
}

impl Message {
    pub fn new(id: MessageId, sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            sender,
            timestamp: Utc::now(),
            files: Vec::new(),
            image_url: None,
            branch_id: BranchId::main(),
            parent_id: None,
            children: Vec::new(),
            branch_point: false,
            is_complete: None,
            was_paused: false,
            thinking_content: None,
            is_thinking_complete: false,
            thinking_collapsed: true,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        let mut message = Self::new(MessageId::generate(), Sender::User, text);
        message.is_complete = Some(true);
        message
    }

    /// Creates an AI placeholder in the pending state.
    pub fn ai_placeholder() -> Self {
        let mut message = Self::new(MessageId::generate(), Sender::Ai, String::new());
        message.is_complete = Some(false);
        message
    }

    pub fn with_branch(mut self, branch_id: BranchId) -> Self {
        self.branch_id = branch_id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_files(mut self, files: Vec<MessageFile>) -> Self {
        self.files = files;
        self
    }

    pub fn is_user(&self) -> bool {
        self.sender == Sender::User
    }

    pub fn is_ai(&self) -> bool {
        self.sender == Sender::Ai
    }

    pub fn state(&self) -> MessageState {
        MessageState::of(self)
    }

    /// Applies every field present on the patch; absent fields are left untouched.
    pub fn apply(&mut self, patch: &MessagePatch) {
        if let Some(text) = &patch.text {
            self.text.clone_from(text);
        }
        if let Some(image_url) = &patch.image_url {
            self.image_url = Some(image_url.clone());
        }
        if let Some(is_complete) = patch.is_complete {
            self.is_complete = Some(is_complete);
        }
        if let Some(was_paused) = patch.was_paused {
            self.was_paused = was_paused;
        }
        if let Some(thinking_content) = &patch.thinking_content {
            self.thinking_content.clone_from(thinking_content);
        }
        if let Some(thinking_fragment) = &patch.append_thinking {
            self.thinking_content
                .get_or_insert_with(String::new)
                .push_str(thinking_fragment);
        }
        if let Some(is_thinking_complete) = patch.is_thinking_complete {
            self.is_thinking_complete = is_thinking_complete;
        }
        if let Some(thinking_collapsed) = patch.thinking_collapsed {
            self.thinking_collapsed = thinking_collapsed;
        }
    }
}

/// Partial update for one message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePatch {
    pub text: Option<String>,
    pub image_url: Option<String>,
    pub is_complete: Option<bool>,
    pub was_paused: Option<bool>,
    /// `Some(None)` clears the thinking trace.
    pub thinking_content: Option<Option<String>>,
    pub append_thinking: Option<String>,
    pub is_thinking_complete: Option<bool>,
    pub thinking_collapsed: Option<bool>,
}

impl MessagePatch {
    /// Streaming update: the handler always delivers the full accumulated text.
    pub fn text(text: impl Into<String>, image_url: Option<String>) -> Self {
        Self {
            text: Some(text.into()),
            image_url,
            ..Self::default()
        }
    }

    pub fn thinking(fragment: impl Into<String>, is_complete: bool) -> Self {
        Self {
            append_thinking: Some(fragment.into()),
            is_thinking_complete: Some(is_complete),
            ..Self::default()
        }
    }

    /// Back to PENDING before a regeneration.
    pub fn ai_reset() -> Self {
        Self {
            text: Some(String::new()),
            image_url: None,
            is_complete: Some(false),
            was_paused: Some(false),
            thinking_content: Some(None),
            append_thinking: None,
            is_thinking_complete: Some(false),
            thinking_collapsed: Some(true),
        }
    }

    pub fn completed() -> Self {
        Self {
            is_complete: Some(true),
            was_paused: Some(false),
            is_thinking_complete: Some(true),
            ..Self::default()
        }
    }

    /// Keeps whatever text has accumulated.
    pub fn paused() -> Self {
        Self {
            is_complete: Some(true),
            was_paused: Some(true),
            is_thinking_complete: Some(true),
            ..Self::default()
        }
    }

    /// Discards partial content in favour of the fixed apology text.
    pub fn failed() -> Self {
        Self {
            text: Some(GENERATION_ERROR_TEXT.to_string()),
            is_complete: Some(true),
            was_paused: Some(false),
            is_thinking_complete: Some(true),
            ..Self::default()
        }
    }

    pub fn text_edit(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

/// Lifecycle of an AI message as observed from its stored fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Pending,
    Streaming,
    Complete,
    CompleteButPaused,
    CompleteWithErrorText,
}

impl MessageState {
    pub fn of(message: &Message) -> Self {
        match message.is_complete {
            Some(true) if message.was_paused => Self::CompleteButPaused,
            Some(true) if message.is_ai() && message.text == GENERATION_ERROR_TEXT => {
                Self::CompleteWithErrorText
            }
            Some(true) => Self::Complete,
            Some(false) | None if message.text.is_empty() => Self::Pending,
            Some(false) | None => Self::Streaming,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::CompleteButPaused | Self::CompleteWithErrorText
        )
    }
}

fn default_thinking_collapsed() -> bool {
    true
}
