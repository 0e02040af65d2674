use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::MessageId;
use crate::message::{Message, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    User,
    Assistant,
}

/// One prior turn handed to a backend adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: ConversationRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Message> for ConversationMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: match message.sender {
                Sender::User => ConversationRole::User,
                Sender::Ai => ConversationRole::Assistant,
            },
            content: message.text.clone(),
            timestamp: message.timestamp,
        }
    }
}

pub fn build_history<'a>(
    messages: impl IntoIterator<Item = &'a Message>,
) -> Vec<ConversationMessage> {
    messages.into_iter().map(ConversationMessage::from).collect()
}

/// History for regenerating `message_id`: the visible messages strictly before it.
///
/// When the message is not visible the whole sequence is returned.
pub fn history_before(visible: &[Message], message_id: &MessageId) -> Vec<ConversationMessage> {
    let end = visible
        .iter()
        .position(|message| &message.id == message_id)
        .unwrap_or(visible.len());
    build_history(&visible[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_stops_before_regenerated_message() {
        let question = Message::user("hello");
        let mut answer = Message::ai_placeholder();
        answer.text = "hi".to_string();
        let follow_up = Message::user("again");
        let visible = vec![question, answer.clone(), follow_up];

        let history = history_before(&visible, &answer.id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, ConversationRole::User);
        assert_eq!(history[0].content, "hello");
    }

    #[test]
    fn ai_messages_map_to_assistant_role() {
        let encoded = serde_json::to_value(ConversationMessage::from(&Message::ai_placeholder()))
            .expect("serialize history entry");
        assert_eq!(encoded["role"], "assistant");
    }
}
