use snafu::Snafu;

use super::ids::{BranchId, ChatId, MessageId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BranchError {
    #[snafu(display("chat '{chat_id}' was not found"))]
    ChatNotFound {
        stage: &'static str,
        chat_id: ChatId,
    },
    #[snafu(display("message '{message_id}' was not found in chat '{chat_id}'"))]
    MessageNotFound {
        stage: &'static str,
        chat_id: ChatId,
        message_id: MessageId,
    },
    #[snafu(display("branch '{branch_id}' was not found in chat '{chat_id}'"))]
    BranchNotFound {
        stage: &'static str,
        chat_id: ChatId,
        branch_id: BranchId,
    },
    #[snafu(display("the root branch cannot be modified on `{stage}`"))]
    RootBranchImmutable { stage: &'static str },
    #[snafu(display(
        "branch tree of chat '{chat_id}' is corrupt while resolving '{branch_id}': {details}"
    ))]
    CorruptBranchTree {
        stage: &'static str,
        chat_id: ChatId,
        branch_id: BranchId,
        details: String,
    },
}

pub type BranchResult<T> = Result<T, BranchError>;
