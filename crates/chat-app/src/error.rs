use snafu::Snafu;
use trellis_core::{BranchError, ChatId, MessageId};
use trellis_llm::AdapterError;
use trellis_storage::StorageError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("branch operation failed on `{stage}`: {source}"))]
    Branch {
        stage: &'static str,
        source: BranchError,
    },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("adapter failed on `{stage}`: {source}"))]
    Adapter {
        stage: &'static str,
        source: AdapterError,
    },
    #[snafu(display("message '{message_id}' in chat '{chat_id}' cannot be edited on `{stage}`"))]
    MessageNotEditable {
        stage: &'static str,
        chat_id: ChatId,
        message_id: MessageId,
    },
    #[snafu(display("chat '{chat_id}' has no AI response to regenerate"))]
    NothingToRegenerate { stage: &'static str, chat_id: ChatId },
    #[snafu(display("refusing to send an empty message on `{stage}`"))]
    EmptyMessage { stage: &'static str },
}

pub type EngineResult<T> = Result<T, EngineError>;
