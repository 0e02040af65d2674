pub mod branch;
pub mod chat;
pub mod error;
pub mod history;
pub mod ids;
pub mod message;

pub use branch::{
    BranchOption, BreadcrumbSegment, ResolverCache, branching_points, breadcrumb,
    build_branch_path, create_branch_from_message, delete_branch, resolve_branch_options,
    resolve_visible_messages, switch_to_branch,
};
pub use chat::{BranchModel, BranchNode, Chat, DEFAULT_CHAT_TITLE};
pub use error::{BranchError, BranchResult};
pub use history::{ConversationMessage, ConversationRole, build_history, history_before};
pub use ids::{BranchId, ChatId, FileId, MAIN_BRANCH, MessageId};
pub use message::{
    GENERATION_ERROR_TEXT, Message, MessageFile, MessagePatch, MessageState, Sender,
};
