pub mod command;
pub mod engine;
pub mod error;
pub mod events;
pub mod repl;
pub mod settings;
pub mod store;
pub mod stream;

pub use engine::{BranchEdit, ChatEngine, UploadFailure, UploadReport};
pub use error::{EngineError, EngineResult};
pub use events::{ChatEvent, NoticeLevel};
pub use store::ChatStore;
