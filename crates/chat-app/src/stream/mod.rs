//! In-flight generation registry and the relay that drives one generation.

mod handler;
mod manager;

pub use handler::{
    ResponseMode, StreamOutcome, StreamingCallbacks, StreamingContext, StreamingMessageHandler,
};
pub use manager::{StreamInfo, StreamKey, StreamManager, StreamSession};
