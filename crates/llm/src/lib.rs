use std::sync::Arc;

mod adapter;
mod mock;
mod rig_adapter;

pub use adapter::{
    AdapterConfig, AdapterError, AdapterEventStream, AdapterResult, AdapterStreamHandle,
    AdapterWorker, BoxFuture, ChatAdapter, FailureKind, FileUpload, MessageRequest,
    MessageResponse, StreamChunk, StreamEvent, StreamEventPayload, StreamFailure, StreamRequest,
    StreamSessionId, StreamTarget,
};
pub use mock::{MOCK_ADAPTER_ID, MockAdapter, MockStep};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_ADAPTER_ID, RigChatAdapter};

pub fn create_adapter(mut config: AdapterConfig) -> AdapterResult<Arc<dyn ChatAdapter>> {
    if config.adapter_id.trim().is_empty() {
        config.adapter_id = MOCK_ADAPTER_ID.to_string();
    }

    match config.adapter_id.as_str() {
        MOCK_ADAPTER_ID => Ok(Arc::new(MockAdapter::new())),
        "openai" | "rig-openai" => {
            config.adapter_id = RIG_OPENAI_ADAPTER_ID.to_string();
            Ok(Arc::new(RigChatAdapter::new(config)?))
        }
        _ => Err(AdapterError::UnsupportedAdapter {
            stage: "create-adapter",
            adapter_id: config.adapter_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_adapter_id_selects_mock() {
        let adapter = create_adapter(AdapterConfig::new("", "", "", "")).expect("mock adapter");
        assert_eq!(adapter.id(), MOCK_ADAPTER_ID);
    }

    #[test]
    fn unknown_adapter_is_rejected() {
        let error = create_adapter(AdapterConfig::new("carrier-pigeon", "", "", ""))
            .err()
            .expect("unsupported adapter");
        assert!(matches!(error, AdapterError::UnsupportedAdapter { .. }));
    }

    #[test]
    fn openai_alias_normalizes_id() {
        let adapter = create_adapter(AdapterConfig::new("rig-openai", "sk-test", "", ""))
            .expect("rig adapter");
        assert_eq!(adapter.id(), RIG_OPENAI_ADAPTER_ID);
    }
}
