use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trellis_core::{FileId, MessageFile};

use super::adapter::{
    AdapterResult, AdapterStreamHandle, AdapterWorker, AbortedSnafu, BackendSnafu, BoxFuture,
    ChatAdapter, FileUpload, MessageRequest, MessageResponse, StreamChunk, StreamEvent,
    StreamEventPayload, StreamFailure, StreamRequest, StreamTarget, UploadFailedSnafu, emit,
    make_event_stream,
};

pub const MOCK_ADAPTER_ID: &str = "mock";

const GREETING: &str =
    "Hello! I'm a mock AI assistant. I can simulate responses for demo purposes.";
const IMAGE_TEXT: &str = "Here's a placeholder image I generated:";
const IMAGE_URL: &str = "https://via.placeholder.com/512x512.png?text=AI+Generated+Image";

/// One scripted action of the mock backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockStep {
    Text(String),
    Thinking { text: String, complete: bool },
    Image(String),
    /// Emits nothing until cancelled.
    Hold,
    Fail(String),
}

/// Offline backend: canned demo replies, or a fixed script for every request.
#[derive(Debug, Clone)]
pub struct MockAdapter {
    script: Option<Arc<[MockStep]>>,
    step_delay: Duration,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            script: None,
            step_delay: Duration::from_millis(60),
        }
    }

    pub fn scripted(steps: impl IntoIterator<Item = MockStep>) -> Self {
        Self {
            script: Some(steps.into_iter().collect()),
            step_delay: Duration::ZERO,
        }
    }

    pub fn with_step_delay(mut self, step_delay: Duration) -> Self {
        self.step_delay = step_delay;
        self
    }

    fn steps_for(&self, request: &MessageRequest) -> Vec<MockStep> {
        if let Some(script) = &self.script {
            return script.to_vec();
        }

        let lowered = request.text.to_lowercase();
        let is_greeting = lowered
            .split(|character: char| !character.is_alphanumeric())
            .any(|word| word == "hello" || word == "hi");
        let (reply, image) = if is_greeting {
            (GREETING.to_string(), None)
        } else if lowered.contains("image") {
            (IMAGE_TEXT.to_string(), Some(IMAGE_URL.to_string()))
        } else {
            (format!("You said: \"{}\"", request.text), None)
        };

        let words = reply.split(' ').collect::<Vec<_>>();
        let last = words.len().saturating_sub(1);
        let mut steps = words
            .iter()
            .enumerate()
            .map(|(index, word)| {
                let separator = if index < last { " " } else { "" };
                MockStep::Text(format!("{word}{separator}"))
            })
            .collect::<Vec<_>>();
        steps.extend(image.map(MockStep::Image));
        steps
    }

    async fn pause(step_delay: Duration, cancel: &CancellationToken) -> bool {
        if step_delay.is_zero() {
            tokio::task::yield_now().await;
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(step_delay) => true,
        }
    }

    async fn run_stream_worker(
        steps: Vec<MockStep>,
        step_delay: Duration,
        target: StreamTarget,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        cancel: CancellationToken,
    ) {
        for step in steps {
            if !Self::pause(step_delay, &cancel).await {
                emit(
                    &event_tx,
                    &target,
                    StreamEventPayload::Failed(StreamFailure::aborted()),
                );
                return;
            }

            let chunk = match step {
                MockStep::Text(text) => StreamChunk::text(text),
                MockStep::Thinking { text, complete } => StreamChunk::thinking(text, complete),
                MockStep::Image(url) => StreamChunk::image(url),
                MockStep::Hold => {
                    cancel.cancelled().await;
                    tracing::debug!(target = ?target, "mock stream released by cancellation");
                    emit(
                        &event_tx,
                        &target,
                        StreamEventPayload::Failed(StreamFailure::aborted()),
                    );
                    return;
                }
                MockStep::Fail(message) => {
                    emit(
                        &event_tx,
                        &target,
                        StreamEventPayload::Failed(StreamFailure::transport(message)),
                    );
                    return;
                }
            };

            if !emit(&event_tx, &target, StreamEventPayload::Chunk(chunk)) {
                return;
            }
        }

        let final_chunk = StreamChunk {
            complete: true,
            ..StreamChunk::default()
        };
        emit(&event_tx, &target, StreamEventPayload::Chunk(final_chunk));
        emit(&event_tx, &target, StreamEventPayload::Done);
    }
}

impl ChatAdapter for MockAdapter {
    fn id(&self) -> &str {
        MOCK_ADAPTER_ID
    }

    fn name(&self) -> &str {
        "Mock"
    }

    fn send_message<'a>(
        &'a self,
        request: MessageRequest,
    ) -> BoxFuture<'a, AdapterResult<MessageResponse>> {
        Box::pin(async move {
            let mut response = MessageResponse::default();
            for step in self.steps_for(&request) {
                if !self.step_delay.is_zero() {
                    tokio::time::sleep(self.step_delay).await;
                }
                match step {
                    MockStep::Text(text) => response.text.push_str(&text),
                    MockStep::Thinking { text, .. } => response
                        .thinking
                        .get_or_insert_with(String::new)
                        .push_str(&text),
                    MockStep::Image(url) => response.image_url = Some(url),
                    MockStep::Hold => std::future::pending::<()>().await,
                    MockStep::Fail(message) => {
                        return BackendSnafu {
                            stage: "mock-send-message",
                            message,
                        }
                        .fail();
                    }
                }
            }
            Ok(response)
        })
    }

    fn stream_message(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> AdapterResult<AdapterStreamHandle> {
        if cancel.is_cancelled() {
            return AbortedSnafu {
                stage: "mock-stream-precheck",
            }
            .fail();
        }

        let steps = self.steps_for(&request.request);
        let (event_tx, stream, worker_cancel) = make_event_stream(request.target.clone(), &cancel);
        let worker: AdapterWorker = Box::pin(Self::run_stream_worker(
            steps,
            self.step_delay,
            request.target,
            event_tx,
            worker_cancel,
        ));

        Ok(AdapterStreamHandle { stream, worker })
    }

    fn upload_file<'a>(
        &'a self,
        upload: FileUpload,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, AdapterResult<MessageFile>> {
        Box::pin(async move {
            if !Self::pause(self.step_delay, &cancel).await {
                return AbortedSnafu {
                    stage: "mock-upload",
                }
                .fail();
            }
            if upload.bytes.is_empty() {
                return UploadFailedSnafu {
                    stage: "mock-upload",
                    file_name: upload.name,
                    details: "file is empty".to_string(),
                }
                .fail();
            }

            let id = FileId::generate();
            Ok(MessageFile {
                url: format!("mock://files/{id}/{}", upload.name),
                id,
                size: upload.bytes.len() as u64,
                name: upload.name,
                mime_type: upload.mime_type,
            })
        })
    }
}
