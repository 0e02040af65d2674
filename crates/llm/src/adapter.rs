use std::fmt;
use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trellis_core::{ChatId, ConversationMessage, MessageFile, MessageId};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type AdapterWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Backend selection plus the generation knobs passed through to the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterConfig {
    pub adapter_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl AdapterConfig {
    pub fn new(
        adapter_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            adapter_id: adapter_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            model: model.into().trim().to_string(),
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Monotonic id distinguishing successive streams for the same message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(u64);

impl StreamSessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for StreamSessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Identity stamped on every event so consumers can drop output of superseded streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub session: StreamSessionId,
}

impl StreamTarget {
    pub fn new(chat_id: ChatId, message_id: MessageId, session: StreamSessionId) -> Self {
        Self {
            chat_id,
            message_id,
            session,
        }
    }
}

/// User turn plus the conversation preceding it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageRequest {
    pub text: String,
    pub files: Vec<MessageFile>,
    pub history: Vec<ConversationMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageResponse {
    pub text: String,
    pub image_url: Option<String>,
    pub thinking: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub request: MessageRequest,
}

/// Raw file contents waiting to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Incremental output. A `None` field means "no update this tick", never "clear".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamChunk {
    pub text: Option<String>,
    pub image_url: Option<String>,
    pub thinking: Option<String>,
    pub thinking_complete: bool,
    pub complete: bool,
}

impl StreamChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            text: Some(delta.into()),
            ..Self::default()
        }
    }

    pub fn thinking(fragment: impl Into<String>, complete: bool) -> Self {
        Self {
            thinking: Some(fragment.into()),
            thinking_complete: complete,
            ..Self::default()
        }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self {
            image_url: Some(url.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Aborted,
    Transport,
}

/// Terminal failure of one stream as seen by its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StreamFailure {
    pub fn aborted() -> Self {
        Self {
            kind: FailureKind::Aborted,
            message: "request aborted".to_string(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            message: message.into(),
        }
    }

    pub fn is_abort(&self) -> bool {
        self.kind == FailureKind::Aborted
    }
}

impl From<&AdapterError> for StreamFailure {
    fn from(error: &AdapterError) -> Self {
        if error.is_abort() {
            Self::aborted()
        } else {
            Self::transport(error.to_string())
        }
    }
}

impl fmt::Display for StreamFailure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Chunk(StreamChunk),
    Done,
    Failed(StreamFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AdapterError {
    #[snafu(display("request aborted on `{stage}`"))]
    Aborted { stage: &'static str },
    #[snafu(display("missing API key for adapter '{adapter_id}'"))]
    MissingApiKey {
        stage: &'static str,
        adapter_id: String,
    },
    #[snafu(display("adapter '{adapter_id}' is not supported"))]
    UnsupportedAdapter {
        stage: &'static str,
        adapter_id: String,
    },
    #[snafu(display("request for {target:?} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        target: Option<StreamTarget>,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("upload of '{file_name}' failed: {details}"))]
    UploadFailed {
        stage: &'static str,
        file_name: String,
        details: String,
    },
    #[snafu(display("adapter '{adapter_id}' does not support `{operation}`"))]
    Unsupported {
        stage: &'static str,
        adapter_id: String,
        operation: &'static str,
    },
    #[snafu(display("backend reported an error on `{stage}`: {message}"))]
    Backend {
        stage: &'static str,
        message: String,
    },
}

impl AdapterError {
    /// True for user-initiated cancellation, which callers surface as a pause.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// Receiving half of a stream. Dropping it cancels the worker.
pub struct AdapterEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
}

pub struct AdapterStreamHandle {
    pub stream: AdapterEventStream,
    pub worker: AdapterWorker,
}

impl AdapterEventStream {
    pub(crate) fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            target,
            events,
            cancel,
        }
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) -> bool {
        let was_live = !self.cancel.is_cancelled();
        self.cancel.cancel();
        was_live
    }
}

impl Drop for AdapterEventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub trait ChatAdapter: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;

    /// Single-shot completion.
    fn send_message<'a>(&'a self, request: MessageRequest)
    -> BoxFuture<'a, AdapterResult<MessageResponse>>;

    /// Opens a stream. The worker must be polled for events to flow; cancelling `cancel`
    /// makes it emit a single aborted failure and stop.
    fn stream_message(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> AdapterResult<AdapterStreamHandle>;

    fn upload_file<'a>(
        &'a self,
        upload: FileUpload,
        _cancel: CancellationToken,
    ) -> BoxFuture<'a, AdapterResult<MessageFile>> {
        Box::pin(async move {
            tracing::debug!(
                adapter_id = %self.id(),
                file_name = %upload.name,
                "upload not supported"
            );
            UnsupportedSnafu {
                stage: "upload-file",
                adapter_id: self.id().to_string(),
                operation: "upload_file",
            }
            .fail()
        })
    }
}

/// Wires a channel pair whose worker side observes a child of `cancel`.
pub(crate) fn make_event_stream(
    target: StreamTarget,
    cancel: &CancellationToken,
) -> (
    mpsc::UnboundedSender<StreamEvent>,
    AdapterEventStream,
    CancellationToken,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let worker_cancel = cancel.child_token();
    (
        event_tx,
        AdapterEventStream::new(target, event_rx, worker_cancel.clone()),
        worker_cancel,
    )
}

pub(crate) fn emit(
    event_tx: &mpsc::UnboundedSender<StreamEvent>,
    target: &StreamTarget,
    payload: StreamEventPayload,
) -> bool {
    event_tx
        .send(StreamEvent {
            target: target.clone(),
            payload,
        })
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> StreamTarget {
        StreamTarget::new(
            ChatId::new("chat-1"),
            MessageId::new("msg-1"),
            StreamSessionId::new(7),
        )
    }

    #[test]
    fn dropping_event_stream_cancels_worker_but_not_parent() {
        let parent = CancellationToken::new();
        let (_tx, stream, worker_cancel) = make_event_stream(target(), &parent);

        drop(stream);

        assert!(worker_cancel.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn parent_cancellation_reaches_worker() {
        let parent = CancellationToken::new();
        let (_tx, stream, worker_cancel) = make_event_stream(target(), &parent);

        parent.cancel();
        assert!(worker_cancel.is_cancelled());
        assert!(!stream.cancel());
    }

    #[test]
    fn abort_errors_map_to_aborted_failures() {
        let aborted = AdapterError::Aborted { stage: "test" };
        assert!(StreamFailure::from(&aborted).is_abort());

        let backend = AdapterError::Backend {
            stage: "test",
            message: "502".to_string(),
        };
        let failure = StreamFailure::from(&backend);
        assert_eq!(failure.kind, FailureKind::Transport);
        assert!(failure.message.contains("502"));
    }
}
