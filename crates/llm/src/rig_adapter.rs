use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trellis_core::{ConversationMessage, ConversationRole};

use super::adapter::{
    AdapterConfig, AdapterError, AdapterResult, AdapterStreamHandle, AdapterWorker, AbortedSnafu,
    BoxFuture, ChatAdapter, CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu,
    MessageRequest, MessageResponse, MissingApiKeySnafu, StreamChunk, StreamEvent,
    StreamEventPayload, StreamFailure, StreamRequest, StreamTarget, emit, make_event_stream,
};

pub const RIG_OPENAI_ADAPTER_ID: &str = "openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// OpenAI-compatible backend driven through rig.
pub struct RigChatAdapter {
    config: AdapterConfig,
}

impl RigChatAdapter {
    pub fn new(mut config: AdapterConfig) -> AdapterResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                adapter_id: config.adapter_id.clone(),
            }
        );
        if config.model.is_empty() {
            config.model = DEFAULT_OPENAI_MODEL.to_string();
        }

        Ok(Self { config })
    }

    fn build_client(config: &AdapterConfig) -> AdapterResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &ConversationMessage) -> Option<RigMessage> {
        if message.content.trim().is_empty() {
            return None;
        }
        Some(match message.role {
            ConversationRole::User => RigMessage::user(message.content.clone()),
            ConversationRole::Assistant => RigMessage::assistant(message.content.clone()),
        })
    }

    // History normally already ends with the user turn being answered; only append the
    // request text when it does not.
    fn conversation(request: &MessageRequest) -> Vec<RigMessage> {
        let mut messages = request
            .history
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let ends_with_prompt = request.history.last().is_some_and(|last| {
            last.role == ConversationRole::User && last.content == request.text
        });
        if !ends_with_prompt && !request.text.trim().is_empty() {
            messages.push(RigMessage::user(request.text.clone()));
        }
        messages
    }

    async fn open_stream(
        config: &AdapterConfig,
        request: &MessageRequest,
        target: Option<&StreamTarget>,
    ) -> AdapterResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(config.model.clone());

        let mut messages = Self::conversation(request);
        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                target = ?target,
                model_id = %config.model,
                history_len = request.history.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                target: target.cloned(),
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = config
            .preamble
            .as_ref()
            .filter(|preamble| !preamble.trim().is_empty())
        {
            builder = builder.preamble(preamble.clone());
        }

        if let Some(temperature) = config.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = config.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<StreamChunk>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) => Some(StreamChunk::text(text.text)),
            StreamedAssistantContent::Reasoning(reasoning) => {
                // Rig can split reasoning into multiple fragments; flatten before forwarding.
                let text = reasoning.reasoning.join("");
                (!text.is_empty()).then(|| StreamChunk::thinking(text, false))
            }
            StreamedAssistantContent::ReasoningDelta { reasoning, .. } => {
                (!reasoning.is_empty()).then(|| StreamChunk::thinking(reasoning, false))
            }
            StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    async fn run_stream_worker(
        config: AdapterConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        cancel: CancellationToken,
    ) {
        let target = request.target;
        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                emit(&event_tx, &target, StreamEventPayload::Failed(StreamFailure::aborted()));
                return;
            }
            opened = Self::open_stream(&config, &request.request, Some(&target)) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    adapter_id = %config.adapter_id,
                    model_id = %config.model,
                    error = %error,
                    "failed to open provider stream"
                );
                emit(
                    &event_tx,
                    &target,
                    StreamEventPayload::Failed(StreamFailure::from(&error)),
                );
                return;
            }
        };

        let mut thinking_open = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Cancel the upstream Rig stream so provider IO stops promptly.
                    tracing::debug!(target = ?target, "provider stream cancelled");
                    stream.cancel();
                    emit(&event_tx, &target, StreamEventPayload::Failed(StreamFailure::aborted()));
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            let Some(mut chunk) = Self::map_stream_item(item) else {
                                continue;
                            };
                            if chunk.thinking.is_some() {
                                thinking_open = true;
                            } else if thinking_open && chunk.text.is_some() {
                                // First answer token closes the reasoning trace.
                                chunk.thinking = Some(String::new());
                                chunk.thinking_complete = true;
                                thinking_open = false;
                            }
                            if !emit(&event_tx, &target, StreamEventPayload::Chunk(chunk)) {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                target = ?target,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = AdapterError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            emit(
                                &event_tx,
                                &target,
                                StreamEventPayload::Failed(StreamFailure::from(&error)),
                            );
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = emit(&event_tx, &target, StreamEventPayload::Done);
    }
}

impl ChatAdapter for RigChatAdapter {
    fn id(&self) -> &str {
        &self.config.adapter_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn send_message<'a>(
        &'a self,
        request: MessageRequest,
    ) -> BoxFuture<'a, AdapterResult<MessageResponse>> {
        Box::pin(async move {
            let mut stream = Self::open_stream(&self.config, &request, None).await?;
            let mut response = MessageResponse::default();

            while let Some(item) = stream.next().await {
                let item = item.context(CompletionsFailedSnafu {
                    stage: "send-message-chunk",
                })?;
                let Some(chunk) = Self::map_stream_item(item) else {
                    continue;
                };
                if let Some(text) = chunk.text {
                    response.text.push_str(&text);
                }
                if let Some(thinking) = chunk.thinking {
                    response
                        .thinking
                        .get_or_insert_with(String::new)
                        .push_str(&thinking);
                }
            }

            tracing::debug!(
                adapter_id = %self.id(),
                text_len = response.text.len(),
                "collected single-shot response"
            );
            Ok(response)
        })
    }

    fn stream_message(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> AdapterResult<AdapterStreamHandle> {
        ensure!(
            !request.request.text.trim().is_empty() || !request.request.history.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-message",
                target: Some(request.target.clone()),
            }
        );
        ensure!(
            !cancel.is_cancelled(),
            AbortedSnafu {
                stage: "stream-message-precheck",
            }
        );

        let (event_tx, stream, worker_cancel) = make_event_stream(request.target.clone(), &cancel);
        let worker: AdapterWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            worker_cancel,
        ));

        Ok(AdapterStreamHandle { stream, worker })
    }
}
