use std::sync::Arc;

use serde::{Deserialize, Serialize};
use trellis_core::{ChatId, ConversationMessage, MessageFile, MessageId};
use trellis_llm::{
    ChatAdapter, MessageRequest, StreamEventPayload, StreamFailure, StreamRequest, StreamTarget,
};

use super::manager::{StreamManager, StreamSession};

/// How the backend is asked for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    #[default]
    Stream,
    Fetch,
}

/// Everything one generation needs to know about its slot and its prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingContext {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub user_text: String,
    pub user_files: Vec<MessageFile>,
    pub history: Vec<ConversationMessage>,
}

/// Receiver of relayed output. `on_text_chunk` always gets the full text so far.
pub trait StreamingCallbacks: Send {
    fn on_text_chunk(&mut self, text: &str, image_url: Option<&str>);
    fn on_thinking_chunk(&mut self, fragment: &str, is_complete: bool);
    fn on_complete(&mut self);
    fn on_error(&mut self, failure: StreamFailure);
}

/// How one invocation ended. `Superseded` means a newer session owns the slot and no
/// terminal callback was delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed(StreamFailure),
    Superseded,
}

/// Relays adapter output for a single send or regeneration. Holds no branch knowledge.
pub struct StreamingMessageHandler {
    adapter: Arc<dyn ChatAdapter>,
    streams: Arc<StreamManager>,
}

impl StreamingMessageHandler {
    pub fn new(adapter: Arc<dyn ChatAdapter>, streams: Arc<StreamManager>) -> Self {
        Self { adapter, streams }
    }

    /// Runs the generation to a terminal callback. Never returns an error of its own.
    pub async fn handle<C>(
        &self,
        context: StreamingContext,
        callbacks: &mut C,
        mode: ResponseMode,
    ) -> StreamOutcome
    where
        C: StreamingCallbacks,
    {
        let session = self
            .streams
            .start_stream(&context.chat_id, &context.message_id);
        tracing::debug!(
            chat_id = %context.chat_id,
            message_id = %context.message_id,
            session = %session.session,
            adapter_id = %self.adapter.id(),
            mode = ?mode,
            history_len = context.history.len(),
            "handling generation"
        );

        let request = MessageRequest {
            text: context.user_text,
            files: context.user_files,
            history: context.history,
        };
        let outcome = match mode {
            ResponseMode::Stream => self.run_stream(&session, request, callbacks).await,
            ResponseMode::Fetch => self.run_fetch(&session, request, callbacks).await,
        };

        tracing::debug!(
            chat_id = %session.chat_id,
            message_id = %session.message_id,
            session = %session.session,
            outcome = ?outcome,
            "generation finished"
        );
        outcome
    }

    async fn run_stream<C>(
        &self,
        session: &StreamSession,
        request: MessageRequest,
        callbacks: &mut C,
    ) -> StreamOutcome
    where
        C: StreamingCallbacks,
    {
        let target = session.target();
        let opened = self.adapter.stream_message(
            StreamRequest {
                target: target.clone(),
                request,
            },
            session.token.clone(),
        );
        let handle = match opened {
            Ok(handle) => handle,
            Err(error) => {
                tracing::error!(
                    chat_id = %target.chat_id,
                    message_id = %target.message_id,
                    error = %error,
                    "failed to open stream"
                );
                return self.finish(&target, Err(StreamFailure::from(&error)), callbacks);
            }
        };

        let worker = tokio::spawn(handle.worker);
        let mut stream = handle.stream;
        let mut accumulated = String::new();

        let result = loop {
            let Some(event) = stream.recv().await else {
                break if session.token.is_cancelled() {
                    Err(StreamFailure::aborted())
                } else {
                    tracing::warn!(
                        chat_id = %target.chat_id,
                        message_id = %target.message_id,
                        "provider stream ended before a terminal event"
                    );
                    Err(StreamFailure::transport(
                        "provider stream ended before a terminal event",
                    ))
                };
            };

            if event.target != target {
                // Strict target equality keeps output of other sessions out of this message.
                tracing::warn!(
                    expected = ?target,
                    received = ?event.target,
                    "dropped stream event for another target"
                );
                continue;
            }
            if self.streams.is_superseded(&target) {
                break Ok(false);
            }

            match event.payload {
                StreamEventPayload::Chunk(chunk) => {
                    if let Some(fragment) = chunk.thinking.as_deref()
                        && (!fragment.is_empty() || chunk.thinking_complete)
                    {
                        callbacks.on_thinking_chunk(fragment, chunk.thinking_complete);
                    }
                    if chunk.text.is_some() || chunk.image_url.is_some() {
                        if let Some(delta) = chunk.text.as_deref() {
                            accumulated.push_str(delta);
                        }
                        callbacks.on_text_chunk(&accumulated, chunk.image_url.as_deref());
                    }
                }
                StreamEventPayload::Done => break Ok(true),
                StreamEventPayload::Failed(failure) => break Err(failure),
            }
        };

        // Dropping the receiver cancels the worker's child token if it is still running.
        drop(stream);
        if let Err(error) = worker.await {
            tracing::error!(
                chat_id = %target.chat_id,
                message_id = %target.message_id,
                error = %error,
                "stream worker task failed"
            );
        }

        match result {
            Ok(false) => {
                tracing::debug!(target = ?target, "stream superseded by a newer session");
                StreamOutcome::Superseded
            }
            Ok(true) => self.finish(&target, Ok(()), callbacks),
            Err(failure) => self.finish(&target, Err(failure), callbacks),
        }
    }

    async fn run_fetch<C>(
        &self,
        session: &StreamSession,
        request: MessageRequest,
        callbacks: &mut C,
    ) -> StreamOutcome
    where
        C: StreamingCallbacks,
    {
        let target = session.target();
        let result = tokio::select! {
            biased;
            _ = session.token.cancelled() => Err(StreamFailure::aborted()),
            response = self.adapter.send_message(request) => {
                response.map_err(|error| StreamFailure::from(&error))
            }
        };

        let response = match result {
            Ok(response) => response,
            Err(failure) => return self.finish(&target, Err(failure), callbacks),
        };
        if self.streams.is_superseded(&target) {
            return StreamOutcome::Superseded;
        }

        if let Some(thinking) = response.thinking.as_deref() {
            callbacks.on_thinking_chunk(thinking, true);
        }
        callbacks.on_text_chunk(&response.text, response.image_url.as_deref());
        self.finish(&target, Ok(()), callbacks)
    }

    /// Releases the registry slot, then delivers exactly one terminal callback.
    fn finish<C>(
        &self,
        target: &StreamTarget,
        result: Result<(), StreamFailure>,
        callbacks: &mut C,
    ) -> StreamOutcome
    where
        C: StreamingCallbacks,
    {
        if self.streams.is_superseded(target) {
            return StreamOutcome::Superseded;
        }
        self.streams.finish_stream(target);

        match result {
            Ok(()) => {
                callbacks.on_complete();
                StreamOutcome::Completed
            }
            Err(failure) => {
                if !failure.is_abort() {
                    tracing::warn!(
                        chat_id = %target.chat_id,
                        message_id = %target.message_id,
                        error = %failure,
                        "generation failed"
                    );
                }
                callbacks.on_error(failure.clone());
                StreamOutcome::Failed(failure)
            }
        }
    }
}
