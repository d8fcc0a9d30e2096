//! Server-sent-event shaping for streaming completions.
//!
//! The worker emits already-paced [`StreamEvent`]s; this module turns them
//! into OpenAI chunk JSON. Finish-reason placement needs one event of
//! lookahead: the last content chunk carries `length`/`tool_calls`, while a
//! `stop` finish is a trailing chunk of its own.

use std::convert::Infallible;

use axum::response::sse::{Event, Sse};
use sim_common::SimError;
use sim_core::request::{FinishReason, StreamEvent, Usage};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::types::{
    ChatChunkChoice, ChatCompletionChunk, ChunkDelta, ErrorResponse, FunctionDelta,
    TextChunkChoice, TextCompletionChunk, ToolCallDeltaOut,
};

pub(crate) struct StreamMeta {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub include_usage: bool,
}

type SseStream = Sse<ReceiverStream<Result<Event, Infallible>>>;

pub(crate) fn chat_sse(meta: StreamMeta, mut rx: mpsc::Receiver<StreamEvent>) -> SseStream {
    let (out_tx, out_rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let enc = Encoder {
            meta,
            tx: out_tx,
        };
        let mut pending: Option<ChunkDelta> = None;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Role => {
                    let delta = ChunkDelta {
                        role: Some("assistant"),
                        ..ChunkDelta::default()
                    };
                    if !enc.chat_chunk(delta, None, None).await {
                        return;
                    }
                }
                StreamEvent::Token(token) => {
                    if let Some(prev) = pending.take() {
                        if !enc.chat_chunk(prev, None, None).await {
                            return;
                        }
                    }
                    pending = Some(ChunkDelta {
                        content: Some(token),
                        ..ChunkDelta::default()
                    });
                }
                StreamEvent::ToolCallStart { index, id, name } => {
                    if let Some(prev) = pending.take() {
                        if !enc.chat_chunk(prev, None, None).await {
                            return;
                        }
                    }
                    pending = Some(tool_delta(
                        index,
                        Some(id),
                        Some(name),
                        Some(String::new()),
                    ));
                }
                StreamEvent::ToolCallDelta { index, delta } => {
                    if let Some(prev) = pending.take() {
                        if !enc.chat_chunk(prev, None, None).await {
                            return;
                        }
                    }
                    pending = Some(tool_delta(index, None, None, Some(delta)));
                }
                StreamEvent::Finish { reason, usage, .. } => {
                    enc.finish_chat(pending.take(), reason, usage).await;
                    break;
                }
                StreamEvent::Error(e) => {
                    enc.error(e).await;
                    break;
                }
            }
        }
        enc.done().await;
    });
    Sse::new(ReceiverStream::new(out_rx))
}

pub(crate) fn text_sse(meta: StreamMeta, mut rx: mpsc::Receiver<StreamEvent>) -> SseStream {
    let (out_tx, out_rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let enc = Encoder {
            meta,
            tx: out_tx,
        };
        let mut pending: Option<String> = None;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Token(token) => {
                    if let Some(prev) = pending.take() {
                        if !enc.text_chunk(prev, None, None).await {
                            return;
                        }
                    }
                    pending = Some(token);
                }
                StreamEvent::Finish { reason, usage, .. } => {
                    enc.finish_text(pending.take(), reason, usage).await;
                    break;
                }
                StreamEvent::Error(e) => {
                    enc.error(e).await;
                    break;
                }
                // Role and tool deltas only occur on chat streams.
                _ => {}
            }
        }
        enc.done().await;
    });
    Sse::new(ReceiverStream::new(out_rx))
}

fn tool_delta(
    index: usize,
    id: Option<String>,
    name: Option<String>,
    arguments: Option<String>,
) -> ChunkDelta {
    ChunkDelta {
        tool_calls: Some(vec![ToolCallDeltaOut {
            index,
            kind: id.as_ref().map(|_| "function"),
            id,
            function: FunctionDelta { name, arguments },
        }]),
        ..ChunkDelta::default()
    }
}

struct Encoder {
    meta: StreamMeta,
    tx: mpsc::Sender<Result<Event, Infallible>>,
}

impl Encoder {
    async fn chat_chunk(
        &self,
        delta: ChunkDelta,
        finish: Option<&'static str>,
        usage: Option<Usage>,
    ) -> bool {
        let choices = if usage.is_some() && finish.is_none() {
            Vec::new()
        } else {
            vec![ChatChunkChoice {
                index: 0,
                delta,
                finish_reason: finish,
            }]
        };
        let chunk = ChatCompletionChunk {
            id: self.meta.id.clone(),
            object: "chat.completion.chunk",
            created: self.meta.created,
            model: self.meta.model.clone(),
            choices,
            usage,
        };
        self.send_json(&chunk).await
    }

    async fn text_chunk(
        &self,
        text: String,
        finish: Option<&'static str>,
        usage: Option<Usage>,
    ) -> bool {
        let choices = if usage.is_some() && finish.is_none() {
            Vec::new()
        } else {
            vec![TextChunkChoice {
                index: 0,
                text,
                finish_reason: finish,
            }]
        };
        let chunk = TextCompletionChunk {
            id: self.meta.id.clone(),
            object: "text_completion",
            created: self.meta.created,
            model: self.meta.model.clone(),
            choices,
            usage,
        };
        self.send_json(&chunk).await
    }

    async fn finish_chat(&self, pending: Option<ChunkDelta>, reason: FinishReason, usage: Usage) {
        match reason {
            FinishReason::Stop => {
                if let Some(prev) = pending {
                    if !self.chat_chunk(prev, None, None).await {
                        return;
                    }
                }
                if !self
                    .chat_chunk(ChunkDelta::default(), Some("stop"), None)
                    .await
                {
                    return;
                }
            }
            other => {
                let delta = pending.unwrap_or_default();
                if !self.chat_chunk(delta, Some(other.as_str()), None).await {
                    return;
                }
            }
        }
        if self.meta.include_usage {
            let _ = self.chat_chunk(ChunkDelta::default(), None, Some(usage)).await;
        }
    }

    async fn finish_text(&self, pending: Option<String>, reason: FinishReason, usage: Usage) {
        match reason {
            FinishReason::Stop => {
                if let Some(prev) = pending {
                    if !self.text_chunk(prev, None, None).await {
                        return;
                    }
                }
                if !self.text_chunk(String::new(), Some("stop"), None).await {
                    return;
                }
            }
            other => {
                let text = pending.unwrap_or_default();
                if !self.text_chunk(text, Some(other.as_str()), None).await {
                    return;
                }
            }
        }
        if self.meta.include_usage {
            let _ = self.text_chunk(String::new(), None, Some(usage)).await;
        }
    }

    async fn error(&self, e: SimError) {
        let body = ErrorResponse::new(
            "invalid_request_error",
            format!("failed to generate response: {e}"),
            None,
        );
        if let Ok(json) = serde_json::to_string(&body) {
            let _ = self.tx.send(Ok(Event::default().data(json))).await;
        }
    }

    async fn done(&self) {
        let _ = self.tx.send(Ok(Event::default().data("[DONE]"))).await;
    }

    async fn send_json<T: serde::Serialize>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.tx.send(Ok(Event::default().data(json))).await.is_ok(),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode stream chunk");
                false
            }
        }
    }
}
