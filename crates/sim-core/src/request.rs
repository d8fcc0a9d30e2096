//! Internal request/response model, owned by the worker for the lifetime of
//! a request.

use sim_common::{Result, SimError};
use tokio::sync::{mpsc, oneshot};

use crate::toolcalls::{Tool, ToolCall, ToolChoice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Unknown => "unknown",
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub enum RequestPayload {
    Chat {
        messages: Vec<ChatMessage>,
        tools: Vec<Tool>,
        tool_choice: ToolChoice,
    },
    Text {
        prompt: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    RemoteDecode,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::RemoteDecode => "remote_decode",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Placeholder identifiers attached to prefill-only responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDecodeInfo {
    pub block_ids: Vec<String>,
    pub engine_id: String,
    pub host: String,
    pub port: u16,
}

impl RemoteDecodeInfo {
    pub fn placeholder() -> Self {
        Self {
            block_ids: vec!["remote-block-1".to_string()],
            engine_id: "remote-engine".to_string(),
            host: "remote-host".to_string(),
            port: 1234,
        }
    }
}

/// A parsed, validated completion request.
#[derive(Debug, Clone)]
pub struct SimRequest {
    pub id: String,
    pub requested_model: String,
    /// Name surfaced in the response: the adapter's own name, or the first
    /// served alias for the base model.
    pub display_model: String,
    /// Set when the requested model is a loaded LoRA adapter.
    pub lora_name: Option<String>,
    pub stream: bool,
    pub include_usage: bool,
    pub ignore_eos: bool,
    pub do_remote_prefill: bool,
    pub do_remote_decode: bool,
    /// Filled in by the KV-cache hook before generation.
    pub cached_prompt_tokens: usize,
    /// Resolved cap: `max_completion_tokens` wins over `max_tokens`.
    pub max_tokens: Option<usize>,
    pub payload: RequestPayload,
    /// Token count of the canonical prompt projection.
    pub prompt_token_count: usize,
}

impl SimRequest {
    /// Prompt text used for token counting and echo mode.
    pub fn prompt_text(&self) -> String {
        match &self.payload {
            RequestPayload::Text { prompt } => prompt.clone(),
            RequestPayload::Chat { messages, .. } => messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Prompt projection hashed for dataset lookup. Each message becomes a
    /// `### <role>:\n<content>\n` block; a bare prompt projects as `user`.
    pub fn hash_projection(&self) -> String {
        match &self.payload {
            RequestPayload::Text { prompt } => format!("### user:\n{prompt}\n"),
            RequestPayload::Chat { messages, .. } => {
                let mut out = String::new();
                for m in messages {
                    out.push_str("### ");
                    out.push_str(m.role.as_str());
                    out.push_str(":\n");
                    out.push_str(&m.content);
                    out.push('\n');
                }
                out
            }
        }
    }

    pub fn is_chat(&self) -> bool {
        matches!(self.payload, RequestPayload::Chat { .. })
    }
}

/// Completed output of a non-streaming request.
#[derive(Debug, Clone)]
pub struct CompletionOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub remote: Option<RemoteDecodeInfo>,
}

/// Events produced by the worker for a streaming request, already paced.
#[derive(Debug)]
pub enum StreamEvent {
    /// First chunk of a chat stream (role = assistant).
    Role,
    Token(String),
    /// First delta of a tool call; carries the function name and id.
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallDelta {
        index: usize,
        delta: String,
    },
    Finish {
        reason: FinishReason,
        usage: Usage,
        remote: Option<RemoteDecodeInfo>,
    },
    Error(SimError),
}

pub enum Responder {
    Full(oneshot::Sender<Result<CompletionOutput>>),
    Stream(mpsc::Sender<StreamEvent>),
}

/// One admission-queue item.
pub struct QueuedRequest {
    pub request: SimRequest,
    pub responder: Responder,
}
