//! HTTP surface: OpenAI-compatible completion endpoints, model listing,
//! LoRA lifecycle, tokenize, metrics, and health probes.

pub mod types;
mod stream;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use once_cell::sync::Lazy;
use prometheus::{Encoder, TextEncoder};
use sim_common::SimError;
use sim_core::request::{
    ChatMessage, CompletionOutput, QueuedRequest, RequestPayload, Responder, SimRequest,
};
use sim_core::toolcalls::{Tool, ToolChoice};
use sim_core::{failure, tokenizer, Simulator};
use tokio::sync::{mpsc, oneshot};

use stream::StreamMeta;
use types::*;

const STREAM_CHANNEL_CAPACITY: usize = 64;

static ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);

#[derive(Clone)]
pub struct AppState {
    sim: Arc<Simulator>,
}

pub fn app(sim: Arc<Simulator>) -> Router {
    let pod_name = sim.config().pod_name.clone();
    let pod_namespace = sim.config().pod_namespace.clone();
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(models))
        .route("/v1/load_lora_adapter", post(load_lora_adapter))
        .route("/v1/unload_lora_adapter", post(unload_lora_adapter))
        .route("/tokenize", post(tokenize))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route("/ready", get(health))
        .layer(axum::middleware::from_fn(
            move |req: axum::extract::Request, next: axum::middleware::Next| {
                let pod_name = pod_name.clone();
                let pod_namespace = pod_namespace.clone();
                async move {
                    let mut res = next.run(req).await;
                    if let Some(pod) = pod_name.as_deref() {
                        if let Ok(value) = HeaderValue::from_str(pod) {
                            res.headers_mut().insert("x-inference-pod", value);
                        }
                    }
                    if let Some(ns) = pod_namespace.as_deref() {
                        if let Ok(value) = HeaderValue::from_str(ns) {
                            res.headers_mut().insert("x-inference-namespace", value);
                        }
                    }
                    res
                }
            },
        ))
        .with_state(AppState { sim })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({}))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let families = state.sim.metrics().registry().gather();
    let mut buffer = Vec::new();
    if let Err(e) = ENCODER.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()).into_response();
    }
    (
        [("content-type", ENCODER.format_type().to_string())],
        buffer,
    )
        .into_response()
}

async fn models(State(state): State<AppState>) -> Json<ModelList> {
    let sim = &state.sim;
    let created = unix_now();
    let first_alias = sim.config().public_model_name().to_string();
    let mut data: Vec<ModelInfo> = sim
        .config()
        .served_aliases()
        .into_iter()
        .map(|alias| ModelInfo {
            id: alias.clone(),
            object: "model",
            created,
            owned_by: "vllm",
            root: alias,
            parent: None,
        })
        .collect();
    for adapter in sim.lora().list() {
        data.push(ModelInfo {
            id: adapter.name.clone(),
            object: "model",
            created,
            owned_by: "vllm",
            root: adapter.name,
            parent: Some(first_alias.clone()),
        });
    }
    Json(ModelList {
        object: "list",
        data,
    })
}

async fn load_lora_adapter(
    State(state): State<AppState>,
    Json(body): Json<LoraAdapterRequest>,
) -> Response {
    if body.lora_name.is_empty() {
        return api_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "lora_name is required".into(),
            Some("lora_name".into()),
        );
    }
    tracing::info!(lora = %body.lora_name, "loading lora adapter");
    state.sim.lora().load(&body.lora_name, &body.lora_path);
    Json(serde_json::json!({})).into_response()
}

async fn unload_lora_adapter(
    State(state): State<AppState>,
    Json(body): Json<LoraAdapterRequest>,
) -> Response {
    tracing::info!(lora = %body.lora_name, "unloading lora adapter");
    state.sim.lora().unload(&body.lora_name);
    Json(serde_json::json!({})).into_response()
}

async fn tokenize(State(state): State<AppState>, Json(body): Json<TokenizeRequest>) -> Response {
    let text = match (&body.prompt, &body.messages) {
        (Some(prompt), _) => prompt.clone(),
        (None, Some(messages)) => messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        (None, None) => {
            return api_error(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "either prompt or messages is required".into(),
                None,
            )
        }
    };
    let tokens = tokenizer::tokenize(&text);
    Json(TokenizeResponse {
        count: tokens.len(),
        tokens,
        max_model_len: state.sim.config().max_model_len,
    })
    .into_response()
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Response {
    let sim = &state.sim;
    if let Some(f) = failure::maybe_inject(sim.config(), sim.rng(), sim.config().public_model_name())
    {
        return injected_response(f);
    }
    let request = match build_chat_request(sim, &req) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    tracing::info!(request_id = %request.id, model = %request.requested_model, stream = request.stream, "chat completion accepted");
    let meta = StreamMeta {
        id: format!("chatcmpl-{}", request.id),
        created: unix_now(),
        model: request.display_model.clone(),
        include_usage: request.include_usage,
    };
    if request.stream {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        sim.enqueue(QueuedRequest {
            request,
            responder: Responder::Stream(tx),
        })
        .await;
        stream::chat_sse(meta, rx).into_response()
    } else {
        let (tx, rx) = oneshot::channel();
        sim.enqueue(QueuedRequest {
            request,
            responder: Responder::Full(tx),
        })
        .await;
        match rx.await {
            Ok(Ok(output)) => Json(chat_response(meta, output)).into_response(),
            Ok(Err(e)) => sim_error_response(e),
            Err(_) => api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "worker dropped the request".into(),
                None,
            ),
        }
    }
}

async fn completions(
    State(state): State<AppState>,
    Json(req): Json<TextCompletionRequest>,
) -> Response {
    let sim = &state.sim;
    if let Some(f) = failure::maybe_inject(sim.config(), sim.rng(), sim.config().public_model_name())
    {
        return injected_response(f);
    }
    let request = match build_text_request(sim, &req) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    tracing::info!(request_id = %request.id, model = %request.requested_model, stream = request.stream, "text completion accepted");
    let meta = StreamMeta {
        id: format!("cmpl-{}", request.id),
        created: unix_now(),
        model: request.display_model.clone(),
        include_usage: request.include_usage,
    };
    if request.stream {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        sim.enqueue(QueuedRequest {
            request,
            responder: Responder::Stream(tx),
        })
        .await;
        stream::text_sse(meta, rx).into_response()
    } else {
        let (tx, rx) = oneshot::channel();
        sim.enqueue(QueuedRequest {
            request,
            responder: Responder::Full(tx),
        })
        .await;
        match rx.await {
            Ok(Ok(output)) => Json(text_response(meta, output)).into_response(),
            Ok(Err(e)) => sim_error_response(e),
            Err(_) => api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "worker dropped the request".into(),
                None,
            ),
        }
    }
}

fn build_chat_request(
    sim: &Simulator,
    req: &ChatCompletionRequest,
) -> Result<SimRequest, Response> {
    let (display_model, lora_name) = resolve_model(sim, &req.model)?;
    let max_tokens = resolve_max_tokens(req.max_tokens, req.max_completion_tokens)?;
    let tools: Vec<Tool> = req
        .tools
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|t| Tool {
            name: t.function.name.clone(),
            description: t.function.description.clone(),
            parameters: t.function.parameters.clone(),
        })
        .collect();
    let tool_choice = parse_tool_choice(req.tool_choice.as_deref(), !tools.is_empty())?;
    let payload = RequestPayload::Chat {
        messages: req
            .messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role.as_str().into(),
                content: m.content.clone(),
            })
            .collect(),
        tools,
        tool_choice,
    };
    finish_request(sim, req.stream, req.stream_options.as_ref(), payload, FinishArgs {
        display_model,
        lora_name,
        requested_model: req.model.clone(),
        max_tokens,
        ignore_eos: req.ignore_eos,
        do_remote_prefill: req.do_remote_prefill,
        do_remote_decode: req.do_remote_decode,
    })
}

fn build_text_request(
    sim: &Simulator,
    req: &TextCompletionRequest,
) -> Result<SimRequest, Response> {
    let (display_model, lora_name) = resolve_model(sim, &req.model)?;
    let max_tokens = resolve_max_tokens(req.max_tokens, None)?;
    let payload = RequestPayload::Text {
        prompt: req.prompt.clone(),
    };
    finish_request(sim, req.stream, req.stream_options.as_ref(), payload, FinishArgs {
        display_model,
        lora_name,
        requested_model: req.model.clone(),
        max_tokens,
        ignore_eos: req.ignore_eos,
        do_remote_prefill: req.do_remote_prefill,
        do_remote_decode: req.do_remote_decode,
    })
}

struct FinishArgs {
    display_model: String,
    lora_name: Option<String>,
    requested_model: String,
    max_tokens: Option<usize>,
    ignore_eos: bool,
    do_remote_prefill: bool,
    do_remote_decode: bool,
}

fn finish_request(
    sim: &Simulator,
    stream: bool,
    stream_options: Option<&StreamOptions>,
    payload: RequestPayload,
    args: FinishArgs,
) -> Result<SimRequest, Response> {
    if args.do_remote_decode && stream {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "do_remote_decode is not supported with streaming".into(),
            None,
        ));
    }
    if args.ignore_eos && args.max_tokens.is_none() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "ignore_eos requires max_completion_tokens or max_tokens to be set".into(),
            None,
        ));
    }
    let mut request = SimRequest {
        id: sim.rng().uuid(),
        requested_model: args.requested_model,
        display_model: args.display_model,
        lora_name: args.lora_name,
        stream,
        include_usage: stream_options.map(|o| o.include_usage).unwrap_or(false),
        ignore_eos: args.ignore_eos,
        do_remote_prefill: args.do_remote_prefill,
        do_remote_decode: args.do_remote_decode,
        cached_prompt_tokens: 0,
        max_tokens: args.max_tokens,
        payload,
        prompt_token_count: 0,
    };
    request.prompt_token_count = tokenizer::count(&request.prompt_text());
    let completion_budget = request.max_tokens.unwrap_or(0);
    let total = request.prompt_token_count + completion_budget;
    let max_model_len = sim.config().max_model_len;
    if total > max_model_len {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            format!(
                "This model's maximum context length is {max_model_len} tokens. However, you requested {total} tokens ({} in the messages, {completion_budget} in the completion). Please reduce the length of the messages or completion.",
                request.prompt_token_count
            ),
            Some("messages".into()),
        ));
    }
    Ok(request)
}

fn resolve_model(sim: &Simulator, model: &str) -> Result<(String, Option<String>), Response> {
    sim.resolve_model(model).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "not_found_error",
            format!("The model `{model}` does not exist."),
            Some("model".into()),
        )
    })
}

fn resolve_max_tokens(
    max_tokens: Option<i64>,
    max_completion_tokens: Option<i64>,
) -> Result<Option<usize>, Response> {
    for (name, value) in [
        ("max_completion_tokens", max_completion_tokens),
        ("max_tokens", max_tokens),
    ] {
        if let Some(v) = value {
            if v <= 0 {
                return Err(api_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request_error",
                    format!("{name} must be at least 1, got {v}"),
                    Some(name.into()),
                ));
            }
        }
    }
    // max_completion_tokens takes precedence over the deprecated max_tokens.
    Ok(max_completion_tokens.or(max_tokens).map(|v| v as usize))
}

fn parse_tool_choice(choice: Option<&str>, has_tools: bool) -> Result<ToolChoice, Response> {
    match choice {
        None => Ok(if has_tools {
            ToolChoice::Auto
        } else {
            ToolChoice::None
        }),
        Some("none") => Ok(ToolChoice::None),
        Some("auto") => Ok(ToolChoice::Auto),
        Some("required") => Ok(ToolChoice::Required),
        Some(other) => Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            format!("unsupported tool_choice \"{other}\""),
            Some("tool_choice".into()),
        )),
    }
}

fn chat_response(meta: StreamMeta, output: CompletionOutput) -> ChatCompletionResponse {
    let tool_calls = if output.tool_calls.is_empty() {
        None
    } else {
        Some(
            output
                .tool_calls
                .iter()
                .enumerate()
                .map(|(index, c)| ToolCallOut {
                    id: c.id.clone(),
                    kind: "function",
                    index,
                    function: ToolCallFunction {
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    },
                })
                .collect(),
        )
    };
    let content = if tool_calls.is_some() {
        None
    } else {
        Some(output.text)
    };
    let remote = output.remote;
    ChatCompletionResponse {
        id: meta.id,
        object: "chat.completion",
        created: meta.created,
        model: meta.model,
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant",
                content,
                tool_calls,
            },
            finish_reason: output.finish_reason.as_str(),
        }],
        usage: output.usage,
        remote_block_ids: remote.as_ref().map(|r| r.block_ids.clone()),
        remote_engine_id: remote.as_ref().map(|r| r.engine_id.clone()),
        remote_host: remote.as_ref().map(|r| r.host.clone()),
        remote_port: remote.as_ref().map(|r| r.port),
    }
}

fn text_response(meta: StreamMeta, output: CompletionOutput) -> TextCompletionResponse {
    let remote = output.remote;
    TextCompletionResponse {
        id: meta.id,
        object: "text_completion",
        created: meta.created,
        model: meta.model,
        choices: vec![TextChoice {
            index: 0,
            text: output.text,
            finish_reason: output.finish_reason.as_str(),
        }],
        usage: output.usage,
        remote_block_ids: remote.as_ref().map(|r| r.block_ids.clone()),
        remote_engine_id: remote.as_ref().map(|r| r.engine_id.clone()),
        remote_host: remote.as_ref().map(|r| r.host.clone()),
        remote_port: remote.as_ref().map(|r| r.port),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn injected_response(f: failure::InjectedFailure) -> Response {
    let status = StatusCode::from_u16(f.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    api_error(status, &f.error_type, f.message, f.param)
}

fn api_error(status: StatusCode, kind: &str, message: String, param: Option<String>) -> Response {
    (status, Json(ErrorResponse::new(kind, message, param))).into_response()
}

/// Maps errors raised inside the worker onto client responses. LoRA and
/// metrics problems never reach here; dataset failures degrade earlier.
fn sim_error_response(e: SimError) -> Response {
    match e {
        SimError::Validation { message, param } => api_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            message,
            param,
        ),
        SimError::UnknownModel(model) => api_error(
            StatusCode::NOT_FOUND,
            "not_found_error",
            format!("The model `{model}` does not exist."),
            Some("model".into()),
        ),
        SimError::ToolSynthesis(msg) => api_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            format!("failed to generate response: {msg}"),
            None,
        ),
        other => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            format!("failed to generate response: {other}"),
            None,
        ),
    }
}
