//! Response assembly and pacing.
//!
//! Given an accepted request the worker either synthesizes tool calls or
//! pulls completion tokens from the dataset, then emits the result with
//! TTFT and inter-token delays applied. Streaming requests receive already
//! paced events; non-streaming requests sleep the whole budget once.

use std::time::Duration;

use sim_common::{Result, SimError};

use crate::request::{
    CompletionOutput, FinishReason, QueuedRequest, RemoteDecodeInfo, RequestPayload, Responder,
    SimRequest, StreamEvent, Usage,
};
use crate::toolcalls::{self, ToolCall, ToolChoice};
use crate::tokenizer;
use crate::EngineCtx;

/// Base token cost of a tool call on top of its arguments.
const TOOL_CALL_BASE_TOKENS: usize = 3;

struct Plan {
    tokens: Vec<String>,
    tool_calls: Vec<ToolCall>,
    finish: FinishReason,
    usage: Usage,
    remote: Option<RemoteDecodeInfo>,
}

pub(crate) async fn process(ctx: &EngineCtx, item: QueuedRequest) {
    let QueuedRequest {
        mut request,
        responder,
    } = item;

    match ctx
        .kv_hook
        .on_request_start(&request.id, &tokenizer::tokenize(&request.prompt_text()))
    {
        Ok(cached) => request.cached_prompt_tokens = cached,
        Err(e) => {
            tracing::error!(request_id = %request.id, error = %e, "kv-cache start hook failed");
            respond_error(responder, SimError::Internal(e.to_string())).await;
            return;
        }
    }

    let plan = match build_plan(ctx, &request) {
        Ok(plan) => plan,
        Err(e) => {
            tracing::debug!(request_id = %request.id, error = %e, "generation failed");
            respond_error(responder, e).await;
            finish_hook(ctx, &request);
            return;
        }
    };

    match responder {
        Responder::Full(tx) => {
            let output = emit_blocking(ctx, &request, plan).await;
            let _ = tx.send(Ok(output));
        }
        Responder::Stream(tx) => {
            emit_stream(ctx, &request, plan, tx).await;
        }
    }
    finish_hook(ctx, &request);
}

fn finish_hook(ctx: &EngineCtx, request: &SimRequest) {
    if let Err(e) = ctx.kv_hook.on_request_end(&request.id) {
        tracing::error!(request_id = %request.id, error = %e, "kv-cache end hook failed");
    }
}

async fn respond_error(responder: Responder, error: SimError) {
    match responder {
        Responder::Full(tx) => {
            let _ = tx.send(Err(error));
        }
        Responder::Stream(tx) => {
            let _ = tx.send(StreamEvent::Error(error)).await;
        }
    }
}

fn build_plan(ctx: &EngineCtx, request: &SimRequest) -> Result<Plan> {
    if let RequestPayload::Chat {
        tools, tool_choice, ..
    } = &request.payload
    {
        if !tools.is_empty() && *tool_choice != ToolChoice::None {
            let calls = toolcalls::generate(&ctx.cfg, &ctx.rng, tools, *tool_choice)?;
            if !calls.is_empty() {
                let completion: usize = calls
                    .iter()
                    .map(|c| TOOL_CALL_BASE_TOKENS + c.argument_tokens)
                    .sum();
                let usage = Usage::new(request.prompt_token_count, completion);
                return Ok(finalize(request, Vec::new(), calls, FinishReason::ToolCalls, usage));
            }
            // An "auto" choice may produce zero calls; fall through to text.
        }
    }
    let (tokens, finish) = ctx.dataset.get_tokens(request, &ctx.latency)?;
    let usage = Usage::new(request.prompt_token_count, tokens.len());
    Ok(finalize(request, tokens, Vec::new(), finish, usage))
}

fn finalize(
    request: &SimRequest,
    tokens: Vec<String>,
    tool_calls: Vec<ToolCall>,
    finish: FinishReason,
    usage: Usage,
) -> Plan {
    let (finish, remote) = if request.do_remote_decode {
        (FinishReason::RemoteDecode, Some(RemoteDecodeInfo::placeholder()))
    } else {
        (finish, None)
    };
    Plan {
        tokens,
        tool_calls,
        finish,
        usage,
        remote,
    }
}

/// Non-streaming: sleep TTFT plus one inter-token delay per additional
/// completion token, then hand back the whole response.
async fn emit_blocking(ctx: &EngineCtx, request: &SimRequest, plan: Plan) -> CompletionOutput {
    let running = ctx.metrics.running();
    let mut total = ctx.latency.ttft(
        running,
        request.prompt_token_count,
        request.cached_prompt_tokens,
        request.do_remote_prefill,
    );
    for _ in 1..plan.usage.completion_tokens.max(1) {
        total += ctx.latency.inter_token(running);
    }
    tokio::time::sleep(total).await;
    CompletionOutput {
        text: plan.tokens.concat(),
        tool_calls: plan.tool_calls,
        finish_reason: plan.finish,
        usage: plan.usage,
        remote: plan.remote,
    }
}

/// Streaming: TTFT before the first event, inter-token delay between
/// successive content emissions. Send failures mean the client went away;
/// the worker finishes silently.
async fn emit_stream(
    ctx: &EngineCtx,
    request: &SimRequest,
    plan: Plan,
    tx: tokio::sync::mpsc::Sender<StreamEvent>,
) {
    let running = ctx.metrics.running();
    let ttft = ctx.latency.ttft(
        running,
        request.prompt_token_count,
        request.cached_prompt_tokens,
        request.do_remote_prefill,
    );
    tokio::time::sleep(ttft).await;

    if request.is_chat() {
        if tx.send(StreamEvent::Role).await.is_err() {
            return;
        }
    }

    let mut pace = Pacer::first();
    if plan.tool_calls.is_empty() {
        for token in &plan.tokens {
            pace.wait(ctx, running).await;
            if tx.send(StreamEvent::Token(token.clone())).await.is_err() {
                return;
            }
        }
    } else {
        for (index, call) in plan.tool_calls.iter().enumerate() {
            pace.wait(ctx, running).await;
            let started = tx
                .send(StreamEvent::ToolCallStart {
                    index,
                    id: call.id.clone(),
                    name: call.name.clone(),
                })
                .await;
            if started.is_err() {
                return;
            }
            for delta in tokenizer::tokenize(&call.arguments) {
                pace.wait(ctx, running).await;
                if tx
                    .send(StreamEvent::ToolCallDelta { index, delta })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }

    let _ = tx
        .send(StreamEvent::Finish {
            reason: plan.finish,
            usage: plan.usage,
            remote: plan.remote,
        })
        .await;
}

/// Sleeps the inter-token delay between emissions, never before the first.
struct Pacer {
    first: bool,
}

impl Pacer {
    fn first() -> Self {
        Self { first: true }
    }

    async fn wait(&mut self, ctx: &EngineCtx, running: i64) {
        if self.first {
            self.first = false;
            return;
        }
        let delay = ctx.latency.inter_token(running);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
    }
}
