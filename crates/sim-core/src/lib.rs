//! Request-processing core of the inference-server simulator: admission
//! queue, worker pool, pacing, dataset lookup, tool-call synthesis, LoRA
//! accounting, and channel-serialized metrics.

pub mod dataset;
mod engine;
pub mod failure;
pub mod kvcache;
pub mod latency;
pub mod lora;
pub mod metrics;
mod queue;
pub mod random;
pub mod request;
pub mod tokenizer;
pub mod toolcalls;

use std::sync::Arc;

use sim_common::config::{Config, ADMISSION_QUEUE_CAPACITY};
use sim_common::Result;
use tokio::sync::mpsc;

use dataset::DatasetProvider;
use kvcache::{KvCacheHook, NoopKvCache};
use latency::LatencyModel;
use lora::LoraRegistry;
use metrics::{LoraState, Metrics};
use random::Rng;
use request::QueuedRequest;

/// Everything a worker needs to process one request.
pub(crate) struct EngineCtx {
    pub cfg: Arc<Config>,
    pub rng: Rng,
    pub metrics: Arc<Metrics>,
    pub dataset: DatasetProvider,
    pub latency: LatencyModel,
    pub kv_hook: Arc<dyn KvCacheHook>,
}

/// One simulator replica: configuration, services, and the admission queue.
pub struct Simulator {
    ctx: Arc<EngineCtx>,
    lora: LoraRegistry,
    queue_tx: mpsc::Sender<QueuedRequest>,
}

impl Simulator {
    pub async fn start(cfg: Config) -> Result<Arc<Self>> {
        Self::start_with_hook(cfg, Arc::new(NoopKvCache)).await
    }

    pub async fn start_with_hook(cfg: Config, kv_hook: Arc<dyn KvCacheHook>) -> Result<Arc<Self>> {
        cfg.validate()?;
        let seed = cfg.seed.unwrap_or_else(Rng::nanos_seed);
        tracing::debug!(seed, "seeding simulator prng");
        let rng = Rng::seeded(seed);
        let cfg = Arc::new(cfg);
        let metrics = Metrics::start(&cfg)?;
        let lora = LoraRegistry::new(&cfg.lora_modules);
        let dataset = DatasetProvider::init(&cfg, rng.clone()).await?;
        let latency = LatencyModel::new(Arc::clone(&cfg), rng.clone());

        let (queue_tx, queue_rx) = mpsc::channel(ADMISSION_QUEUE_CAPACITY);
        let ctx = Arc::new(EngineCtx {
            cfg,
            rng,
            metrics,
            dataset,
            latency,
            kv_hook,
        });
        queue::spawn_workers(Arc::clone(&ctx), queue_rx);

        Ok(Arc::new(Self {
            ctx,
            lora,
            queue_tx,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.ctx.cfg
    }

    pub fn rng(&self) -> &Rng {
        &self.ctx.rng
    }

    pub fn metrics(&self) -> &Metrics {
        &self.ctx.metrics
    }

    pub fn lora(&self) -> &LoraRegistry {
        &self.lora
    }

    /// Resolves a requested model name to the name surfaced in responses
    /// and, when it names an adapter, the LoRA name. `None` means the model
    /// is unknown.
    pub fn resolve_model(&self, name: &str) -> Option<(String, Option<String>)> {
        if self.ctx.cfg.is_served_alias(name) {
            return Some((self.ctx.cfg.public_model_name().to_string(), None));
        }
        if self.lora.contains(name) {
            return Some((name.to_string(), Some(name.to_string())));
        }
        None
    }

    /// Pushes a request into the admission queue, blocking when the queue
    /// holds 1000 items. Gauge updates happen before the push so waiting
    /// counts include queued-but-unclaimed requests.
    pub async fn enqueue(&self, item: QueuedRequest) {
        self.ctx.metrics.record_waiting(1).await;
        if let Some(name) = &item.request.lora_name {
            self.ctx.metrics.record_lora(name, LoraState::Waiting).await;
        }
        if self.queue_tx.send(item).await.is_err() {
            tracing::error!("admission queue closed while enqueueing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{
        ChatMessage, FinishReason, RequestPayload, Responder, Role, SimRequest, StreamEvent,
    };
    use crate::toolcalls::ToolChoice;
    use sim_common::config::Mode;

    fn test_config() -> Config {
        Config {
            model: "my_model".into(),
            mode: Mode::Echo,
            seed: Some(100),
            ..Config::default()
        }
    }

    fn text_request(sim: &Simulator, prompt: &str, max_tokens: Option<usize>) -> SimRequest {
        SimRequest {
            id: sim.rng().uuid(),
            requested_model: "my_model".into(),
            display_model: "my_model".into(),
            lora_name: None,
            stream: false,
            include_usage: false,
            ignore_eos: false,
            do_remote_prefill: false,
            do_remote_decode: false,
            cached_prompt_tokens: 0,
            max_tokens,
            payload: RequestPayload::Text {
                prompt: prompt.into(),
            },
            prompt_token_count: tokenizer::count(prompt),
        }
    }

    #[tokio::test]
    async fn echo_round_trip_through_queue() {
        let sim = Simulator::start(test_config()).await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let request = text_request(&sim, "This is a test.", None);
        sim.enqueue(QueuedRequest {
            request,
            responder: Responder::Full(tx),
        })
        .await;
        let output = rx.await.unwrap().unwrap();
        assert_eq!(output.text, "This is a test.");
        assert_eq!(output.finish_reason, FinishReason::Stop);
        assert_eq!(output.usage.prompt_tokens, 4);
        assert_eq!(output.usage.completion_tokens, 4);
        assert_eq!(output.usage.total_tokens, 8);
    }

    #[tokio::test]
    async fn streaming_emits_tokens_then_finish() {
        let sim = Simulator::start(test_config()).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let mut request = text_request(&sim, "one two three", None);
        request.stream = true;
        sim.enqueue(QueuedRequest {
            request,
            responder: Responder::Stream(tx),
        })
        .await;
        let mut tokens = String::new();
        let mut finished = false;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Token(t) => tokens.push_str(&t),
                StreamEvent::Finish { reason, usage, .. } => {
                    assert_eq!(reason, FinishReason::Stop);
                    assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
                    finished = true;
                }
                StreamEvent::Role => panic!("text stream must not carry a role chunk"),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(finished);
        assert_eq!(tokens, "one two three");
    }

    #[tokio::test]
    async fn chat_stream_starts_with_role() {
        let sim = Simulator::start(test_config()).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let mut request = text_request(&sim, "", None);
        request.stream = true;
        request.payload = RequestPayload::Chat {
            messages: vec![ChatMessage {
                role: Role::User,
                content: "hello there".into(),
            }],
            tools: Vec::new(),
            tool_choice: ToolChoice::None,
        };
        request.prompt_token_count = 2;
        sim.enqueue(QueuedRequest {
            request,
            responder: Responder::Stream(tx),
        })
        .await;
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, StreamEvent::Role));
    }

    #[tokio::test]
    async fn remote_decode_rewrites_finish_reason() {
        let sim = Simulator::start(test_config()).await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut request = text_request(&sim, "prefill me", None);
        request.do_remote_decode = true;
        sim.enqueue(QueuedRequest {
            request,
            responder: Responder::Full(tx),
        })
        .await;
        let output = rx.await.unwrap().unwrap();
        assert_eq!(output.finish_reason, FinishReason::RemoteDecode);
        let remote = output.remote.unwrap();
        assert_eq!(remote.engine_id, "remote-engine");
        assert_eq!(remote.port, 1234);
    }

    #[tokio::test]
    async fn ignore_eos_emits_exactly_max_completion_tokens() {
        let mut cfg = test_config();
        cfg.mode = Mode::Random;
        let sim = Simulator::start(cfg).await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut request = text_request(&sim, "hi", Some(12));
        request.ignore_eos = true;
        sim.enqueue(QueuedRequest {
            request,
            responder: Responder::Full(tx),
        })
        .await;
        let output = rx.await.unwrap().unwrap();
        assert_eq!(output.usage.completion_tokens, 12);
        assert_eq!(output.finish_reason, FinishReason::Length);
        assert_eq!(tokenizer::count(&output.text), 12);
    }

    #[tokio::test]
    async fn resolve_model_knows_aliases_and_adapters() {
        let mut cfg = test_config();
        cfg.served_model_name = vec!["alias-one".into(), "alias-two".into()];
        cfg.lora_modules = vec![sim_common::config::LoraModule {
            name: "lora1".into(),
            path: "/adapters/lora1".into(),
            base_model_name: None,
        }];
        let sim = Simulator::start(cfg).await.unwrap();
        assert_eq!(
            sim.resolve_model("alias-two"),
            Some(("alias-one".to_string(), None))
        );
        assert_eq!(
            sim.resolve_model("lora1"),
            Some(("lora1".to_string(), Some("lora1".to_string())))
        );
        assert_eq!(sim.resolve_model("ghost"), None);
    }

    #[tokio::test]
    async fn same_seed_fresh_simulators_agree() {
        let mut texts = Vec::new();
        for _ in 0..3 {
            let mut cfg = test_config();
            cfg.mode = Mode::Random;
            let sim = Simulator::start(cfg).await.unwrap();
            let (tx, rx) = tokio::sync::oneshot::channel();
            let request = text_request(&sim, "Write me a poem", Some(10));
            sim.enqueue(QueuedRequest {
                request,
                responder: Responder::Full(tx),
            })
            .await;
            texts.push(rx.await.unwrap().unwrap().text);
        }
        assert_eq!(texts[0], texts[1]);
        assert_eq!(texts[1], texts[2]);
    }
}
