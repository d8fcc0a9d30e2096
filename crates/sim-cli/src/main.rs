//! `llm-sim`: an OpenAI-compatible inference-server simulator.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sim_common::config::{Config, FailureKind, FakeMetrics, LoraModule, Mode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug, Default)]
#[command(name = "llm-sim", version, about = "OpenAI-compatible LLM inference server simulator")]
struct Cli {
    /// YAML configuration file, loaded before any flag is applied.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Base model name (required unless the config file provides it).
    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Public model aliases; the first one is surfaced in responses.
    #[arg(long = "served-model-name", num_args = 1..)]
    served_model_name: Option<Vec<String>>,

    /// Maximum concurrent sequences (worker pool size).
    #[arg(long = "max-num-seqs")]
    max_num_seqs: Option<usize>,

    #[arg(long = "max-loras")]
    max_loras: Option<usize>,

    #[arg(long = "max-cpu-loras")]
    max_cpu_loras: Option<usize>,

    #[arg(long = "max-model-len")]
    max_model_len: Option<usize>,

    /// Response mode: echo or random.
    #[arg(long)]
    mode: Option<Mode>,

    #[arg(long)]
    seed: Option<u64>,

    /// LoRA adapters as JSON blobs: '{"name":"...","path":"..."}'.
    #[arg(long = "lora-modules", num_args = 1..)]
    lora_modules: Option<Vec<String>>,

    #[arg(long = "time-to-first-token")]
    time_to_first_token: Option<u64>,
    #[arg(long = "time-to-first-token-std-dev")]
    time_to_first_token_std_dev: Option<u64>,
    #[arg(long = "inter-token-latency")]
    inter_token_latency: Option<u64>,
    #[arg(long = "inter-token-latency-std-dev")]
    inter_token_latency_std_dev: Option<u64>,
    #[arg(long = "kv-cache-transfer-latency")]
    kv_cache_transfer_latency: Option<u64>,
    #[arg(long = "kv-cache-transfer-latency-std-dev")]
    kv_cache_transfer_latency_std_dev: Option<u64>,
    #[arg(long = "kv-cache-transfer-time-per-token")]
    kv_cache_transfer_time_per_token: Option<u64>,
    #[arg(long = "kv-cache-transfer-time-std-dev")]
    kv_cache_transfer_time_std_dev: Option<u64>,
    #[arg(long = "prefill-overhead")]
    prefill_overhead: Option<u64>,
    #[arg(long = "prefill-time-per-token")]
    prefill_time_per_token: Option<u64>,
    #[arg(long = "prefill-time-std-dev")]
    prefill_time_std_dev: Option<u64>,
    #[arg(long = "time-factor-under-load")]
    time_factor_under_load: Option<f64>,

    #[arg(long = "min-tool-call-integer-param")]
    min_tool_call_integer_param: Option<i64>,
    #[arg(long = "max-tool-call-integer-param")]
    max_tool_call_integer_param: Option<i64>,
    #[arg(long = "min-tool-call-number-param")]
    min_tool_call_number_param: Option<f64>,
    #[arg(long = "max-tool-call-number-param")]
    max_tool_call_number_param: Option<f64>,
    #[arg(long = "min-tool-call-array-param-length")]
    min_tool_call_array_param_length: Option<usize>,
    #[arg(long = "max-tool-call-array-param-length")]
    max_tool_call_array_param_length: Option<usize>,
    #[arg(long = "tool-call-not-required-param-probability")]
    tool_call_not_required_param_probability: Option<u32>,
    #[arg(long = "object-tool-call-not-required-field-probability")]
    object_tool_call_not_required_field_probability: Option<u32>,

    #[arg(long = "failure-injection-rate")]
    failure_injection_rate: Option<u32>,

    /// Allowed failure kinds, e.g. rate_limit server_error.
    #[arg(long = "failure-types", num_args = 1..)]
    failure_types: Option<Vec<FailureKind>>,

    #[arg(long = "dataset-path")]
    dataset_path: Option<PathBuf>,
    #[arg(long = "dataset-url")]
    dataset_url: Option<String>,
    #[arg(long = "dataset-in-memory")]
    dataset_in_memory: bool,

    #[arg(long = "enable-kvcache")]
    enable_kvcache: bool,
    #[arg(long = "kv-cache-size")]
    kv_cache_size: Option<usize>,
    #[arg(long = "block-size")]
    block_size: Option<usize>,

    #[arg(long = "tokenizers-cache-dir")]
    tokenizers_cache_dir: Option<PathBuf>,
    #[arg(long = "hash-seed")]
    hash_seed: Option<String>,

    #[arg(long = "zmq-endpoint")]
    zmq_endpoint: Option<String>,
    #[arg(long = "zmq-max-connect-attempts")]
    zmq_max_connect_attempts: Option<u32>,
    #[arg(long = "event-batch-size")]
    event_batch_size: Option<usize>,

    /// Constant gauge values as JSON, disabling the live updaters.
    #[arg(long = "fake-metrics")]
    fake_metrics: Option<String>,

    #[arg(long = "data-parallel-size")]
    data_parallel_size: Option<u8>,

    #[arg(long = "ssl-certfile")]
    ssl_certfile: Option<PathBuf>,
    #[arg(long = "ssl-keyfile")]
    ssl_keyfile: Option<PathBuf>,
    #[arg(long = "self-signed-certs")]
    self_signed_certs: bool,
}

impl Cli {
    /// Folds the flags into `cfg`; a flag that was given wins over the
    /// config file.
    fn apply(self, cfg: &mut Config) -> anyhow::Result<()> {
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field { cfg.$field = v; })*
            };
        }
        macro_rules! set_opt {
            ($($field:ident),* $(,)?) => {
                $(if self.$field.is_some() { cfg.$field = self.$field; })*
            };
        }
        if let Some(model) = self.model {
            cfg.model = model;
        }
        set!(
            port,
            max_num_seqs,
            max_loras,
            max_cpu_loras,
            max_model_len,
            mode,
            time_to_first_token,
            time_to_first_token_std_dev,
            inter_token_latency,
            inter_token_latency_std_dev,
            kv_cache_transfer_latency,
            kv_cache_transfer_latency_std_dev,
            kv_cache_transfer_time_per_token,
            kv_cache_transfer_time_std_dev,
            prefill_overhead,
            prefill_time_per_token,
            prefill_time_std_dev,
            time_factor_under_load,
            min_tool_call_integer_param,
            max_tool_call_integer_param,
            min_tool_call_number_param,
            max_tool_call_number_param,
            min_tool_call_array_param_length,
            max_tool_call_array_param_length,
            tool_call_not_required_param_probability,
            object_tool_call_not_required_field_probability,
            failure_injection_rate,
            kv_cache_size,
            block_size,
            zmq_max_connect_attempts,
            event_batch_size,
            data_parallel_size,
        );
        set_opt!(
            seed,
            dataset_path,
            dataset_url,
            tokenizers_cache_dir,
            hash_seed,
            zmq_endpoint,
            ssl_certfile,
            ssl_keyfile,
        );
        if let Some(aliases) = self.served_model_name {
            cfg.served_model_name = aliases;
        }
        if let Some(types) = self.failure_types {
            cfg.failure_types = types;
        }
        if let Some(blobs) = self.lora_modules {
            let mut modules = Vec::with_capacity(blobs.len());
            for blob in &blobs {
                let module: LoraModule = serde_json::from_str(blob)
                    .with_context(|| format!("invalid --lora-modules entry: {blob}"))?;
                modules.push(module);
            }
            cfg.lora_modules = modules;
        }
        if let Some(raw) = self.fake_metrics {
            let fm: FakeMetrics =
                serde_json::from_str(&raw).context("invalid --fake-metrics JSON")?;
            cfg.fake_metrics = Some(fm);
        }
        if self.dataset_in_memory {
            cfg.dataset_in_memory = true;
        }
        if self.enable_kvcache {
            cfg.enable_kvcache = true;
        }
        if self.self_signed_certs {
            cfg.self_signed_certs = true;
        }
        Ok(())
    }
}

fn build_config(cli: Cli) -> anyhow::Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => Config::from_yaml_file(path)?,
        None => Config::default(),
    };
    cli.apply(&mut cfg)?;
    if cfg.hash_seed.as_deref().map_or(true, str::is_empty) {
        cfg.hash_seed = std::env::var("PYTHONHASHSEED").ok().filter(|s| !s.is_empty());
    }
    cfg.pod_name = std::env::var("POD_NAME").ok().filter(|s| !s.is_empty());
    cfg.pod_namespace = std::env::var("POD_NAMESPACE").ok().filter(|s| !s.is_empty());
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = build_config(cli)?;
    if cfg.ssl_certfile.is_some() || cfg.self_signed_certs {
        tracing::info!("tls termination is delegated to the fronting proxy");
    }
    if cfg.enable_kvcache {
        tracing::info!(
            block_size = cfg.block_size,
            kv_cache_size = cfg.kv_cache_size,
            "kv-cache hook enabled, block accounting is provided externally"
        );
    }

    let (shutdown_tx, _) = tokio::sync::watch::channel(());
    let mut servers = Vec::new();
    // Each data-parallel rank is an independent replica on base port + rank.
    for rank in 0..cfg.data_parallel_size {
        let mut replica_cfg = cfg.clone();
        replica_cfg.port = cfg.port + rank as u16;
        let port = replica_cfg.port;
        let sim = sim_core::Simulator::start(replica_cfg).await?;
        let app = sim_api::app(Arc::clone(&sim));
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind port {port}"))?;
        tracing::info!(rank, port, model = %sim.config().model, "listening");
        let mut shutdown_rx = shutdown_tx.subscribe();
        servers.push(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        }));
    }

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown signal received");
    drop(shutdown_tx);
    for server in servers {
        server.await.context("server task panicked")??;
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
