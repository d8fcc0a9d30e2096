//! Simulator configuration: YAML file first, CLI flags override field-by-field.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Result, SimError};

pub const ADMISSION_QUEUE_CAPACITY: usize = 1000;
pub const VALID_BLOCK_SIZES: [usize; 5] = [8, 16, 32, 64, 128];
pub const MAX_ZMQ_CONNECT_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Echo,
    Random,
}

impl std::str::FromStr for Mode {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "echo" => Ok(Mode::Echo),
            "random" => Ok(Mode::Random),
            other => Err(SimError::Config(format!(
                "invalid mode \"{other}\", expected \"echo\" or \"random\""
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimit,
    InvalidApiKey,
    ContextLength,
    ServerError,
    InvalidRequest,
    ModelNotFound,
}

impl FailureKind {
    pub const ALL: [FailureKind; 6] = [
        FailureKind::RateLimit,
        FailureKind::InvalidApiKey,
        FailureKind::ContextLength,
        FailureKind::ServerError,
        FailureKind::InvalidRequest,
        FailureKind::ModelNotFound,
    ];
}

impl std::str::FromStr for FailureKind {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rate_limit" => Ok(FailureKind::RateLimit),
            "invalid_api_key" => Ok(FailureKind::InvalidApiKey),
            "context_length" => Ok(FailureKind::ContextLength),
            "server_error" => Ok(FailureKind::ServerError),
            "invalid_request" => Ok(FailureKind::InvalidRequest),
            "model_not_found" => Ok(FailureKind::ModelNotFound),
            other => Err(SimError::Config(format!("unknown failure type \"{other}\""))),
        }
    }
}

/// A LoRA adapter announced at startup via `--lora-modules`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraModule {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model_name: Option<String>,
}

/// Constant gauge values that replace the live metric updaters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FakeMetrics {
    #[serde(default)]
    pub running_requests: i64,
    #[serde(default)]
    pub waiting_requests: i64,
    #[serde(default)]
    pub kv_cache_usage: f64,
    #[serde(default)]
    pub loras: Vec<FakeLoraMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FakeLoraMetrics {
    #[serde(default)]
    pub running: String,
    #[serde(default)]
    pub waiting: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub port: u16,
    /// Base model name; required.
    pub model: String,
    /// Public aliases. The first one is the name surfaced in responses.
    pub served_model_name: Vec<String>,
    /// Maximum concurrent sequences; also the worker pool size.
    pub max_num_seqs: usize,
    pub max_loras: usize,
    pub max_cpu_loras: usize,
    pub max_model_len: usize,
    pub mode: Mode,
    /// PRNG seed; current nanos when unset.
    pub seed: Option<u64>,
    pub lora_modules: Vec<LoraModule>,

    // Latency parameters, all in milliseconds.
    pub time_to_first_token: u64,
    pub time_to_first_token_std_dev: u64,
    pub inter_token_latency: u64,
    pub inter_token_latency_std_dev: u64,
    pub kv_cache_transfer_latency: u64,
    pub kv_cache_transfer_latency_std_dev: u64,
    pub kv_cache_transfer_time_per_token: u64,
    pub kv_cache_transfer_time_std_dev: u64,
    pub prefill_overhead: u64,
    pub prefill_time_per_token: u64,
    pub prefill_time_std_dev: u64,
    /// Latency multiplier at full saturation; >= 1.0.
    pub time_factor_under_load: f64,

    // Tool-synthesis bounds.
    pub min_tool_call_integer_param: i64,
    pub max_tool_call_integer_param: i64,
    pub min_tool_call_number_param: f64,
    pub max_tool_call_number_param: f64,
    pub min_tool_call_array_param_length: usize,
    pub max_tool_call_array_param_length: usize,
    /// Percent chance of including a non-required top-level parameter.
    pub tool_call_not_required_param_probability: u32,
    /// Percent chance of including a non-required object field.
    pub object_tool_call_not_required_field_probability: u32,

    pub failure_injection_rate: u32,
    pub failure_types: Vec<FailureKind>,

    pub dataset_path: Option<PathBuf>,
    pub dataset_url: Option<String>,
    pub dataset_in_memory: bool,

    pub enable_kvcache: bool,
    pub kv_cache_size: usize,
    pub block_size: usize,

    pub tokenizers_cache_dir: Option<PathBuf>,
    pub hash_seed: Option<String>,

    pub zmq_endpoint: Option<String>,
    pub zmq_max_connect_attempts: u32,
    pub event_batch_size: usize,

    pub fake_metrics: Option<FakeMetrics>,

    pub data_parallel_size: u8,

    pub ssl_certfile: Option<PathBuf>,
    pub ssl_keyfile: Option<PathBuf>,
    pub self_signed_certs: bool,

    /// Shape the x-inference-pod / x-inference-namespace response headers.
    #[serde(skip)]
    pub pod_name: Option<String>,
    #[serde(skip)]
    pub pod_namespace: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            model: String::new(),
            served_model_name: Vec::new(),
            max_num_seqs: 5,
            max_loras: 1,
            max_cpu_loras: 1,
            max_model_len: 1024,
            mode: Mode::Random,
            seed: None,
            lora_modules: Vec::new(),
            time_to_first_token: 0,
            time_to_first_token_std_dev: 0,
            inter_token_latency: 0,
            inter_token_latency_std_dev: 0,
            kv_cache_transfer_latency: 0,
            kv_cache_transfer_latency_std_dev: 0,
            kv_cache_transfer_time_per_token: 0,
            kv_cache_transfer_time_std_dev: 0,
            prefill_overhead: 0,
            prefill_time_per_token: 0,
            prefill_time_std_dev: 0,
            time_factor_under_load: 1.0,
            min_tool_call_integer_param: 0,
            max_tool_call_integer_param: 100,
            min_tool_call_number_param: 0.0,
            max_tool_call_number_param: 100.0,
            min_tool_call_array_param_length: 1,
            max_tool_call_array_param_length: 5,
            tool_call_not_required_param_probability: 50,
            object_tool_call_not_required_field_probability: 50,
            failure_injection_rate: 0,
            failure_types: Vec::new(),
            dataset_path: None,
            dataset_url: None,
            dataset_in_memory: false,
            enable_kvcache: false,
            kv_cache_size: 1024,
            block_size: 16,
            tokenizers_cache_dir: None,
            hash_seed: None,
            zmq_endpoint: None,
            zmq_max_connect_attempts: 0,
            event_batch_size: 16,
            fake_metrics: None,
            data_parallel_size: 1,
            ssl_certfile: None,
            ssl_keyfile: None,
            self_signed_certs: false,
            pod_name: None,
            pod_namespace: None,
        }
    }
}

impl Config {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| SimError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// The model name surfaced in API responses for the base model.
    pub fn public_model_name(&self) -> &str {
        self.served_model_name
            .first()
            .map(String::as_str)
            .unwrap_or(&self.model)
    }

    /// All names the base model answers to.
    pub fn served_aliases(&self) -> Vec<String> {
        if self.served_model_name.is_empty() {
            vec![self.model.clone()]
        } else {
            self.served_model_name.clone()
        }
    }

    pub fn is_served_alias(&self, name: &str) -> bool {
        name == self.model || self.served_aliases().iter().any(|a| a == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.is_empty() {
            return Err(SimError::Config("model is required".into()));
        }
        if self.max_num_seqs == 0 {
            return Err(SimError::Config("max-num-seqs must be at least 1".into()));
        }
        if self.max_model_len == 0 {
            return Err(SimError::Config("max-model-len must be at least 1".into()));
        }
        if self.max_loras == 0 {
            return Err(SimError::Config("max-loras must be at least 1".into()));
        }
        if self.max_cpu_loras < self.max_loras {
            return Err(SimError::Config(
                "max-cpu-loras cannot be less than max-loras".into(),
            ));
        }
        for lora in &self.lora_modules {
            if lora.name.is_empty() {
                return Err(SimError::Config("lora module name cannot be empty".into()));
            }
            if let Some(base) = &lora.base_model_name {
                if base != &self.model {
                    return Err(SimError::Config(format!(
                        "lora module \"{}\" declares base model \"{}\" but the served base model is \"{}\"",
                        lora.name, base, self.model
                    )));
                }
            }
        }
        if self.time_factor_under_load < 1.0 {
            return Err(SimError::Config(
                "time-factor-under-load must be at least 1.0".into(),
            ));
        }
        self.validate_std_dev(
            "time-to-first-token",
            self.time_to_first_token,
            self.time_to_first_token_std_dev,
        )?;
        self.validate_std_dev(
            "inter-token-latency",
            self.inter_token_latency,
            self.inter_token_latency_std_dev,
        )?;
        self.validate_std_dev(
            "kv-cache-transfer-latency",
            self.kv_cache_transfer_latency,
            self.kv_cache_transfer_latency_std_dev,
        )?;
        self.validate_std_dev(
            "kv-cache-transfer-time-per-token",
            self.kv_cache_transfer_time_per_token,
            self.kv_cache_transfer_time_std_dev,
        )?;
        self.validate_std_dev(
            "prefill-time-per-token",
            self.prefill_time_per_token,
            self.prefill_time_std_dev,
        )?;
        if self.min_tool_call_integer_param > self.max_tool_call_integer_param {
            return Err(SimError::Config(
                "min-tool-call-integer-param cannot exceed max-tool-call-integer-param".into(),
            ));
        }
        if self.min_tool_call_number_param > self.max_tool_call_number_param {
            return Err(SimError::Config(
                "min-tool-call-number-param cannot exceed max-tool-call-number-param".into(),
            ));
        }
        if self.min_tool_call_array_param_length > self.max_tool_call_array_param_length {
            return Err(SimError::Config(
                "min-tool-call-array-param-length cannot exceed max-tool-call-array-param-length"
                    .into(),
            ));
        }
        for (name, p) in [
            (
                "tool-call-not-required-param-probability",
                self.tool_call_not_required_param_probability,
            ),
            (
                "object-tool-call-not-required-field-probability",
                self.object_tool_call_not_required_field_probability,
            ),
        ] {
            if p > 100 {
                return Err(SimError::Config(format!("{name} must be between 0 and 100")));
            }
        }
        if self.failure_injection_rate > 100 {
            return Err(SimError::Config(
                "failure-injection-rate must be between 0 and 100".into(),
            ));
        }
        if !VALID_BLOCK_SIZES.contains(&self.block_size) {
            return Err(SimError::Config(format!(
                "block-size must be one of {VALID_BLOCK_SIZES:?}, got {}",
                self.block_size
            )));
        }
        if self.zmq_max_connect_attempts > MAX_ZMQ_CONNECT_ATTEMPTS {
            return Err(SimError::Config(format!(
                "zmq-max-connect-attempts cannot exceed {MAX_ZMQ_CONNECT_ATTEMPTS}"
            )));
        }
        if self.event_batch_size == 0 {
            return Err(SimError::Config("event-batch-size must be at least 1".into()));
        }
        if self.data_parallel_size == 0 || self.data_parallel_size > 8 {
            return Err(SimError::Config(
                "data-parallel-size must be between 1 and 8".into(),
            ));
        }
        if self.ssl_certfile.is_some() != self.ssl_keyfile.is_some() {
            return Err(SimError::Config(
                "ssl-certfile and ssl-keyfile must be provided together".into(),
            ));
        }
        if self.self_signed_certs && self.ssl_certfile.is_some() {
            return Err(SimError::Config(
                "self-signed-certs cannot be combined with ssl-certfile/ssl-keyfile".into(),
            ));
        }
        if self.dataset_url.is_some() && self.dataset_path.is_none() {
            return Err(SimError::Config(
                "dataset-url requires dataset-path as the download target".into(),
            ));
        }
        Ok(())
    }

    fn validate_std_dev(&self, name: &str, mean: u64, std_dev: u64) -> Result<()> {
        if std_dev as f64 > 0.3 * mean as f64 {
            return Err(SimError::Config(format!(
                "{name}-std-dev cannot exceed 30% of {name} ({std_dev} > 0.3 * {mean})"
            )));
        }
        Ok(())
    }
}
