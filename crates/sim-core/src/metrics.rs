//! vLLM-compatible gauges, updated through single-consumer channels.
//!
//! Every mutation of the running/waiting counters, the per-adapter
//! reference counts, and the cache-usage value is a message on a bounded
//! channel drained by exactly one task. The maps behind the lora gauge are
//! therefore unsynchronized, and every state change is observable as a
//! distinct published snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use prometheus::{GaugeVec, IntGaugeVec, Opts, Registry};
use sim_common::config::Config;
use sim_common::Result;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraState {
    Waiting,
    Running,
    Done,
}

#[derive(Debug, Clone)]
pub struct LoraUpdate {
    pub name: String,
    pub state: LoraState,
}

pub struct Metrics {
    registry: Registry,
    running_gauge: IntGaugeVec,
    waiting_gauge: IntGaugeVec,
    kv_gauge: GaugeVec,
    model_name: String,
    fake: bool,
    running_tx: mpsc::Sender<i64>,
    waiting_tx: mpsc::Sender<i64>,
    lora_tx: mpsc::Sender<LoraUpdate>,
    kv_tx: mpsc::Sender<f64>,
}

impl Metrics {
    pub fn start(cfg: &Config) -> Result<Arc<Self>> {
        let registry = Registry::new();
        let model_name = cfg.public_model_name().to_string();
        let max_lora = cfg.max_loras.to_string();

        let running_gauge = IntGaugeVec::new(
            Opts::new(
                "vllm:num_requests_running",
                "Number of requests currently running on GPU.",
            ),
            &["model_name"],
        )
        .map_err(internal)?;
        let waiting_gauge = IntGaugeVec::new(
            Opts::new(
                "vllm:num_requests_waiting",
                "Number of requests waiting to be processed.",
            ),
            &["model_name"],
        )
        .map_err(internal)?;
        let kv_gauge = GaugeVec::new(
            Opts::new(
                "vllm:gpu_cache_usage_perc",
                "GPU KV-cache usage. 1 means 100 percent usage.",
            ),
            &["model_name"],
        )
        .map_err(internal)?;
        let lora_gauge = GaugeVec::new(
            Opts::new(
                "vllm:lora_requests_info",
                "Running stats on lora requests.",
            ),
            &["max_lora", "running_lora_adapters", "waiting_lora_adapters"],
        )
        .map_err(internal)?;

        registry
            .register(Box::new(running_gauge.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(waiting_gauge.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(kv_gauge.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(lora_gauge.clone()))
            .map_err(internal)?;

        let (running_tx, running_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (waiting_tx, waiting_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (lora_tx, lora_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (kv_tx, kv_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let fake = cfg.fake_metrics.is_some();
        if let Some(fm) = &cfg.fake_metrics {
            running_gauge
                .with_label_values(&[&model_name])
                .set(fm.running_requests);
            waiting_gauge
                .with_label_values(&[&model_name])
                .set(fm.waiting_requests);
            kv_gauge
                .with_label_values(&[&model_name])
                .set(fm.kv_cache_usage);
            for lora in &fm.loras {
                lora_gauge
                    .with_label_values(&[&max_lora, &lora.running, &lora.waiting])
                    .set(lora.timestamp as f64);
            }
        } else {
            running_gauge.with_label_values(&[&model_name]).set(0);
            waiting_gauge.with_label_values(&[&model_name]).set(0);
            kv_gauge.with_label_values(&[&model_name]).set(0.0);
            spawn_counter_updater(running_rx, running_gauge.clone(), model_name.clone());
            spawn_counter_updater(waiting_rx, waiting_gauge.clone(), model_name.clone());
            spawn_kv_updater(kv_rx, kv_gauge.clone(), model_name.clone());
            spawn_lora_updater(lora_rx, lora_gauge, max_lora);
        }

        Ok(Arc::new(Self {
            registry,
            running_gauge,
            waiting_gauge,
            kv_gauge,
            model_name,
            fake,
            running_tx,
            waiting_tx,
            lora_tx,
            kv_tx,
        }))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current running-request count, as published. Input to the load factor.
    pub fn running(&self) -> i64 {
        self.running_gauge.with_label_values(&[&self.model_name]).get()
    }

    pub fn waiting(&self) -> i64 {
        self.waiting_gauge.with_label_values(&[&self.model_name]).get()
    }

    pub fn kv_usage(&self) -> f64 {
        self.kv_gauge.with_label_values(&[&self.model_name]).get()
    }

    pub async fn record_running(&self, delta: i64) {
        if !self.fake {
            let _ = self.running_tx.send(delta).await;
        }
    }

    pub async fn record_waiting(&self, delta: i64) {
        if !self.fake {
            let _ = self.waiting_tx.send(delta).await;
        }
    }

    pub async fn record_lora(&self, name: &str, state: LoraState) {
        if !self.fake {
            let _ = self
                .lora_tx
                .send(LoraUpdate {
                    name: name.to_string(),
                    state,
                })
                .await;
        }
    }

    pub async fn record_kv_usage(&self, fraction: f64) {
        if !self.fake {
            let _ = self.kv_tx.send(fraction).await;
        }
    }
}

fn spawn_counter_updater(mut rx: mpsc::Receiver<i64>, gauge: IntGaugeVec, model: String) {
    tokio::spawn(async move {
        let mut value: i64 = 0;
        let gauge = gauge.with_label_values(&[&model]);
        while let Some(delta) = rx.recv().await {
            value += delta;
            gauge.set(value);
        }
    });
}

fn spawn_kv_updater(mut rx: mpsc::Receiver<f64>, gauge: GaugeVec, model: String) {
    tokio::spawn(async move {
        let gauge = gauge.with_label_values(&[&model]);
        while let Some(fraction) = rx.recv().await {
            gauge.set(fraction.clamp(0.0, 1.0));
        }
    });
}

fn spawn_lora_updater(mut rx: mpsc::Receiver<LoraUpdate>, gauge: GaugeVec, max_lora: String) {
    tokio::spawn(async move {
        let mut waiting: BTreeMap<String, u64> = BTreeMap::new();
        let mut running: BTreeMap<String, u64> = BTreeMap::new();
        while let Some(update) = rx.recv().await {
            match update.state {
                LoraState::Waiting => {
                    *waiting.entry(update.name).or_insert(0) += 1;
                }
                // A running transition is one snapshot: leave waiting,
                // enter running, publish once.
                LoraState::Running => {
                    decrement(&mut waiting, &update.name);
                    *running.entry(update.name).or_insert(0) += 1;
                }
                LoraState::Done => {
                    decrement(&mut running, &update.name);
                }
            }
            let ts = unix_seconds();
            gauge
                .with_label_values(&[&max_lora, &join_keys(&running), &join_keys(&waiting)])
                .set(ts);
        }
    });
}

fn decrement(map: &mut BTreeMap<String, u64>, name: &str) {
    if let Some(count) = map.get_mut(name) {
        *count -= 1;
        if *count == 0 {
            map.remove(name);
        }
    }
}

fn join_keys(map: &BTreeMap<String, u64>) -> String {
    map.keys().cloned().collect::<Vec<_>>().join(",")
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as f64)
        .unwrap_or(0.0)
}

fn internal(e: prometheus::Error) -> sim_common::SimError {
    sim_common::SimError::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::proto::MetricFamily;
    use sim_common::config::{FakeLoraMetrics, FakeMetrics};
    use std::time::Duration;

    fn family<'a>(families: &'a [MetricFamily], name: &str) -> &'a MetricFamily {
        families
            .iter()
            .find(|f| f.get_name() == name)
            .unwrap_or_else(|| panic!("missing family {name}"))
    }

    fn cfg() -> Config {
        Config {
            model: "my_model".into(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn counters_accumulate_deltas() {
        let metrics = Metrics::start(&cfg()).unwrap();
        metrics.record_waiting(1).await;
        metrics.record_waiting(1).await;
        metrics.record_waiting(-1).await;
        metrics.record_running(1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(metrics.waiting(), 1);
        assert_eq!(metrics.running(), 1);
    }

    #[tokio::test]
    async fn lora_waiting_to_running_is_one_snapshot() {
        let metrics = Metrics::start(&cfg()).unwrap();
        metrics.record_lora("lora1", LoraState::Waiting).await;
        metrics.record_lora("lora1", LoraState::Running).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let families = metrics.registry().gather();
        let lora = family(&families, "vllm:lora_requests_info");
        let labels: Vec<Vec<(String, String)>> = lora
            .get_metric()
            .iter()
            .map(|m| {
                m.get_label()
                    .iter()
                    .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
                    .collect()
            })
            .collect();
        // Two snapshots: waiting-only, then running-only.
        assert!(labels.iter().any(|ls| ls
            .iter()
            .any(|(k, v)| k == "waiting_lora_adapters" && v == "lora1")));
        assert!(labels.iter().any(|ls| ls
            .iter()
            .any(|(k, v)| k == "running_lora_adapters" && v == "lora1")));
    }

    #[tokio::test]
    async fn lora_key_removed_at_zero() {
        let metrics = Metrics::start(&cfg()).unwrap();
        metrics.record_lora("lora1", LoraState::Waiting).await;
        metrics.record_lora("lora1", LoraState::Running).await;
        metrics.record_lora("lora1", LoraState::Done).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let families = metrics.registry().gather();
        let lora = family(&families, "vllm:lora_requests_info");
        let last_empty = lora.get_metric().iter().any(|m| {
            m.get_label().iter().all(|l| {
                l.get_name() == "max_lora" || l.get_value().is_empty()
            })
        });
        assert!(last_empty, "expected a snapshot with empty adapter lists");
    }

    #[tokio::test]
    async fn fake_metrics_short_circuit_updaters() {
        let mut config = cfg();
        config.fake_metrics = Some(FakeMetrics {
            running_requests: 10,
            waiting_requests: 30,
            kv_cache_usage: 0.4,
            loras: vec![FakeLoraMetrics {
                running: "lora4,lora2".into(),
                waiting: "lora3".into(),
                timestamp: 1257894567,
            }],
        });
        let metrics = Metrics::start(&config).unwrap();
        metrics.record_running(5).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Still the configured constants.
        assert_eq!(metrics.running(), 10);
        assert_eq!(metrics.waiting(), 30);
        assert!((metrics.kv_usage() - 0.4).abs() < 1e-9);
        let families = metrics.registry().gather();
        let lora = family(&families, "vllm:lora_requests_info");
        assert_eq!(lora.get_metric()[0].get_gauge().get_value(), 1257894567.0);
    }
}
