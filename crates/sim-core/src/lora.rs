//! Registry of loadable LoRA adapters.
//!
//! Reads (request validation, model listing) and writes (load/unload) run
//! concurrently, so the map is a `DashMap`. Reference counting for
//! waiting/running requests lives in the metrics updater, not here: an
//! adapter can keep a non-zero count for a short while after `unload`.

use dashmap::DashMap;
use sim_common::config::LoraModule;

pub struct LoraRegistry {
    adapters: DashMap<String, LoraAdapter>,
    insertion_counter: std::sync::atomic::AtomicU64,
}

#[derive(Debug, Clone)]
pub struct LoraAdapter {
    pub name: String,
    pub path: String,
    order: u64,
}

impl LoraRegistry {
    pub fn new(modules: &[LoraModule]) -> Self {
        let registry = Self {
            adapters: DashMap::new(),
            insertion_counter: std::sync::atomic::AtomicU64::new(0),
        };
        for m in modules {
            registry.load(&m.name, &m.path);
        }
        registry
    }

    /// Idempotent upsert. Re-loading an adapter keeps its listing position.
    pub fn load(&self, name: &str, path: &str) {
        use std::sync::atomic::Ordering;
        self.adapters
            .entry(name.to_string())
            .and_modify(|a| a.path = path.to_string())
            .or_insert_with(|| LoraAdapter {
                name: name.to_string(),
                path: path.to_string(),
                order: self.insertion_counter.fetch_add(1, Ordering::Relaxed),
            });
    }

    /// Idempotent delete.
    pub fn unload(&self, name: &str) {
        self.adapters.remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Adapters in insertion order, for `/v1/models`.
    pub fn list(&self) -> Vec<LoraAdapter> {
        let mut out: Vec<LoraAdapter> = self.adapters.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|a| a.order);
        out
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
