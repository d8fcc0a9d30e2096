//! Seam for the external KV-cache block model.
//!
//! The block accounting itself lives outside this crate; the worker only
//! calls the hook around request processing and records the cached-prompt
//! token count it reports. Cache usage is published through the metrics
//! kv-usage channel by hook implementations.

use sim_common::Result;

pub trait KvCacheHook: Send + Sync {
    /// Called before processing starts; returns the number of prompt tokens
    /// already present in the cache for this request.
    fn on_request_start(&self, request_id: &str, prompt_tokens: &[String]) -> Result<usize>;

    /// Called after the last byte of the response has been flushed.
    fn on_request_end(&self, request_id: &str) -> Result<()>;
}

/// Hook used when kv-cache support is disabled.
pub struct NoopKvCache;

impl KvCacheHook for NoopKvCache {
    fn on_request_start(&self, _request_id: &str, _prompt_tokens: &[String]) -> Result<usize> {
        Ok(0)
    }

    fn on_request_end(&self, _request_id: &str) -> Result<()> {
        Ok(())
    }
}
