//! Bounded admission queue and fixed worker pool.
//!
//! One FIFO channel of capacity 1000 feeds exactly `max_num_seqs` workers,
//! so at most that many requests run concurrently and a full queue blocks
//! the producing handler. Workers drain their in-flight item and exit when
//! the sender side closes.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::engine;
use crate::metrics::LoraState;
use crate::request::QueuedRequest;
use crate::EngineCtx;

pub(crate) fn spawn_workers(ctx: Arc<EngineCtx>, rx: mpsc::Receiver<QueuedRequest>) {
    let rx = Arc::new(Mutex::new(rx));
    for worker_id in 0..ctx.cfg.max_num_seqs {
        let ctx = Arc::clone(&ctx);
        let rx = Arc::clone(&rx);
        tokio::spawn(async move {
            loop {
                // Hold the lock only for the receive so dispatch stays FIFO
                // while other workers keep consuming.
                let item = { rx.lock().await.recv().await };
                let Some(item) = item else { break };
                let lora = item.request.lora_name.clone();
                let request_id = item.request.id.clone();
                ctx.metrics.record_waiting(-1).await;
                ctx.metrics.record_running(1).await;
                if let Some(name) = &lora {
                    ctx.metrics.record_lora(name, LoraState::Running).await;
                }
                tracing::debug!(worker_id, request_id = %request_id, "request picked up");
                engine::process(&ctx, item).await;
                ctx.metrics.record_running(-1).await;
                if let Some(name) = &lora {
                    ctx.metrics.record_lora(name, LoraState::Done).await;
                }
            }
            tracing::debug!(worker_id, "worker stopped");
        });
    }
}
