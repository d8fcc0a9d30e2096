//! Prompt-keyed dataset of pre-generated token sequences.
//!
//! Lookup order: sqlite rows matching the SHA-256 of the formatted prompt,
//! then rows matching the target length, then synthesis from the preset
//! sentence bank. A store that cannot be locked exclusively degrades to
//! preset-only mode.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use sim_common::config::{Config, Mode};
use sim_common::{Result, SimError};

use crate::latency::LatencyModel;
use crate::random::Rng;
use crate::request::{FinishReason, SimRequest};
use crate::tokenizer;

pub const TABLE_NAME: &str = "llm_responses";

/// Built-in sentence bank used when no stored sequence matches.
pub const PRESET_SENTENCES: [&str; 11] = [
    "The quick brown fox jumps over the lazy dog.",
    "A journey of a thousand miles begins with a single step.",
    "All that glitters is not gold.",
    "Actions speak louder than words.",
    "The early bird catches the worm.",
    "Practice makes perfect in every endeavor.",
    "Fortune favors the bold and the prepared mind.",
    "Every cloud has a silver lining somewhere.",
    "Knowledge is power when it is shared.",
    "Still waters run deep beneath the surface.",
    "Rome was not built in a single day.",
];

const DOWNLOAD_LOG_INTERVAL: Duration = Duration::from_secs(5);
const DOWNLOAD_LOG_PERCENT_STEP: u64 = 10;

pub struct DatasetProvider {
    mode: Mode,
    store: Option<SqliteStore>,
    rng: Rng,
}

impl DatasetProvider {
    /// Builds the provider: optional download, store open with exclusive
    /// lock (falling back to preset-only on contention), optional
    /// in-memory copy.
    pub async fn init(cfg: &Config, rng: Rng) -> Result<Self> {
        let mut store = None;
        if let Some(path) = &cfg.dataset_path {
            if let Some(url) = &cfg.dataset_url {
                if !path.exists() {
                    download(url, path).await?;
                }
            }
            if path.exists() {
                match SqliteStore::open(path, cfg.dataset_in_memory) {
                    Ok(s) => store = Some(s),
                    Err(SimError::Dataset(msg)) if msg.contains("locked") => {
                        tracing::warn!(
                            path = %path.display(),
                            "dataset store is locked by another process, using preset responses"
                        );
                    }
                    Err(e) => return Err(e),
                }
            } else if cfg.dataset_url.is_none() {
                return Err(SimError::Dataset(format!(
                    "dataset path {} does not exist",
                    path.display()
                )));
            }
        }
        Ok(Self {
            mode: cfg.mode,
            store,
            rng,
        })
    }

    pub fn preset_only(mode: Mode, rng: Rng) -> Self {
        Self {
            mode,
            store: None,
            rng,
        }
    }

    /// Returns the completion tokens and finish reason for a request.
    pub fn get_tokens(
        &self,
        req: &SimRequest,
        latency: &LatencyModel,
    ) -> Result<(Vec<String>, FinishReason)> {
        if self.mode == Mode::Echo {
            return Ok(echo_tokens(req));
        }
        let (target, reason) = self.target_length(req, latency);
        if target == 0 {
            return Ok((Vec::new(), reason));
        }
        if let Some(store) = &self.store {
            let hash = prompt_hash(&req.hash_projection());
            match store.lookup(&hash, target, reason, &self.rng) {
                Ok(Some(tokens)) => return Ok((tokens, reason)),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "dataset lookup failed, synthesizing from presets");
                }
            }
        }
        Ok((synthesize_preset(&self.rng, target), reason))
    }

    fn target_length(&self, req: &SimRequest, latency: &LatencyModel) -> (usize, FinishReason) {
        if req.ignore_eos {
            // Validation guarantees a max is set alongside ignore_eos.
            return (req.max_tokens.unwrap_or(1), FinishReason::Length);
        }
        match req.max_tokens {
            Some(max) => {
                let len = latency.length_by_histogram(max);
                let reason = if len == max {
                    FinishReason::Length
                } else {
                    FinishReason::Stop
                };
                (len, reason)
            }
            None => (latency.unlimited_length(), FinishReason::Stop),
        }
    }
}

fn echo_tokens(req: &SimRequest) -> (Vec<String>, FinishReason) {
    let mut tokens = tokenizer::tokenize(&req.prompt_text());
    if let Some(max) = req.max_tokens {
        if tokens.len() > max {
            tokens.truncate(max);
            return (tokens, FinishReason::Length);
        }
    }
    (tokens, FinishReason::Stop)
}

pub fn prompt_hash(projection: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(projection.as_bytes());
    hasher.finalize().into()
}

/// Concatenates random preset sentences until `target` tokens are reached.
/// Sentences after the first carry the joining space inside their first
/// token so no extra token is spent on the boundary.
fn synthesize_preset(rng: &Rng, target: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(target);
    while out.len() < target {
        let sentence = *rng.pick(&PRESET_SENTENCES);
        let mut tokens = tokenizer::tokenize(sentence);
        if !out.is_empty() {
            if let Some(last) = out.last_mut() {
                if !last.ends_with(' ') {
                    last.push(' ');
                }
            }
        }
        out.append(&mut tokens);
    }
    out.truncate(target);
    out
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path, in_memory: bool) -> Result<Self> {
        let file = Connection::open(path).map_err(store_err)?;
        Self::acquire_exclusive(&file)?;
        Self::verify_schema(&file)?;
        let conn = if in_memory {
            let mut mem = Connection::open_in_memory().map_err(store_err)?;
            {
                let backup = rusqlite::backup::Backup::new(&file, &mut mem).map_err(store_err)?;
                backup
                    .run_to_completion(64, Duration::from_millis(5), None)
                    .map_err(store_err)?;
            }
            // The file lock is released with the file connection; lookups
            // run against the copy from here on.
            drop(file);
            mem
        } else {
            file
        };
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn acquire_exclusive(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "locking_mode", "EXCLUSIVE")
            .map_err(store_err)?;
        // The pragma takes effect on the next access; a transaction forces
        // the lock attempt now so contention is detected at startup.
        conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")
            .map_err(|e| SimError::Dataset(format!("dataset store is locked: {e}")))
    }

    fn verify_schema(conn: &Connection) -> Result<()> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")
            .map_err(store_err)?;
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(store_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(store_err)?;
        if tables.len() != 1 || tables[0] != TABLE_NAME {
            return Err(SimError::Dataset(format!(
                "expected a single table named {TABLE_NAME}, found {tables:?}"
            )));
        }
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({TABLE_NAME})"))
            .map_err(store_err)?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(store_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(store_err)?;
        for expected in ["id", "prompt_hash", "gen_tokens", "n_gen_tokens"] {
            if !columns.iter().any(|c| c == expected) {
                return Err(SimError::Dataset(format!(
                    "table {TABLE_NAME} is missing column {expected}"
                )));
            }
        }
        Ok(())
    }

    /// Hash-keyed lookup with finish-reason filter, then length-keyed
    /// lookup. Returns None when nothing matches.
    fn lookup(
        &self,
        hash: &[u8; 32],
        target: usize,
        reason: FinishReason,
        rng: &Rng,
    ) -> Result<Option<Vec<String>>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(&format!(
                "SELECT gen_tokens, n_gen_tokens FROM {TABLE_NAME} WHERE prompt_hash = ?1"
            ))
            .map_err(store_err)?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([hash.as_slice()], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(store_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(store_err)?;
        let candidates: Vec<&String> = rows
            .iter()
            .filter(|(_, n)| matches_reason(*n as usize, target, reason))
            .map(|(t, _)| t)
            .collect();
        if !candidates.is_empty() {
            let raw = rng.pick(&candidates);
            return Ok(Some(serde_json::from_str(raw)?));
        }
        // Hash miss (or all candidates filtered out): silently fall back
        // to a length-keyed query.
        let comparator = match reason {
            FinishReason::Length => "=",
            _ => "<=",
        };
        let mut stmt = conn
            .prepare(&format!(
                "SELECT id FROM {TABLE_NAME} WHERE n_gen_tokens {comparator} ?1"
            ))
            .map_err(store_err)?;
        let ids: Vec<i64> = stmt
            .query_map([target as i64], |row| row.get(0))
            .map_err(store_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(store_err)?;
        if ids.is_empty() {
            return Ok(None);
        }
        let id = *rng.pick(&ids);
        let raw: String = conn
            .query_row(
                &format!("SELECT gen_tokens FROM {TABLE_NAME} WHERE id = ?1"),
                [id],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }
}

fn matches_reason(len: usize, target: usize, reason: FinishReason) -> bool {
    match reason {
        FinishReason::Length => len == target,
        _ => len > 0 && len <= target,
    }
}

fn store_err(e: rusqlite::Error) -> SimError {
    SimError::Dataset(e.to_string())
}

/// Removes the partial file unless the download completed.
struct PartialFileGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for PartialFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

async fn download(url: &str, path: &Path) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    tracing::info!(url, path = %path.display(), "downloading dataset");
    let response = reqwest::get(url)
        .await
        .map_err(|e| SimError::Dataset(format!("dataset download failed: {e}")))?;
    if !response.status().is_success() {
        return Err(SimError::Dataset(format!(
            "dataset download failed: status {}",
            response.status()
        )));
    }
    let total = response.content_length();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = path.with_extension("partial");
    let mut guard = PartialFileGuard {
        path: partial.clone(),
        armed: true,
    };
    let mut file = tokio::fs::File::create(&partial).await?;
    let mut written: u64 = 0;
    let mut last_log = Instant::now();
    let mut last_percent: u64 = 0;
    let mut response = response;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| SimError::Dataset(format!("dataset download failed: {e}")))?
    {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        if let Some(total) = total {
            let percent = written * 100 / total.max(1);
            if last_log.elapsed() >= DOWNLOAD_LOG_INTERVAL
                || percent >= last_percent + DOWNLOAD_LOG_PERCENT_STEP
            {
                tracing::info!(percent, written, total, "dataset download progress");
                last_log = Instant::now();
                last_percent = percent;
            }
        } else if last_log.elapsed() >= DOWNLOAD_LOG_INTERVAL {
            tracing::info!(written, "dataset download progress");
            last_log = Instant::now();
        }
    }
    file.flush().await?;
    drop(file);
    if let Some(total) = total {
        if written != total {
            return Err(SimError::Dataset(format!(
                "dataset download truncated: {written} of {total} bytes"
            )));
        }
    }
    tokio::fs::rename(&partial, path).await?;
    guard.armed = false;
    tracing::info!(path = %path.display(), written, "dataset download complete");
    Ok(())
}
