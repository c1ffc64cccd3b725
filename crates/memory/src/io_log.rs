use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::embedding::{EmbeddingService, similarity};

/// One appended interaction. Rows are immutable after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoLogRow {
    pub date: String,
    pub time: String,
    pub input_type: String,
    pub input: String,
    pub input_embedding: Vec<f32>,
    pub output_raw: String,
    pub output_final: String,
    pub output_final_embedding: Vec<f32>,
    pub solution_path: Option<String>,
}

/// The caller-facing shape of an append; embeddings are computed by the log.
#[derive(Debug, Clone)]
pub struct IoEntry {
    pub input_type: String,
    pub input: String,
    pub output_raw: String,
    pub output_final: String,
    pub solution_path: Option<String>,
}

/// Append-only JSONL interaction log with embedding-based recall queries.
pub struct IoLog {
    path: PathBuf,
    embeddings: Arc<EmbeddingService>,
}

impl std::fmt::Debug for IoLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoLog").field("path", &self.path).finish()
    }
}

impl IoLog {
    pub fn new(path: impl AsRef<Path>, embeddings: Arc<EmbeddingService>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            embeddings,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Synchronous append: embeds both texts inline, then appends the row
    /// with an fsync so it survives a crash immediately after the call.
    pub async fn append(&self, entry: IoEntry) -> Result<()> {
        let input_embedding = self.embeddings.embed(&entry.input, true).await;
        let output_final_embedding = self.embeddings.embed(&entry.output_final, true).await;
        let now = Utc::now();
        let row = IoLogRow {
            date: now.format("%Y-%m-%d").to_string(),
            time: now.format("%H:%M:%S").to_string(),
            input_type: entry.input_type,
            input: entry.input,
            input_embedding,
            output_raw: entry.output_raw,
            output_final: entry.output_final,
            output_final_embedding,
            solution_path: entry.solution_path,
        };
        self.append_row(&row)
    }

    fn append_row(&self, row: &IoLogRow) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(row)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<IoLogRow>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut rows = Vec::new();
        for (line_idx, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IoLogRow>(&line) {
                Ok(row) => rows.push(row),
                Err(err) => warn!(
                    line = line_idx + 1,
                    %err,
                    path = %self.path.display(),
                    "corrupt io-log line — skipping"
                ),
            }
        }
        Ok(rows)
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Rows nearest to `query` by input-embedding similarity, best first.
    pub async fn knn(&self, query: &str, k: usize) -> Result<Vec<(IoLogRow, f32)>> {
        let query_embedding = self.embeddings.embed(query, true).await;
        if query_embedding.is_empty() {
            return Ok(Vec::new());
        }
        let mut ranked: Vec<(IoLogRow, f32)> = self
            .load()?
            .into_iter()
            .map(|row| {
                let score = similarity(&row.input_embedding, &query_embedding);
                (row, score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(k);
        Ok(ranked)
    }

    /// Last `max_rows` rows, newest first.
    pub fn recent(&self, max_rows: usize) -> Result<Vec<IoLogRow>> {
        let mut rows = self.load()?;
        rows.reverse();
        rows.truncate(max_rows);
        Ok(rows)
    }

    pub fn stats_by_input_type(&self) -> Result<BTreeMap<String, usize>> {
        let mut stats = BTreeMap::new();
        for row in self.load()? {
            *stats.entry(row.input_type).or_insert(0) += 1;
        }
        Ok(stats)
    }

    /// Rows whose `input_type` marks them as agent-router traffic,
    /// newest first.
    pub fn agent_router_interactions(&self, max_rows: usize) -> Result<Vec<IoLogRow>> {
        let mut rows: Vec<IoLogRow> = self
            .load()?
            .into_iter()
            .filter(|row| row.input_type.starts_with("agent router"))
            .collect();
        rows.reverse();
        rows.truncate(max_rows);
        Ok(rows)
    }
}

// ── Async mode ────────────────────────────────────────────────────────────────

/// Fire-and-forget front for [`IoLog`]: `append` returns immediately and a
/// background worker does the embedding and disk write. Worker failures are
/// logged and the row dropped — the request path never sees them.
pub struct AsyncIoLog {
    tx: mpsc::UnboundedSender<IoEntry>,
    worker: tokio::task::JoinHandle<()>,
}

impl AsyncIoLog {
    pub fn spawn(log: Arc<IoLog>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<IoEntry>();
        let worker = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(err) = log.append(entry).await {
                    warn!(%err, "async io-log append failed — row dropped");
                }
            }
            info!("async io-log worker drained and stopped");
        });
        Self { tx, worker }
    }

    pub fn append(&self, entry: IoEntry) {
        if self.tx.send(entry).is_err() {
            warn!("async io-log worker gone — row dropped");
        }
    }

    /// Close the intake and wait for queued rows to reach disk.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.worker.await;
    }
}
