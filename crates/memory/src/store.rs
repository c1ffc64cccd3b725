use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::embedding::EmbeddingService;
use crate::snapshot::SolutionSnapshot;

/// On-disk store of solution snapshots, one JSON file per solution, with the
/// full set held in memory for similarity ranking.
///
/// Files are named `{slug}-{n}.json` where `n` disambiguates earlier
/// solutions to similarly-worded questions in the same directory. Writes go
/// through a tmp-file + fsync + rename so a crash never leaves a partial
/// snapshot behind.
pub struct SnapshotStore {
    dir: PathBuf,
    embeddings: Arc<EmbeddingService>,
    snapshots: IndexMap<String, SolutionSnapshot>,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("dir", &self.dir)
            .field("snapshots", &self.snapshots.len())
            .finish()
    }
}

impl SnapshotStore {
    pub fn open(dir: impl AsRef<Path>, embeddings: Arc<EmbeddingService>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating solutions directory {}", dir.display()))?;

        let mut snapshots = IndexMap::new();
        let mut corrupt = 0usize;
        let mut names: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        names.sort();

        for path in names {
            match fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| Ok(serde_json::from_str::<SolutionSnapshot>(&raw)?))
            {
                Ok(mut snapshot) => {
                    snapshot.solution_file = path
                        .file_name()
                        .map(|name| name.to_string_lossy().to_string());
                    snapshots.insert(snapshot.id_hash.clone(), snapshot);
                }
                Err(err) => {
                    corrupt += 1;
                    warn!(path = %path.display(), %err, "corrupt snapshot file — skipping");
                }
            }
        }

        info!(
            dir = %dir.display(),
            loaded = snapshots.len(),
            corrupt,
            "solution snapshots loaded"
        );
        Ok(Self { dir, embeddings, snapshots })
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingService> {
        &self.embeddings
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn get_by_id(&self, id_hash: &str) -> Option<&SolutionSnapshot> {
        self.snapshots.get(id_hash)
    }

    pub fn get_mut(&mut self, id_hash: &str) -> Option<&mut SolutionSnapshot> {
        self.snapshots.get_mut(id_hash)
    }

    /// Persist a snapshot, generating any embeddings still missing for its
    /// non-empty text facets. Question, gist, summary, and thoughts embed in
    /// cache-normalized mode; code embeds verbatim.
    pub async fn insert(&mut self, mut snapshot: SolutionSnapshot) -> Result<String> {
        if snapshot.question_embedding.is_empty() && !snapshot.question.is_empty() {
            snapshot.question_embedding = self.embeddings.embed(&snapshot.question, true).await;
        }
        if snapshot.question_gist_embedding.is_empty() && !snapshot.question_gist.is_empty() {
            snapshot.question_gist_embedding =
                self.embeddings.embed(&snapshot.question_gist, true).await;
        }
        if snapshot.solution_embedding.is_empty() && !snapshot.solution_summary.is_empty() {
            snapshot.solution_embedding =
                self.embeddings.embed(&snapshot.solution_summary, true).await;
        }
        if snapshot.thoughts_embedding.is_empty() && !snapshot.thoughts.is_empty() {
            snapshot.thoughts_embedding = self.embeddings.embed(&snapshot.thoughts, true).await;
        }
        if snapshot.code_embedding.is_empty() && !snapshot.code.is_empty() {
            snapshot.code_embedding =
                self.embeddings.embed(&snapshot.code.join(" "), false).await;
        }

        if snapshot.solution_file.is_none() {
            snapshot.solution_file = Some(self.next_file_name(&snapshot.question));
        }

        self.write_snapshot(&snapshot)?;
        let id_hash = snapshot.id_hash.clone();
        self.snapshots.insert(id_hash.clone(), snapshot);
        Ok(id_hash)
    }

    /// Rewrite the file of an already-stored snapshot after mutation
    /// (synonym additions, runtime-stat updates).
    pub fn persist(&self, id_hash: &str) -> Result<()> {
        let snapshot = self
            .snapshots
            .get(id_hash)
            .with_context(|| format!("persist: unknown snapshot {id_hash}"))?;
        self.write_snapshot(snapshot)
    }

    /// Top-k snapshots ranked by question-embedding similarity to the query.
    /// Scores are on the 0–100 dot-product scale.
    pub async fn similar_to(&self, question: &str, k: usize) -> Vec<(&SolutionSnapshot, f32)> {
        let query_embedding = self.embeddings.embed(question, true).await;
        if query_embedding.is_empty() {
            return Vec::new();
        }

        let mut ranked: Vec<(&SolutionSnapshot, f32)> = self
            .snapshots
            .values()
            .map(|snapshot| (snapshot, snapshot.question_similarity_to(&query_embedding)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(k);
        ranked
    }

    /// Top-1 snapshot at or above `threshold`, skipping snapshots that have
    /// already rejected this phrasing as a non-synonym.
    pub async fn best_match(
        &self,
        question: &str,
        threshold: f32,
    ) -> Option<(&SolutionSnapshot, f32)> {
        let ranked = self.similar_to(question, usize::MAX).await;
        ranked
            .into_iter()
            .find(|(snapshot, _)| !snapshot.is_known_non_synonym(question))
            .filter(|(_, score)| *score >= threshold)
    }

    /// Delete a snapshot and its file. Unknown ids return `Ok(false)` with no
    /// mutation.
    pub fn delete(&mut self, id_hash: &str) -> Result<bool> {
        let Some(snapshot) = self.snapshots.shift_remove(id_hash) else {
            debug!(id_hash, "delete: snapshot not found");
            return Ok(false);
        };
        if let Some(file) = &snapshot.solution_file {
            let path = self.dir.join(file);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(true)
    }

    // ── File handling ─────────────────────────────────────────────────────────

    fn next_file_name(&self, question: &str) -> String {
        let slug = slugify(question);
        let prefix = format!("{slug}-");
        let existing = fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| {
                        let name = entry.file_name().to_string_lossy().to_string();
                        name.starts_with(&prefix) && name.ends_with(".json")
                    })
                    .count()
            })
            .unwrap_or(0);
        format!("{slug}-{existing}.json")
    }

    fn write_snapshot(&self, snapshot: &SolutionSnapshot) -> Result<()> {
        let file = snapshot
            .solution_file
            .as_ref()
            .context("snapshot has no assigned file name")?;
        let path = self.dir.join(file);
        let tmp_path = self.dir.join(format!("{file}.tmp"));

        let write_result: Result<()> = (|| {
            let rendered = serde_json::to_string(snapshot)?;
            let mut out = fs::File::create(&tmp_path)?;
            out.write_all(rendered.as_bytes())?;
            out.flush()?;
            out.sync_all()?;
            Ok(())
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Err(err) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o644));
        }

        debug!(path = %path.display(), "snapshot written");
        Ok(())
    }
}

/// File-name slug for a question: non-alphanumerics to `_`, truncated to 64
/// chars, spaces to `-`.
fn slugify(question: &str) -> String {
    let cleaned: String = question
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == ' ' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let truncated: String = cleaned.chars().take(64).collect();
    truncated.replace(' ', "-")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::embedding::test_support::StubEmbeddingClient;
    use crate::normalize::GistNormalizer;

    async fn open_store(dir: &Path) -> SnapshotStore {
        let service = EmbeddingService::open(
            dir.join("cache.redb"),
            Arc::new(StubEmbeddingClient::default()),
            GistNormalizer::default(),
            "stub-model",
            false,
        )
        .unwrap();
        SnapshotStore::open(dir.join("solutions"), Arc::new(service)).unwrap()
    }

    #[tokio::test]
    async fn insert_writes_slugged_file_and_fills_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path()).await;

        let mut snapshot = SolutionSnapshot::for_question("what is 2 plus 2");
        snapshot.code = vec!["print(2+2)".to_string()];
        let id = store.insert(snapshot).await.unwrap();

        let stored = store.get_by_id(&id).unwrap();
        assert!(!stored.question_embedding.is_empty());
        assert!(!stored.code_embedding.is_empty());
        assert_eq!(stored.solution_file.as_deref(), Some("what-is-2-plus-2-0.json"));
        assert!(dir.path().join("solutions/what-is-2-plus-2-0.json").exists());
    }

    #[tokio::test]
    async fn same_question_twice_disambiguates_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path()).await;

        store
            .insert(SolutionSnapshot::for_question("what time is it"))
            .await
            .unwrap();
        let second = store
            .insert(SolutionSnapshot::for_question("what time is it"))
            .await
            .unwrap();

        assert_eq!(
            store.get_by_id(&second).unwrap().solution_file.as_deref(),
            Some("what-time-is-it-1.json")
        );
    }

    #[tokio::test]
    async fn reopen_round_trips_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut store = open_store(dir.path()).await;
            let mut snapshot = SolutionSnapshot::for_question("what day is today");
            snapshot.answer = "Saturday".to_string();
            store.insert(snapshot).await.unwrap()
        };

        let store = open_store(dir.path()).await;
        let loaded = store.get_by_id(&id).unwrap();
        assert_eq!(loaded.question, "what day is today");
        assert_eq!(loaded.answer, "Saturday");
        assert!(!loaded.question_embedding.is_empty());
    }

    #[tokio::test]
    async fn identical_question_scores_one_hundred() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path()).await;
        store
            .insert(SolutionSnapshot::for_question("what time is it"))
            .await
            .unwrap();

        let ranked = store.similar_to("what time is it", 5).await;
        assert_eq!(ranked.len(), 1);
        assert!((ranked[0].1 - 100.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn best_match_respects_threshold_and_negatives() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path()).await;
        let id = store
            .insert(SolutionSnapshot::for_question("what day is today"))
            .await
            .unwrap();

        assert!(store.best_match("what day is today", 99.0).await.is_some());
        // Unrelated question embeds differently; demand an exact-grade score.
        assert!(store.best_match("completely different topic", 99.9).await.is_none());

        store
            .get_mut(&id)
            .unwrap()
            .add_non_synonymous_question("what day is today");
        assert!(store.best_match("what day is today", 99.0).await.is_none());
    }

    #[tokio::test]
    async fn delete_unknown_id_is_clean_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path()).await;
        assert!(!store.delete("deadbeef").unwrap());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn delete_removes_file_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path()).await;
        let id = store
            .insert(SolutionSnapshot::for_question("delete me"))
            .await
            .unwrap();
        let path = dir.path().join("solutions/delete-me-0.json");
        assert!(path.exists());

        assert!(store.delete(&id).unwrap());
        assert!(!path.exists());
        assert!(store.get_by_id(&id).is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_skipped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = open_store(dir.path()).await;
            store
                .insert(SolutionSnapshot::for_question("good question"))
                .await
                .unwrap();
        }
        std::fs::write(dir.path().join("solutions/broken-0.json"), "{ not json").unwrap();

        let store = open_store(dir.path()).await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn persist_after_mutation_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut store = open_store(dir.path()).await;
            let id = store
                .insert(SolutionSnapshot::for_question("what time is it"))
                .await
                .unwrap();
            let snapshot = store.get_mut(&id).unwrap();
            snapshot.add_synonymous_question("tell me the time", 95.0);
            snapshot.update_runtime_stats(4200);
            snapshot.update_runtime_stats(12);
            store.persist(&id).unwrap();
            id
        };

        let store = open_store(dir.path()).await;
        let loaded = store.get_by_id(&id).unwrap();
        assert_eq!(loaded.synonymous_questions.len(), 2);
        assert_eq!(loaded.runtime_stats.first_run_ms, Some(4200));
        assert_eq!(loaded.runtime_stats.run_count, 1);
    }
}
