//! Vector store for chunk embeddings: similarity and diversity (MMR) search,
//! persisted as immutable versions on disk.
//!
//! Layout under the index root:
//!
//! ```text
//! CURRENT                         name of the active version
//! versions/<version>/manifest.json
//! versions/<version>/shard-00000.bin
//! ```
//!
//! A build writes a complete new version, then swaps `CURRENT` with a rename.
//! Older versions are removed afterwards; handles already opened keep their
//! in-memory copy.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::chunks::DocumentChunk;
use crate::config::RetrievalConfig;

const CURRENT_FILE: &str = "CURRENT";
const VERSIONS_DIR: &str = "versions";
const MANIFEST_FILE: &str = "manifest.json";
/// Entries per shard file.
pub const SHARD_SIZE: usize = 1024;
/// Relevance weight used for diversity search when none (or no usable one) is set.
pub const DEFAULT_LAMBDA: f32 = 0.5;

/// How to rank results for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Plain top-k by cosine similarity.
    Similarity,
    /// Maximal marginal relevance over a larger similarity-ranked pool.
    #[default]
    #[serde(alias = "mmr")]
    Diversity,
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "similarity" => Ok(SearchMode::Similarity),
            "diversity" | "mmr" => Ok(SearchMode::Diversity),
            other => Err(format!("unknown search mode '{}'; use similarity or diversity", other)),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Similarity => f.write_str("similarity"),
            SearchMode::Diversity => f.write_str("diversity"),
        }
    }
}

/// Query parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub k: usize,
    pub mode: SearchMode,
    pub fetch_k: usize,
    pub lambda: f32,
}

impl SearchParams {
    pub fn similarity(k: usize) -> Self {
        Self {
            k,
            mode: SearchMode::Similarity,
            ..Self::from(&RetrievalConfig::default())
        }
    }

    pub fn diversity(k: usize) -> Self {
        Self {
            k,
            mode: SearchMode::Diversity,
            ..Self::from(&RetrievalConfig::default())
        }
    }
}

impl From<&RetrievalConfig> for SearchParams {
    fn from(c: &RetrievalConfig) -> Self {
        Self {
            k: c.k,
            mode: c.mode,
            fetch_k: c.fetch_k,
            lambda: sanitize_lambda(c.lambda),
        }
    }
}

/// A stored chunk with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Unit-length embedding, so cosine similarity is a dot product.
    pub embedding: Vec<f32>,
    pub text: String,
    pub source_id: String,
    pub start_offset: usize,
}

impl IndexEntry {
    fn to_chunk(&self) -> DocumentChunk {
        DocumentChunk {
            text: self.text.clone(),
            source_id: self.source_id.clone(),
            start_offset: self.start_offset,
        }
    }
}

/// A search hit: the chunk and its cosine similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

/// In-memory vector store. Holds chunks and their embeddings; supports similarity search.
#[derive(Debug, Default, Clone)]
pub struct VectorStore {
    dimension: usize,
    entries: Vec<IndexEntry>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk with its embedding. Embedding is normalized before storage.
    /// The first entry fixes the store's dimension.
    pub fn add(&mut self, chunk: DocumentChunk, embedding: Vec<f32>) -> Result<(), StoreError> {
        if embedding.is_empty() {
            return Err(StoreError::InvalidEmbedding("empty vector".to_string()));
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(StoreError::InvalidEmbedding("contains NaN or infinity".to_string()));
        }
        if self.entries.is_empty() {
            self.dimension = embedding.len();
        } else if embedding.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        self.entries.push(IndexEntry {
            embedding: normalize(&embedding),
            text: chunk.text,
            source_id: chunk.source_id,
            start_offset: chunk.start_offset,
        });
        Ok(())
    }

    /// Add multiple chunks with embeddings in one batch.
    pub fn add_batch(
        &mut self,
        chunks: Vec<DocumentChunk>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<(), StoreError> {
        if chunks.len() != embeddings.len() {
            return Err(StoreError::InvalidEmbedding(format!(
                "{} embeddings for {} chunks",
                embeddings.len(),
                chunks.len()
            )));
        }
        for (chunk, embedding) in chunks.into_iter().zip(embeddings) {
            self.add(chunk, embedding)?;
        }
        Ok(())
    }

    /// Runs a query in the requested mode. Never mutates the store.
    pub fn query(&self, query: &[f32], params: &SearchParams) -> Result<Vec<ScoredChunk>, StoreError> {
        if self.entries.is_empty() || params.k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let q_norm = normalize(query);
        let picked = match params.mode {
            SearchMode::Similarity => {
                let mut ranked = self.ranked(&q_norm);
                ranked.truncate(params.k);
                ranked
            }
            SearchMode::Diversity => self.mmr(&q_norm, params),
        };
        Ok(picked
            .into_iter()
            .map(|(i, score)| ScoredChunk {
                chunk: self.entries[i].to_chunk(),
                score,
            })
            .collect())
    }

    /// Top `k` by cosine similarity, ties in insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>, StoreError> {
        self.query(query, &SearchParams::similarity(k))
    }

    /// All entries as `(position, similarity)`, best first. Stable sort keeps
    /// insertion order among equal scores.
    fn ranked(&self, q_norm: &[f32]) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, dot(q_norm, &e.embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }

    /// Greedy maximal marginal relevance over the `fetch_k` most similar entries.
    fn mmr(&self, q_norm: &[f32], params: &SearchParams) -> Vec<(usize, f32)> {
        let mut pool = self.ranked(q_norm);
        pool.truncate(params.fetch_k.max(params.k));
        let lambda = sanitize_lambda(params.lambda);

        let mut selected: Vec<(usize, f32)> = Vec::with_capacity(params.k);
        while selected.len() < params.k && !pool.is_empty() {
            let mut best = 0;
            let mut best_score = f32::NEG_INFINITY;
            for (pos, (idx, sim)) in pool.iter().enumerate() {
                let redundancy = selected
                    .iter()
                    .map(|(s, _)| dot(&self.entries[*idx].embedding, &self.entries[*s].embedding))
                    .fold(None, |acc: Option<f32>, v| Some(acc.map_or(v, |a| a.max(v))))
                    .unwrap_or(0.0);
                let score = lambda * sim - (1.0 - lambda) * redundancy;
                if score > best_score {
                    best = pos;
                    best_score = score;
                }
            }
            selected.push(pool.remove(best));
        }
        selected
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }
}

/// An opened, immutable index version. Cheap to clone.
#[derive(Debug, Clone)]
pub struct IndexHandle {
    version: String,
    store: Arc<VectorStore>,
}

impl IndexHandle {
    pub fn new(version: impl Into<String>, store: VectorStore) -> Self {
        Self {
            version: version.into(),
            store: Arc::new(store),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    pub fn query(&self, query: &[f32], params: &SearchParams) -> Result<Vec<ScoredChunk>, StoreError> {
        self.store.query(query, params)
    }
}

/// Metadata written next to the shards of a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub version: String,
    pub created_at_epoch_ms: u64,
    pub embed_model: String,
    pub dimension: usize,
    pub entry_count: usize,
    pub shards: Vec<ShardInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub file: String,
    pub entries: usize,
}

/// The directory holding the persisted index.
#[derive(Debug, Clone)]
pub struct IndexLocation {
    root: PathBuf,
}

impl IndexLocation {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Name of the active version, if an index has been published.
    pub fn current_version(&self) -> Option<String> {
        fs::read_to_string(self.root.join(CURRENT_FILE))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Version directories present on disk, sorted by name (oldest first).
    pub fn list_versions(&self) -> Vec<String> {
        let Ok(dir) = fs::read_dir(self.root.join(VERSIONS_DIR)) else {
            return Vec::new();
        };
        let mut names: Vec<String> = dir
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    /// Reads the manifest of the active version.
    pub fn manifest(&self) -> Result<IndexManifest, StoreError> {
        let version = self
            .current_version()
            .ok_or_else(|| self.unavailable("index has not been built"))?;
        self.read_manifest(&version)
    }

    /// Writes `store` as a new version and makes it the active one. Every other
    /// version on disk is deleted afterwards. Files are synced to disk before
    /// `CURRENT` moves; a failed publish removes its partial version directory.
    pub fn publish(&self, store: &VectorStore, embed_model: &str) -> Result<IndexManifest, StoreError> {
        let created_at_epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let version = format!(
            "v{}-{}",
            created_at_epoch_ms,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let dir = self.version_dir(&version);
        fs::create_dir_all(&dir).map_err(|e| StoreError::Write(dir.clone(), e))?;

        let written = self
            .write_version(&dir, &version, created_at_epoch_ms, store, embed_model)
            .and_then(|manifest| self.swap_current(&version).map(|()| manifest));
        let manifest = match written {
            Ok(manifest) => manifest,
            Err(e) => {
                if let Err(rm) = fs::remove_dir_all(&dir) {
                    warn!("failed to remove partial index version {}: {}", dir.display(), rm);
                }
                return Err(e);
            }
        };
        info!(version = %version, entries = manifest.entry_count, "published index version");

        for old in self.list_versions().into_iter().filter(|v| *v != version) {
            let path = self.version_dir(&old);
            match fs::remove_dir_all(&path) {
                Ok(()) => info!(version = %old, "removed previous index version"),
                Err(e) => warn!("failed to remove old index version {}: {}", path.display(), e),
            }
        }
        Ok(manifest)
    }

    fn write_version(
        &self,
        dir: &Path,
        version: &str,
        created_at_epoch_ms: u64,
        store: &VectorStore,
        embed_model: &str,
    ) -> Result<IndexManifest, StoreError> {
        let mut shards = Vec::new();
        for (n, batch) in store.entries.chunks(SHARD_SIZE).enumerate() {
            let file = format!("shard-{:05}.bin", n);
            write_synced(&dir.join(&file), |out| {
                bincode::serialize_into(out, batch).map_err(|e| StoreError::Encode(e.to_string()))
            })?;
            shards.push(ShardInfo {
                file,
                entries: batch.len(),
            });
        }

        let manifest = IndexManifest {
            version: version.to_string(),
            created_at_epoch_ms,
            embed_model: embed_model.to_string(),
            dimension: store.dimension,
            entry_count: store.len(),
            shards,
        };
        write_synced(&dir.join(MANIFEST_FILE), |out| {
            serde_json::to_writer_pretty(out, &manifest).map_err(|e| StoreError::Encode(e.to_string()))
        })?;
        Ok(manifest)
    }

    /// Points `CURRENT` at `version`; rename is atomic on the same filesystem.
    fn swap_current(&self, version: &str) -> Result<(), StoreError> {
        let tmp = self.root.join(format!("{}.tmp", CURRENT_FILE));
        if let Err(e) = write_synced(&tmp, |out| {
            out.write_all(version.as_bytes())
                .map_err(|e| StoreError::Write(tmp.clone(), e))
        }) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        let current = self.root.join(CURRENT_FILE);
        fs::rename(&tmp, &current).map_err(|e| StoreError::Write(current, e))
    }

    /// Loads the active version into memory.
    pub fn open(&self) -> Result<IndexHandle, StoreError> {
        let manifest = self.manifest()?;
        let dir = self.version_dir(&manifest.version);
        let mut entries = Vec::with_capacity(manifest.entry_count);
        for shard in &manifest.shards {
            let path = dir.join(&shard.file);
            let file = File::open(&path)
                .map_err(|e| self.unavailable(format!("cannot open {}: {}", shard.file, e)))?;
            let batch: Vec<IndexEntry> = bincode::deserialize_from(BufReader::new(file))
                .map_err(|e| self.unavailable(format!("corrupt shard {}: {}", shard.file, e)))?;
            if batch.len() != shard.entries {
                return Err(self.unavailable(format!(
                    "shard {} holds {} entries, manifest says {}",
                    shard.file,
                    batch.len(),
                    shard.entries
                )));
            }
            entries.extend(batch);
        }
        if entries.len() != manifest.entry_count {
            return Err(self.unavailable(format!(
                "found {} entries, manifest says {}",
                entries.len(),
                manifest.entry_count
            )));
        }
        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != manifest.dimension) {
            return Err(self.unavailable(format!(
                "entry from {} has {} dimensions, manifest says {}",
                bad.source_id,
                bad.embedding.len(),
                manifest.dimension
            )));
        }
        info!(version = %manifest.version, entries = entries.len(), "opened index");
        Ok(IndexHandle::new(
            manifest.version,
            VectorStore {
                dimension: manifest.dimension,
                entries,
            },
        ))
    }

    fn read_manifest(&self, version: &str) -> Result<IndexManifest, StoreError> {
        let path = self.version_dir(version).join(MANIFEST_FILE);
        let file = File::open(&path)
            .map_err(|e| self.unavailable(format!("cannot open manifest for {}: {}", version, e)))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| self.unavailable(format!("corrupt manifest for {}: {}", version, e)))
    }

    fn version_dir(&self, version: &str) -> PathBuf {
        self.root.join(VERSIONS_DIR).join(version)
    }

    fn unavailable(&self, reason: impl Into<String>) -> StoreError {
        StoreError::Unavailable {
            path: self.root.clone(),
            reason: reason.into(),
        }
    }
}

/// Creates `path`, fills it through `fill`, then flushes and syncs it to disk.
fn write_synced(
    path: &Path,
    fill: impl FnOnce(&mut BufWriter<File>) -> Result<(), StoreError>,
) -> Result<(), StoreError> {
    let file = File::create(path).map_err(|e| StoreError::Write(path.to_path_buf(), e))?;
    let mut out = BufWriter::new(file);
    fill(&mut out)?;
    out.flush().map_err(|e| StoreError::Write(path.to_path_buf(), e))?;
    out.get_ref()
        .sync_all()
        .map_err(|e| StoreError::Write(path.to_path_buf(), e))
}

/// Clamps to `[0, 1]`; NaN and infinities fall back to [DEFAULT_LAMBDA].
fn sanitize_lambda(lambda: f32) -> f32 {
    if lambda.is_finite() {
        lambda.clamp(0.0, 1.0)
    } else {
        DEFAULT_LAMBDA
    }
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    (0..n).map(|i| a[i] * b[i]).sum()
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Missing, never built, or corrupt. Queries fail until a successful build.
    #[error("index unavailable at {}: {reason}", path.display())]
    Unavailable { path: PathBuf, reason: String },
    #[error("embedding has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("failed to write {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("failed to encode index: {0}")]
    Encode(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}
