//! Index pipeline: load catalog → chunk → embed → store → publish.

use std::path::Path;
use std::time::Instant;

use tracing::info;

use crate::catalog::{load_catalog, CatalogError, CatalogLoad};
use crate::chunks::{ingest, DocumentChunk, TextSplitter};
use crate::provider::{EmbedError, Embedder};
use crate::store::{IndexHandle, IndexLocation, IndexManifest, StoreError, VectorStore};

/// Default number of chunks sent per embedding request.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Embeds `chunks` in order-preserving batches and publishes them as the new
/// active index at `location`. Any embedding failure aborts before anything is
/// written, so the previous index stays in place.
pub async fn build_index(
    chunks: Vec<DocumentChunk>,
    embedder: &dyn Embedder,
    location: &IndexLocation,
    batch_size: usize,
) -> Result<(IndexHandle, IndexManifest), IndexError> {
    let started = Instant::now();
    let batch_size = batch_size.max(1);
    let total_batches = chunks.len().div_ceil(batch_size);

    let mut embeddings = Vec::with_capacity(chunks.len());
    for (n, batch) in chunks.chunks(batch_size).enumerate() {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder.embed(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(IndexError::Embedding(EmbedError::Malformed(format!(
                "batch {} returned {} embeddings for {} chunks",
                n + 1,
                vectors.len(),
                texts.len()
            ))));
        }
        embeddings.extend(vectors);
        info!(
            batch = n + 1,
            of = total_batches,
            embedded = embeddings.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "embedded batch"
        );
    }

    let mut store = VectorStore::new();
    store.add_batch(chunks, embeddings)?;
    let manifest = location.publish(&store, embedder.model())?;
    info!(
        version = %manifest.version,
        entries = manifest.entry_count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "index built"
    );
    Ok((IndexHandle::new(manifest.version.clone(), store), manifest))
}

/// Summary of a catalog rebuild.
#[derive(Debug)]
pub struct RebuildReport {
    pub catalog: CatalogLoad,
    pub chunks: usize,
    pub manifest: IndexManifest,
}

/// Runs the full pipeline from a CSV file: load, chunk, embed, publish.
/// Returns the new handle and a report of what was loaded and skipped.
pub async fn rebuild_from_catalog(
    catalog_path: &Path,
    id_column: &str,
    splitter: &TextSplitter,
    embedder: &dyn Embedder,
    location: &IndexLocation,
    batch_size: usize,
) -> Result<(IndexHandle, RebuildReport), IndexError> {
    let catalog = load_catalog(catalog_path, id_column)?;
    let chunks = ingest(&catalog.records, splitter);
    let chunk_count = chunks.len();
    let (handle, manifest) = build_index(chunks, embedder, location, batch_size).await?;
    Ok((
        handle,
        RebuildReport {
            catalog,
            chunks: chunk_count,
            manifest,
        },
    ))
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbedError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Maps each text to `[len, calls]` and counts requests.
    struct Counting {
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
    }

    #[async_trait]
    impl Embedder for Counting {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(call) == self.fail_on_call {
                return Err(EmbedError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }

        fn model(&self) -> &str {
            "counting"
        }
    }

    fn chunks(n: usize) -> Vec<DocumentChunk> {
        (0..n)
            .map(|i| DocumentChunk {
                text: "x".repeat(i + 1),
                source_id: format!("P{i}"),
                start_offset: 0,
            })
            .collect()
    }

    #[tokio::test]
    async fn embeds_in_batches_preserving_order() {
        let dir = tempfile::tempdir().unwrap();
        let loc = IndexLocation::new(dir.path());
        let e = Counting {
            calls: AtomicUsize::new(0),
            fail_on_call: None,
        };
        let (handle, manifest) = build_index(chunks(5), &e, &loc, 2).await.unwrap();
        assert_eq!(e.calls.load(Ordering::SeqCst), 3);
        assert_eq!(manifest.entry_count, 5);
        assert_eq!(manifest.embed_model, "counting");
        let ids: Vec<_> = handle.store().entries().iter().map(|e| e.source_id.as_str()).collect();
        assert_eq!(ids, ["P0", "P1", "P2", "P3", "P4"]);
    }

    #[tokio::test]
    async fn failed_batch_leaves_previous_index_alone() {
        let dir = tempfile::tempdir().unwrap();
        let loc = IndexLocation::new(dir.path());
        let ok = Counting {
            calls: AtomicUsize::new(0),
            fail_on_call: None,
        };
        let (_, first) = build_index(chunks(2), &ok, &loc, 8).await.unwrap();

        let failing = Counting {
            calls: AtomicUsize::new(0),
            fail_on_call: Some(2),
        };
        let err = build_index(chunks(6), &failing, &loc, 2).await.unwrap_err();
        assert!(matches!(err, IndexError::Embedding(EmbedError::Status { status: 500, .. })));
        assert_eq!(loc.current_version(), Some(first.version));
        assert_eq!(loc.open().unwrap().store().len(), 2);
    }

    #[tokio::test]
    async fn empty_catalog_publishes_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let loc = IndexLocation::new(dir.path());
        let e = Counting {
            calls: AtomicUsize::new(0),
            fail_on_call: None,
        };
        let (handle, _) = build_index(Vec::new(), &e, &loc, 4).await.unwrap();
        assert!(handle.store().is_empty());
        assert_eq!(e.calls.load(Ordering::SeqCst), 0);
        assert!(loc.open().unwrap().store().is_empty());
    }

    #[tokio::test]
    async fn rebuild_from_csv_reports_skipped_rows() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("catalog.csv");
        std::fs::write(&csv, "product_id,title\nB001,Mug\n,Orphan\nB002,Lamp\n").unwrap();
        let loc = IndexLocation::new(dir.path().join("index"));
        let e = Counting {
            calls: AtomicUsize::new(0),
            fail_on_call: None,
        };
        let (handle, report) =
            rebuild_from_catalog(&csv, "product_id", &TextSplitter::default(), &e, &loc, 32)
                .await
                .unwrap();
        assert_eq!(report.catalog.records.len(), 2);
        assert_eq!(report.catalog.skipped.len(), 1);
        assert_eq!(report.chunks, 2);
        assert_eq!(handle.store().len(), 2);
    }
}
