//! 🚚 The Bulk Loader: chop, ship, count, repeat.
//!
//! 🎬 *[a conveyor belt of people rolls toward a loading dock.]*
//! *[every 500 of them get boxed, labelled, and shoved through a single HTTP door.]*
//! *[some boxes come back stamped REJECTED. the belt does not stop.]*
//!
//! Records are pulled lazily from any iterator, packed into chunks of at most
//! `chunk_size`, and each chunk becomes exactly one `bulk_write`. A chunk that
//! times out or hits a transport error is written off in full and the loader
//! moves on. Nothing is retried here. If you want retries, you are the retry
//! policy. 🦆

use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{StoreError, TallyError, config_error};
use crate::progress::ProgressMetrics;
use crate::records::Document;
use crate::store::{BulkItem, BulkResult, Rejection, SearchStore};

#[derive(Debug, Deserialize, Clone)]
pub struct LoaderConfig {
    /// 📦 Max records per `_bulk` request.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// ⏱️ How long we wait on one chunk before writing it off.
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
}

// -- 📦 500 docs per `_bulk` keeps requests comfortably under the default http.max_content_length
fn default_chunk_size() -> usize {
    500
}

fn default_chunk_timeout_secs() -> u64 {
    60
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<(), TallyError> {
        if self.chunk_size == 0 {
            return Err(config_error("loader.chunk_size must be at least 1"));
        }
        if self.chunk_timeout_secs == 0 {
            return Err(config_error("loader.chunk_timeout_secs must be at least 1"));
        }
        Ok(())
    }
}

/// 📊 The loader's report card.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSummary {
    pub accepted: usize,
    /// Rejected items plus every item of every failed chunk.
    pub failed: usize,
    pub chunks_submitted: usize,
    pub chunks_failed: usize,
    /// First rejection of each chunk that had any, for the post-mortem.
    pub first_rejections: Vec<Rejection>,
}

/// One chunk's fate. Either the store answered, or the chunk is gone.
#[derive(Debug)]
enum ChunkOutcome {
    Answered { index: usize, result: BulkResult, serialize_failures: Vec<Rejection> },
    Lost { index: usize, len: usize, error: StoreError },
}

/// 🧺 Pulls up to `size` items at a time from an iterator. The last basket may be light.
#[derive(Debug)]
pub struct Chunked<I> {
    inner: I,
    size: usize,
}

impl<I: Iterator> Iterator for Chunked<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk: Vec<I::Item> = self.inner.by_ref().take(self.size).collect();
        if chunk.is_empty() { None } else { Some(chunk) }
    }
}

/// Chunk any iterator. `size` must be non-zero; the loader validates that up front.
pub fn chunked<I: IntoIterator>(items: I, size: usize) -> Chunked<I::IntoIter> {
    Chunked {
        inner: items.into_iter(),
        size,
    }
}

/// 🚚 Ships documents into one collection, one chunk per request.
#[derive(Debug)]
pub struct BulkLoader<'s, S: SearchStore + ?Sized> {
    store: &'s S,
    collection: String,
    chunk_size: usize,
    chunk_timeout: Duration,
    parallelism: usize,
}

impl<'s, S: SearchStore + ?Sized> BulkLoader<'s, S> {
    /// 🏗️ Validates the chunking knobs before anyone touches the network.
    pub fn new(
        store: &'s S,
        collection: impl Into<String>,
        config: &LoaderConfig,
        parallelism: usize,
    ) -> Result<Self, TallyError> {
        config.validate()?;
        if parallelism == 0 {
            return Err(config_error("runtime.parallelism must be at least 1"));
        }
        Ok(Self {
            store,
            collection: collection.into(),
            chunk_size: config.chunk_size,
            chunk_timeout: Duration::from_secs(config.chunk_timeout_secs),
            parallelism,
        })
    }

    /// Override the per-chunk wait. Handy when seconds are too coarse.
    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    /// 🚀 Load everything. Never fails on a bad chunk, only reports it.
    pub async fn load<I, D>(&self, records: I) -> LoadSummary
    where
        I: IntoIterator<Item = D>,
        D: Document,
    {
        let records = records.into_iter();
        let expected = records.size_hint().1.unwrap_or(0) as u64;
        let mut progress = ProgressMetrics::new(format!("bulk → {}", self.collection), expected);
        let mut summary = LoadSummary::default();

        // -- 🧵 parallelism 1 degenerates to a plain sequential loop, in order, one round trip at a time
        let mut outcomes = futures::stream::iter(chunked(records, self.chunk_size).enumerate())
            .map(|(index, chunk)| self.submit(index, chunk))
            .buffer_unordered(self.parallelism);

        while let Some(outcome) = outcomes.next().await {
            summary.chunks_submitted += 1;
            match outcome {
                ChunkOutcome::Answered { index, result, serialize_failures } => {
                    let rejected = result.rejected.len() + serialize_failures.len();
                    summary.accepted += result.accepted;
                    summary.failed += rejected;
                    if let Some(first) = serialize_failures.into_iter().chain(result.rejected).next() {
                        warn!(
                            "⚠️ chunk {index} into '{}': {rejected} item(s) rejected, first was '{}': {}",
                            self.collection, first.id, first.reason
                        );
                        summary.first_rejections.push(first);
                    }
                    progress.update(result.accepted as u64 + rejected as u64, rejected as u64);
                }
                ChunkOutcome::Lost { index, len, error } => {
                    summary.chunks_failed += 1;
                    summary.failed += len;
                    warn!(
                        "💀 chunk {index} into '{}' lost whole ({len} records): {error}",
                        self.collection
                    );
                    progress.update(len as u64, len as u64);
                }
            }
        }
        progress.finish();

        info!(
            "📦 '{}': {} accepted, {} failed across {} chunk(s), {} chunk(s) lost",
            self.collection,
            summary.accepted,
            summary.failed,
            summary.chunks_submitted,
            summary.chunks_failed
        );
        summary
    }

    async fn submit<D: Document>(&self, index: usize, chunk: Vec<D>) -> ChunkOutcome {
        let len = chunk.len();
        let mut items = Vec::with_capacity(len);
        let mut serialize_failures = Vec::new();
        for doc in chunk {
            match serde_json::to_value(&doc) {
                Ok(payload) => items.push(BulkItem {
                    id: doc.doc_id().to_string(),
                    payload,
                }),
                Err(e) => serialize_failures.push(Rejection {
                    id: doc.doc_id().to_string(),
                    reason: format!("could not serialize record: {e}"),
                }),
            }
        }

        debug!("🚚 chunk {index}: {} records → '{}'", items.len(), self.collection);
        let call = self.store.bulk_write(&self.collection, items);
        match tokio::time::timeout(self.chunk_timeout, call).await {
            Ok(Ok(result)) => ChunkOutcome::Answered { index, result, serialize_failures },
            Ok(Err(error)) => ChunkOutcome::Lost { index, len, error },
            Err(_) => ChunkOutcome::Lost {
                index,
                len,
                error: StoreError::Timeout(format!(
                    "no acknowledgment within {:?}",
                    self.chunk_timeout
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde::Serialize;

    #[derive(Debug, Serialize)]
    struct Doc {
        id: String,
        n: usize,
    }

    impl Document for Doc {
        fn doc_id(&self) -> &str {
            &self.id
        }
    }

    fn the_docs(m: usize) -> impl Iterator<Item = Doc> {
        (0..m).map(|n| Doc { id: format!("doc-{n}"), n })
    }

    fn the_config(chunk_size: usize) -> LoaderConfig {
        LoaderConfig {
            chunk_size,
            ..LoaderConfig::default()
        }
    }

    #[test]
    fn the_one_where_chunks_are_full_except_maybe_the_last() {
        let the_sizes: Vec<usize> = chunked(0..11, 4).map(|c| c.len()).collect();
        assert_eq!(the_sizes, vec![4, 4, 3]);
        assert_eq!(chunked(0..0, 4).count(), 0);
        assert_eq!(chunked(0..8, 4).count(), 2);
    }

    #[tokio::test]
    async fn the_one_where_m_records_take_ceil_m_over_c_trips() -> anyhow::Result<()> {
        for (m, c) in [(0usize, 5usize), (1, 5), (10, 5), (11, 5), (1_234, 100), (7, 1)] {
            let the_store = InMemoryStore::new();
            let the_loader = BulkLoader::new(&the_store, "person", &the_config(c), 1)?;
            let the_summary = the_loader.load(the_docs(m)).await;
            let the_expected_trips = m.div_ceil(c);
            assert_eq!(the_store.bulk_calls(), the_expected_trips, "m={m} c={c}");
            assert_eq!(the_summary.chunks_submitted, the_expected_trips);
            assert_eq!(the_summary.accepted, m);
            assert_eq!(the_summary.failed, 0);
            assert_eq!(the_store.documents("person").await.len(), m);
        }
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_dead_chunk_does_not_stop_the_belt() -> anyhow::Result<()> {
        let the_store = InMemoryStore::new().with_failing_bulk_call(2);
        let the_loader = BulkLoader::new(&the_store, "person", &the_config(10), 1)?;
        let the_summary = the_loader.load(the_docs(35)).await;
        assert_eq!(the_store.bulk_calls(), 4, "every chunk submitted exactly once, no retries");
        assert_eq!(the_summary.chunks_failed, 1);
        assert_eq!(the_summary.failed, 10);
        assert_eq!(the_summary.accepted, 25);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_item_rejections_are_counted_not_escalated() -> anyhow::Result<()> {
        let the_store = InMemoryStore::new().with_rejected_id("doc-3");
        let the_loader = BulkLoader::new(&the_store, "person", &the_config(4), 1)?;
        let the_summary = the_loader.load(the_docs(8)).await;
        assert_eq!(the_summary.accepted, 7);
        assert_eq!(the_summary.failed, 1);
        assert_eq!(the_summary.chunks_failed, 0);
        assert_eq!(the_summary.first_rejections.len(), 1);
        assert_eq!(the_summary.first_rejections[0].id, "doc-3");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_slow_store_gets_written_off() -> anyhow::Result<()> {
        let the_store = InMemoryStore::new().with_bulk_delay(Duration::from_millis(200));
        let the_loader = BulkLoader::new(&the_store, "person", &the_config(5), 1)?
            .with_chunk_timeout(Duration::from_millis(20));
        let the_summary = the_loader.load(the_docs(10)).await;
        assert_eq!(the_summary.chunks_submitted, 2);
        assert_eq!(the_summary.chunks_failed, 2);
        assert_eq!(the_summary.failed, 10);
        assert_eq!(the_summary.accepted, 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_parallel_chunks_add_up_the_same() -> anyhow::Result<()> {
        let the_store = InMemoryStore::new().with_failing_bulk_call(3);
        let the_loader = BulkLoader::new(&the_store, "person", &the_config(7), 4)?;
        let the_summary = the_loader.load(the_docs(100)).await;
        assert_eq!(the_store.bulk_calls(), 15);
        assert_eq!(the_summary.chunks_submitted, 15);
        assert_eq!(the_summary.chunks_failed, 1);
        assert_eq!(the_summary.accepted + the_summary.failed, 100);
        Ok(())
    }

    #[test]
    fn the_one_where_zero_sized_chunks_are_refused_at_the_door() {
        let the_store = InMemoryStore::new();
        assert!(matches!(
            BulkLoader::new(&the_store, "person", &the_config(0), 1),
            Err(TallyError::Configuration(_))
        ));
        assert!(matches!(
            BulkLoader::new(&the_store, "person", &the_config(10), 0),
            Err(TallyError::Configuration(_))
        ));
    }
}
