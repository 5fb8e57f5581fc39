//! # Previously, on Tally...
//!
//! 🎬 The cluster was down. Or it was Tuesday and nobody wanted to start
//! Docker. Either way, someone needed a search store that lives entirely in
//! RAM, answers instantly, and can be told to fail on command.
//!
//! `InMemoryStore` models the same contract as the Elasticsearch backend:
//! term filters, scroll cursors that run dry and stay dry, nested member
//! aggregation with per-predicate counters. It also keeps a tally (ha) of
//! every call so tests can assert "exactly three page fetches" with a
//! straight face.
//!
//! ⚠️ Fault injection lives here too. Tell it which bulk call should drop the
//! connection, which aggregation should explode, or after how many page
//! fetches the cursor should expire. It will comply. It has no pride. 🦆

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::trace;

use super::{
    AggregationRequest, BulkItem, BulkResult, Cursor, HealthSummary, RawBucket, Rejection,
    ScrollPage, SearchStore, TermFilter,
};
use crate::error::StoreError;

/// Rewrites a bucket key on its way out: `(raw key, aggregate call number) -> key as reported`.
pub type KeyEncoder = fn(&str, usize) -> serde_json::Value;

#[derive(Debug, Default)]
struct ScrollState {
    remaining: VecDeque<String>,
    page_size: usize,
}

#[derive(Debug, Default)]
struct State {
    // -- 📚 BTreeMap so scroll order and aggregation order are stable across runs
    collections: HashMap<String, BTreeMap<String, serde_json::Value>>,
    scrolls: HashMap<String, ScrollState>,
    next_scroll_id: u64,
}

/// 📊 How many times each operation was called. Atomics, because `&self` is all we get.
#[derive(Debug, Default)]
struct CallCounts {
    bulk_writes: AtomicUsize,
    scroll_opens: AtomicUsize,
    scroll_fetches: AtomicUsize,
    aggregations: AtomicUsize,
}

#[derive(Debug, Default, Clone)]
struct Faults {
    /// 1-based bulk call numbers that fail with a transport error.
    failing_bulk_calls: HashSet<usize>,
    /// Ids the store "rejects" item-by-item inside an otherwise healthy bulk.
    rejected_ids: HashSet<String>,
    bulk_delay: Option<Duration>,
    /// 1-based aggregate call number that fails.
    failing_aggregate_call: Option<usize>,
    /// After this many page fetches, every cursor is forgotten.
    expire_scroll_after: Option<usize>,
    key_encoder: Option<KeyEncoder>,
}

/// 🧠 A search store that fits in a `HashMap`. Clone it freely; clones share state.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    calls: Arc<CallCounts>,
    faults: Faults,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 💥 Make the `call`-th bulk write (1-based) fail as if the connection dropped.
    pub fn with_failing_bulk_call(mut self, call: usize) -> Self {
        self.faults.failing_bulk_calls.insert(call);
        self
    }

    /// 🙅 Reject this id on every bulk write, while accepting its neighbours.
    pub fn with_rejected_id(mut self, id: impl Into<String>) -> Self {
        self.faults.rejected_ids.insert(id.into());
        self
    }

    /// 🐢 Sleep this long inside every bulk write.
    pub fn with_bulk_delay(mut self, delay: Duration) -> Self {
        self.faults.bulk_delay = Some(delay);
        self
    }

    /// 💥 Make the `call`-th aggregation (1-based) fail.
    pub fn with_failing_aggregate_call(mut self, call: usize) -> Self {
        self.faults.failing_aggregate_call = Some(call);
        self
    }

    /// 🕰️ Expire every cursor once this many page fetches have happened.
    pub fn with_scroll_expiring_after(mut self, fetches: usize) -> Self {
        self.faults.expire_scroll_after = Some(fetches);
        self
    }

    /// 🎭 Report bucket keys through `encoder`, to mimic a store with unstable key encodings.
    pub fn with_key_encoder(mut self, encoder: KeyEncoder) -> Self {
        self.faults.key_encoder = Some(encoder);
        self
    }

    pub fn bulk_calls(&self) -> usize {
        self.calls.bulk_writes.load(Ordering::SeqCst)
    }

    pub fn scroll_opens(&self) -> usize {
        self.calls.scroll_opens.load(Ordering::SeqCst)
    }

    pub fn scroll_fetches(&self) -> usize {
        self.calls.scroll_fetches.load(Ordering::SeqCst)
    }

    pub fn aggregate_calls(&self) -> usize {
        self.calls.aggregations.load(Ordering::SeqCst)
    }

    /// 🌱 Seed a document directly, skipping the bulk path.
    pub async fn insert(&self, collection: &str, id: impl Into<String>, doc: serde_json::Value) {
        self.state
            .lock()
            .await
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.into(), doc);
    }

    /// 🔎 Everything in a collection, in id order.
    pub async fn documents(&self, collection: &str) -> Vec<serde_json::Value> {
        self.state
            .lock()
            .await
            .collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// How many scroll contexts are still open store-side.
    pub async fn open_scrolls(&self) -> usize {
        self.state.lock().await.scrolls.len()
    }
}

#[async_trait]
impl SearchStore for InMemoryStore {
    async fn bulk_write(&self, collection: &str, items: Vec<BulkItem>) -> Result<BulkResult, StoreError> {
        let call = self.calls.bulk_writes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.faults.bulk_delay {
            tokio::time::sleep(delay).await;
        }
        if self.faults.failing_bulk_calls.contains(&call) {
            return Err(StoreError::Transport(format!(
                "connection reset during bulk call {call} (injected)"
            )));
        }

        let mut state = self.state.lock().await;
        let docs = state.collections.entry(collection.to_string()).or_default();
        let mut result = BulkResult::default();
        for item in items {
            if self.faults.rejected_ids.contains(&item.id) {
                result.rejected.push(Rejection {
                    reason: "mapper_parsing_exception: rejected by test fault".to_string(),
                    id: item.id,
                });
            } else {
                docs.insert(item.id, item.payload);
                result.accepted += 1;
            }
        }
        trace!(
            "📥 in-memory bulk #{call}: {} accepted, {} rejected",
            result.accepted,
            result.rejected.len()
        );
        Ok(result)
    }

    async fn open_scroll(
        &self,
        collection: &str,
        filter: &TermFilter,
        page_size: usize,
    ) -> Result<Cursor, StoreError> {
        self.calls.scroll_opens.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        let remaining: VecDeque<String> = state
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, doc)| filter.matches(doc))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();
        state.next_scroll_id += 1;
        let scroll_id = format!("mem-scroll-{}", state.next_scroll_id);
        state.scrolls.insert(
            scroll_id.clone(),
            ScrollState {
                remaining,
                page_size: page_size.max(1),
            },
        );
        Ok(Cursor::new(scroll_id, None))
    }

    async fn advance_scroll(&self, cursor: &mut Cursor) -> Result<ScrollPage, StoreError> {
        if cursor.exhausted {
            return Err(StoreError::CursorExhausted);
        }
        let fetch = self.calls.scroll_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.lock().await;

        if self.faults.expire_scroll_after.is_some_and(|limit| fetch > limit) {
            state.scrolls.remove(&cursor.scroll_id);
            return Err(StoreError::CursorExpired(cursor.scroll_id.clone()));
        }
        if let Some(ids) = cursor.pending.take() {
            if ids.is_empty() {
                cursor.exhausted = true;
            }
            return Ok(ScrollPage { ids });
        }

        let Some(scroll) = state.scrolls.get_mut(&cursor.scroll_id) else {
            return Err(StoreError::CursorExpired(cursor.scroll_id.clone()));
        };
        let take = scroll.page_size.min(scroll.remaining.len());
        let ids: Vec<String> = scroll.remaining.drain(..take).collect();
        if ids.is_empty() {
            cursor.exhausted = true;
            state.scrolls.remove(&cursor.scroll_id);
        }
        Ok(ScrollPage { ids })
    }

    async fn clear_scroll(&self, cursor: Cursor) -> Result<(), StoreError> {
        self.state.lock().await.scrolls.remove(&cursor.scroll_id);
        Ok(())
    }

    async fn aggregate(
        &self,
        collection: &str,
        request: &AggregationRequest,
    ) -> Result<Vec<RawBucket>, StoreError> {
        let call = self.calls.aggregations.fetch_add(1, Ordering::SeqCst) + 1;
        if self.faults.failing_aggregate_call == Some(call) {
            return Err(StoreError::Rejected {
                status: 500,
                body: format!("search_phase_execution_exception on aggregate call {call} (injected)"),
            });
        }

        let wanted: HashSet<&str> = request.member_ids.iter().map(String::as_str).collect();
        let state = self.state.lock().await;
        let mut buckets = Vec::new();
        for doc in state.collections.get(collection).into_iter().flat_map(|d| d.values()) {
            let matched: Vec<&serde_json::Value> = doc
                .get(&request.nested_path)
                .and_then(serde_json::Value::as_array)
                .into_iter()
                .flatten()
                .filter(|member| {
                    member
                        .get(&request.member_id_field)
                        .and_then(serde_json::Value::as_str)
                        .is_some_and(|id| wanted.contains(id))
                })
                .collect();
            if matched.is_empty() {
                continue;
            }
            let raw_key = match doc.get(&request.group_by_field) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => continue,
            };
            let key = match self.faults.key_encoder {
                Some(encode) => encode(&raw_key, call),
                None => serde_json::Value::String(raw_key),
            };
            let label = request
                .label_field
                .as_ref()
                .and_then(|field| doc.get(field))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);
            let counters = request
                .counters
                .iter()
                .map(|predicate| matched.iter().filter(|m| predicate.matches(m)).count() as u64)
                .collect();
            buckets.push(RawBucket {
                key,
                label,
                total: matched.len() as u64,
                counters,
            });
        }

        if buckets.len() > request.max_buckets {
            return Err(StoreError::BucketLimitExceeded {
                limit: request.max_buckets,
                left_out: (buckets.len() - request.max_buckets) as u64,
            });
        }
        Ok(buckets)
    }

    async fn health(&self) -> Result<HealthSummary, StoreError> {
        let state = self.state.lock().await;
        Ok(HealthSummary {
            cluster_name: "in-memory".to_string(),
            status: "green".to_string(),
            number_of_nodes: 1,
            active_shards: state.collections.len() as u64,
            unassigned_shards: 0,
        })
    }

    async fn ensure_collection(
        &self,
        collection: &str,
        _mapping: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.collections.contains_key(collection) {
            return Ok(false);
        }
        state.collections.insert(collection.to_string(), BTreeMap::new());
        Ok(true)
    }

    async fn sample_records(
        &self,
        collection: &str,
        size: usize,
    ) -> Result<Vec<serde_json::Value>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .collections
            .get(collection)
            .map(|docs| docs.values().take(size).cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, collection: &str, filter: &TermFilter) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .collections
            .get(collection)
            .map(|docs| docs.values().filter(|doc| filter.matches(doc)).count() as u64)
            .unwrap_or(0))
    }
}
