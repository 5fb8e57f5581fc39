//! 🔌 The Store: the external search engine, seen through a keyhole.
//!
//! 🚰 We do not index. We do not score. We do not speak the wire protocol in
//! our sleep. We ask a search store to do all of that, through one trait,
//! and we pretend not to care which store is on the other end.
//!
//! 🎭 Two actors audition for the role:
//! - `ElasticsearchStore`: the real thing, over HTTP, with all its moods.
//! - `InMemoryStore`: a stand-in that lives in RAM, counts its calls, and
//!   fails on cue when a test asks it to.
//!
//! `StoreBackend` is the casting agency. The pipeline holds one, borrows it
//! into every component, and drops it when the run ends, failure or not. 🦆

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub mod elasticsearch;
pub mod in_mem;

pub use elasticsearch::{ElasticsearchStore, ElasticsearchStoreConfig};
pub use in_mem::InMemoryStore;

// ===== Requests and responses =====

/// 📦 One item in a bulk write: an id and the JSON it should become.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    pub id: String,
    pub payload: serde_json::Value,
}

/// 🙅 One rejected item, and the reason the store gave for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub id: String,
    pub reason: String,
}

/// ✅ What came back from one bulk write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResult {
    pub accepted: usize,
    pub rejected: Vec<Rejection>,
}

/// 🎯 An exact-match constraint value. Untagged so TOML can say `rep = 10` or `region = "Porto"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TermValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl TermValue {
    /// Does a stored JSON value satisfy this exact match?
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match (self, value) {
            (TermValue::Int(want), serde_json::Value::Number(n)) => n.as_i64() == Some(*want),
            (TermValue::Bool(want), serde_json::Value::Bool(b)) => want == b,
            (TermValue::Str(want), serde_json::Value::String(s)) => want == s,
            _ => false,
        }
    }
}

impl From<&TermValue> for serde_json::Value {
    fn from(value: &TermValue) -> Self {
        match value {
            TermValue::Int(i) => serde_json::Value::from(*i),
            TermValue::Bool(b) => serde_json::Value::from(*b),
            TermValue::Str(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

/// 🔍 A conjunction of exact-match term constraints. Empty means "match everything".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TermFilter {
    pub terms: BTreeMap<String, TermValue>,
}

impl TermFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style `and`. `TermFilter::new().and("rep", 10).and("rep_office", 11)`.
    pub fn and(mut self, field: impl Into<String>, value: impl Into<TermValue>) -> Self {
        self.terms.insert(field.into(), value.into());
        self
    }

    pub fn matches(&self, doc: &serde_json::Value) -> bool {
        self.terms
            .iter()
            .all(|(field, want)| doc.get(field).is_some_and(|v| want.matches(v)))
    }
}

impl From<i64> for TermValue {
    fn from(value: i64) -> Self {
        TermValue::Int(value)
    }
}

impl From<&str> for TermValue {
    fn from(value: &str) -> Self {
        TermValue::Str(value.to_string())
    }
}

impl From<bool> for TermValue {
    fn from(value: bool) -> Self {
        TermValue::Bool(value)
    }
}

/// 🕰️ An open scroll. Opaque to callers; only the store that minted it reads the insides.
///
/// `pending` holds a first page the store already fetched while opening the
/// cursor. The first `advance_scroll` hands it over without another round trip.
#[derive(Debug, Clone)]
pub struct Cursor {
    pub(crate) scroll_id: String,
    pub(crate) pending: Option<Vec<String>>,
    pub(crate) exhausted: bool,
}

impl Cursor {
    pub(crate) fn new(scroll_id: String, pending: Option<Vec<String>>) -> Self {
        Self {
            scroll_id,
            pending,
            exhausted: false,
        }
    }

    /// Has the store already reported an empty page on this cursor?
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

/// 📄 One page of a scroll: the ids of the hits on it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrollPage {
    pub ids: Vec<String>,
}

impl ScrollPage {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// 🧮 A member-level predicate that gets its own counter in every bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum CounterPredicate {
    /// `field > value` on an integer field.
    GreaterThan { field: String, value: i64 },
    /// `field > date` on a date field, compared at day resolution.
    DateAfter { field: String, date: NaiveDate },
}

impl CounterPredicate {
    pub fn field(&self) -> &str {
        match self {
            CounterPredicate::GreaterThan { field, .. } | CounterPredicate::DateAfter { field, .. } => {
                field
            }
        }
    }

    /// Evaluate against one nested member object.
    pub fn matches(&self, member: &serde_json::Value) -> bool {
        match self {
            CounterPredicate::GreaterThan { field, value } => member
                .get(field)
                .and_then(serde_json::Value::as_i64)
                .is_some_and(|v| v > *value),
            CounterPredicate::DateAfter { field, date } => member
                .get(field)
                .and_then(serde_json::Value::as_str)
                .and_then(|s| s.get(..10))
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                .is_some_and(|d| d > *date),
        }
    }
}

/// 📊 One aggregation query: bucket `group_by_field`, but only count nested members
/// of `nested_path` whose `member_id_field` is in `member_ids`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationRequest {
    pub group_by_field: String,
    pub label_field: Option<String>,
    pub nested_path: String,
    pub member_id_field: String,
    pub member_ids: Vec<String>,
    pub counters: Vec<CounterPredicate>,
    pub max_buckets: usize,
}

/// 🪣 One bucket as the store reports it. `key` is raw: the store decides its encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBucket {
    pub key: serde_json::Value,
    pub label: Option<String>,
    pub total: u64,
    /// Aligned with `AggregationRequest::counters`.
    pub counters: Vec<u64>,
}

/// 🩺 Cluster health, the short version.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HealthSummary {
    pub cluster_name: String,
    pub status: String,
    #[serde(default)]
    pub number_of_nodes: u64,
    #[serde(default)]
    pub active_shards: u64,
    #[serde(default)]
    pub unassigned_shards: u64,
}

// ===== The trait =====

/// 🔌 The search store, as far as tally is concerned.
///
/// # Contract
/// - `bulk_write` may accept some items and reject others. A transport failure
///   is an `Err`; per-item rejections are data, not errors.
/// - `open_scroll` hands back a cursor. `advance_scroll` returns pages until one
///   is empty; after that the cursor is spent and advancing it is an error.
/// - Every `advance_scroll` refreshes the cursor's keep-alive window.
/// - `aggregate` returns one raw bucket per group touched by the member ids.
#[async_trait]
pub trait SearchStore: fmt::Debug + Send + Sync {
    async fn bulk_write(&self, collection: &str, items: Vec<BulkItem>) -> Result<BulkResult, StoreError>;

    async fn open_scroll(
        &self,
        collection: &str,
        filter: &TermFilter,
        page_size: usize,
    ) -> Result<Cursor, StoreError>;

    async fn advance_scroll(&self, cursor: &mut Cursor) -> Result<ScrollPage, StoreError>;

    /// Release the store-side context early. Best effort; expiry cleans up otherwise.
    async fn clear_scroll(&self, cursor: Cursor) -> Result<(), StoreError>;

    async fn aggregate(
        &self,
        collection: &str,
        request: &AggregationRequest,
    ) -> Result<Vec<RawBucket>, StoreError>;

    async fn health(&self) -> Result<HealthSummary, StoreError>;

    /// Create the collection with `mapping` unless it already exists. Returns true if created.
    async fn ensure_collection(
        &self,
        collection: &str,
        mapping: &serde_json::Value,
    ) -> Result<bool, StoreError>;

    /// Up to `size` raw documents from the collection, in whatever order the store likes.
    async fn sample_records(
        &self,
        collection: &str,
        size: usize,
    ) -> Result<Vec<serde_json::Value>, StoreError>;

    async fn count(&self, collection: &str, filter: &TermFilter) -> Result<u64, StoreError>;
}

/// 🎭 The many faces of a store. Enum dispatch, no vtables, no surprises.
#[derive(Debug)]
pub enum StoreBackend {
    Elasticsearch(ElasticsearchStore),
    InMemory(InMemoryStore),
}

#[async_trait]
impl SearchStore for StoreBackend {
    async fn bulk_write(&self, collection: &str, items: Vec<BulkItem>) -> Result<BulkResult, StoreError> {
        match self {
            StoreBackend::Elasticsearch(es) => es.bulk_write(collection, items).await,
            StoreBackend::InMemory(mem) => mem.bulk_write(collection, items).await,
        }
    }

    async fn open_scroll(
        &self,
        collection: &str,
        filter: &TermFilter,
        page_size: usize,
    ) -> Result<Cursor, StoreError> {
        match self {
            StoreBackend::Elasticsearch(es) => es.open_scroll(collection, filter, page_size).await,
            StoreBackend::InMemory(mem) => mem.open_scroll(collection, filter, page_size).await,
        }
    }

    async fn advance_scroll(&self, cursor: &mut Cursor) -> Result<ScrollPage, StoreError> {
        match self {
            StoreBackend::Elasticsearch(es) => es.advance_scroll(cursor).await,
            StoreBackend::InMemory(mem) => mem.advance_scroll(cursor).await,
        }
    }

    async fn clear_scroll(&self, cursor: Cursor) -> Result<(), StoreError> {
        match self {
            StoreBackend::Elasticsearch(es) => es.clear_scroll(cursor).await,
            StoreBackend::InMemory(mem) => mem.clear_scroll(cursor).await,
        }
    }

    async fn aggregate(
        &self,
        collection: &str,
        request: &AggregationRequest,
    ) -> Result<Vec<RawBucket>, StoreError> {
        match self {
            StoreBackend::Elasticsearch(es) => es.aggregate(collection, request).await,
            StoreBackend::InMemory(mem) => mem.aggregate(collection, request).await,
        }
    }

    async fn health(&self) -> Result<HealthSummary, StoreError> {
        match self {
            StoreBackend::Elasticsearch(es) => es.health().await,
            StoreBackend::InMemory(mem) => mem.health().await,
        }
    }

    async fn ensure_collection(
        &self,
        collection: &str,
        mapping: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        match self {
            StoreBackend::Elasticsearch(es) => es.ensure_collection(collection, mapping).await,
            StoreBackend::InMemory(mem) => mem.ensure_collection(collection, mapping).await,
        }
    }

    async fn sample_records(
        &self,
        collection: &str,
        size: usize,
    ) -> Result<Vec<serde_json::Value>, StoreError> {
        match self {
            StoreBackend::Elasticsearch(es) => es.sample_records(collection, size).await,
            StoreBackend::InMemory(mem) => mem.sample_records(collection, size).await,
        }
    }

    async fn count(&self, collection: &str, filter: &TermFilter) -> Result<u64, StoreError> {
        match self {
            StoreBackend::Elasticsearch(es) => es.count(collection, filter).await,
            StoreBackend::InMemory(mem) => mem.count(collection, filter).await,
        }
    }
}
