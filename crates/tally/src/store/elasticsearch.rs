//! # 📡 THE ELASTICSEARCH STORE
//!
//! *Previously, on Tally...*
//!
//! 🎬 COLD OPEN. INT. SERVER ROOM, 3:47 AM
//!
//! The dashboard glows amber. Somebody asked how many people over 35 sit in
//! each of five thousand groups, filtered by office and rep, and they asked it
//! about a million and a half people. The cluster sighed. Then it scrolled.
//!
//! 🚀 This module speaks just enough of the Elasticsearch REST dialect to do
//! our bidding: `_bulk` for writes, `_search?scroll` plus `_search/scroll` for
//! cursors, a nested filtered terms aggregation for the counting, and
//! `_cluster/health` for the "is anyone home" question.
//!
//! ⚠️ Auth priority is API key first, then basic auth, then hope.
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, trace};

use super::{
    AggregationRequest, BulkItem, BulkResult, CounterPredicate, Cursor, HealthSummary, RawBucket,
    Rejection, ScrollPage, SearchStore, TermFilter,
};
use crate::error::StoreError;

// 📡 ElasticsearchStoreConfig: "It's just Elasticsearch", she said, before the cluster went red.
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchStoreConfig {
    /// 📡 Scheme, host and port. All of it. `localhost` alone is a cry for help.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 Wins over basic auth when both are set.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 🕰️ How long the store keeps a scroll context alive between page fetches.
    #[serde(default = "default_scroll_keep_alive")]
    pub scroll_keep_alive: String,
    /// 🫁 Gzip `_bulk` bodies. Bandwidth is expensive and bytes are squishy.
    #[serde(default)]
    pub compress_requests: bool,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

// -- ⏱️ bulk requests can be meaty, so the read timeout is generous
fn default_request_timeout_secs() -> u64 {
    60
}

fn default_scroll_keep_alive() -> String {
    "1m".to_string()
}

impl ElasticsearchStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            api_key: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            scroll_keep_alive: default_scroll_keep_alive(),
            compress_requests: false,
        }
    }
}

/// 📡 The real store. One `reqwest::Client`, reused for every round trip.
#[derive(Debug)]
pub struct ElasticsearchStore {
    client: reqwest::Client,
    config: ElasticsearchStoreConfig,
}

// ===== Response shapes, only the bits we read =====

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItemResponse>>,
}

#[derive(Debug, Deserialize)]
struct BulkItemResponse {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AggregationResponse {
    aggregations: Option<AggregationBody>,
}

#[derive(Debug, Deserialize)]
struct AggregationBody {
    groups: GroupsAggregation,
}

#[derive(Debug, Deserialize)]
struct GroupsAggregation {
    #[serde(default)]
    sum_other_doc_count: u64,
    #[serde(default)]
    buckets: Vec<GroupBucket>,
}

#[derive(Debug, Deserialize)]
struct GroupBucket {
    key: serde_json::Value,
    #[serde(default)]
    group_label: Option<serde_json::Value>,
    members: MembersAggregation,
}

#[derive(Debug, Deserialize)]
struct MembersAggregation {
    matched: MatchedAggregation,
}

#[derive(Debug, Deserialize)]
struct MatchedAggregation {
    doc_count: u64,
    // -- 🧮 counter_0, counter_1, ... plus whatever else ES feels like telling us
    #[serde(flatten)]
    rest: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

/// 🔍 Term filter to query DSL. No terms means match_all.
fn filter_query(filter: &TermFilter) -> serde_json::Value {
    if filter.terms.is_empty() {
        return json!({"match_all": {}});
    }
    let clauses: Vec<serde_json::Value> = filter
        .terms
        .iter()
        .map(|(field, value)| json!({"term": {field: serde_json::Value::from(value)}}))
        .collect();
    json!({"bool": {"filter": clauses}})
}

fn counter_clause(nested_path: &str, predicate: &CounterPredicate) -> serde_json::Value {
    let field = format!("{nested_path}.{}", predicate.field());
    match predicate {
        CounterPredicate::GreaterThan { value, .. } => json!({"range": {field: {"gt": value}}}),
        CounterPredicate::DateAfter { date, .. } => {
            json!({"range": {field: {"gt": date.format("%Y-%m-%d").to_string()}}})
        }
    }
}

/// 🏗️ The nested, filtered, bucketed query body. The ids appear twice: once to pick
/// which groups are worth bucketing, once to pick which members inside them count.
fn aggregation_body(request: &AggregationRequest) -> serde_json::Value {
    let id_field = format!("{}.{}", request.nested_path, request.member_id_field);
    let member_terms = json!({"terms": {id_field: request.member_ids}});

    let mut counter_aggs = serde_json::Map::new();
    for (i, predicate) in request.counters.iter().enumerate() {
        counter_aggs.insert(
            format!("counter_{i}"),
            json!({"filter": counter_clause(&request.nested_path, predicate)}),
        );
    }

    let mut group_aggs = json!({
        "members": {
            "nested": {"path": request.nested_path},
            "aggs": {
                "matched": {
                    "filter": member_terms,
                    "aggs": counter_aggs
                }
            }
        }
    });
    if let Some(label_field) = &request.label_field {
        group_aggs["group_label"] = json!({
            "top_hits": {"size": 1, "_source": {"includes": [label_field]}}
        });
    }

    json!({
        "size": 0,
        "query": {
            "nested": {
                "path": request.nested_path,
                "query": member_terms
            }
        },
        "aggs": {
            "groups": {
                "terms": {"field": request.group_by_field, "size": request.max_buckets},
                "aggs": group_aggs
            }
        }
    })
}

fn rejection_reason(error: &serde_json::Value) -> String {
    match (
        error.get("type").and_then(serde_json::Value::as_str),
        error.get("reason").and_then(serde_json::Value::as_str),
    ) {
        (Some(kind), Some(reason)) => format!("{kind}: {reason}"),
        (Some(kind), None) => kind.to_string(),
        _ => error.to_string(),
    }
}

impl ElasticsearchStore {
    /// 🚀 Build the client with the configured timeouts. No network traffic yet.
    pub fn new(config: ElasticsearchStoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                StoreError::Transport(format!(
                    "💀 The HTTP client refused to be born. Probably TLS. Either way: tragic. ({e})"
                ))
            })?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        // -- 🧹 one slash of difference, infinite suffering of difference
        format!("{}/{}", self.config.url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {api_key}"))
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    /// 📡 Send, check the status, decode the body. Non-2xx becomes `Rejected` with the body attached.
    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, StoreError> {
        let response = self.authed(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    fn bulk_body(collection: &str, items: &[BulkItem]) -> String {
        let mut body = String::with_capacity(items.len() * 256);
        for item in items {
            let action = json!({"index": {"_index": collection, "_id": item.id}});
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&item.payload.to_string());
            body.push('\n');
        }
        body
    }
}

#[async_trait]
impl SearchStore for ElasticsearchStore {
    async fn bulk_write(&self, collection: &str, items: Vec<BulkItem>) -> Result<BulkResult, StoreError> {
        let body = Self::bulk_body(collection, &items);
        debug!(
            "📡 Sending {} docs ({} bytes) to /_bulk for '{collection}'",
            items.len(),
            body.len()
        );

        let request = self
            .client
            .post(self.url("_bulk"))
            .header("Content-Type", "application/x-ndjson");
        let request = if self.config.compress_requests {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
            encoder
                .write_all(body.as_bytes())
                .and_then(|_| encoder.flush())
                .map_err(|e| StoreError::Transport(format!("gzip of bulk body failed: {e}")))?;
            let squished = encoder
                .finish()
                .map_err(|e| StoreError::Transport(format!("gzip of bulk body failed: {e}")))?;
            request.header("Content-Encoding", "gzip").body(squished)
        } else {
            request.body(body)
        };

        let response: BulkResponse = self.send_json(request).await?;
        let mut result = BulkResult::default();
        for (position, entry) in response.items.into_iter().enumerate() {
            // -- 🎯 one key per entry ("index" for us), we don't care which
            let Some(item) = entry.into_values().next() else {
                continue;
            };
            if (200..300).contains(&item.status) {
                result.accepted += 1;
            } else {
                let id = item
                    .id
                    .or_else(|| items.get(position).map(|i| i.id.clone()))
                    .unwrap_or_default();
                let reason = item
                    .error
                    .as_ref()
                    .map(rejection_reason)
                    .unwrap_or_else(|| format!("status {}", item.status));
                result.rejected.push(Rejection { id, reason });
            }
        }
        if response.errors {
            trace!("⚠️ bulk response flagged errors: {} item(s) rejected", result.rejected.len());
        }
        Ok(result)
    }

    async fn open_scroll(
        &self,
        collection: &str,
        filter: &TermFilter,
        page_size: usize,
    ) -> Result<Cursor, StoreError> {
        let url = self.url(&format!(
            "{collection}/_search?scroll={}",
            self.config.scroll_keep_alive
        ));
        let body = json!({
            "size": page_size,
            "query": filter_query(filter),
            "_source": false,
            "sort": ["_doc"]
        });
        let response: SearchResponse = self.send_json(self.client.post(url).json(&body)).await?;
        let scroll_id = response.scroll_id.ok_or_else(|| {
            StoreError::Decode("search response carried no _scroll_id".to_string())
        })?;
        let first_page = response.hits.hits.into_iter().map(|h| h.id).collect();
        Ok(Cursor::new(scroll_id, Some(first_page)))
    }

    async fn advance_scroll(&self, cursor: &mut Cursor) -> Result<ScrollPage, StoreError> {
        if cursor.exhausted {
            return Err(StoreError::CursorExhausted);
        }
        // -- 📦 the first page rode in with open_scroll, no second trip for it
        if let Some(ids) = cursor.pending.take() {
            if ids.is_empty() {
                cursor.exhausted = true;
            }
            return Ok(ScrollPage { ids });
        }

        let body = json!({
            "scroll": self.config.scroll_keep_alive,
            "scroll_id": cursor.scroll_id
        });
        let request = self.client.post(self.url("_search/scroll")).json(&body);
        let response: SearchResponse = match self.send_json(request).await {
            Ok(r) => r,
            Err(StoreError::Rejected { status: 404, body }) => {
                return Err(StoreError::CursorExpired(body));
            }
            Err(other) => return Err(other),
        };
        if let Some(next_id) = response.scroll_id {
            cursor.scroll_id = next_id;
        }
        let ids: Vec<String> = response.hits.hits.into_iter().map(|h| h.id).collect();
        if ids.is_empty() {
            cursor.exhausted = true;
        }
        Ok(ScrollPage { ids })
    }

    async fn clear_scroll(&self, cursor: Cursor) -> Result<(), StoreError> {
        let body = json!({"scroll_id": [cursor.scroll_id]});
        let response = self
            .authed(self.client.delete(self.url("_search/scroll")).json(&body))
            .send()
            .await?;
        let status = response.status();
        // -- 🗑️ 404 means the store already let it go. same outcome, less ceremony.
        if status.is_success() || status.as_u16() == 404 {
            Ok(())
        } else {
            Err(StoreError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }

    async fn aggregate(
        &self,
        collection: &str,
        request: &AggregationRequest,
    ) -> Result<Vec<RawBucket>, StoreError> {
        let url = self.url(&format!("{collection}/_search"));
        let body = aggregation_body(request);
        let response: AggregationResponse = self.send_json(self.client.post(url).json(&body)).await?;
        let Some(aggregations) = response.aggregations else {
            // -- 💤 no matching groups at all: ES may skip the aggregations block
            return Ok(Vec::new());
        };
        let groups = aggregations.groups;
        if groups.sum_other_doc_count > 0 {
            return Err(StoreError::BucketLimitExceeded {
                limit: request.max_buckets,
                left_out: groups.sum_other_doc_count,
            });
        }

        groups
            .buckets
            .into_iter()
            .map(|bucket| {
                let counters = (0..request.counters.len())
                    .map(|i| {
                        bucket
                            .members
                            .matched
                            .rest
                            .get(&format!("counter_{i}"))
                            .and_then(|c| c.get("doc_count"))
                            .and_then(serde_json::Value::as_u64)
                            .ok_or_else(|| {
                                StoreError::Decode(format!(
                                    "bucket {} is missing counter_{i}",
                                    bucket.key
                                ))
                            })
                    })
                    .collect::<Result<Vec<u64>, StoreError>>()?;
                let label = match (&request.label_field, &bucket.group_label) {
                    (Some(field), Some(top_hits)) => top_hits
                        .pointer(&format!("/hits/hits/0/_source/{field}"))
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string),
                    _ => None,
                };
                Ok(RawBucket {
                    key: bucket.key,
                    label,
                    total: bucket.members.matched.doc_count,
                    counters,
                })
            })
            .collect()
    }

    async fn health(&self) -> Result<HealthSummary, StoreError> {
        self.send_json(self.client.get(self.url("_cluster/health"))).await
    }

    async fn ensure_collection(
        &self,
        collection: &str,
        mapping: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let url = self.url(collection);
        let exists = self.authed(self.client.head(&url)).send().await?;
        match exists.status().as_u16() {
            200 => {
                debug!("✅ Collection '{collection}' already exists, welcome mat is out");
                Ok(false)
            }
            404 => {
                let _: serde_json::Value = self.send_json(self.client.put(&url).json(mapping)).await?;
                debug!("🏗️ Created collection '{collection}'");
                Ok(true)
            }
            status => Err(StoreError::Rejected {
                status,
                body: format!("unexpected status checking for collection '{collection}'"),
            }),
        }
    }

    async fn sample_records(
        &self,
        collection: &str,
        size: usize,
    ) -> Result<Vec<serde_json::Value>, StoreError> {
        let url = self.url(&format!("{collection}/_search"));
        let body = json!({"size": size, "query": {"match_all": {}}});
        let response: SearchResponse = self.send_json(self.client.post(url).json(&body)).await?;
        Ok(response
            .hits
            .hits
            .into_iter()
            .filter_map(|h| h.source)
            .collect())
    }

    async fn count(&self, collection: &str, filter: &TermFilter) -> Result<u64, StoreError> {
        let url = self.url(&format!("{collection}/_count"));
        let body = json!({"query": filter_query(filter)});
        let response: CountResponse = self.send_json(self.client.post(url).json(&body)).await?;
        Ok(response.count)
    }
}
