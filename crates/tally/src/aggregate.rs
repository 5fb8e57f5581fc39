//! 🧮 The Batch Aggregator: count in pieces, add up the pieces, trust nothing in between.
//!
//! 🎬 COLD OPEN. INT. ACCOUNTING, QUARTER END
//!
//! A million matched people. The store will only take 65 536 of them per terms
//! clause. So we slice the ids into sub-batches, ask the store to bucket each
//! slice by group, and add the buckets together. A group whose members got
//! split across three slices shows up three times with partial counts, and
//! only the sum is the truth. No single sub-batch answer is ever final.
//!
//! ⚠️ If one sub-batch query fails, the whole run fails. Dropping a slice
//! would quietly under-count every group that had members in it, and quiet
//! under-counting is the worst kind of wrong.
//!
//! 🔑 Bucket keys are normalized before merging, so a store that answers
//! with "ABC-..." on one call and "abc-..." on the next still yields one
//! group, not two half-groups. 🦆

use std::collections::{BTreeMap, HashMap};
use std::ops::AddAssign;
use std::path::PathBuf;

use async_channel::Receiver;
use chrono::NaiveDate;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{StoreError, TallyError, config_error};
use crate::progress::ProgressMetrics;
use crate::store::{AggregationRequest, CounterPredicate, RawBucket, SearchStore, TermFilter};

/// 🚧 Elasticsearch's default `index.max_terms_count`. One terms clause, at most this many ids.
pub const MAX_TERMS_CLAUSE: usize = 65_536;

/// The name a group gets when the store won't tell us its real one.
pub const UNKNOWN_GROUP: &str = "Unknown Group";

const GROUP_BY_FIELD: &str = "group_id";
const GROUP_LABEL_FIELD: &str = "group_name";
const MEMBERS_PATH: &str = "person_list";
const MEMBER_ID_FIELD: &str = "id";

#[derive(Debug, Deserialize, Clone)]
pub struct AggregateConfig {
    /// 🔍 Which people count at all. Default: `rep_office = 11 AND rep = 10`.
    #[serde(default = "default_person_filter")]
    pub person_filter: TermFilter,
    /// 🚧 Sub-batch size; bounded by the store's terms-clause limit.
    #[serde(default = "default_max_terms_per_query")]
    pub max_terms_per_query: usize,
    /// 🪣 Bucket budget per sub-batch query.
    #[serde(default = "default_max_groups_per_query")]
    pub max_groups_per_query: usize,
    /// Feeds `count_age_gt_35`: members strictly older than this.
    #[serde(default = "default_age_cutoff")]
    pub age_cutoff: i64,
    /// Feeds `count_birthday_after_2000`: members born strictly after this day.
    #[serde(default = "default_birthday_after")]
    pub birthday_after: NaiveDate,
    #[serde(default = "default_output")]
    pub output: PathBuf,
    /// 🚰 Overlap scrolling and aggregating through a bounded channel.
    #[serde(default)]
    pub streaming: bool,
}

fn default_person_filter() -> TermFilter {
    TermFilter::new().and("rep_office", 11).and("rep", 10)
}

fn default_max_terms_per_query() -> usize {
    MAX_TERMS_CLAUSE
}

fn default_max_groups_per_query() -> usize {
    10_000
}

fn default_age_cutoff() -> i64 {
    35
}

fn default_birthday_after() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

fn default_output() -> PathBuf {
    PathBuf::from("group_statistics.json")
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            person_filter: default_person_filter(),
            max_terms_per_query: default_max_terms_per_query(),
            max_groups_per_query: default_max_groups_per_query(),
            age_cutoff: default_age_cutoff(),
            birthday_after: default_birthday_after(),
            output: default_output(),
            streaming: false,
        }
    }
}

impl AggregateConfig {
    pub fn validate(&self) -> Result<(), TallyError> {
        if self.max_terms_per_query == 0 || self.max_terms_per_query > MAX_TERMS_CLAUSE {
            return Err(config_error(format!(
                "aggregate.max_terms_per_query must be between 1 and {MAX_TERMS_CLAUSE}, got {}",
                self.max_terms_per_query
            )));
        }
        if self.max_groups_per_query == 0 {
            return Err(config_error("aggregate.max_groups_per_query must be at least 1"));
        }
        Ok(())
    }
}

/// 🪣 One group's counters. Field names are the artifact's field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCounts {
    pub group_name: String,
    pub total_count: u64,
    pub count_age_gt_35: u64,
    pub count_birthday_after_2000: u64,
}

impl GroupCounts {
    pub fn new(group_name: Option<String>, total: u64, age: u64, birthday: u64) -> Self {
        Self {
            group_name: group_name.unwrap_or_else(|| UNKNOWN_GROUP.to_string()),
            total_count: total,
            count_age_gt_35: age,
            count_birthday_after_2000: birthday,
        }
    }
}

impl AddAssign<&GroupCounts> for GroupCounts {
    fn add_assign(&mut self, other: &GroupCounts) {
        // -- 📈 saturating so the counters only ever go up, even at the edge of u64
        self.total_count = self.total_count.saturating_add(other.total_count);
        self.count_age_gt_35 = self.count_age_gt_35.saturating_add(other.count_age_gt_35);
        self.count_birthday_after_2000 = self
            .count_birthday_after_2000
            .saturating_add(other.count_birthday_after_2000);
        if self.group_name == UNKNOWN_GROUP && other.group_name != UNKNOWN_GROUP {
            self.group_name.clone_from(&other.group_name);
        }
    }
}

/// 🗺️ group id → counters, summed across every sub-batch that touched the group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedAggregateMap {
    groups: HashMap<String, GroupCounts>,
}

impl MergedAggregateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&GroupCounts> {
        self.groups.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &GroupCounts)> {
        self.groups.iter()
    }

    /// New key: insert verbatim. Known key: add element-wise.
    pub fn merge_bucket(&mut self, key: String, counts: GroupCounts) {
        match self.groups.get_mut(&key) {
            Some(existing) => *existing += &counts,
            None => {
                self.groups.insert(key, counts);
            }
        }
    }

    /// Fold a whole sub-batch result in. Commutative and associative, so order never matters.
    pub fn merge(&mut self, other: MergedAggregateMap) {
        for (key, counts) in other.groups {
            self.merge_bucket(key, counts);
        }
    }

    pub fn total_members(&self) -> u64 {
        self.groups.values().map(|g| g.total_count).sum()
    }

    /// Key-sorted view, for stable artifacts and tables.
    pub fn sorted(&self) -> BTreeMap<&str, &GroupCounts> {
        self.groups.iter().map(|(k, v)| (k.as_str(), v)).collect()
    }
}

impl FromIterator<(String, GroupCounts)> for MergedAggregateMap {
    fn from_iter<T: IntoIterator<Item = (String, GroupCounts)>>(iter: T) -> Self {
        let mut map = MergedAggregateMap::new();
        for (key, counts) in iter {
            map.merge_bucket(key, counts);
        }
        map
    }
}

/// 🔑 One canonical spelling per group. UUID-shaped keys become lowercase hyphenated,
/// numbers become decimal strings, everything else is trimmed.
pub fn normalize_key(raw: &serde_json::Value) -> String {
    match raw {
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            match Uuid::parse_str(trimmed) {
                Ok(uuid) => uuid.hyphenated().to_string(),
                Err(_) => trimmed.to_string(),
            }
        }
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// 🧮 Slices ids into sub-batches, queries each, merges everything.
#[derive(Debug)]
pub struct BatchAggregator<'s, S: SearchStore + ?Sized> {
    store: &'s S,
    collection: String,
    max_terms: usize,
    max_groups: usize,
    counters: Vec<CounterPredicate>,
    parallelism: usize,
}

impl<'s, S: SearchStore + ?Sized> BatchAggregator<'s, S> {
    pub fn new(
        store: &'s S,
        collection: impl Into<String>,
        config: &AggregateConfig,
        parallelism: usize,
    ) -> Result<Self, TallyError> {
        config.validate()?;
        if parallelism == 0 {
            return Err(config_error("runtime.parallelism must be at least 1"));
        }
        Ok(Self {
            store,
            collection: collection.into(),
            max_terms: config.max_terms_per_query,
            max_groups: config.max_groups_per_query,
            // -- 🎯 order matters: counters[0] is the age one, counters[1] the birthday one
            counters: vec![
                CounterPredicate::GreaterThan {
                    field: "age".to_string(),
                    value: config.age_cutoff,
                },
                CounterPredicate::DateAfter {
                    field: "birthday".to_string(),
                    date: config.birthday_after,
                },
            ],
            parallelism,
        })
    }

    fn request(&self, member_ids: Vec<String>) -> AggregationRequest {
        AggregationRequest {
            group_by_field: GROUP_BY_FIELD.to_string(),
            label_field: Some(GROUP_LABEL_FIELD.to_string()),
            nested_path: MEMBERS_PATH.to_string(),
            member_id_field: MEMBER_ID_FIELD.to_string(),
            member_ids,
            counters: self.counters.clone(),
            max_buckets: self.max_groups,
        }
    }

    fn fold_buckets(&self, buckets: Vec<RawBucket>) -> Result<MergedAggregateMap, StoreError> {
        let mut partial = MergedAggregateMap::new();
        for bucket in buckets {
            let &[age, birthday] = bucket.counters.as_slice() else {
                return Err(StoreError::Decode(format!(
                    "bucket {} came back with {} counters, expected {}",
                    bucket.key,
                    bucket.counters.len(),
                    self.counters.len()
                )));
            };
            partial.merge_bucket(
                normalize_key(&bucket.key),
                GroupCounts::new(bucket.label, bucket.total, age, birthday),
            );
        }
        Ok(partial)
    }

    /// One sub-batch, one round trip. Any failure is tagged with the batch it came from.
    async fn query_batch(
        &self,
        batch: usize,
        member_ids: Vec<String>,
    ) -> Result<MergedAggregateMap, TallyError> {
        let batch_len = member_ids.len();
        debug!("🧮 sub-batch {batch}: {batch_len} ids → '{}'", self.collection);
        let as_failure = |source| TallyError::Aggregation {
            batch,
            batch_len,
            source,
        };
        let buckets = self
            .store
            .aggregate(&self.collection, &self.request(member_ids))
            .await
            .map_err(as_failure)?;
        self.fold_buckets(buckets).map_err(as_failure)
    }

    /// 🚀 Aggregate a fully collected id set. Empty input means no queries and an empty map.
    pub async fn aggregate(&self, ids: &[String]) -> Result<MergedAggregateMap, TallyError> {
        let batches = ids.len().div_ceil(self.max_terms);
        let mut progress = ProgressMetrics::new(format!("aggregate ← {}", self.collection), batches as u64);

        let merged = futures::stream::iter(ids.chunks(self.max_terms).enumerate())
            .map(|(batch, slice)| self.query_batch(batch, slice.to_vec()))
            .buffer_unordered(self.parallelism)
            .try_fold(MergedAggregateMap::new(), |mut acc, partial| {
                acc.merge(partial);
                progress.update(1, 0);
                async move { Ok::<_, TallyError>(acc) }
            })
            .await?;
        progress.finish();

        info!(
            "🧮 merged {} group(s) from {batches} sub-batch(es), {} member hit(s) total",
            merged.len(),
            merged.total_members()
        );
        Ok(merged)
    }

    /// 🚰 Aggregate ids as they arrive on `rx`, firing a query every time a sub-batch fills.
    /// Finishes when the channel closes; the last, partial sub-batch is flushed then.
    pub async fn aggregate_stream(&self, rx: Receiver<String>) -> Result<MergedAggregateMap, TallyError> {
        let mut merged = MergedAggregateMap::new();
        let mut pending = Vec::with_capacity(self.max_terms.min(8_192));
        let mut batch = 0usize;

        while let Ok(id) = rx.recv().await {
            pending.push(id);
            if pending.len() == self.max_terms {
                merged.merge(self.query_batch(batch, std::mem::take(&mut pending)).await?);
                batch += 1;
            }
        }
        if !pending.is_empty() {
            merged.merge(self.query_batch(batch, pending).await?);
            batch += 1;
        }

        info!(
            "🧮 streamed {batch} sub-batch(es) into {} group(s), {} member hit(s) total",
            merged.len(),
            merged.total_members()
        );
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn counts(name: &str, total: u64, age: u64, birthday: u64) -> GroupCounts {
        GroupCounts::new(Some(name.to_string()), total, age, birthday)
    }

    fn the_config(max_terms: usize) -> AggregateConfig {
        AggregateConfig {
            max_terms_per_query: max_terms,
            ..AggregateConfig::default()
        }
    }

    /// 👥 One group, `size` members: even ones are 40 and born in 2001, odd ones 30 and born in 1990.
    async fn the_store_with_one_big_group(size: usize) -> (InMemoryStore, Vec<String>) {
        let the_store = InMemoryStore::new();
        let the_ids: Vec<String> = (0..size).map(|i| format!("p{i:03}")).collect();
        let the_members: Vec<serde_json::Value> = the_ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                if i % 2 == 0 {
                    json!({"id": id, "age": 40, "birthday": "2001-03-04"})
                } else {
                    json!({"id": id, "age": 30, "birthday": "1990-03-04"})
                }
            })
            .collect();
        the_store
            .insert(
                "group",
                "g1",
                json!({"group_id": "g1", "group_name": "Big Co", "person_list": the_members}),
            )
            .await;
        (the_store, the_ids)
    }

    #[test]
    fn the_one_where_shared_keys_add_up_and_strangers_just_move_in() {
        let mut the_map = MergedAggregateMap::new();
        the_map.merge_bucket("g1".into(), counts("Acme", 3, 1, 2));
        the_map.merge_bucket("g1".into(), counts("Acme", 4, 2, 0));
        assert_eq!(the_map.get("g1"), Some(&counts("Acme", 7, 3, 2)));

        let the_left: MergedAggregateMap = [("a".to_string(), counts("A", 1, 1, 1))].into_iter().collect();
        let the_right: MergedAggregateMap = [("b".to_string(), counts("B", 2, 0, 1))].into_iter().collect();
        let mut the_union = the_left.clone();
        the_union.merge(the_right.clone());
        assert_eq!(the_union.len(), 2);
        assert_eq!(the_union.get("a"), the_left.get("a"));
        assert_eq!(the_union.get("b"), the_right.get("b"));
    }

    #[test]
    fn the_one_where_merge_order_is_irrelevant() {
        let the_parts = [
            ("g1".to_string(), counts("G", 1, 0, 1)),
            ("g2".to_string(), counts("H", 5, 5, 0)),
            ("g1".to_string(), counts("G", 2, 2, 0)),
        ];
        let forwards: MergedAggregateMap = the_parts.clone().into_iter().collect();
        let backwards: MergedAggregateMap = the_parts.into_iter().rev().collect();
        assert_eq!(forwards, backwards);
        assert_eq!(forwards.total_members(), 8);
    }

    #[test]
    fn the_one_where_a_nameless_bucket_learns_its_name_later() {
        let mut the_map = MergedAggregateMap::new();
        the_map.merge_bucket("g1".into(), GroupCounts::new(None, 1, 0, 0));
        assert_eq!(the_map.get("g1").map(|g| g.group_name.as_str()), Some(UNKNOWN_GROUP));
        the_map.merge_bucket("g1".into(), counts("Finally Named", 1, 0, 0));
        assert_eq!(the_map.get("g1").map(|g| g.group_name.as_str()), Some("Finally Named"));
    }

    #[test]
    fn the_one_where_keys_get_one_canonical_spelling() {
        let the_lower = "0f8fad5b-d9cb-469f-a165-70867728950e";
        assert_eq!(normalize_key(&json!(the_lower)), the_lower);
        assert_eq!(normalize_key(&json!(the_lower.to_uppercase())), the_lower);
        assert_eq!(normalize_key(&json!(" 0f8fad5bd9cb469fa16570867728950e ")), the_lower);
        assert_eq!(normalize_key(&json!(42)), "42");
        assert_eq!(normalize_key(&json!("  plain-key ")), "plain-key");
    }

    #[tokio::test]
    async fn the_one_where_150_members_split_100_and_50_still_sum_to_150() -> anyhow::Result<()> {
        let (the_store, the_ids) = the_store_with_one_big_group(150).await;

        let the_split = BatchAggregator::new(&the_store, "group", &the_config(100), 1)?
            .aggregate(&the_ids)
            .await?;
        assert_eq!(the_store.aggregate_calls(), 2, "100 + 50");

        let the_whole = BatchAggregator::new(&the_store, "group", &the_config(150), 1)?
            .aggregate(&the_ids)
            .await?;

        assert_eq!(the_split, the_whole);
        let g1 = the_split.get("g1").expect("💀 g1 vanished");
        assert_eq!(g1.total_count, 150);
        assert_eq!(g1.count_age_gt_35, 75);
        assert_eq!(g1.count_birthday_after_2000, 75);
        assert_eq!(g1.group_name, "Big Co");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_sub_batches_respect_the_terms_limit() -> anyhow::Result<()> {
        let (the_store, the_ids) = the_store_with_one_big_group(95).await;
        let the_result = BatchAggregator::new(&the_store, "group", &the_config(10), 3)?
            .aggregate(&the_ids)
            .await?;
        assert_eq!(the_store.aggregate_calls(), 10);
        assert_eq!(the_result.get("g1").map(|g| g.total_count), Some(95));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_no_ids_means_no_questions_asked() -> anyhow::Result<()> {
        let (the_store, _) = the_store_with_one_big_group(10).await;
        let the_result = BatchAggregator::new(&the_store, "group", &the_config(10), 1)?
            .aggregate(&[])
            .await?;
        assert!(the_result.is_empty());
        assert_eq!(the_store.aggregate_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_one_bad_sub_batch_sinks_the_whole_run() -> anyhow::Result<()> {
        let (the_store, the_ids) = the_store_with_one_big_group(150).await;
        let the_store = the_store.with_failing_aggregate_call(2);
        let the_verdict = BatchAggregator::new(&the_store, "group", &the_config(100), 1)?
            .aggregate(&the_ids)
            .await;
        match the_verdict {
            Err(TallyError::Aggregation { batch, batch_len, .. }) => {
                assert_eq!(batch, 1);
                assert_eq!(batch_len, 50);
            }
            honestly_who_knows => panic!("💀 expected an aggregation failure, got {honestly_who_knows:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_shape_shifting_key_still_lands_in_one_bucket() -> anyhow::Result<()> {
        let the_group_id = "0f8fad5b-d9cb-469f-a165-70867728950e";
        let the_store = InMemoryStore::new().with_key_encoder(|raw, call| {
            if call % 2 == 0 {
                json!(raw.to_uppercase())
            } else {
                json!(raw)
            }
        });
        the_store
            .insert(
                "group",
                the_group_id,
                json!({
                    "group_id": the_group_id,
                    "group_name": "Shifty",
                    "person_list": [
                        {"id": "a", "age": 50, "birthday": "1970-01-01"},
                        {"id": "b", "age": 20, "birthday": "2004-01-01"}
                    ]
                }),
            )
            .await;
        let the_result = BatchAggregator::new(&the_store, "group", &the_config(1), 1)?
            .aggregate(&["a".to_string(), "b".to_string()])
            .await?;
        assert_eq!(the_result.len(), 1, "the group fragmented across key spellings");
        assert_eq!(the_result.get(the_group_id), Some(&counts("Shifty", 2, 1, 1)));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_streaming_and_batching_agree() -> anyhow::Result<()> {
        let (the_store, the_ids) = the_store_with_one_big_group(77).await;
        let the_aggregator = BatchAggregator::new(&the_store, "group", &the_config(20), 1)?;
        let the_batched = the_aggregator.aggregate(&the_ids).await?;

        let (tx, rx) = async_channel::bounded(4);
        let the_producer = async move {
            for id in the_ids {
                tx.send(id).await.expect("💀 receiver should be listening");
            }
        };
        let (_, the_streamed) = tokio::join!(the_producer, the_aggregator.aggregate_stream(rx));
        assert_eq!(the_streamed?, the_batched);
        assert_eq!(the_store.aggregate_calls(), 8, "4 batched + 4 streamed");
        Ok(())
    }

    #[test]
    fn the_one_where_silly_sub_batch_sizes_are_refused() {
        let the_store = InMemoryStore::new();
        for bad in [0, MAX_TERMS_CLAUSE + 1] {
            assert!(matches!(
                BatchAggregator::new(&the_store, "group", &the_config(bad), 1),
                Err(TallyError::Configuration(_))
            ));
        }
    }
}
