//! 🎬 The Pipeline: commands in, outcomes out, one store borrowed by everyone.
//!
//! 🎬 COLD OPEN. INT. OPS ROOM, THE NIGHT BEFORE THE REPORT IS DUE
//!
//! Five stages, loosely coupled. Generate people, load them. Generate groups
//! out of the people already stored, load those. Scroll the people that match,
//! aggregate the groups they belong to, write one file. Each stage talks to
//! the next through plain values (records, ids, a merged map), never through
//! shared state.
//!
//! The store is built once here and dropped here, on success or failure.
//! Aggregation is all-or-nothing: the artifact is written only after every
//! sub-batch has answered. A failed run leaves the previous artifact alone. 🦆

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use comfy_table::Table;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{info, warn};

use crate::aggregate::{BatchAggregator, MergedAggregateMap};
use crate::app_config::{AppConfig, StoreConfig};
use crate::error::{StoreError, TallyError};
use crate::generator;
use crate::loader::{BulkLoader, LoadSummary};
use crate::records::{Member, group_mapping, person_mapping};
use crate::report;
use crate::scroll::ScrollCollector;
use crate::store::{ElasticsearchStore, HealthSummary, InMemoryStore, SearchStore, StoreBackend, TermFilter};
use crate::writer::ResultWriter;

// -- 🏆 how many groups the aggregate summary table shows
const TOP_GROUPS_SHOWN: usize = 10;

/// 🎯 What the user asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Create both collections with their mappings, if missing.
    Setup,
    LoadPersons { count: usize },
    /// `pool_size` overrides `generator.group_pool_size` for this run.
    LoadGroups { count: usize, pool_size: Option<usize> },
    /// `output` overrides `aggregate.output`; `streaming` forces the overlapped mode on.
    Aggregate { output: Option<PathBuf>, streaming: bool },
    Count,
    Health,
}

/// 📊 What actually happened.
#[derive(Debug)]
pub enum Outcome {
    Setup { created: Vec<(String, bool)> },
    Loaded { collection: String, summary: LoadSummary },
    Aggregated { output: PathBuf, matched_people: usize, merged: MergedAggregateMap },
    Counted { rows: Vec<(String, u64)> },
    Health(HealthSummary),
}

impl Outcome {
    /// 🍽️ The table the CLI prints.
    pub fn table(&self) -> Table {
        match self {
            Outcome::Setup { created } => report::setup_table(created),
            Outcome::Loaded { collection, summary } => report::load_table(collection, summary),
            Outcome::Aggregated { merged, .. } => report::top_groups_table(merged, TOP_GROUPS_SHOWN),
            Outcome::Counted { rows } => report::count_table(rows),
            Outcome::Health(health) => report::health_table(health),
        }
    }
}

/// 🏭 Build the configured store. Nothing is sent over the wire yet.
pub fn build_store(config: &StoreConfig) -> Result<StoreBackend, TallyError> {
    Ok(match config {
        StoreConfig::Elasticsearch(es) => StoreBackend::Elasticsearch(ElasticsearchStore::new(es.clone())?),
        StoreConfig::InMemory => StoreBackend::InMemory(InMemoryStore::new()),
    })
}

/// 🚀 Validate, build the store, run the command. Config problems surface before any I/O.
pub async fn run(config: &AppConfig, command: Command) -> anyhow::Result<Outcome> {
    config.validate().context("💀 The configuration didn't pass inspection")?;
    let store = build_store(&config.store).context("💀 Couldn't build the store client")?;
    execute(&store, config, command).await
}

/// Run one command against an already-built store, under `runtime.deadline_secs` if set.
pub async fn execute<S: SearchStore + ?Sized>(
    store: &S,
    config: &AppConfig,
    command: Command,
) -> anyhow::Result<Outcome> {
    let work = dispatch(store, config, command);
    match config.runtime.deadline_secs {
        None => work.await,
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), work).await {
            Ok(outcome) => outcome,
            Err(_) => Err::<Outcome, _>(TallyError::Store(StoreError::Timeout(format!(
                "command exceeded runtime.deadline_secs ({secs}s); acknowledged chunks stay committed"
            ))))
            .context("💀 Ran out of time"),
        },
    }
}

async fn dispatch<S: SearchStore + ?Sized>(
    store: &S,
    config: &AppConfig,
    command: Command,
) -> anyhow::Result<Outcome> {
    match command {
        Command::Setup => setup(store, config).await,
        Command::LoadPersons { count } => load_persons(store, config, count).await,
        Command::LoadGroups { count, pool_size } => load_groups(store, config, count, pool_size).await,
        Command::Aggregate { output, streaming } => {
            let output = output.unwrap_or_else(|| config.aggregate.output.clone());
            aggregate(store, config, output, streaming || config.aggregate.streaming).await
        }
        Command::Count => count(store, config).await,
        Command::Health => Ok(Outcome::Health(
            store.health().await.map_err(TallyError::from).context("💀 Health check failed")?,
        )),
    }
}

fn rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

async fn setup<S: SearchStore + ?Sized>(store: &S, config: &AppConfig) -> anyhow::Result<Outcome> {
    let mut created = Vec::with_capacity(2);
    for (name, mapping) in [
        (&config.collections.person, person_mapping()),
        (&config.collections.group, group_mapping()),
    ] {
        let fresh = store
            .ensure_collection(name, &mapping)
            .await
            .map_err(TallyError::from)
            .with_context(|| format!("💀 Couldn't create collection '{name}'"))?;
        info!("🏗️ collection '{name}': {}", if fresh { "created" } else { "already there" });
        created.push((name.clone(), fresh));
    }
    Ok(Outcome::Setup { created })
}

async fn load_persons<S: SearchStore + ?Sized>(
    store: &S,
    config: &AppConfig,
    count: usize,
) -> anyhow::Result<Outcome> {
    let collection = &config.collections.person;
    let mut rng = rng(config.runtime.seed);
    let people = generator::persons(&config.generator, &mut rng, count)?;
    let loader = BulkLoader::new(store, collection, &config.loader, config.runtime.parallelism)?;
    let summary = loader.load(people).await;
    report_failures(collection, &summary);
    Ok(Outcome::Loaded {
        collection: collection.clone(),
        summary,
    })
}

async fn load_groups<S: SearchStore + ?Sized>(
    store: &S,
    config: &AppConfig,
    count: usize,
    pool_size: Option<usize>,
) -> anyhow::Result<Outcome> {
    let pool_size = pool_size.unwrap_or(config.generator.group_pool_size);
    generator::check_pool_size(pool_size).context("💀 The member pool size didn't pass inspection")?;
    let raw = store
        .sample_records(&config.collections.person, pool_size)
        .await
        .map_err(TallyError::from)
        .with_context(|| format!("💀 Couldn't sample the member pool from '{}'", config.collections.person))?;

    let sampled = raw.len();
    let pool: Vec<Member> = raw
        .into_iter()
        .filter_map(|doc| serde_json::from_value(doc).ok())
        .collect();
    if pool.len() < sampled {
        warn!("⚠️ {} sampled record(s) didn't look like people and were skipped", sampled - pool.len());
    }
    info!("🎣 member pool: {} people from '{}'", pool.len(), config.collections.person);

    let collection = &config.collections.group;
    let mut rng = rng(config.runtime.seed);
    let groups = generator::groups(&config.generator, &mut rng, &pool, count)
        .context("💀 Couldn't generate groups; did you load-persons first?")?;
    let loader = BulkLoader::new(store, collection, &config.loader, config.runtime.parallelism)?;
    let summary = loader.load(groups).await;
    report_failures(collection, &summary);
    Ok(Outcome::Loaded {
        collection: collection.clone(),
        summary,
    })
}

fn report_failures(collection: &str, summary: &LoadSummary) {
    if summary.failed > 0 {
        warn!(
            "⚠️ '{collection}': {} document(s) failed across {} lost chunk(s) and {} rejection report(s)",
            summary.failed,
            summary.chunks_failed,
            summary.first_rejections.len()
        );
    }
}

async fn aggregate<S: SearchStore + ?Sized>(
    store: &S,
    config: &AppConfig,
    output: PathBuf,
    streaming: bool,
) -> anyhow::Result<Outcome> {
    let filter = &config.aggregate.person_filter;
    let collector = ScrollCollector::new(store, &config.collections.person, &config.scroll)?;
    let aggregator = BatchAggregator::new(
        store,
        &config.collections.group,
        &config.aggregate,
        config.runtime.parallelism,
    )?;

    let (matched_people, merged) = if streaming {
        info!("🚰 streaming mode: scroll and aggregate overlap through a {}-slot queue", config.runtime.queue_capacity);
        let (tx, rx) = async_channel::bounded(config.runtime.queue_capacity);
        tokio::try_join!(collector.stream(filter, tx), aggregator.aggregate_stream(rx))
            .context("💀 Streaming aggregation failed; no artifact was written")?
    } else {
        let ids = collector
            .collect(filter)
            .await
            .context("💀 Collecting matching people failed; no artifact was written")?;
        let merged = aggregator
            .aggregate(&ids)
            .await
            .context("💀 Aggregation failed; no artifact was written")?;
        (ids.len(), merged)
    };

    let writer = ResultWriter::new(output);
    let bytes = writer
        .write(&merged)
        .await
        .context("💀 Aggregation succeeded but the artifact couldn't be written")?;
    info!("💾 {bytes} bytes → {}", writer.path().display());

    Ok(Outcome::Aggregated {
        output: writer.path().to_path_buf(),
        matched_people,
        merged,
    })
}

async fn count<S: SearchStore + ?Sized>(store: &S, config: &AppConfig) -> anyhow::Result<Outcome> {
    let everything = TermFilter::new();
    let person = &config.collections.person;
    let group = &config.collections.group;
    let mut rows = Vec::with_capacity(3);
    for (label, collection, filter) in [
        (format!("{person} (all)"), person, &everything),
        (format!("{person} (aggregate filter)"), person, &config.aggregate.person_filter),
        (format!("{group} (all)"), group, &everything),
    ] {
        let n = store
            .count(collection, filter)
            .await
            .map_err(TallyError::from)
            .with_context(|| format!("💀 Couldn't count '{collection}'"))?;
        rows.push((label, n));
    }
    Ok(Outcome::Counted { rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::GroupCounts;
    use chrono::NaiveDate;
    use std::collections::{BTreeMap, HashSet};

    fn the_config(dir: &tempfile::TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.store = StoreConfig::InMemory;
        config.runtime.seed = Some(42);
        config.loader.chunk_size = 64;
        config.scroll.page_size = 50;
        config.aggregate.max_terms_per_query = 40;
        config.aggregate.output = dir.path().join("group_statistics.json");
        config.generator.reference_date = NaiveDate::from_ymd_opt(2024, 6, 1);
        config.generator.members_min = 3;
        config.generator.members_max = 12;
        config
    }

    async fn the_loaded_store(config: &AppConfig) -> anyhow::Result<InMemoryStore> {
        let the_store = InMemoryStore::new();
        execute(&the_store, config, Command::Setup).await?;
        execute(&the_store, config, Command::LoadPersons { count: 400 }).await?;
        execute(&the_store, config, Command::LoadGroups { count: 30, pool_size: None }).await?;
        Ok(the_store)
    }

    /// 🧮 The slow, obviously-correct answer: walk every group, check every member.
    async fn the_brute_force_answer(store: &InMemoryStore, config: &AppConfig) -> BTreeMap<String, GroupCounts> {
        let the_matching: HashSet<String> = store
            .documents(&config.collections.person)
            .await
            .into_iter()
            .filter(|p| config.aggregate.person_filter.matches(p))
            .filter_map(|p| p["id"].as_str().map(str::to_string))
            .collect();
        let the_cutoff = config.aggregate.birthday_after.format("%Y-%m-%d").to_string();
        let mut the_answer = BTreeMap::new();
        for group in store.documents(&config.collections.group).await {
            let members: Vec<&serde_json::Value> = group["person_list"]
                .as_array()
                .into_iter()
                .flatten()
                .filter(|m| m["id"].as_str().is_some_and(|id| the_matching.contains(id)))
                .collect();
            if members.is_empty() {
                continue;
            }
            the_answer.insert(
                group["group_id"].as_str().unwrap_or_default().to_string(),
                GroupCounts {
                    group_name: group["group_name"].as_str().unwrap_or_default().to_string(),
                    total_count: members.len() as u64,
                    count_age_gt_35: members
                        .iter()
                        .filter(|m| m["age"].as_i64().is_some_and(|a| a > config.aggregate.age_cutoff))
                        .count() as u64,
                    count_birthday_after_2000: members
                        .iter()
                        .filter(|m| m["birthday"].as_str().is_some_and(|b| b > the_cutoff.as_str()))
                        .count() as u64,
                },
            );
        }
        the_answer
    }

    fn read_artifact(path: &std::path::Path) -> anyhow::Result<BTreeMap<String, GroupCounts>> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    #[tokio::test]
    async fn the_one_where_the_whole_pipeline_agrees_with_brute_force() -> anyhow::Result<()> {
        let the_dir = tempfile::tempdir()?;
        let the_config = the_config(&the_dir);
        let the_store = the_loaded_store(&the_config).await?;
        assert_eq!(the_store.documents("person").await.len(), 400);
        assert_eq!(the_store.documents("group").await.len(), 30);

        let the_outcome = execute(
            &the_store,
            &the_config,
            Command::Aggregate { output: None, streaming: false },
        )
        .await?;
        let Outcome::Aggregated { output, matched_people, .. } = the_outcome else {
            panic!("💀 expected an aggregate outcome");
        };
        assert!(matched_people > 0, "seed 42 should match somebody");

        let the_expected = the_brute_force_answer(&the_store, &the_config).await;
        assert!(!the_expected.is_empty());
        assert_eq!(read_artifact(&output)?, the_expected);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_streaming_writes_the_same_file() -> anyhow::Result<()> {
        let the_dir = tempfile::tempdir()?;
        let mut the_config = the_config(&the_dir);
        the_config.runtime.queue_capacity = 2;
        let the_store = the_loaded_store(&the_config).await?;

        let the_batched = the_dir.path().join("batched.json");
        let the_streamed = the_dir.path().join("streamed.json");
        execute(&the_store, &the_config, Command::Aggregate { output: Some(the_batched.clone()), streaming: false }).await?;
        execute(&the_store, &the_config, Command::Aggregate { output: Some(the_streamed.clone()), streaming: true }).await?;

        assert_eq!(std::fs::read_to_string(&the_batched)?, std::fs::read_to_string(&the_streamed)?);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_failed_sub_batch_leaves_no_artifact() -> anyhow::Result<()> {
        let the_dir = tempfile::tempdir()?;
        let the_config = the_config(&the_dir);
        for streaming in [false, true] {
            let the_store = the_loaded_store(&the_config).await?.with_failing_aggregate_call(1);
            let the_error = execute(&the_store, &the_config, Command::Aggregate { output: None, streaming })
                .await
                .expect_err("💀 a failed sub-batch must fail the run");
            assert!(matches!(
                the_error.downcast_ref::<TallyError>(),
                Some(TallyError::Aggregation { batch: 0, .. })
            ));
            assert!(!the_config.aggregate.output.exists(), "no artifact after a failed run");
        }
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_expired_cursor_leaves_no_artifact() -> anyhow::Result<()> {
        let the_dir = tempfile::tempdir()?;
        let the_config = the_config(&the_dir);
        let the_store = the_loaded_store(&the_config).await?.with_scroll_expiring_after(0);

        let the_error = execute(&the_store, &the_config, Command::Aggregate { output: None, streaming: false })
            .await
            .expect_err("💀 the cursor is dead on arrival");
        assert_eq!(the_error.downcast_ref::<TallyError>().map(TallyError::exit_code), Some(5));
        assert!(!the_config.aggregate.output.exists());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_same_seed_loads_the_same_people() -> anyhow::Result<()> {
        let the_dir = tempfile::tempdir()?;
        let the_config = the_config(&the_dir);
        let the_first = InMemoryStore::new();
        let the_second = InMemoryStore::new();
        execute(&the_first, &the_config, Command::LoadPersons { count: 25 }).await?;
        execute(&the_second, &the_config, Command::LoadPersons { count: 25 }).await?;
        assert_eq!(the_first.documents("person").await, the_second.documents("person").await);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_groups_without_people_is_a_config_problem() -> anyhow::Result<()> {
        let the_dir = tempfile::tempdir()?;
        let the_config = the_config(&the_dir);
        let the_error = execute(&InMemoryStore::new(), &the_config, Command::LoadGroups { count: 5, pool_size: None })
            .await
            .expect_err("💀 no people, no groups");
        assert!(matches!(the_error.downcast_ref::<TallyError>(), Some(TallyError::Configuration(_))));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_oversized_pool_is_refused_before_sampling() -> anyhow::Result<()> {
        let the_dir = tempfile::tempdir()?;
        let the_config = the_config(&the_dir);
        let the_store = InMemoryStore::new();
        let the_error = execute(
            &the_store,
            &the_config,
            Command::LoadGroups { count: 5, pool_size: Some(generator::MAX_GROUP_POOL_SIZE + 1) },
        )
        .await
        .expect_err("💀 a pool bigger than one page can't be sampled");
        assert_eq!(the_error.downcast_ref::<TallyError>().map(TallyError::exit_code), Some(2));
        assert!(the_store.documents("group").await.is_empty(), "nothing was loaded");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_setup_is_idempotent_and_count_adds_up() -> anyhow::Result<()> {
        let the_dir = tempfile::tempdir()?;
        let the_config = the_config(&the_dir);
        let the_store = the_loaded_store(&the_config).await?;

        match execute(&the_store, &the_config, Command::Setup).await? {
            Outcome::Setup { created } => assert!(created.iter().all(|(_, fresh)| !fresh)),
            honestly_who_knows => panic!("💀 expected setup, got {honestly_who_knows:?}"),
        }

        match execute(&the_store, &the_config, Command::Count).await? {
            Outcome::Counted { rows } => {
                assert_eq!(rows[0].1, 400);
                assert!(rows[1].1 <= rows[0].1);
                assert_eq!(rows[2].1, 30);
            }
            honestly_who_knows => panic!("💀 expected counts, got {honestly_who_knows:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_deadline_pulls_the_plug() -> anyhow::Result<()> {
        let the_dir = tempfile::tempdir()?;
        let mut the_config = the_config(&the_dir);
        the_config.runtime.deadline_secs = Some(1);
        let the_store = InMemoryStore::new().with_bulk_delay(Duration::from_secs(5));

        let the_error = execute(&the_store, &the_config, Command::LoadPersons { count: 10 })
            .await
            .expect_err("💀 five seconds doesn't fit in one");
        assert!(matches!(
            the_error.downcast_ref::<TallyError>(),
            Some(TallyError::Store(StoreError::Timeout(_)))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_bad_config_never_reaches_the_network() {
        let mut the_config = AppConfig::default();
        // -- 📡 nothing listens here; validation must fail first
        the_config.store = StoreConfig::Elasticsearch(crate::store::ElasticsearchStoreConfig::new("http://127.0.0.1:9"));
        the_config.runtime.parallelism = 0;
        let the_error = run(&the_config, Command::Health).await.expect_err("💀 parallelism 0 is nonsense");
        assert_eq!(the_error.downcast_ref::<TallyError>().map(TallyError::exit_code), Some(2));
    }

    #[tokio::test]
    async fn the_one_where_the_in_memory_store_reports_healthy() -> anyhow::Result<()> {
        let mut the_config = AppConfig::default();
        the_config.store = StoreConfig::InMemory;
        match run(&the_config, Command::Health).await? {
            Outcome::Health(health) => assert_eq!(health.status, "green"),
            honestly_who_knows => panic!("💀 expected health, got {honestly_who_knows:?}"),
        }
        Ok(())
    }
}
