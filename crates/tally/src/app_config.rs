//! 🔧 App Configuration: TOML and `TALLY_*` env vars in, one validated struct out.
//!
//! 📡 "Config not found: we looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! Every section has serde defaults, so an empty file is a valid config that
//! talks to `http://localhost:9200`. Validation runs before anything touches
//! the network; a bad knob is a `Configuration` error, never a half-done run.

use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::aggregate::AggregateConfig;
use crate::error::{TallyError, config_error};
use crate::generator::GeneratorConfig;
use crate::loader::LoaderConfig;
use crate::scroll::ScrollConfig;
use crate::store::ElasticsearchStoreConfig;

/// 📦 Everything the app needs to know about itself.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub collections: CollectionsConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub scroll: ScrollConfig,
    #[serde(default)]
    pub aggregate: AggregateConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// 🎭 Which store to talk to. Externally tagged: `[store.Elasticsearch]` or `store = "InMemory"`.
#[derive(Debug, Deserialize, Clone)]
pub enum StoreConfig {
    Elasticsearch(ElasticsearchStoreConfig),
    /// 🧠 Everything lives and dies with the process. Good for smoke tests and demos.
    InMemory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Elasticsearch(ElasticsearchStoreConfig::new("http://localhost:9200"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectionsConfig {
    #[serde(default = "default_person_collection")]
    pub person: String,
    #[serde(default = "default_group_collection")]
    pub group: String,
}

fn default_person_collection() -> String {
    "person".to_string()
}

fn default_group_collection() -> String {
    "group".to_string()
}

impl Default for CollectionsConfig {
    fn default() -> Self {
        Self {
            person: default_person_collection(),
            group: default_group_collection(),
        }
    }
}

/// ⚙️ How hard and how long we push.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// 🚰 Bounded channel between the scroll producer and the aggregator in streaming mode.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// 🚦 In-flight chunk submissions or sub-batch queries. 1 means strictly one at a time.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// ⏱️ Whole-command wall clock budget. Unset means "take all night".
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    /// 🎲 Seed for the generator. Unset means fresh entropy every run.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_queue_capacity() -> usize {
    10
}

fn default_parallelism() -> usize {
    1
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            parallelism: default_parallelism(),
            deadline_secs: None,
            seed: None,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), TallyError> {
        if self.queue_capacity == 0 {
            return Err(config_error("runtime.queue_capacity must be at least 1"));
        }
        if self.parallelism == 0 {
            return Err(config_error("runtime.parallelism must be at least 1"));
        }
        if self.deadline_secs == Some(0) {
            return Err(config_error("runtime.deadline_secs must be at least 1 when set"));
        }
        Ok(())
    }
}

impl AppConfig {
    /// ✅ Check every section. Called before the store is even built.
    pub fn validate(&self) -> Result<(), TallyError> {
        if let StoreConfig::Elasticsearch(es) = &self.store {
            if es.url.trim().is_empty() {
                return Err(config_error("store.Elasticsearch.url is empty"));
            }
        }
        if self.collections.person.trim().is_empty() || self.collections.group.trim().is_empty() {
            return Err(config_error("collection names must not be empty"));
        }
        self.generator.validate()?;
        self.loader.validate()?;
        self.scroll.validate()?;
        self.aggregate.validate()?;
        self.runtime.validate()
    }
}

/// 🚀 Load the config: `TALLY_*` env vars, plus a TOML file when one is given. TOML wins.
///
/// Nested keys come from env with a double underscore:
/// `TALLY_RUNTIME__PARALLELISM=4`, `TALLY_AGGREGATE__STREAMING=true`.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("TALLY_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (TALLY_*). \
             The file exists in our hearts, but apparently not on disk, or not as valid TOML.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (TALLY_*). \
                 No file was provided, so this one's all on the environment."
            .to_string(),
    };

    config.extract().context(context_msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn write_test_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let the_path = dir.path().join("tally.toml");
        // 🧪 Figment wants TOML from disk, like it's method acting.
        fs::write(&the_path, contents)
            .expect("💀 Failed to write test config. The filesystem said 'new phone who dis'.");
        the_path
    }

    #[test]
    fn the_one_where_an_empty_file_is_a_perfectly_good_config() -> anyhow::Result<()> {
        let the_dir = tempfile::tempdir()?;
        let the_path = write_test_config(&the_dir, "");
        let the_config = load_config(Some(&the_path))?;
        the_config.validate()?;

        match &the_config.store {
            StoreConfig::Elasticsearch(es) => assert_eq!(es.url, "http://localhost:9200"),
            honestly_who_knows => panic!("💀 expected the Elasticsearch default, got {honestly_who_knows:?}"),
        }
        assert_eq!(the_config.collections.person, "person");
        assert_eq!(the_config.collections.group, "group");
        assert_eq!(the_config.loader.chunk_size, 500);
        assert_eq!(the_config.scroll.page_size, 1000);
        assert_eq!(the_config.aggregate.max_terms_per_query, 65_536);
        assert_eq!(the_config.generator.group_pool_size, 10_000);
        assert_eq!(the_config.runtime.queue_capacity, 10);
        assert_eq!(the_config.runtime.parallelism, 1);
        Ok(())
    }

    #[test]
    fn the_one_where_every_section_gets_its_say() -> anyhow::Result<()> {
        let the_dir = tempfile::tempdir()?;
        let the_path = write_test_config(
            &the_dir,
            r#"
            [store.Elasticsearch]
            url = "https://search.internal:9243"
            api_key = "c2VjcmV0"
            compress_requests = true

            [collections]
            person = "people_v2"

            [loader]
            chunk_size = 250

            [scroll]
            page_size = 200

            [aggregate]
            max_terms_per_query = 1000
            streaming = true
            output = "out/stats.json"
            birthday_after = "1999-12-31"
            person_filter = { rep_office = 12, active = true }

            [runtime]
            parallelism = 4
            deadline_secs = 600
            seed = 7
            "#,
        );
        let the_config = load_config(Some(&the_path))?;
        the_config.validate()?;

        match &the_config.store {
            StoreConfig::Elasticsearch(es) => {
                assert_eq!(es.url, "https://search.internal:9243");
                assert_eq!(es.api_key.as_deref(), Some("c2VjcmV0"));
                assert!(es.compress_requests);
            }
            honestly_who_knows => panic!("💀 wrong store, got {honestly_who_knows:?}"),
        }
        assert_eq!(the_config.collections.person, "people_v2");
        assert_eq!(the_config.collections.group, "group");
        assert_eq!(the_config.loader.chunk_size, 250);
        assert_eq!(the_config.scroll.page_size, 200);
        assert_eq!(the_config.aggregate.max_terms_per_query, 1000);
        assert!(the_config.aggregate.streaming);
        assert_eq!(the_config.aggregate.output, PathBuf::from("out/stats.json"));
        assert_eq!(
            the_config.aggregate.person_filter,
            crate::store::TermFilter::new().and("rep_office", 12).and("active", true)
        );
        assert_eq!(the_config.runtime.parallelism, 4);
        assert_eq!(the_config.runtime.deadline_secs, Some(600));
        assert_eq!(the_config.runtime.seed, Some(7));
        Ok(())
    }

    #[test]
    fn the_one_where_the_store_lives_in_memory() -> anyhow::Result<()> {
        let the_dir = tempfile::tempdir()?;
        let the_path = write_test_config(&the_dir, r#"store = "InMemory""#);
        let the_config = load_config(Some(&the_path))?;
        assert!(matches!(the_config.store, StoreConfig::InMemory));
        Ok(())
    }

    #[test]
    fn the_one_where_zeroes_are_caught_before_the_network_is() {
        let mut the_config = AppConfig::default();
        the_config.runtime.parallelism = 0;
        assert!(matches!(the_config.validate(), Err(TallyError::Configuration(_))));

        let mut the_config = AppConfig::default();
        the_config.runtime.queue_capacity = 0;
        assert!(matches!(the_config.validate(), Err(TallyError::Configuration(_))));

        let mut the_config = AppConfig::default();
        the_config.loader.chunk_size = 0;
        assert!(matches!(the_config.validate(), Err(TallyError::Configuration(_))));

        let mut the_config = AppConfig::default();
        the_config.scroll.page_size = 0;
        assert!(matches!(the_config.validate(), Err(TallyError::Configuration(_))));

        let mut the_config = AppConfig::default();
        the_config.aggregate.max_terms_per_query = 70_000;
        assert!(matches!(the_config.validate(), Err(TallyError::Configuration(_))));

        let mut the_config = AppConfig::default();
        the_config.aggregate.max_groups_per_query = 0;
        assert!(matches!(the_config.validate(), Err(TallyError::Configuration(_))));

        let mut the_config = AppConfig::default();
        the_config.generator.age_min = 99;
        assert!(matches!(the_config.validate(), Err(TallyError::Configuration(_))));
    }

    #[test]
    fn the_one_where_a_sample_config_survives_a_toml_round_trip() -> anyhow::Result<()> {
        let the_sample: toml::Value = toml::from_str(
            r#"
            [runtime]
            queue_capacity = 3
            [aggregate]
            age_cutoff = 40
            "#,
        )?;
        let the_dir = tempfile::tempdir()?;
        let the_path = write_test_config(&the_dir, &toml::to_string(&the_sample)?);
        let the_config = load_config(Some(&the_path))?;
        assert_eq!(the_config.runtime.queue_capacity, 3);
        assert_eq!(the_config.aggregate.age_cutoff, 40);
        Ok(())
    }

    #[test]
    fn the_one_where_a_broken_file_says_which_file() {
        let the_dir = tempfile::tempdir().expect("💀 no temp dir");
        let the_path = write_test_config(&the_dir, "[runtime]\nparallelism = \"lots\"\n");
        let the_error = load_config(Some(&the_path)).expect_err("💀 'lots' is not a number");
        assert!(format!("{the_error}").contains("tally.toml"));
    }
}
