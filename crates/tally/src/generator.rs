//! 🎲 The Synthetic Record Generator: a people factory with a seed.
//!
//! 🎬 *[a dice rolls. a person is born. they are 47, live in Lisbon, and report to office 11.]*
//! *[the dice rolls again. it is the same dice. it is a deterministic dice.]*
//!
//! Everything here draws from an explicitly passed `Rng`, never from a process
//! global. Hand it `StdRng::seed_from_u64(42)` and you get the same people and
//! the same groups every single time, which is what test fixtures want and what
//! production does not care about.
//!
//! Generators are lazy and count down from N. They are not restartable; a
//! finished generator stays finished. 🦆

use chrono::{Days, NaiveDate, Utc};
use rand::{Rng, RngCore};
use serde::Deserialize;
use uuid::Builder;

use crate::error::{TallyError, config_error};
use crate::records::{GroupRecord, Member, PersonRecord};

/// 🔧 Field distributions for the generator. Ranges are inclusive on both ends.
#[derive(Debug, Deserialize, Clone)]
pub struct GeneratorConfig {
    #[serde(default = "default_age_min")]
    pub age_min: i64,
    #[serde(default = "default_age_max")]
    pub age_max: i64,
    /// 📅 Birthdays land between `birthday_years_min` and `birthday_years_max` years
    /// (365-day years, leap days be damned) before `reference_date`.
    #[serde(default = "default_birthday_years_min")]
    pub birthday_years_min: u32,
    #[serde(default = "default_birthday_years_max")]
    pub birthday_years_max: u32,
    /// Defaults to today (UTC) when unset.
    #[serde(default)]
    pub reference_date: Option<NaiveDate>,
    #[serde(default = "default_members_min")]
    pub members_min: usize,
    #[serde(default = "default_members_max")]
    pub members_max: usize,
    /// 🎣 How many stored people `load-groups` samples as its member pool.
    #[serde(default = "default_group_pool_size")]
    pub group_pool_size: usize,
    #[serde(default = "default_rep_office_pool")]
    pub rep_office_pool: Vec<i64>,
    #[serde(default = "default_rep_pool")]
    pub rep_pool: Vec<i64>,
    #[serde(default = "default_region_pool")]
    pub region_pool: Vec<String>,
    #[serde(default = "default_first_names")]
    pub first_names: Vec<String>,
    #[serde(default = "default_last_names")]
    pub last_names: Vec<String>,
    #[serde(default = "default_company_words")]
    pub company_words: Vec<String>,
    #[serde(default = "default_company_suffixes")]
    pub company_suffixes: Vec<String>,
}

fn default_age_min() -> i64 {
    18
}

fn default_age_max() -> i64 {
    80
}

fn default_birthday_years_min() -> u32 {
    18
}

fn default_birthday_years_max() -> u32 {
    80
}

// -- 👥 10 to 100 people per group. a book club on the low end, a wedding on the high end.
fn default_members_min() -> usize {
    10
}

fn default_members_max() -> usize {
    100
}

/// 🎣 Elasticsearch's default `index.max_result_window`. The member pool is one
/// match_all page, so it can't be bigger than this.
pub const MAX_GROUP_POOL_SIZE: usize = 10_000;

fn default_group_pool_size() -> usize {
    MAX_GROUP_POOL_SIZE
}

fn default_rep_office_pool() -> Vec<i64> {
    vec![10, 11, 12]
}

fn default_rep_pool() -> Vec<i64> {
    vec![9, 10, 11]
}

fn strings(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

fn default_region_pool() -> Vec<String> {
    strings(&[
        "Lisbon", "Osaka", "Nairobi", "Denver", "Tallinn", "Recife", "Hanoi", "Calgary",
        "Porto", "Kraków", "Auckland", "Tucson", "Valparaíso", "Leeds", "Busan", "Lyon",
    ])
}

fn default_first_names() -> Vec<String> {
    strings(&[
        "Ada", "Grace", "Alan", "Edsger", "Barbara", "Ken", "Margaret", "Linus", "Frances",
        "Dennis", "Radia", "Tim", "Hedy", "Donald", "Katherine", "John", "Sophie", "Niklaus",
    ])
}

fn default_last_names() -> Vec<String> {
    strings(&[
        "Lovelace", "Hopper", "Turing", "Dijkstra", "Liskov", "Thompson", "Hamilton",
        "Torvalds", "Allen", "Ritchie", "Perlman", "Berners-Lee", "Lamarr", "Knuth",
        "Johnson", "McCarthy", "Wilson", "Wirth",
    ])
}

fn default_company_words() -> Vec<String> {
    strings(&[
        "Acme", "Globex", "Initech", "Umbrella", "Hooli", "Vandelay", "Stark", "Wonka",
        "Cyberdyne", "Soylent", "Tyrell", "Massive", "Dynamic", "Pied", "Piper", "Wayne",
    ])
}

fn default_company_suffixes() -> Vec<String> {
    strings(&["LLC", "Inc", "Group", "and Sons", "Ltd", "Partners", "Holdings", "Co"])
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            age_min: default_age_min(),
            age_max: default_age_max(),
            birthday_years_min: default_birthday_years_min(),
            birthday_years_max: default_birthday_years_max(),
            reference_date: None,
            members_min: default_members_min(),
            members_max: default_members_max(),
            group_pool_size: default_group_pool_size(),
            rep_office_pool: default_rep_office_pool(),
            rep_pool: default_rep_pool(),
            region_pool: default_region_pool(),
            first_names: default_first_names(),
            last_names: default_last_names(),
            company_words: default_company_words(),
            company_suffixes: default_company_suffixes(),
        }
    }
}

impl GeneratorConfig {
    /// ✅ Fail fast on any range that runs backwards or any pool with nothing in it.
    pub fn validate(&self) -> Result<(), TallyError> {
        if self.age_min > self.age_max {
            return Err(config_error(format!(
                "generator.age_min ({}) is greater than generator.age_max ({})",
                self.age_min, self.age_max
            )));
        }
        if self.birthday_years_min > self.birthday_years_max {
            return Err(config_error(format!(
                "generator.birthday_years_min ({}) is greater than generator.birthday_years_max ({})",
                self.birthday_years_min, self.birthday_years_max
            )));
        }
        if self.members_min > self.members_max {
            return Err(config_error(format!(
                "generator.members_min ({}) is greater than generator.members_max ({})",
                self.members_min, self.members_max
            )));
        }
        check_pool_size(self.group_pool_size)?;
        if self.oldest_birthday().is_none() {
            return Err(config_error(format!(
                "generator.birthday_years_max ({}) reaches back before the earliest representable date from {}",
                self.birthday_years_max,
                self.reference_date()
            )));
        }
        let the_pools: [(&str, usize); 7] = [
            ("rep_office_pool", self.rep_office_pool.len()),
            ("rep_pool", self.rep_pool.len()),
            ("region_pool", self.region_pool.len()),
            ("first_names", self.first_names.len()),
            ("last_names", self.last_names.len()),
            ("company_words", self.company_words.len()),
            ("company_suffixes", self.company_suffixes.len()),
        ];
        for (name, len) in the_pools {
            if len == 0 {
                return Err(config_error(format!(
                    "generator.{name} is empty, there is nothing to pick from"
                )));
            }
        }
        Ok(())
    }

    fn reference_date(&self) -> NaiveDate {
        self.reference_date
            .unwrap_or_else(|| Utc::now().date_naive())
    }

    fn oldest_birthday(&self) -> Option<NaiveDate> {
        self.reference_date()
            .checked_sub_days(Days::new(365 * u64::from(self.birthday_years_max)))
    }
}

/// ✅ A member pool is sampled in one match_all page: 1 to `MAX_GROUP_POOL_SIZE` people.
pub fn check_pool_size(pool_size: usize) -> Result<(), TallyError> {
    if !(1..=MAX_GROUP_POOL_SIZE).contains(&pool_size) {
        return Err(config_error(format!(
            "group pool size {pool_size} is out of range, it must be between 1 and {MAX_GROUP_POOL_SIZE}"
        )));
    }
    Ok(())
}

// -- 🎯 pools are validated non-empty before any generator exists, so indexing is safe here
fn pick<'a, T, R: Rng + ?Sized>(pool: &'a [T], rng: &mut R) -> &'a T {
    &pool[rng.random_range(0..pool.len())]
}

/// 🪪 A v4 UUID minted from the caller's rng, so seeded runs mint the same ids.
fn fresh_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    Builder::from_random_bytes(bytes).into_uuid().to_string()
}

/// 🧍 Lazy, exactly-N stream of person records.
#[derive(Debug)]
pub struct PersonGenerator<'a, R: Rng + ?Sized> {
    config: &'a GeneratorConfig,
    rng: &'a mut R,
    remaining: usize,
    reference_date: NaiveDate,
}

/// 🚀 Build a generator for `count` people. Validates the config first.
pub fn persons<'a, R: Rng + ?Sized>(
    config: &'a GeneratorConfig,
    rng: &'a mut R,
    count: usize,
) -> Result<PersonGenerator<'a, R>, TallyError> {
    config.validate()?;
    Ok(PersonGenerator {
        config,
        rng,
        remaining: count,
        reference_date: config.reference_date(),
    })
}

impl<R: Rng + ?Sized> PersonGenerator<'_, R> {
    fn person(&mut self) -> PersonRecord {
        let cfg = self.config;
        let rng = &mut *self.rng;
        let id = fresh_id(rng);
        let name = format!("{} {}", pick(&cfg.first_names, rng), pick(&cfg.last_names, rng));
        let age = rng.random_range(cfg.age_min..=cfg.age_max);
        // -- 📅 age and birthday are drawn independently. yes, a 20 year old can be born in 1950.
        // -- the aggregation counts them separately, so nobody downstream minds.
        let days_back = rng.random_range(
            365 * u64::from(cfg.birthday_years_min)..=365 * u64::from(cfg.birthday_years_max),
        );
        // -- validate() proved the widest span fits, so the MIN fallback never fires
        let birthday = self
            .reference_date
            .checked_sub_days(Days::new(days_back))
            .unwrap_or(NaiveDate::MIN);
        PersonRecord {
            id,
            name,
            age,
            birthday,
            region: pick(&cfg.region_pool, rng).clone(),
            rep_office: *pick(&cfg.rep_office_pool, rng),
            rep: *pick(&cfg.rep_pool, rng),
        }
    }
}

impl<R: Rng + ?Sized> Iterator for PersonGenerator<'_, R> {
    type Item = PersonRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.person())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<R: Rng + ?Sized> ExactSizeIterator for PersonGenerator<'_, R> {}

/// 👥 Lazy, exactly-N stream of groups, each sampling distinct members from a pool.
#[derive(Debug)]
pub struct GroupGenerator<'a, R: Rng + ?Sized> {
    config: &'a GeneratorConfig,
    rng: &'a mut R,
    pool: &'a [Member],
    remaining: usize,
    members_max: usize,
}

/// 🚀 Build a generator for `count` groups drawing members from `pool`.
///
/// ⚠️ A pool smaller than `members_min` is a configuration error. A pool smaller
/// than `members_max` just caps the upper bound, so sampling without replacement
/// stays possible.
pub fn groups<'a, R: Rng + ?Sized>(
    config: &'a GeneratorConfig,
    rng: &'a mut R,
    pool: &'a [Member],
    count: usize,
) -> Result<GroupGenerator<'a, R>, TallyError> {
    config.validate()?;
    if pool.len() < config.members_min {
        return Err(config_error(format!(
            "member pool has {} people but every group needs at least generator.members_min={}",
            pool.len(),
            config.members_min
        )));
    }
    Ok(GroupGenerator {
        config,
        rng,
        pool,
        remaining: count,
        members_max: config.members_max.min(pool.len()),
    })
}

impl<R: Rng + ?Sized> GroupGenerator<'_, R> {
    fn group(&mut self) -> GroupRecord {
        let cfg = self.config;
        let rng = &mut *self.rng;
        let group_id = fresh_id(rng);
        let group_name = format!(
            "{} {} {}",
            pick(&cfg.company_words, rng),
            pick(&cfg.company_words, rng),
            pick(&cfg.company_suffixes, rng)
        );
        let how_many = rng.random_range(cfg.members_min..=self.members_max);
        // -- 🎯 index::sample hands back distinct positions, so no person joins the same group twice
        let person_list = rand::seq::index::sample(rng, self.pool.len(), how_many)
            .into_iter()
            .map(|i| self.pool[i].clone())
            .collect();
        GroupRecord {
            group_id,
            group_name,
            person_list,
        }
    }
}

impl<R: Rng + ?Sized> Iterator for GroupGenerator<'_, R> {
    type Item = GroupRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.group())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<R: Rng + ?Sized> ExactSizeIterator for GroupGenerator<'_, R> {}
