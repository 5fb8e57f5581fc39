//! 📊 tally: seed a search store with synthetic people and groups, then count,
//! per group, how many members match a filter. Scroll, slice, aggregate, merge,
//! write one JSON file. Repeat until the numbers stop surprising anyone. 🦆

pub mod aggregate;
pub mod app_config;
pub mod error;
pub mod generator;
pub mod loader;
pub mod pipeline;
pub(crate) mod progress;
pub mod records;
pub mod report;
pub mod scroll;
pub mod store;
pub mod writer;

pub use error::{StoreError, TallyError};
pub use pipeline::{Command, Outcome, execute, run};
