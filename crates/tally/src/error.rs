//! 💀 Errors with names: for the failures that deserve their own exit code.
//!
//! 🎬 *[a pipeline fails. the operator asks "which part?"]*
//! *[anyhow shrugs. thiserror raises its hand.]*
//!
//! Most of tally rides on `anyhow` context chains, same as always. But a few
//! outcomes have to be told apart by the caller: a bad config, an expired
//! scroll cursor, an aggregation sub-batch that blew up, and a result file
//! that refused to be written. Those live here, typed, so `main` can
//! `downcast_ref` them out of the chain and pick an exit status. 🦆

use std::path::PathBuf;

use thiserror::Error;

/// 📡 What the external store can do to us on a bad day.
#[derive(Debug, Error)]
pub enum StoreError {
    /// ⏱️ We waited. Like a dog at the window. The owner never came home.
    #[error("store request timed out: {0}")]
    Timeout(String),

    /// 🔌 Connection refused, DNS said no, the socket hung up mid-sentence.
    #[error("store transport failure: {0}")]
    Transport(String),

    /// 🕰️ The scroll context expired or the store forgot it ever existed.
    #[error("scroll cursor expired or unknown to the store: {0}")]
    CursorExpired(String),

    /// 🚫 Somebody tried to advance a cursor after it already reported an empty page.
    #[error("scroll cursor was already exhausted and cannot be advanced")]
    CursorExhausted,

    /// 🙅 The store answered, and the answer was a non-2xx status.
    #[error("store rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// 🧩 The store answered in a shape we did not expect.
    #[error("could not decode store response: {0}")]
    Decode(String),

    /// 🪣 More groups matched than the bucket limit allows, the rest were dropped by the store.
    #[error(
        "aggregation returned more groups than max_groups_per_query={limit} (documents left out: {left_out})"
    )]
    BucketLimitExceeded { limit: usize, left_out: u64 },
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        // -- 🕵️ reqwest knows whether it was the clock or the wire. we just ask nicely.
        if err.is_timeout() {
            StoreError::Timeout(err.to_string())
        } else if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Transport(err.to_string())
        }
    }
}

/// 🎯 The pipeline-level verdicts. Each one maps to its own exit status in the CLI.
#[derive(Debug, Error)]
pub enum TallyError {
    /// 🔧 Invalid ranges, zero chunk sizes, empty pools. Caught before any network I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// 🕰️ Scroll collection died mid-flight. Restart from scratch; there is no resume.
    #[error("scroll collection aborted, cursor expired after {collected} ids: {source}")]
    CursorExpired {
        collected: usize,
        #[source]
        source: StoreError,
    },

    /// 💥 A sub-batch query failed, so the whole aggregation run is void.
    #[error("aggregation failed on sub-batch {batch} ({batch_len} ids): {source}")]
    Aggregation {
        batch: usize,
        batch_len: usize,
        #[source]
        source: StoreError,
    },

    /// 💾 Aggregation succeeded but the artifact could not be persisted.
    #[error("could not write aggregate results to '{}': {source}", path.display())]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 📡 Any other store failure that bubbled up to the top.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TallyError {
    /// 🚪 The process exit status for this failure. 1 is reserved for "something else entirely".
    pub fn exit_code(&self) -> u8 {
        match self {
            TallyError::Configuration(_) => 2,
            TallyError::Aggregation { .. } => 3,
            TallyError::OutputWrite { .. } => 4,
            TallyError::CursorExpired { .. } => 5,
            TallyError::Store(_) => 1,
        }
    }
}

/// 🔧 Shorthand for the configuration complaint, which gets raised from a lot of places.
pub(crate) fn config_error(msg: impl Into<String>) -> TallyError {
    TallyError::Configuration(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_every_verdict_gets_its_own_door() {
        let the_codes = [
            TallyError::Configuration("min > max".into()).exit_code(),
            TallyError::Aggregation {
                batch: 0,
                batch_len: 1,
                source: StoreError::Transport("nope".into()),
            }
            .exit_code(),
            TallyError::OutputWrite {
                path: PathBuf::from("/nowhere"),
                source: std::io::Error::other("disk said no"),
            }
            .exit_code(),
            TallyError::CursorExpired {
                collected: 3,
                source: StoreError::CursorExhausted,
            }
            .exit_code(),
        ];
        assert_eq!(the_codes, [2, 3, 4, 5]);
    }

    #[test]
    fn the_one_where_anyhow_context_does_not_hide_the_real_culprit() {
        let the_wrapped: anyhow::Error = anyhow::Error::new(TallyError::Configuration(
            "chunk_size must be > 0".into(),
        ))
        .context("💀 loading went sideways");
        let the_culprit = the_wrapped
            .downcast_ref::<TallyError>()
            .expect("💀 the typed error should survive a context layer");
        assert_eq!(the_culprit.exit_code(), 2);
    }
}
