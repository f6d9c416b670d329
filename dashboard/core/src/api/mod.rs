//! Upstream API Seams
//!
//! Tiles never talk HTTP directly. Each upstream service is an async trait
//! ([`ConcordanceApi`], [`FreqDistribApi`], [`WordSimApi`],
//! [`TimeDistribApi`]) and an [`ApiProvider`] constructs instances per
//! configured URL. Two providers ship with the crate:
//!
//! - [`kontext::KontextProvider`] - `reqwest` clients for KonText-style
//!   corpus APIs, with a shared [`cache::ResponseCache`]
//! - [`scripted::ScriptedProvider`] - in-memory responses for tests and
//!   offline runs

pub mod cache;
pub mod kontext;
pub mod scripted;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actions::TileError;
use crate::query::QueryMatch;
use crate::source::FallbackError;

// ============================================================================
// Errors
// ============================================================================

/// Upstream API failures
#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection, timeout or protocol failure
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success HTTP status
    #[error("{url} returned {status}: {body}")]
    Status {
        /// Requested URL
        url: String,
        /// HTTP status code
        status: u16,
        /// Response body (may be empty)
        body: String,
    },

    /// Response body did not match the expected shape
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl From<ApiError> for TileError {
    fn from(err: ApiError) -> Self {
        TileError::Api(err.to_string())
    }
}

impl From<FallbackError<ApiError>> for TileError {
    fn from(err: FallbackError<ApiError>) -> Self {
        match err {
            FallbackError::NoInstances => TileError::Api("no API instance configured".to_string()),
            FallbackError::Failed { source, .. } => source.into(),
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// One concordance line
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcLine {
    /// Left context
    pub left: String,
    /// Keyword in context
    pub kwic: String,
    /// Right context
    pub right: String,
    /// Token number of the KWIC
    pub toknum: u64,
}

/// A persisted concordance
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcResponse {
    /// Persistence id other requests can refer to
    pub conc_id: String,
    /// Corpus
    pub corpname: String,
    /// Subcorpus, if any
    pub subcname: Option<String>,
    /// Number of hits (0 is a valid, empty result)
    pub concsize: u64,
    /// Average reduced frequency
    pub arf: f64,
    /// Instances per million
    pub ipm: f64,
    /// First page of lines
    pub lines: Vec<ConcLine>,
}

/// One row of a frequency distribution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FreqRow {
    /// Category value
    pub name: String,
    /// Absolute frequency
    pub freq: u64,
    /// Relative frequency (instances per million)
    pub ipm: f64,
}

/// Frequency distribution for one criterion
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FreqResponse {
    /// Concordance the distribution was computed from
    pub conc_id: String,
    /// Rows as returned by the service
    pub rows: Vec<FreqRow>,
}

/// A word similar to the queried one
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimilarWord {
    /// The word
    pub word: String,
    /// Similarity score
    pub score: f64,
}

/// One point of a time distribution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeDataPoint {
    /// Time period label (e.g. a year)
    pub datetime: String,
    /// Absolute frequency in the period
    pub freq: u64,
    /// Size of the period in tokens
    pub norm: u64,
}

/// Time distribution of a concordance
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeDistribResponse {
    /// Concordance the distribution was computed from
    pub conc_id: String,
    /// Data points
    pub points: Vec<TimeDataPoint>,
}

// ============================================================================
// Request Arguments
// ============================================================================

/// Concordance request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcArgs {
    /// Corpus
    pub corpname: String,
    /// Subcorpus
    pub subcname: Option<String>,
    /// CQL query
    pub query: String,
    /// Lines to fetch
    pub max_lines: usize,
}

/// Frequency distribution request on an existing concordance
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreqArgs {
    /// Corpus
    pub corpname: String,
    /// Subcorpus
    pub subcname: Option<String>,
    /// Concordance persistence id
    pub conc_id: String,
    /// Frequency criterion (e.g. `doc.genre 0`)
    pub fcrit: String,
    /// Minimum frequency
    pub flimit: u64,
}

/// Word similarity request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordSimArgs {
    /// Queried word
    pub word: String,
    /// Maximum number of results
    pub max_items: usize,
    /// Corpus the model was trained on, if the service needs it
    pub corpname: Option<String>,
}

/// Time distribution request on an existing concordance
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeDistribArgs {
    /// Corpus
    pub corpname: String,
    /// Subcorpus
    pub subcname: Option<String>,
    /// Concordance persistence id
    pub conc_id: String,
    /// Time criterion (e.g. `doc.pubyear 0`)
    pub fcrit: String,
}

/// CQL matching every token of the lemma
///
/// `New York` becomes `[lemma="New"] [lemma="York"]`.
#[must_use]
pub fn lemma_cql(m: &QueryMatch) -> String {
    m.lemma
        .split_whitespace()
        .map(|tok| format!("[lemma=\"{}\"]", tok.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Traits
// ============================================================================

/// Creates concordances
#[async_trait]
pub trait ConcordanceApi: Send + Sync {
    /// Run the query
    async fn call(&self, args: &ConcArgs) -> Result<ConcResponse, ApiError>;
}

/// Computes frequency distributions of concordances
#[async_trait]
pub trait FreqDistribApi: Send + Sync {
    /// Compute one criterion
    async fn call(&self, args: &FreqArgs) -> Result<FreqResponse, ApiError>;
}

/// Finds similar words
#[async_trait]
pub trait WordSimApi: Send + Sync {
    /// Look up similar words
    async fn call(&self, args: &WordSimArgs) -> Result<Vec<SimilarWord>, ApiError>;
}

/// Computes time distributions of concordances
#[async_trait]
pub trait TimeDistribApi: Send + Sync {
    /// Compute the distribution
    async fn call(&self, args: &TimeDistribArgs) -> Result<TimeDistribResponse, ApiError>;
}

/// Constructs API clients for configured URLs
pub trait ApiProvider: Send + Sync {
    /// Concordance client for `url`
    fn concordance(&self, url: &str) -> Arc<dyn ConcordanceApi>;

    /// Frequency client for `url`
    fn freq_distrib(&self, url: &str) -> Arc<dyn FreqDistribApi>;

    /// Word similarity client for `url`
    fn word_sim(&self, url: &str) -> Arc<dyn WordSimApi>;

    /// Time distribution client for `url`
    fn time_distrib(&self, url: &str) -> Arc<dyn TimeDistribApi>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lemma_cql() {
        assert_eq!(lemma_cql(&QueryMatch::new("dům", "dům", "N")), "[lemma=\"dům\"]");
        assert_eq!(
            lemma_cql(&QueryMatch::new("New York", "New York", "N N")),
            "[lemma=\"New\"] [lemma=\"York\"]"
        );
        assert_eq!(
            lemma_cql(&QueryMatch::new("a\"b", "a\"b", "X")),
            "[lemma=\"a\\\"b\"]"
        );
    }

    #[test]
    fn test_fallback_error_to_tile_error() {
        let err: TileError = FallbackError::Failed {
            index: 1,
            source: ApiError::Status {
                url: "http://x".to_string(),
                status: 503,
                body: String::new(),
            },
        }
        .into();
        assert_eq!(err, TileError::Api("http://x returned 503: ".to_string()));

        let err: TileError = FallbackError::<ApiError>::NoInstances.into();
        assert!(matches!(err, TileError::Api(_)));
    }
}
