//! Query Matches and Result Normalization
//!
//! The lexical frequency database answers a query with a flat list of
//! [`QueryMatch`] records. A lemma which exists in several parts of speech
//! comes back as several records, each with a single POS tag. Before tiles
//! consume the list, identical lemmas are merged into one record carrying all
//! of their POS tags ([`find_mergeable_query_matches`]) and every record gets
//! a frequency band ([`calc_freq_band`]).

use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum `max_abs / min_abs` ratio for a merged lemma group to be
/// surfaced at the front of the result list.
pub const MERGE_CANDIDATE_MIN_DIFF_RATIO: f64 = 100.0;

/// Query processing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Query type string not recognized
    #[error("unknown query type '{0}'")]
    UnknownQueryType(String),

    /// A query match violates its invariants
    #[error("invalid query match '{lemma}': {reason}")]
    InvalidMatch {
        /// Offending lemma
        lemma: String,
        /// What is wrong
        reason: String,
    },
}

// ============================================================================
// Query Type
// ============================================================================

/// Query mode submitted by the user
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// One word
    #[default]
    Single,
    /// Comparison of several words
    Cmp,
    /// Translation between two languages
    Translat,
}

impl QueryType {
    /// Parse a query type code; an empty string yields `default`
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::UnknownQueryType`] for anything else than
    /// `single`, `cmp` or `translat`.
    pub fn parse(value: &str, default: QueryType) -> Result<Self, QueryError> {
        match value {
            "" => Ok(default),
            "single" => Ok(Self::Single),
            "cmp" => Ok(Self::Cmp),
            "translat" => Ok(Self::Translat),
            other => Err(QueryError::UnknownQueryType(other.to_string())),
        }
    }

    /// Wire code
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Cmp => "cmp",
            Self::Translat => "translat",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Frequency Bands
// ============================================================================

/// Ordinal frequency band (1..=5) derived from instances per million
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct FreqBand(u8);

impl FreqBand {
    /// Lowest band
    pub const MIN: FreqBand = FreqBand(1);
    /// Highest band
    pub const MAX: FreqBand = FreqBand(5);

    /// Create a band from its ordinal
    #[must_use]
    pub fn new(value: u8) -> Option<Self> {
        (1..=5).contains(&value).then_some(Self(value))
    }

    /// Band ordinal
    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for FreqBand {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("frequency band out of range: {value}"))
    }
}

impl From<FreqBand> for u8 {
    fn from(band: FreqBand) -> Self {
        band.0
    }
}

/// Calculate the frequency band of an ipm value
///
/// ```text
/// [0, 1)      => 1
/// [1, 10)     => 2
/// [10, 100)   => 3
/// [100, 1000) => 4
/// [1000, ..)  => 5
/// ```
#[must_use]
pub fn calc_freq_band(ipm: f64) -> FreqBand {
    if ipm < 1.0 {
        FreqBand(1)
    } else if ipm < 10.0 {
        FreqBand(2)
    } else if ipm < 100.0 {
        FreqBand(3)
    } else if ipm < 1000.0 {
        FreqBand(4)
    } else {
        FreqBand(5)
    }
}

// ============================================================================
// Query Matches
// ============================================================================

/// Part of speech tag (e.g. `N`, `V`, or a multi-word `A N`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PosTag(pub String);

impl PosTag {
    /// Tag used for words unknown to the frequency database
    pub const UNKNOWN: &'static str = "X";

    /// Create a tag
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

impl fmt::Display for PosTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single item matching a query, as reported by the frequency database
///
/// The item may be ambiguous in terms of part of speech, hence `pos` is a
/// list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryMatch {
    /// Dictionary base form
    pub lemma: String,
    /// Parts of speech (at least one)
    pub pos: Vec<PosTag>,
    /// Surface form
    pub word: String,
    /// Absolute frequency
    pub abs: f64,
    /// Average reduced frequency
    pub arf: f64,
    /// Instances per million tokens
    pub ipm: f64,
    /// Frequency band of `ipm`
    pub flevel: Option<FreqBand>,
    /// Whether this variant is the selected one
    pub is_current: bool,
    /// Set for words missing from the dictionary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_non_dict: Option<bool>,
}

impl QueryMatch {
    /// Create a match with a single POS tag; frequencies default to zero
    pub fn new(lemma: impl Into<String>, word: impl Into<String>, pos: impl Into<String>) -> Self {
        Self {
            lemma: lemma.into(),
            pos: vec![PosTag::new(pos)],
            word: word.into(),
            abs: 0.0,
            arf: 0.0,
            ipm: 0.0,
            flevel: None,
            is_current: false,
            is_non_dict: None,
        }
    }

    /// Match for a word the dictionary does not know
    pub fn non_dict(word: impl Into<String>) -> Self {
        let word = word.into();
        Self {
            is_current: true,
            is_non_dict: Some(true),
            ..Self::new(word.clone(), word, PosTag::UNKNOWN)
        }
    }

    /// Set frequencies and derive the band
    #[must_use]
    pub fn with_freqs(mut self, abs: f64, arf: f64, ipm: f64) -> Self {
        self.abs = abs;
        self.arf = arf;
        self.ipm = ipm;
        self.flevel = Some(calc_freq_band(ipm));
        self
    }

    /// Mark as the selected variant
    #[must_use]
    pub fn current(mut self) -> Self {
        self.is_current = true;
        self
    }

    /// Check record invariants
    ///
    /// # Errors
    ///
    /// Fails when `pos` is empty or a frequency is negative (or NaN).
    pub fn validate(&self) -> Result<(), QueryError> {
        let invalid = |reason: &str| QueryError::InvalidMatch {
            lemma: self.lemma.clone(),
            reason: reason.to_string(),
        };
        if self.pos.is_empty() {
            return Err(invalid("no part of speech"));
        }
        for (name, value) in [("abs", self.abs), ("arf", self.arf), ("ipm", self.ipm)] {
            if value.is_nan() || value < 0.0 {
                return Err(invalid(&format!("{name} must be non-negative, got {value}")));
            }
        }
        Ok(())
    }
}

/// Whether the match list represents a dictionary word
#[must_use]
pub fn test_is_dict_match(matches: &[QueryMatch]) -> bool {
    match matches {
        [] => false,
        [single] => !single.is_non_dict.unwrap_or(false),
        _ => true,
    }
}

/// Whether at least one recognized variant is a multi-word expression
#[must_use]
pub fn test_is_multi_word_mode(queries: &[Vec<QueryMatch>]) -> bool {
    queries
        .iter()
        .flatten()
        .any(|m| m.word.chars().any(char::is_whitespace))
}

/// Whether the match has exactly the given POS tags, in order
#[must_use]
pub fn matches_pos(m: &QueryMatch, pos: &[PosTag]) -> bool {
    m.pos.len() == pos.len() && m.pos.iter().zip(pos).all(|(a, b)| a == b)
}

/// The selected variant, falling back to the first one
#[must_use]
pub fn find_current_match(variants: &[QueryMatch]) -> Option<&QueryMatch> {
    variants
        .iter()
        .find(|m| m.is_current)
        .or_else(|| variants.first())
}

// ============================================================================
// Merging
// ============================================================================

struct LemmaGroup<'a> {
    lemma: &'a str,
    members: Vec<&'a QueryMatch>,
}

/// Merge records sharing a lemma into one multi-POS record
///
/// The original list is returned unchanged with merged records added:
/// a merged group whose member frequencies differ at least
/// [`MERGE_CANDIDATE_MIN_DIFF_RATIO`] times is inserted at the front (one
/// clearly dominant sense), any other merged group is appended at the end.
/// Groups are processed in the order their lemma first appeared, each front
/// insertion landing before the previous ones.
#[must_use]
pub fn find_mergeable_query_matches(variants: &[QueryMatch]) -> Vec<QueryMatch> {
    let mut groups: Vec<LemmaGroup<'_>> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for item in variants {
        let idx = *index.entry(item.lemma.as_str()).or_insert_with(|| {
            groups.push(LemmaGroup {
                lemma: item.lemma.as_str(),
                members: Vec::new(),
            });
            groups.len() - 1
        });
        groups[idx].members.push(item);
    }

    let mut ans: VecDeque<QueryMatch> = variants.iter().cloned().collect();
    for group in groups.iter().filter(|g| g.members.len() > 1) {
        let (merged, min_abs, max_abs) = merge_group(group);
        if max_abs / min_abs >= MERGE_CANDIDATE_MIN_DIFF_RATIO {
            ans.push_front(merged);
        } else {
            ans.push_back(merged);
        }
    }
    ans.into()
}

fn merge_group(group: &LemmaGroup<'_>) -> (QueryMatch, f64, f64) {
    let first = group.members[0];
    let ipm: f64 = group.members.iter().map(|m| m.ipm).sum();
    let min_abs = group.members.iter().map(|m| m.abs).fold(first.abs, f64::min);
    let max_abs = group.members.iter().map(|m| m.abs).fold(first.abs, f64::max);
    let merged = QueryMatch {
        lemma: group.lemma.to_string(),
        pos: group
            .members
            .iter()
            .flat_map(|m| m.pos.iter().cloned())
            .collect(),
        word: first.word.clone(),
        abs: group.members.iter().map(|m| m.abs).sum(),
        arf: group.members.iter().map(|m| m.arf).sum(),
        ipm,
        flevel: Some(calc_freq_band(ipm)),
        is_current: false,
        is_non_dict: None,
    };
    (merged, min_abs, max_abs)
}
