//! Scripted API
//!
//! In-memory implementation of every API trait. Responses are configured up
//! front; every call is recorded so tests can assert on what tiles asked
//! for. The daemon's `--offline` mode runs layouts against
//! [`ScriptedProvider::sample`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ApiError, ApiProvider, ConcArgs, ConcLine, ConcResponse, ConcordanceApi, FreqArgs,
    FreqDistribApi, FreqResponse, FreqRow, SimilarWord, TimeDataPoint, TimeDistribApi,
    TimeDistribArgs, TimeDistribResponse, WordSimApi, WordSimArgs,
};

/// A recorded call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptedCall {
    /// `ConcordanceApi::call`
    Concordance(ConcArgs),
    /// `FreqDistribApi::call`
    Freq(FreqArgs),
    /// `WordSimApi::call`
    WordSim(WordSimArgs),
    /// `TimeDistribApi::call`
    TimeDistrib(TimeDistribArgs),
}

/// Configurable fake backend
#[derive(Debug, Default)]
pub struct ScriptedApi {
    concordance: Option<ConcResponse>,
    concordance_by_query: HashMap<String, (ConcResponse, Duration)>,
    freqs: HashMap<String, Vec<FreqRow>>,
    similar: Option<Vec<SimilarWord>>,
    time_points: Option<Vec<TimeDataPoint>>,
    failure: Option<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<ScriptedCall>>,
}

impl ScriptedApi {
    /// Backend without any configured response (every call fails)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer concordance calls with `resp`
    #[must_use]
    pub fn with_concordance(mut self, resp: ConcResponse) -> Self {
        self.concordance = Some(resp);
        self
    }

    /// Answer concordance calls for the CQL `query` with `resp` after `delay`
    #[must_use]
    pub fn with_concordance_for(mut self, query: impl Into<String>, resp: ConcResponse, delay: Duration) -> Self {
        self.concordance_by_query.insert(query.into(), (resp, delay));
        self
    }

    /// Answer frequency calls for `fcrit` with `rows`
    #[must_use]
    pub fn with_freqs(mut self, fcrit: impl Into<String>, rows: Vec<FreqRow>) -> Self {
        self.freqs.insert(fcrit.into(), rows);
        self
    }

    /// Answer word similarity calls with `words`
    #[must_use]
    pub fn with_similar_words(mut self, words: Vec<SimilarWord>) -> Self {
        self.similar = Some(words);
        self
    }

    /// Answer time distribution calls with `points`
    #[must_use]
    pub fn with_time_points(mut self, points: Vec<TimeDataPoint>) -> Self {
        self.time_points = Some(points);
        self
    }

    /// Fail every call with `reason`
    #[must_use]
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Delay every answer
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Calls received so far
    #[must_use]
    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().clone()
    }

    async fn answer<T: Clone>(&self, call: ScriptedCall, configured: Option<&T>) -> Result<T, ApiError> {
        let what = match &call {
            ScriptedCall::Concordance(_) => "concordance",
            ScriptedCall::Freq(_) => "frequency",
            ScriptedCall::WordSim(_) => "word similarity",
            ScriptedCall::TimeDistrib(_) => "time distribution",
        };
        self.calls.lock().push(call);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.failure {
            return Err(ApiError::Other(reason.clone()));
        }
        configured
            .cloned()
            .ok_or_else(|| ApiError::Other(format!("no scripted {what} response")))
    }

    /// Backend answering every call with small plausible data
    #[must_use]
    pub fn sample() -> Self {
        let lines = ["the old house", "a new house", "house prices rose"]
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                let (left, rest) = text.split_once("house").unwrap_or((text, ""));
                ConcLine {
                    left: left.trim().to_string(),
                    kwic: "house".to_string(),
                    right: rest.trim().to_string(),
                    toknum: 1000 + i as u64,
                }
            })
            .collect();
        let row = |name: &str, freq: u64, ipm: f64| FreqRow {
            name: name.to_string(),
            freq,
            ipm,
        };
        let point = |year: u32, freq: u64| TimeDataPoint {
            datetime: year.to_string(),
            freq,
            norm: 1_000_000,
        };
        Self::new()
            .with_concordance(ConcResponse {
                conc_id: "offline-conc".to_string(),
                corpname: "sample".to_string(),
                subcname: None,
                concsize: 3,
                arf: 2.4,
                ipm: 31.7,
                lines,
            })
            .with_freqs(
                "doc.genre 0",
                vec![row("fiction", 120, 35.5), row("news", 80, 22.0), row("science", 10, 4.1)],
            )
            .with_freqs("doc.medium 0", vec![row("print", 150, 40.2), row("web", 60, 18.0)])
            .with_similar_words(vec![
                SimilarWord {
                    word: "home".to_string(),
                    score: 0.82,
                },
                SimilarWord {
                    word: "building".to_string(),
                    score: 0.61,
                },
                SimilarWord {
                    word: "cottage".to_string(),
                    score: 0.12,
                },
            ])
            .with_time_points(vec![point(2018, 40), point(2019, 55), point(2020, 61)])
    }
}

#[async_trait]
impl ConcordanceApi for ScriptedApi {
    async fn call(&self, args: &ConcArgs) -> Result<ConcResponse, ApiError> {
        let resp = if let Some((resp, delay)) = self.concordance_by_query.get(&args.query) {
            self.calls.lock().push(ScriptedCall::Concordance(args.clone()));
            tokio::time::sleep(*delay).await;
            Ok(resp.clone())
        } else {
            let configured = self.concordance.as_ref();
            self.answer(ScriptedCall::Concordance(args.clone()), configured).await
        };
        resp.map(|resp| ConcResponse {
            corpname: args.corpname.clone(),
            subcname: args.subcname.clone(),
            ..resp
        })
    }
}

#[async_trait]
impl FreqDistribApi for ScriptedApi {
    async fn call(&self, args: &FreqArgs) -> Result<FreqResponse, ApiError> {
        let configured = self.freqs.get(&args.fcrit);
        let rows = self.answer(ScriptedCall::Freq(args.clone()), configured).await?;
        Ok(FreqResponse {
            conc_id: args.conc_id.clone(),
            rows,
        })
    }
}

#[async_trait]
impl WordSimApi for ScriptedApi {
    async fn call(&self, args: &WordSimArgs) -> Result<Vec<SimilarWord>, ApiError> {
        let configured = self.similar.as_ref();
        self.answer(ScriptedCall::WordSim(args.clone()), configured).await
    }
}

#[async_trait]
impl TimeDistribApi for ScriptedApi {
    async fn call(&self, args: &TimeDistribArgs) -> Result<TimeDistribResponse, ApiError> {
        let configured = self.time_points.as_ref();
        let points = self
            .answer(ScriptedCall::TimeDistrib(args.clone()), configured)
            .await?;
        Ok(TimeDistribResponse {
            conc_id: args.conc_id.clone(),
            points,
        })
    }
}

/// Provider mapping URLs to scripted backends
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    apis: HashMap<String, Arc<ScriptedApi>>,
    fallback: Arc<ScriptedApi>,
}

impl ScriptedProvider {
    /// Provider whose unknown URLs fail every call
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider answering every URL with [`ScriptedApi::sample`]
    #[must_use]
    pub fn sample() -> Self {
        Self {
            apis: HashMap::new(),
            fallback: Arc::new(ScriptedApi::sample()),
        }
    }

    /// Serve `url` from `api`
    #[must_use]
    pub fn with_api(mut self, url: impl Into<String>, api: Arc<ScriptedApi>) -> Self {
        self.apis.insert(url.into(), api);
        self
    }

    fn api(&self, url: &str) -> Arc<ScriptedApi> {
        self.apis.get(url).unwrap_or(&self.fallback).clone()
    }
}

impl ApiProvider for ScriptedProvider {
    fn concordance(&self, url: &str) -> Arc<dyn ConcordanceApi> {
        self.api(url)
    }

    fn freq_distrib(&self, url: &str) -> Arc<dyn FreqDistribApi> {
        self.api(url)
    }

    fn word_sim(&self, url: &str) -> Arc<dyn WordSimApi> {
        self.api(url)
    }

    fn time_distrib(&self, url: &str) -> Arc<dyn TimeDistribApi> {
        self.api(url)
    }
}
