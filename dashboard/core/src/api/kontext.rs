//! KonText HTTP Clients
//!
//! Clients for KonText-style corpus APIs (`first` for concordances, `freqs`
//! for frequency and time distributions) and for Datamuse-style word
//! similarity services. All of them go through [`cached_get_json`], so equal
//! requests from different tiles hit the network once per dashboard run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::cache::{RequestKey, ResponseCache};
use super::{
    ApiError, ApiProvider, ConcArgs, ConcLine, ConcResponse, ConcordanceApi, FreqArgs,
    FreqDistribApi, FreqResponse, FreqRow, SimilarWord, TimeDataPoint, TimeDistribApi,
    TimeDistribArgs, TimeDistribResponse, WordSimApi, WordSimArgs,
};

/// GET `url` with query `args`, going through the cache
///
/// # Errors
///
/// Transport failures, non-success statuses and undecodable bodies.
pub async fn cached_get_json<A, R>(
    client: &reqwest::Client,
    cache: &dyn ResponseCache,
    url: &str,
    args: &A,
) -> Result<R, ApiError>
where
    A: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let key = RequestKey::new(url, args)?;
    if let Some(value) = cache.get(&key) {
        tracing::debug!(%url, %key, "response cache hit");
        return Ok(serde_json::from_value(value)?);
    }

    let response = client.get(url).query(args).send().await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            url: url.to_string(),
            status,
            body,
        });
    }

    let value: serde_json::Value = response.json().await?;
    let decoded = serde_json::from_value(value.clone())?;
    cache.set(&key, value);
    Ok(decoded)
}

#[derive(Clone)]
struct Endpoint {
    url: String,
    client: reqwest::Client,
    cache: Arc<dyn ResponseCache>,
}

impl Endpoint {
    async fn get<A, R>(&self, args: &A) -> Result<R, ApiError>
    where
        A: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        cached_get_json(&self.client, self.cache.as_ref(), &self.url, args).await
    }
}

// ============================================================================
// Wire Formats
// ============================================================================

#[derive(Serialize)]
struct ConcQuery<'a> {
    corpname: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    usesubcorp: Option<&'a str>,
    q: String,
    pagesize: usize,
    format: &'static str,
}

#[derive(Deserialize)]
struct HttpLineElement {
    #[serde(rename = "str")]
    text: String,
}

#[derive(Deserialize)]
struct HttpLine {
    #[serde(rename = "Left", default)]
    left: Vec<HttpLineElement>,
    #[serde(rename = "Kwic", default)]
    kwic: Vec<HttpLineElement>,
    #[serde(rename = "Right", default)]
    right: Vec<HttpLineElement>,
    #[serde(default)]
    toknum: u64,
}

#[derive(Deserialize)]
struct HttpConcResponse {
    #[serde(rename = "Lines", default)]
    lines: Vec<HttpLine>,
    #[serde(default)]
    concsize: u64,
    #[serde(default)]
    result_arf: f64,
    #[serde(default)]
    result_relative_freq: f64,
    conc_persistence_op_id: String,
}

fn join_elements(elements: &[HttpLineElement]) -> String {
    elements
        .iter()
        .map(|e| e.text.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Serialize)]
struct FreqQuery<'a> {
    corpname: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    usesubcorp: Option<&'a str>,
    q: String,
    fcrit: &'a str,
    flimit: u64,
    freq_sort: &'static str,
    fpage: u32,
    ftt_include_empty: u8,
    format: &'static str,
}

impl<'a> FreqQuery<'a> {
    fn new(corpname: &'a str, subcname: Option<&'a str>, conc_id: &str, fcrit: &'a str, flimit: u64) -> Self {
        Self {
            corpname,
            usesubcorp: subcname,
            q: format!("~{conc_id}"),
            fcrit,
            flimit,
            freq_sort: "rel",
            fpage: 1,
            ftt_include_empty: 0,
            format: "json",
        }
    }
}

#[derive(Deserialize)]
struct HttpWord {
    n: String,
}

#[derive(Deserialize)]
struct HttpFreqItem {
    #[serde(rename = "Word")]
    word: Vec<HttpWord>,
    freq: u64,
    #[serde(default)]
    rel: f64,
    #[serde(default)]
    norm: u64,
}

impl HttpFreqItem {
    fn name(&self) -> String {
        self.word.iter().map(|w| w.n.as_str()).collect::<Vec<_>>().join(" ")
    }
}

#[derive(Deserialize)]
struct HttpFreqBlock {
    #[serde(rename = "Items", default)]
    items: Vec<HttpFreqItem>,
}

#[derive(Deserialize)]
struct HttpFreqResponse {
    #[serde(rename = "Blocks", default)]
    blocks: Vec<HttpFreqBlock>,
    #[serde(default)]
    conc_persistence_op_id: Option<String>,
}

impl HttpFreqResponse {
    /// Items of the first block; KonText returns one block per criterion
    fn into_items(self) -> Vec<HttpFreqItem> {
        self.blocks.into_iter().next().map(|b| b.items).unwrap_or_default()
    }
}

#[derive(Serialize)]
struct WordSimQuery<'a> {
    ml: &'a str,
    max: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    corpname: Option<&'a str>,
}

// ============================================================================
// Clients
// ============================================================================

/// KonText concordance client
#[derive(Clone)]
pub struct KontextConcApi(Endpoint);

#[async_trait]
impl ConcordanceApi for KontextConcApi {
    async fn call(&self, args: &ConcArgs) -> Result<ConcResponse, ApiError> {
        let query = ConcQuery {
            corpname: &args.corpname,
            usesubcorp: args.subcname.as_deref(),
            q: format!("q{}", args.query),
            pagesize: args.max_lines,
            format: "json",
        };
        let resp: HttpConcResponse = self.0.get(&query).await?;
        Ok(ConcResponse {
            conc_id: resp.conc_persistence_op_id,
            corpname: args.corpname.clone(),
            subcname: args.subcname.clone(),
            concsize: resp.concsize,
            arf: resp.result_arf,
            ipm: resp.result_relative_freq,
            lines: resp
                .lines
                .iter()
                .map(|line| ConcLine {
                    left: join_elements(&line.left),
                    kwic: join_elements(&line.kwic),
                    right: join_elements(&line.right),
                    toknum: line.toknum,
                })
                .collect(),
        })
    }
}

/// KonText frequency distribution client
#[derive(Clone)]
pub struct KontextFreqApi(Endpoint);

#[async_trait]
impl FreqDistribApi for KontextFreqApi {
    async fn call(&self, args: &FreqArgs) -> Result<FreqResponse, ApiError> {
        let query = FreqQuery::new(
            &args.corpname,
            args.subcname.as_deref(),
            &args.conc_id,
            &args.fcrit,
            args.flimit,
        );
        let resp: HttpFreqResponse = self.0.get(&query).await?;
        let conc_id = resp
            .conc_persistence_op_id
            .clone()
            .unwrap_or_else(|| args.conc_id.clone());
        let rows = resp
            .into_items()
            .into_iter()
            .map(|item| FreqRow {
                name: item.name(),
                freq: item.freq,
                ipm: item.rel,
            })
            .collect();
        Ok(FreqResponse { conc_id, rows })
    }
}

/// KonText time distribution client (a frequency query on a time attribute)
#[derive(Clone)]
pub struct KontextTimeDistribApi(Endpoint);

#[async_trait]
impl TimeDistribApi for KontextTimeDistribApi {
    async fn call(&self, args: &TimeDistribArgs) -> Result<TimeDistribResponse, ApiError> {
        let query = FreqQuery::new(
            &args.corpname,
            args.subcname.as_deref(),
            &args.conc_id,
            &args.fcrit,
            1,
        );
        let resp: HttpFreqResponse = self.0.get(&query).await?;
        let mut points: Vec<TimeDataPoint> = resp
            .into_items()
            .into_iter()
            .map(|item| TimeDataPoint {
                datetime: item.name(),
                freq: item.freq,
                norm: item.norm,
            })
            .collect();
        points.sort_by(|a, b| a.datetime.cmp(&b.datetime));
        Ok(TimeDistribResponse {
            conc_id: args.conc_id.clone(),
            points,
        })
    }
}

/// Datamuse-style word similarity client (`?ml=<word>&max=<n>`)
#[derive(Clone)]
pub struct HttpWordSimApi(Endpoint);

#[async_trait]
impl WordSimApi for HttpWordSimApi {
    async fn call(&self, args: &WordSimArgs) -> Result<Vec<SimilarWord>, ApiError> {
        let query = WordSimQuery {
            ml: &args.word,
            max: args.max_items,
            corpname: args.corpname.as_deref(),
        };
        self.0.get(&query).await
    }
}

/// Provider of HTTP clients sharing one connection pool and cache
#[derive(Clone)]
pub struct KontextProvider {
    client: reqwest::Client,
    cache: Arc<dyn ResponseCache>,
}

impl KontextProvider {
    /// Create a provider with a per-request timeout
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built (e.g. no TLS backend).
    pub fn new(request_timeout: Duration, cache: Arc<dyn ResponseCache>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, cache })
    }

    fn endpoint(&self, url: &str) -> Endpoint {
        Endpoint {
            url: url.to_string(),
            client: self.client.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl ApiProvider for KontextProvider {
    fn concordance(&self, url: &str) -> Arc<dyn ConcordanceApi> {
        Arc::new(KontextConcApi(self.endpoint(url)))
    }

    fn freq_distrib(&self, url: &str) -> Arc<dyn FreqDistribApi> {
        Arc::new(KontextFreqApi(self.endpoint(url)))
    }

    fn word_sim(&self, url: &str) -> Arc<dyn WordSimApi> {
        Arc::new(HttpWordSimApi(self.endpoint(url)))
    }

    fn time_distrib(&self, url: &str) -> Arc<dyn TimeDistribApi> {
        Arc::new(KontextTimeDistribApi(self.endpoint(url)))
    }
}
