//! Integration tests for tile coordination
//!
//! These tests drive complete dashboards built from TOML layouts against
//! scripted API backends. Tests cover:
//! - A dependent tile fetching exactly once with its upstream's concordance
//! - Independent tiles never suspending
//! - Upstream failures and wait timeouts ending dependent waits
//! - Loads of a superseded query never reaching the next cycle
//! - Multi-block upstream tiles counting as loaded with their last block
//! - Disabled and unsupported tiles staying frozen
//! - Weighted API fallback configured from a file

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

use wag_core::api::scripted::{ScriptedApi, ScriptedCall, ScriptedProvider};
use wag_core::api::{ConcResponse, FreqRow};
use wag_core::config::{load_config_from_path, parse_config_str};
use wag_core::{Action, Dashboard, Query, QueryMatch, QueryType, TileId, TilePayload};

const SETTLE: Duration = Duration::from_secs(10);

const CONC_URL: &str = "scripted://conc";
const FREQ_URL: &str = "scripted://freq";
const SIM_URL: &str = "scripted://sim";

fn layout(wait_for_timeout_secs: u64) -> String {
    format!(
        r#"
[dashboard]
wait_for_timeout_secs = {wait_for_timeout_secs}

[[tiles]]
name = "conc"
tile_type = "concordance"
api_url = "{CONC_URL}"
corpname = "syn2020"

[[tiles]]
name = "freq"
tile_type = "freq_distrib"
wait_for = ["conc"]
api_url = "{FREQ_URL}"
corpname = "syn2020"
fcrit = "doc.genre 0"

[[tiles]]
name = "similar"
tile_type = "word_sim"
api_url = "{SIM_URL}"
"#
    )
}

fn conc(conc_id: &str) -> ConcResponse {
    ConcResponse {
        conc_id: conc_id.to_string(),
        corpname: "syn2020".to_string(),
        concsize: 42,
        ..Default::default()
    }
}

fn genres() -> Vec<FreqRow> {
    vec![
        FreqRow {
            name: "news".to_string(),
            freq: 10,
            ipm: 5.0,
        },
        FreqRow {
            name: "fiction".to_string(),
            freq: 30,
            ipm: 12.0,
        },
    ]
}

fn query(word: &str) -> Query {
    Query::single("cs", vec![QueryMatch::new(word, word, "N").current()])
}

struct Fixture {
    dashboard: Dashboard,
    conc: Arc<ScriptedApi>,
    freq: Arc<ScriptedApi>,
}

fn fixture(wait_for_timeout_secs: u64, conc: ScriptedApi, freq: ScriptedApi) -> Fixture {
    let conc = Arc::new(conc);
    let freq = Arc::new(freq);
    let provider = ScriptedProvider::sample()
        .with_api(CONC_URL, conc.clone())
        .with_api(FREQ_URL, freq.clone());
    let config = parse_config_str(&layout(wait_for_timeout_secs)).unwrap();
    let dashboard = Dashboard::from_config(&config, &provider).unwrap();
    Fixture {
        dashboard,
        conc,
        freq,
    }
}

fn freq_conc_ids(api: &ScriptedApi) -> Vec<String> {
    api.calls()
        .into_iter()
        .filter_map(|call| match call {
            ScriptedCall::Freq(args) => Some(args.conc_id),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Dependent tiles
// =============================================================================

#[tokio::test]
async fn test_dependent_tile_fetches_once_with_upstream_conc() {
    let mut fx = fixture(
        60,
        ScriptedApi::new().with_concordance(conc("c1")),
        ScriptedApi::new().failing("internal server error"),
    );

    fx.dashboard.submit(query("house")).unwrap();
    fx.dashboard.run_until_settled(SETTLE).await.unwrap();

    assert_eq!(freq_conc_ids(&fx.freq), vec!["c1".to_string()]);
    assert_eq!(fx.conc.calls().len(), 1);

    let statuses = fx.dashboard.statuses();
    assert!(!statuses[0].is_busy);
    assert_eq!(statuses[0].error, None);
    assert!(!statuses[1].is_busy);
    assert!(statuses[1]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("internal server error")));
}

#[tokio::test]
async fn test_dependent_tile_loads_blocks() {
    let mut fx = fixture(
        60,
        ScriptedApi::new().with_concordance(conc("c7")),
        ScriptedApi::new().with_freqs("doc.genre 0", genres()),
    );

    fx.dashboard.submit(query("house")).unwrap();
    fx.dashboard.run_until_settled(SETTLE).await.unwrap();

    let snapshot = fx.dashboard.snapshot();
    let freq = &snapshot[1].state;
    assert_eq!(freq["conc_id"], "c7");
    assert_eq!(freq["blocks"][0]["is_ready"], true);
    assert_eq!(freq["blocks"][0]["rows"][0]["name"], "fiction");
    assert_eq!(freq["blocks"][0]["rows"][1]["name"], "news");
}

#[tokio::test]
async fn test_actions_reach_listeners_in_order() {
    let mut fx = fixture(
        60,
        ScriptedApi::new().with_concordance(conc("c1")),
        ScriptedApi::new().with_freqs("doc.genre 0", genres()),
    );
    let seen: Arc<Mutex<Vec<(&'static str, Option<TileId>)>>> = Arc::default();
    let sink = seen.clone();
    let _subscription = fx
        .dashboard
        .subscribe(move |action| sink.lock().push((action.name(), action.tile_id())));

    fx.dashboard.submit(query("house")).unwrap();
    fx.dashboard.run_until_settled(SETTLE).await.unwrap();

    let seen = seen.lock().clone();
    assert_eq!(seen[0], ("SubmitQuery", None));
    let conc_loaded = seen
        .iter()
        .position(|a| a.1 == Some(TileId(0)))
        .unwrap();
    let freq_loaded = seen
        .iter()
        .position(|a| a.1 == Some(TileId(1)))
        .unwrap();
    assert!(conc_loaded < freq_loaded);
}

#[tokio::test]
async fn test_independent_tiles_never_suspend() {
    let mut fx = fixture(
        60,
        ScriptedApi::new()
            .with_concordance(conc("c1"))
            .with_delay(Duration::from_millis(200)),
        ScriptedApi::new().with_freqs("doc.genre 0", genres()),
    );

    fx.dashboard.submit(query("house")).unwrap();
    fx.dashboard.bus_mut().try_step().unwrap();

    let statuses = fx.dashboard.statuses();
    assert!(!statuses[0].suspended);
    assert!(statuses[0].is_busy);
    assert!(statuses[1].suspended);
    assert!(!statuses[2].suspended);

    fx.dashboard.run_until_settled(SETTLE).await.unwrap();
    assert!(fx.dashboard.statuses().iter().all(|s| !s.suspended));
}

#[tokio::test]
async fn test_unrelated_actions_keep_tile_waiting() {
    let mut fx = fixture(
        60,
        ScriptedApi::new()
            .with_concordance(conc("c1"))
            .with_delay(Duration::from_millis(300)),
        ScriptedApi::new().with_freqs("doc.genre 0", genres()),
    );

    fx.dashboard.submit(query("house")).unwrap();
    fx.dashboard.bus_mut().try_step().unwrap();

    let bus = fx.dashboard.bus_mut();
    bus.dispatch(Action::SetActiveBlock {
        tile_id: TileId(0),
        idx: 1,
    });
    bus.dispatch(Action::loaded(TileId(2), 1, TilePayload::WordSim(Vec::new())));
    bus.drain().unwrap();

    let freq = fx.dashboard.statuses()[1].clone();
    assert!(freq.suspended);
    assert!(freq.is_busy);
    assert!(fx.freq.calls().is_empty());

    fx.dashboard.run_until_settled(SETTLE).await.unwrap();
    assert_eq!(freq_conc_ids(&fx.freq), vec!["c1".to_string()]);
}

#[tokio::test]
async fn test_upstream_error_ends_wait_without_fetch() {
    let mut fx = fixture(
        60,
        ScriptedApi::new().failing("corpus unavailable"),
        ScriptedApi::new().with_freqs("doc.genre 0", genres()),
    );

    fx.dashboard.submit(query("house")).unwrap();
    fx.dashboard.run_until_settled(SETTLE).await.unwrap();

    assert!(fx.freq.calls().is_empty());
    let statuses = fx.dashboard.statuses();
    assert!(statuses[0].error.is_some());
    let freq_error = statuses[1].error.clone().unwrap();
    assert!(freq_error.starts_with("failed to obtain required data"), "{freq_error}");
    assert!(!statuses[1].is_busy);
    assert!(!statuses[1].suspended);
}

#[tokio::test]
async fn test_wait_timeout_fails_dependent_tile() {
    let mut fx = fixture(
        1,
        ScriptedApi::new()
            .with_concordance(conc("late"))
            .with_delay(Duration::from_secs(2)),
        ScriptedApi::new().with_freqs("doc.genre 0", genres()),
    );

    fx.dashboard.submit(query("house")).unwrap();
    fx.dashboard.run_until_settled(SETTLE).await.unwrap();

    let statuses = fx.dashboard.statuses();
    assert_eq!(statuses[0].error, None);
    assert_eq!(
        statuses[1].error.as_deref(),
        Some("timed out after 1s waiting for upstream tiles")
    );
    assert!(fx.freq.calls().is_empty());
}

#[tokio::test]
async fn test_new_query_restarts_wait() {
    let mut fx = fixture(
        60,
        ScriptedApi::new().with_concordance(conc("c1")),
        ScriptedApi::new().with_freqs("doc.genre 0", genres()),
    );

    fx.dashboard.submit(query("house")).unwrap();
    fx.dashboard.run_until_settled(SETTLE).await.unwrap();
    fx.dashboard.submit(query("home")).unwrap();
    fx.dashboard.run_until_settled(SETTLE).await.unwrap();

    assert_eq!(
        freq_conc_ids(&fx.freq),
        vec!["c1".to_string(), "c1".to_string()]
    );
    assert!(fx.dashboard.statuses().iter().all(|s| s.error.is_none()));
}

#[tokio::test]
async fn test_slow_load_of_superseded_query_is_ignored() {
    let mut fx = fixture(
        60,
        ScriptedApi::new()
            .with_concordance_for(r#"[lemma="first"]"#, conc("conc-of-first"), Duration::from_millis(200))
            .with_concordance_for(r#"[lemma="second"]"#, conc("conc-of-second"), Duration::from_millis(400)),
        ScriptedApi::new().with_freqs("doc.genre 0", genres()),
    );

    fx.dashboard.submit(query("first")).unwrap();
    fx.dashboard.bus_mut().try_step().unwrap();
    fx.dashboard.submit(query("second")).unwrap();
    fx.dashboard.run_until_settled(SETTLE).await.unwrap();

    assert_eq!(fx.conc.calls().len(), 2);
    assert_eq!(freq_conc_ids(&fx.freq), vec!["conc-of-second".to_string()]);

    let snapshot = fx.dashboard.snapshot();
    assert_eq!(snapshot[0].state["query"], r#"[lemma="second"]"#);
    assert_eq!(snapshot[0].state["conc_id"], "conc-of-second");
    assert_eq!(snapshot[1].state["conc_id"], "conc-of-second");
}

#[tokio::test]
async fn test_tile_waiting_on_freq_tile_sees_all_blocks() {
    let layout = r#"
[[tiles]]
name = "conc"
tile_type = "concordance"
api_url = "scripted://conc"
corpname = "syn2020"

[[tiles]]
name = "freq"
tile_type = "freq_distrib"
wait_for = ["conc"]
api_url = "scripted://freq"
fcrit = ["doc.genre 0", "doc.medium 0"]

[[tiles]]
name = "similar"
tile_type = "word_sim"
wait_for = ["freq"]
api_url = "scripted://sim"
"#;
    // the second criterion has no scripted answer and fails
    let freq = Arc::new(ScriptedApi::new().with_freqs("doc.genre 0", genres()));
    let sim = Arc::new(ScriptedApi::sample());
    let provider = ScriptedProvider::sample()
        .with_api("scripted://freq", freq.clone())
        .with_api("scripted://sim", sim.clone());
    let config = parse_config_str(layout).unwrap();
    let mut dashboard = Dashboard::from_config(&config, &provider).unwrap();

    dashboard.submit(query("house")).unwrap();
    dashboard.run_until_settled(SETTLE).await.unwrap();

    assert_eq!(freq.calls().len(), 2);
    assert!(sim.calls().is_empty());
    let statuses = dashboard.statuses();
    let similar_error = statuses[2].error.clone().unwrap();
    assert!(similar_error.starts_with("failed to obtain required data from tile#1"), "{similar_error}");
}

// =============================================================================
// Disabled tiles
// =============================================================================

#[tokio::test]
async fn test_disabled_tile_stays_frozen() {
    let mut fx = fixture(
        60,
        ScriptedApi::new().with_concordance(conc("c1")),
        ScriptedApi::new().with_freqs("doc.genre 0", genres()),
    );
    let freq_id = fx.dashboard.tile_id("freq").unwrap();
    let before = fx.dashboard.snapshot()[1].state.clone();

    let bus = fx.dashboard.bus_mut();
    bus.disable(freq_id).unwrap();
    bus.dispatch(Action::SubmitQuery {
        query: query("house"),
    });
    fx.dashboard.run_until_settled(SETTLE).await.unwrap();

    let snapshot = fx.dashboard.snapshot();
    assert_eq!(snapshot[1].state, before);
    assert!(snapshot[1].status.disabled);
    assert!(fx.freq.calls().is_empty());
    assert_eq!(snapshot[0].state["conc_id"], "c1");
}

#[tokio::test]
async fn test_unsupported_query_type_disables_tiles() {
    let mut fx = fixture(
        60,
        ScriptedApi::new().with_concordance(conc("c1")),
        ScriptedApi::new().with_freqs("doc.genre 0", genres()),
    );

    fx.dashboard
        .submit(query("house").with_query_type(QueryType::Cmp))
        .unwrap();
    fx.dashboard.run_until_settled(SETTLE).await.unwrap();

    let statuses = fx.dashboard.statuses();
    assert!(!statuses[0].disabled);
    assert!(statuses[1].disabled);
    assert!(statuses[2].disabled);
    assert_eq!(fx.conc.calls().len(), 1);
    assert!(fx.freq.calls().is_empty());
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test]
async fn test_layout_from_file_uses_weighted_fallback() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(
        br#"
[dashboard]
request_timeout_secs = 5

[[tiles]]
name = "conc"
tile_type = "concordance"
api_url = ["scripted://low", "scripted://high"]
api_priority = [1, 3]
corpname = "syn2020"
"#,
    )
    .unwrap();

    let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
    let high = Arc::new(ScriptedApi::new().failing("overloaded"));
    let low = Arc::new(ScriptedApi::new().with_concordance(conc("from-low")));
    let provider = ScriptedProvider::new()
        .with_api("scripted://high", high.clone())
        .with_api("scripted://low", low.clone());
    let mut dashboard = Dashboard::from_config(&config, &provider).unwrap();

    dashboard.submit(query("house")).unwrap();
    dashboard.run_until_settled(SETTLE).await.unwrap();

    assert_eq!(high.calls().len(), 1);
    assert_eq!(low.calls().len(), 1);
    assert_eq!(dashboard.snapshot()[0].state["conc_id"], "from-low");
}
