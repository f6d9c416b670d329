//! TOML Configuration File Support
//!
//! Dashboard settings and the tile layout live in a TOML file at
//! `~/.config/wag/dashboard.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`WAG_*`)
//! 3. TOML configuration file
//! 4. Default values (including the built-in [`DEFAULT_LAYOUT`])
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/wag/dashboard.toml` (typically `~/.config/wag/dashboard.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [dashboard]
//! default_query_type = "single"
//! wait_for_timeout_secs = 60
//! request_timeout_secs = 30
//! cache = true
//!
//! [[tiles]]
//! name = "conc"
//! tile_type = "concordance"
//! api_url = ["https://kontext.example.org/first", "https://mirror.example.org/first"]
//! api_priority = [2, 1]
//! corpname = "syn2020"
//!
//! [[tiles]]
//! name = "genres"
//! tile_type = "freq_distrib"
//! wait_for = ["conc"]
//! api_url = "https://kontext.example.org/freqs"
//! corpname = "syn2020"
//! fcrit = ["doc.genre 0", "doc.medium 0"]
//! crit_labels = ["genre", "medium"]
//! ```

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query::QueryType;
use crate::tiles::TileType;

/// Layout used when no configuration file exists
pub const DEFAULT_LAYOUT: &str = r#"
[[tiles]]
name = "concordance"
tile_type = "concordance"
api_url = "https://www.korpus.cz/kontext-api/first"
corpname = "syn2020"
max_lines = 10

[[tiles]]
name = "freq"
tile_type = "freq_distrib"
wait_for = ["concordance"]
api_url = "https://www.korpus.cz/kontext-api/freqs"
corpname = "syn2020"
fcrit = ["doc.genre 0", "doc.medium 0"]
crit_labels = ["genre", "medium"]
max_num_categories = 8

[[tiles]]
name = "time"
tile_type = "time_distrib"
wait_for = ["concordance"]
api_url = "https://www.korpus.cz/kontext-api/freqs"
conc_api_url = "https://www.korpus.cz/kontext-api/first"
corpname = "syn2020"
fcrit = "doc.pubyear 0"

[[tiles]]
name = "similar"
tile_type = "word_sim"
api_url = "https://api.datamuse.com/words"
max_result_items = 10
min_score = 0.1
"#;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value or layout
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// A single string or a list of strings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    /// `key = "value"`
    One(String),
    /// `key = ["a", "b"]`
    Many(Vec<String>),
}

impl OneOrMany {
    /// Flatten into a list
    #[must_use]
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

/// Dashboard section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardToml {
    /// Query type used when a query does not specify one
    pub default_query_type: Option<String>,

    /// Dependency wait limit in seconds (0 disables it)
    pub wait_for_timeout_secs: Option<u64>,

    /// HTTP request timeout in seconds
    pub request_timeout_secs: Option<u64>,

    /// Whether API responses are cached for the run
    pub cache: Option<bool>,
}

/// One `[[tiles]]` entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TileToml {
    /// Unique tile name, referenced by `wait_for`
    pub name: String,

    /// Tile kind
    pub tile_type: TileType,

    /// Names of tiles this one waits for
    #[serde(default)]
    pub wait_for: Vec<String>,

    /// API URL(s)
    pub api_url: OneOrMany,

    /// Weights parallel to `api_url` (higher first)
    #[serde(default)]
    pub api_priority: Vec<f64>,

    /// Concordance endpoints parallel to `api_url` (time_distrib only)
    #[serde(default)]
    pub conc_api_url: Option<OneOrMany>,

    /// Corpus
    #[serde(default)]
    pub corpname: Option<String>,

    /// Subcorpus or subcorpora
    #[serde(default)]
    pub subcname: Option<OneOrMany>,

    /// Frequency criterion or criteria
    #[serde(default)]
    pub fcrit: Option<OneOrMany>,

    /// Labels of the criteria
    #[serde(default)]
    pub crit_labels: Vec<String>,

    /// Rows kept per frequency block
    #[serde(default)]
    pub max_num_categories: Option<usize>,

    /// Minimum frequency
    #[serde(default)]
    pub flimit: Option<u64>,

    /// Concordance lines to fetch
    #[serde(default)]
    pub max_lines: Option<usize>,

    /// Similar words kept
    #[serde(default)]
    pub max_result_items: Option<usize>,

    /// Lowest accepted similarity score
    #[serde(default)]
    pub min_score: Option<f64>,

    /// Handled query types (defaults depend on the tile type)
    #[serde(default)]
    pub query_types: Option<Vec<QueryType>>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WagToml {
    /// Dashboard configuration section
    pub dashboard: DashboardToml,

    /// Tile layout
    pub tiles: Vec<TileToml>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved configuration of one tile
#[derive(Clone, Debug, PartialEq)]
pub struct TileConfig {
    /// Unique tile name
    pub name: String,
    /// Tile kind
    pub tile_type: TileType,
    /// Names of upstream tiles
    pub wait_for: Vec<String>,
    /// API URLs
    pub api_urls: Vec<String>,
    /// Weights parallel to `api_urls`
    pub api_priority: Vec<f64>,
    /// Concordance endpoints parallel to `api_urls` (empty: same as `api_urls`)
    pub conc_api_urls: Vec<String>,
    /// Corpus
    pub corpname: String,
    /// Subcorpora
    pub subcnames: Vec<String>,
    /// Criteria
    pub fcrit: Vec<String>,
    /// Criteria labels
    pub crit_labels: Vec<String>,
    /// Rows kept per frequency block
    pub max_num_categories: Option<usize>,
    /// Minimum frequency
    pub flimit: Option<u64>,
    /// Concordance lines
    pub max_lines: Option<usize>,
    /// Similar words kept
    pub max_result_items: Option<usize>,
    /// Lowest accepted similarity score
    pub min_score: Option<f64>,
    /// Handled query types
    pub query_types: Vec<QueryType>,
}

impl From<TileToml> for TileConfig {
    fn from(toml: TileToml) -> Self {
        let query_types = toml
            .query_types
            .unwrap_or_else(|| toml.tile_type.default_query_types().to_vec());
        Self {
            name: toml.name,
            tile_type: toml.tile_type,
            wait_for: toml.wait_for,
            api_urls: toml.api_url.into_vec(),
            api_priority: toml.api_priority,
            conc_api_urls: toml.conc_api_url.map(OneOrMany::into_vec).unwrap_or_default(),
            corpname: toml.corpname.unwrap_or_default(),
            subcnames: toml.subcname.map(OneOrMany::into_vec).unwrap_or_default(),
            fcrit: toml.fcrit.map(OneOrMany::into_vec).unwrap_or_default(),
            crit_labels: toml.crit_labels,
            max_num_categories: toml.max_num_categories,
            flimit: toml.flimit,
            max_lines: toml.max_lines,
            max_result_items: toml.max_result_items,
            min_score: toml.min_score,
            query_types,
        }
    }
}

/// Centralized configuration for a dashboard run
#[derive(Clone, Debug)]
pub struct DashboardConfig {
    /// Query type used when none is given
    pub default_query_type: QueryType,

    /// Dependency wait limit
    pub wait_for_timeout: Option<Duration>,

    /// HTTP request timeout
    pub request_timeout: Duration,

    /// Whether API responses are cached
    pub cache_enabled: bool,

    /// Tile layout, in registration order
    pub tiles: Vec<TileConfig>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            default_query_type: QueryType::Single,
            wait_for_timeout: Some(Duration::from_secs(60)),
            request_timeout: Duration::from_secs(30),
            cache_enabled: true,
            tiles: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl DashboardConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Tile configuration by name
    #[must_use]
    pub fn tile(&self, name: &str) -> Option<&TileConfig> {
        self.tiles.iter().find(|t| t.name == name)
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/wag/dashboard.toml` or
/// `~/.config/wag/dashboard.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("wag").join("dashboard.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting layout is invalid. A missing config file is not an error
/// (the built-in layout is used).
pub fn load_config() -> Result<DashboardConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the layout fails [`validate`].
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<DashboardConfig, ConfigError> {
    let mut config = DashboardConfig::default();

    let file = match path {
        Some(ref config_path) if config_path.exists() => {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::Read {
                    path: config_path.clone(),
                    source: e,
                })?;
            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
            Some((config_path.clone(), toml_content))
        }
        Some(ref config_path) => {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
            None
        }
        None => None,
    };

    match file {
        Some((config_path, content)) => {
            let toml_config: WagToml = toml::from_str(&content)?;
            apply_toml_config(&mut config, toml_config)?;
            config.config_file_path = Some(config_path);
            config.source = ConfigSource::File;
        }
        None => {
            let toml_config: WagToml = toml::from_str(DEFAULT_LAYOUT)?;
            apply_toml_config(&mut config, toml_config)?;
        }
    }

    apply_env_config(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Parse a configuration from TOML text (no environment, no file)
///
/// # Errors
///
/// Parse and validation errors.
pub fn parse_config_str(content: &str) -> Result<DashboardConfig, ConfigError> {
    let mut config = DashboardConfig::default();
    let toml_config: WagToml = toml::from_str(content)?;
    apply_toml_config(&mut config, toml_config)?;
    validate(&config)?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut DashboardConfig, toml: WagToml) -> Result<(), ConfigError> {
    if let Some(ref query_type) = toml.dashboard.default_query_type {
        config.default_query_type = QueryType::parse(query_type, config.default_query_type)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
    }
    if let Some(secs) = toml.dashboard.wait_for_timeout_secs {
        config.wait_for_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(secs) = toml.dashboard.request_timeout_secs {
        config.request_timeout = Duration::from_secs(secs);
    }
    if let Some(enabled) = toml.dashboard.cache {
        config.cache_enabled = enabled;
    }
    config.tiles = toml.tiles.into_iter().map(TileConfig::from).collect();
    Ok(())
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut DashboardConfig) {
    apply_env_with(config, |key| std::env::var(key).ok());
}

fn apply_env_with<F>(config: &mut DashboardConfig, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = var("WAG_QUERY_TYPE") {
        match QueryType::parse(&value, config.default_query_type) {
            Ok(query_type) => {
                config.default_query_type = query_type;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(error = %e, "ignoring WAG_QUERY_TYPE"),
        }
    }
    if let Some(value) = var("WAG_WAIT_TIMEOUT_SECS") {
        if let Ok(secs) = value.parse::<u64>() {
            config.wait_for_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            config.source = ConfigSource::Env;
        }
    }
    if let Some(value) = var("WAG_REQUEST_TIMEOUT_SECS") {
        if let Ok(secs) = value.parse::<u64>() {
            config.request_timeout = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(value) = var("WAG_CACHE") {
        config.cache_enabled = value != "0" && value.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// Layout Validation
// =============================================================================

/// Check the tile layout
///
/// Rejects duplicate names, unknown or self references in `wait_for`,
/// dependency cycles, tiles without API URLs, priority lists not matching
/// the URLs and tile-type specific requirements.
///
/// # Errors
///
/// [`ConfigError::Validation`] describing the first problem found.
pub fn validate(config: &DashboardConfig) -> Result<(), ConfigError> {
    let invalid = |msg: String| Err(ConfigError::Validation(msg));

    if config.tiles.is_empty() {
        return invalid("no tiles configured".to_string());
    }

    let mut names = HashSet::new();
    for tile in &config.tiles {
        if !names.insert(tile.name.as_str()) {
            return invalid(format!("duplicate tile name '{}'", tile.name));
        }
    }

    for tile in &config.tiles {
        for dep in &tile.wait_for {
            if dep == &tile.name {
                return invalid(format!("tile '{}' waits for itself", tile.name));
            }
            if !names.contains(dep.as_str()) {
                return invalid(format!("tile '{}' waits for unknown tile '{dep}'", tile.name));
            }
        }
        if tile.api_urls.is_empty() {
            return invalid(format!("tile '{}' has no api_url", tile.name));
        }
        if !tile.api_priority.is_empty() && tile.api_priority.len() != tile.api_urls.len() {
            return invalid(format!(
                "tile '{}': api_priority has {} entries for {} api_url entries",
                tile.name,
                tile.api_priority.len(),
                tile.api_urls.len()
            ));
        }
        if !tile.conc_api_urls.is_empty() && tile.conc_api_urls.len() != tile.api_urls.len() {
            return invalid(format!(
                "tile '{}': conc_api_url has {} entries for {} api_url entries",
                tile.name,
                tile.conc_api_urls.len(),
                tile.api_urls.len()
            ));
        }
        if tile.tile_type.requires_upstream() && tile.wait_for.is_empty() {
            return invalid(format!(
                "{} tile '{}' needs an upstream tile in wait_for",
                tile.tile_type, tile.name
            ));
        }
        if tile.tile_type == TileType::FreqDistrib && tile.fcrit.is_empty() {
            return invalid(format!("freq_distrib tile '{}' has no fcrit", tile.name));
        }
        if tile.tile_type == TileType::TimeDistrib && tile.wait_for.len() > 1 {
            return invalid(format!(
                "time_distrib tile '{}' can wait for one tile only",
                tile.name
            ));
        }
    }

    if let Some(name) = find_cycle(&config.tiles) {
        return invalid(format!("dependency cycle through tile '{name}'"));
    }
    Ok(())
}

/// Name of a tile on a dependency cycle, if any
fn find_cycle(tiles: &[TileConfig]) -> Option<&str> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Option<&'a str> {
        match marks.get(name) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => return Some(name),
            None => {}
        }
        marks.insert(name, Mark::Visiting);
        for dep in deps.get(name).copied().unwrap_or_default() {
            if let Some(found) = visit(dep.as_str(), deps, marks) {
                return Some(found);
            }
        }
        marks.insert(name, Mark::Done);
        None
    }

    let deps: HashMap<&str, &[String]> = tiles
        .iter()
        .map(|t| (t.name.as_str(), t.wait_for.as_slice()))
        .collect();
    let mut marks = HashMap::new();
    tiles.iter().find_map(|t| visit(t.name.as_str(), &deps, &mut marks))
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Default query type override
    pub query_type: Option<QueryType>,

    /// Dependency wait limit override (seconds, 0 disables)
    pub wait_for_timeout_secs: Option<u64>,

    /// Request timeout override (seconds)
    pub request_timeout_secs: Option<u64>,

    /// Cache toggle override
    pub cache_enabled: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set query type override
    #[must_use]
    pub fn with_query_type(mut self, query_type: QueryType) -> Self {
        self.query_type = Some(query_type);
        self
    }

    /// Set dependency wait limit override
    #[must_use]
    pub fn with_wait_for_timeout_secs(mut self, secs: u64) -> Self {
        self.wait_for_timeout_secs = Some(secs);
        self
    }

    /// Set request timeout override
    #[must_use]
    pub fn with_request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = Some(secs);
        self
    }

    /// Set cache toggle override
    #[must_use]
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = Some(enabled);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut DashboardConfig) {
        if self.query_type.is_some()
            || self.wait_for_timeout_secs.is_some()
            || self.request_timeout_secs.is_some()
            || self.cache_enabled.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(query_type) = self.query_type {
            config.default_query_type = query_type;
        }
        if let Some(secs) = self.wait_for_timeout_secs {
            config.wait_for_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(enabled) = self.cache_enabled {
            config.cache_enabled = enabled;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
