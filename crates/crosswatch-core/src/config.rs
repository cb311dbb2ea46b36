use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CrosswatchError, Result};

/// Top-level config (crosswatch.toml + CROSSWATCH_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrosswatchConfig {
    pub telegram: TelegramConfig,
    pub output: OutputConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub channels: ChannelListsConfig,
}

impl CrosswatchConfig {
    /// Load config from a TOML file with CROSSWATCH_* env var overrides.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path.map(String::from).unwrap_or_else(default_config_path);

        let config: CrosswatchConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CROSSWATCH_").split("_"))
            .extract()
            .map_err(|e| CrosswatchError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Credential presence check. Failing here is fatal (exit code 1).
    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.as_deref().unwrap_or("").is_empty() {
            return Err(CrosswatchError::MissingCredentials(
                "telegram.bot_token".into(),
            ));
        }
        if self.llm.api_key.is_empty() {
            return Err(CrosswatchError::MissingCredentials("llm.api_key".into()));
        }
        Ok(())
    }
}

/// Transport credentials.
///
/// `api_id`/`api_hash`/`phone`/`session_file` describe an MTProto user
/// session for deployments using one; the bundled adapter authenticates with
/// `bot_token`. Additional read-only sessions come from `readers_file`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    pub api_id: Option<i64>,
    pub api_hash: Option<String>,
    pub phone: Option<String>,
    /// Inline session string; takes precedence over `session_file`.
    pub session_string: Option<String>,
    /// Session file path. The admin bot may rotate this file in place.
    pub session_file: Option<String>,
    pub bot_token: Option<String>,
    /// Path to a JSON array of reader session definitions.
    pub readers_file: Option<String>,
}

/// One entry of the readers JSON list.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReaderAccount {
    pub session: Option<String>,
    pub api_id: Option<i64>,
    pub api_hash: Option<String>,
    pub phone: Option<String>,
    pub token: Option<String>,
}

impl TelegramConfig {
    /// Parse the readers JSON list. A missing file means no extra readers;
    /// a malformed file is a config error.
    pub fn load_readers(&self) -> Result<Vec<ReaderAccount>> {
        let Some(path) = self.readers_file.as_deref() else {
            return Ok(Vec::new());
        };
        if !Path::new(path).exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| CrosswatchError::Config(format!("readers file {}: {}", path, e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Numeric chat id that receives trend reports and alerts.
    pub output_chat: i64,
    /// Numeric chat id that receives mirrored smart-channel posts.
    pub smart_chat: i64,
    /// Destination for batch digests; defaults to `output_chat`.
    pub summary_chat: Option<i64>,
}

impl OutputConfig {
    pub fn summary_chat(&self) -> i64 {
        self.summary_chat.unwrap_or(self.output_chat)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_budget_hourly")]
    pub budget_hourly: u32,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_batch_age_secs")]
    pub max_batch_age_secs: u64,
    #[serde(default = "default_summary_min_interval_secs")]
    pub summary_min_interval_secs: u64,
    #[serde(default = "default_event_merge_window_secs")]
    pub event_merge_window_secs: u64,
    #[serde(default = "default_min_sources")]
    pub min_sources: usize,
    #[serde(default = "default_flush_every_secs")]
    pub flush_every_secs: u64,
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,
    #[serde(default = "default_high_authority_threshold")]
    pub high_authority_threshold: f64,
    #[serde(default = "default_source_authority")]
    pub source_default_authority: f64,
    #[serde(default = "default_smart_authority")]
    pub smart_default_authority: f64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_batch_age_secs: default_max_batch_age_secs(),
            summary_min_interval_secs: default_summary_min_interval_secs(),
            event_merge_window_secs: default_event_merge_window_secs(),
            min_sources: default_min_sources(),
            flush_every_secs: default_flush_every_secs(),
            match_threshold: default_match_threshold(),
            high_authority_threshold: default_high_authority_threshold(),
            source_default_authority: default_source_authority(),
            smart_default_authority: default_smart_authority(),
            retention_secs: default_retention_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,
    #[serde(default = "default_scan_batch_limit")]
    pub scan_batch_limit: usize,
    #[serde(default = "default_round_gap_secs")]
    pub round_gap_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_block_phrases")]
    pub block_phrases: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: default_max_requests_per_minute(),
            scan_batch_limit: default_scan_batch_limit(),
            round_gap_secs: default_round_gap_secs(),
            queue_capacity: default_queue_capacity(),
            block_phrases: default_block_phrases(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl DatabaseConfig {
    pub fn db_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("crosswatch.db")
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelListsConfig {
    #[serde(default = "default_source_list")]
    pub source_list: String,
    #[serde(default = "default_smart_list")]
    pub smart_list: String,
}

impl Default for ChannelListsConfig {
    fn default() -> Self {
        Self {
            source_list: default_source_list(),
            smart_list: default_smart_list(),
        }
    }
}

/// Read a channel-list file: one username per line, leading `@` optional,
/// blank lines and `#` comments skipped.
pub fn load_channel_list(path: &str) -> Result<Vec<String>> {
    let data = std::fs::read_to_string(path).map_err(|e| CrosswatchError::ChannelList {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    let mut out = Vec::new();
    for line in data.lines() {
        let name = line.trim().trim_start_matches('@');
        if name.is_empty() || name.starts_with('#') {
            continue;
        }
        out.push(name.to_string());
    }
    Ok(out)
}

fn default_config_path() -> String {
    "crosswatch.toml".to_string()
}
fn default_llm_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        .to_string()
}
fn default_budget_hourly() -> u32 {
    120
}
fn default_max_in_flight() -> usize {
    5
}
fn default_llm_timeout_secs() -> u64 {
    20
}
fn default_batch_size() -> usize {
    10
}
fn default_max_batch_age_secs() -> u64 {
    180
}
fn default_summary_min_interval_secs() -> u64 {
    120
}
fn default_event_merge_window_secs() -> u64 {
    600
}
fn default_min_sources() -> usize {
    2
}
fn default_flush_every_secs() -> u64 {
    60
}
fn default_match_threshold() -> f64 {
    0.6
}
fn default_high_authority_threshold() -> f64 {
    75.0
}
fn default_source_authority() -> f64 {
    50.0
}
fn default_smart_authority() -> f64 {
    60.0
}
fn default_retention_secs() -> u64 {
    86_400
}
fn default_max_requests_per_minute() -> u32 {
    18
}
fn default_scan_batch_limit() -> usize {
    100
}
fn default_round_gap_secs() -> u64 {
    300
}
fn default_queue_capacity() -> usize {
    512
}
fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_source_list() -> String {
    "source_channels.txt".to_string()
}
fn default_smart_list() -> String {
    "smart_channels.txt".to_string()
}

/// Civil-defense boilerplate and promo phrases that are never intelligence.
fn default_block_phrases() -> Vec<String> {
    [
        "צבע אדום",
        "היכנסו למרחב המוגן",
        "חדירת כלי טיס עוין",
        "°תוכן שיווקי",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
