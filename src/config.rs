use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::pipeline::classifier::DEFAULT_SOON_THRESHOLD_DAYS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    pub openai_api_key: Option<String>,

    #[serde(default = "default_openai_model")]
    pub openai_model: String,

    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,

    #[serde(default = "default_schedule_interval")]
    pub schedule_interval_hours: u32,

    /// Closed vocabulary the oracle must pick a category from.
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,

    #[serde(default)]
    pub renderer: RendererConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RendererBackend {
    #[default]
    Http,
    Browserless,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub backend: RendererBackend,
    pub browserless_url: Option<String>,
    pub browserless_token: Option<String>,
    pub user_agent: String,
    pub timeout_ms: u64,
    /// Grace period for dynamic content to settle after navigation.
    pub settle_ms: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            backend: RendererBackend::Http,
            browserless_url: None,
            browserless_token: None,
            user_agent:
                "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0"
                    .to_string(),
            timeout_ms: 30_000,
            settle_ms: 1_500,
        }
    }
}

impl RendererConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub inter_batch_delay_ms: u64,
    pub soon_threshold_days: u32,
    pub max_items_per_source: usize,
    pub fetch_attempts: u32,
    pub fetch_base_delay_ms: u64,
    pub fetch_max_delay_ms: u64,
    pub extraction_attempts: u32,
    pub extraction_base_delay_ms: u64,
    pub oracle_timeout_ms: u64,
    pub min_content_chars: usize,
    pub min_extraction_chars: usize,
    pub max_text_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            concurrency: 5,
            inter_batch_delay_ms: 1_000,
            soon_threshold_days: DEFAULT_SOON_THRESHOLD_DAYS,
            max_items_per_source: 50,
            fetch_attempts: 3,
            fetch_base_delay_ms: 1_000,
            fetch_max_delay_ms: 8_000,
            extraction_attempts: 3,
            extraction_base_delay_ms: 1_000,
            oracle_timeout_ms: 30_000,
            min_content_chars: 100,
            min_extraction_chars: 50,
            max_text_chars: 20_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Listing,
    Feed,
}

/// One grant source. Selector rules live here, not in code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    pub url: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// CSS selector for grant links on a listing page.
    pub link_selector: Option<String>,
    /// Keep only links containing this substring.
    pub link_pattern: Option<String>,
    /// Listing URL for page N, with `{page}` as placeholder.
    pub page_url_template: Option<String>,
    pub next_page_selector: Option<String>,

    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_db_path() -> String {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("grant-scout");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("grants.db").to_string_lossy().to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_schedule_interval() -> u32 {
    24 * 7
}

fn default_true() -> bool {
    true
}

fn default_max_pages() -> u32 {
    1
}

fn default_categories() -> Vec<String> {
    [
        "освіта",
        "стартапи",
        "підтримка ветеранів",
        "підприємництво",
        "бізнес-школи",
        "корпоративне навчання",
        "програми для жінок",
        "лідерство й резильєнтність",
        "фінанси й інвестиції",
        "HR",
        "інвестиційні проєкти",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

fn listing(name: &str, url: &str, link_selector: &str) -> SourceConfig {
    SourceConfig {
        name: name.to_string(),
        kind: SourceKind::Listing,
        url: url.to_string(),
        enabled: true,
        link_selector: Some(link_selector.to_string()),
        link_pattern: None,
        page_url_template: None,
        next_page_selector: None,
        max_pages: 1,
    }
}

fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig {
            page_url_template: Some("https://www.prostir.ua/category/grants/?next_page={page}".into()),
            max_pages: 4,
            ..listing("Prostir", "https://www.prostir.ua/category/grants/", "div.newsblock h3 a")
        },
        SourceConfig {
            link_pattern: Some("/news/grants/".into()),
            page_url_template: Some("https://gurt.org.ua/news/grants/?page={page}".into()),
            next_page_selector: Some("a.next[href*=\"page=\"]".into()),
            max_pages: 5,
            enabled: false,
            ..listing("Gurt", "https://gurt.org.ua/news/grants/", "table a[href*=\"/news/grants/\"]")
        },
        SourceConfig {
            enabled: false,
            ..listing("Grant.Market", "https://grant.market/opp?mode=fresh", "a.item-title")
        },
        SourceConfig {
            link_pattern: Some("/opportunities/portal/screen/opportunities/topic-details/".into()),
            enabled: false,
            ..listing(
                "EU Portal",
                "https://ec.europa.eu/info/funding-tenders/opportunities/portal/screen/opportunities/calls-for-proposals?order=DESC&pageNumber=1&pageSize=50&sortBy=startDate&keywords=Ukraine&isExactMatch=true&status=31094501,31094502",
                "a.ng-star-inserted",
            )
        },
        SourceConfig {
            name: "OpportunityDesk".to_string(),
            kind: SourceKind::Feed,
            url: "https://opportunitydesk.org/category/grants/feed/".to_string(),
            enabled: false,
            link_selector: None,
            link_pattern: Some("https://opportunitydesk.org/".into()),
            page_url_template: None,
            next_page_selector: None,
            max_pages: 1,
        },
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            openai_api_key: None,
            openai_model: default_openai_model(),
            telegram_bot_token: None,
            telegram_chat_id: None,
            schedule_interval_hours: default_schedule_interval(),
            categories: default_categories(),
            renderer: RendererConfig::default(),
            pipeline: PipelineConfig::default(),
            sources: default_sources(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            let config = Config::default();
            config.save()?;
            config
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("grant-scout")
            .join("config.toml")
    }

    /// Environment-style overrides; `lookup` returns the raw value for a key.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("GRANTS_DB_PATH") {
            self.db_path = v;
        }
        if let Some(v) = lookup("OPENAI_API_KEY") {
            self.openai_api_key = Some(v);
        }
        if let Some(v) = lookup("OPENAI_MODEL") {
            self.openai_model = v;
        }
        if let Some(v) = lookup("TELEGRAM_BOT_TOKEN") {
            self.telegram_bot_token = Some(v);
        }
        if let Some(v) = lookup("TELEGRAM_CHAT_ID") {
            self.telegram_chat_id = Some(v);
        }
        if let Some(v) = lookup("BROWSERLESS_URL") {
            self.renderer.browserless_url = Some(v);
            self.renderer.backend = RendererBackend::Browserless;
        }
        if let Some(v) = lookup("BROWSERLESS_TOKEN") {
            self.renderer.browserless_token = Some(v);
        }

        let p = &mut self.pipeline;
        parse_override(&lookup, "GRANTS_BATCH_SIZE", &mut p.batch_size);
        parse_override(&lookup, "GRANTS_CONCURRENCY", &mut p.concurrency);
        parse_override(&lookup, "GRANTS_BATCH_DELAY_MS", &mut p.inter_batch_delay_ms);
        parse_override(&lookup, "GRANTS_SOON_THRESHOLD_DAYS", &mut p.soon_threshold_days);
        parse_override(&lookup, "GRANTS_MAX_ITEMS", &mut p.max_items_per_source);
        parse_override(&lookup, "GRANTS_ORACLE_TIMEOUT_MS", &mut p.oracle_timeout_ms);
        parse_override(&lookup, "GRANTS_FETCH_ATTEMPTS", &mut p.fetch_attempts);
        parse_override(&lookup, "GRANTS_EXTRACTION_ATTEMPTS", &mut p.extraction_attempts);
        parse_override(&lookup, "GRANTS_RENDER_TIMEOUT_MS", &mut self.renderer.timeout_ms);
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.batch_size == 0 {
            return Err(AppError::Config("batch_size must be at least 1".into()));
        }
        if p.concurrency == 0 {
            return Err(AppError::Config("concurrency must be at least 1".into()));
        }
        if p.fetch_attempts == 0 || p.extraction_attempts == 0 {
            return Err(AppError::Config("retry attempts must be at least 1".into()));
        }
        if self.categories.iter().all(|c| c.trim().is_empty()) {
            return Err(AppError::Config("category vocabulary is empty".into()));
        }
        if self.renderer.backend == RendererBackend::Browserless
            && self.renderer.browserless_url.is_none()
        {
            return Err(AppError::Config(
                "browserless backend selected but browserless_url is not set".into(),
            ));
        }
        for source in &self.sources {
            if source.kind == SourceKind::Listing && source.link_selector.is_none() {
                return Err(AppError::Config(format!(
                    "listing source '{}' has no link_selector",
                    source.name
                )));
            }
        }
        Ok(())
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.oracle_timeout_ms)
    }
}

fn parse_override<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparseable config override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_pipeline_constants() {
        let config = Config::default();
        assert_eq!(config.pipeline.batch_size, 5);
        assert_eq!(config.pipeline.inter_batch_delay_ms, 1_000);
        assert_eq!(config.pipeline.soon_threshold_days, 10);
        assert_eq!(config.pipeline.fetch_attempts, 3);
        assert_eq!(config.pipeline.extraction_attempts, 3);
        assert_eq!(config.pipeline.min_content_chars, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_win_and_bad_values_are_ignored() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[
            ("GRANTS_BATCH_SIZE", "8"),
            ("GRANTS_SOON_THRESHOLD_DAYS", "seven"),
            ("OPENAI_API_KEY", "sk-test"),
            ("BROWSERLESS_URL", "http://localhost:3000"),
        ]));

        assert_eq!(config.pipeline.batch_size, 8);
        assert_eq!(config.pipeline.soon_threshold_days, 10);
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.renderer.backend, RendererBackend::Browserless);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut config = Config::default();
        config.pipeline.batch_size = 0;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn config_round_trips_through_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::default();
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let loaded: Config = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.sources.len(), config.sources.len());
        assert_eq!(loaded.categories, config.categories);
        assert_eq!(loaded.sources[0].kind, SourceKind::Listing);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let loaded: Config = toml::from_str(
            r#"
            db_path = "/tmp/grants.db"

            [pipeline]
            batch_size = 3
            "#,
        )
        .unwrap();
        assert_eq!(loaded.pipeline.batch_size, 3);
        assert_eq!(loaded.pipeline.concurrency, 5);
        assert!(!loaded.sources.is_empty());
    }
}
