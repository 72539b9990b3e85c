use std::sync::Arc;
use std::time::Duration;

use scraper::{Html, Selector};
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::db::RejectionSink;
use crate::models::{RejectedCandidate, RejectionReason};
use crate::pipeline::retry::RetryPolicy;
use crate::services::renderer::{RenderError, RenderPool};

/// Content regions tried in order before falling back to the whole document.
const CONTENT_SELECTORS: &[&str] = &[
    "article",
    ".post-content",
    ".entry-content",
    "main",
    "#content",
    ".content",
];

const SNIPPET_CHARS: usize = 1000;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("No meaningful content on page")]
    NoMeaningfulContent,

    #[error("Rendering failed: {0}")]
    Render(#[from] RenderError),
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub retry: RetryPolicy,
    pub min_content_chars: usize,
    pub max_text_chars: usize,
}

impl From<&PipelineConfig> for FetchSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            retry: RetryPolicy::exponential(
                config.fetch_attempts,
                Duration::from_millis(config.fetch_base_delay_ms),
                Duration::from_millis(config.fetch_max_delay_ms),
            ),
            min_content_chars: config.min_content_chars,
            max_text_chars: config.max_text_chars,
        }
    }
}

pub struct ContentFetcher {
    pool: Arc<RenderPool>,
    rejections: Arc<dyn RejectionSink>,
    settings: FetchSettings,
}

impl ContentFetcher {
    pub fn new(
        pool: Arc<RenderPool>,
        rejections: Arc<dyn RejectionSink>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            pool,
            rejections,
            settings,
        }
    }

    /// Rendered, readable page text, capped at the configured length.
    ///
    /// Pages without meaningful content are recorded as rejected. Rendering
    /// failures are returned to the caller without a rejection so the URL
    /// can be tried again on a later run.
    pub async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let html = self
            .settings
            .retry
            .run(url, |attempt| async move {
                tracing::debug!(url, attempt, "Fetching page");
                self.pool.render(url).await
            })
            .await?;

        match extract_page_text(&html, self.settings.min_content_chars) {
            Some(text) => {
                tracing::debug!(url, chars = text.chars().count(), "Extracted page text");
                Ok(truncate_chars(&text, self.settings.max_text_chars))
            }
            None => {
                let rejection = RejectedCandidate::new(url, RejectionReason::NoMeaningfulContent)
                    .with_text(truncate_chars(html.trim(), SNIPPET_CHARS));
                if let Err(e) = self.rejections.record_rejection(rejection).await {
                    tracing::error!(url, error = %e, "Failed to record rejected candidate");
                }
                Err(FetchError::NoMeaningfulContent)
            }
        }
    }
}

/// Readable text from the most specific content region that has more than
/// `min_chars` characters, else from the whole document.
pub fn extract_page_text(html: &str, min_chars: usize) -> Option<String> {
    let document = Html::parse_document(html);

    for selector_str in CONTENT_SELECTORS {
        let Ok(selector) = Selector::parse(selector_str) else {
            continue;
        };
        let text = document
            .select(&selector)
            .flat_map(|el| el.text())
            .collect::<Vec<_>>()
            .join(" ");
        let text = collapse_whitespace(&text);
        if text.chars().count() > min_chars {
            tracing::trace!(selector = selector_str, "Using content region");
            return Some(text);
        }
    }

    // Use html2text to convert the whole document to plain text
    let text = match html2text::from_read(html.as_bytes(), 120) {
        Ok(t) => t,
        Err(e) => {
            tracing::debug!("Failed to convert HTML to text: {}", e);
            return None;
        }
    };

    let cleaned: String = text
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    if cleaned.chars().count() > min_chars {
        Some(cleaned)
    } else {
        tracing::debug!("Extracted content too short ({} chars)", cleaned.chars().count());
        None
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cuts `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}
