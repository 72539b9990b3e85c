use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::config::Config;
use crate::db::RejectionSink;
use crate::models::{GrantCandidate, RejectedCandidate, RejectionReason};
use crate::pipeline::retry::{RetryClass, RetryPolicy, Retryable};
use crate::services::content_fetcher::truncate_chars;

use super::oracle::{Oracle, OracleError};

const SNIPPET_CHARS: usize = 1000;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error("Invalid response: {0}")]
    Invalid(String),
}

impl Retryable for ExtractError {
    fn retry_class(&self) -> RetryClass {
        match self {
            ExtractError::Oracle(e) => e.retry_class(),
            ExtractError::Invalid(_) => RetryClass::Transient,
        }
    }
}

/// A structurally valid oracle reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Candidate(GrantCandidate),
    /// Valid reply, but nothing in the vocabulary fits.
    NoCategory { title: String },
}

#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub retry: RetryPolicy,
    pub min_text_chars: usize,
    pub max_text_chars: usize,
    pub categories: Vec<String>,
}

impl From<&Config> for ExtractionSettings {
    fn from(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::linear(
                config.pipeline.extraction_attempts,
                Duration::from_millis(config.pipeline.extraction_base_delay_ms),
            ),
            min_text_chars: config.pipeline.min_extraction_chars,
            max_text_chars: config.pipeline.max_text_chars,
            categories: config.categories.clone(),
        }
    }
}

pub struct ExtractionClient {
    oracle: Arc<dyn Oracle>,
    rejections: Arc<dyn RejectionSink>,
    settings: ExtractionSettings,
}

impl ExtractionClient {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        rejections: Arc<dyn RejectionSink>,
        settings: ExtractionSettings,
    ) -> Self {
        Self {
            oracle,
            rejections,
            settings,
        }
    }

    /// Every call ends in exactly one of: a returned candidate, or a
    /// recorded rejection whose reason comes back as the error.
    pub async fn extract(
        &self,
        page_text: &str,
        url: &str,
    ) -> std::result::Result<GrantCandidate, RejectionReason> {
        let trimmed = page_text.trim();
        let snippet = truncate_chars(trimmed, SNIPPET_CHARS);

        if trimmed.chars().count() < self.settings.min_text_chars {
            tracing::warn!(url, "Insufficient text content, skipping extraction");
            let reason = RejectionReason::NoMeaningfulContent;
            self.reject(RejectedCandidate::new(url, reason.clone()).with_text(snippet))
                .await;
            return Err(reason);
        }

        let text = truncate_chars(trimmed, self.settings.max_text_chars);
        let text = text.as_str();
        let result = self
            .settings
            .retry
            .run(url, |attempt| async move {
                tracing::debug!(url, attempt, "Calling extraction oracle");
                let value = self.oracle.extract(text, url).await?;
                validate(&value, url, &self.settings.categories)
            })
            .await;

        match result {
            Ok(Extracted::Candidate(candidate)) => {
                tracing::info!(
                    url,
                    title = %candidate.title,
                    deadline = candidate.deadline.as_deref().unwrap_or("none"),
                    category = %candidate.category,
                    "Extracted grant"
                );
                Ok(candidate)
            }
            Ok(Extracted::NoCategory { title }) => {
                tracing::info!(url, title = %title, "Skipped, no matching category");
                let reason = RejectionReason::NoMatchingCategory;
                self.reject(
                    RejectedCandidate::new(url, reason.clone())
                        .with_title(title)
                        .with_text(snippet),
                )
                .await;
                Err(reason)
            }
            Err(e) => {
                tracing::error!(url, error = %e, "Failed to extract grant info");
                let reason = RejectionReason::ExtractionFailed(e.to_string());
                self.reject(RejectedCandidate::new(url, reason.clone()).with_text(snippet))
                    .await;
                Err(reason)
            }
        }
    }

    async fn reject(&self, rejection: RejectedCandidate) {
        let url = rejection.url.clone();
        if let Err(e) = self.rejections.record_rejection(rejection).await {
            tracing::error!(url = %url, error = %e, "Failed to record rejected candidate");
        }
    }
}

/// Checks the reply shape. A missing title is an error (retried); a null
/// or unknown category is a valid "not for us" answer.
pub fn validate(value: &Value, url: &str, categories: &[String]) -> Result<Extracted, ExtractError> {
    let title = match value.get("title") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => return Err(ExtractError::Invalid("missing or invalid title".to_string())),
    };

    let deadline = match value.get("deadline") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    };

    let category = match value.get("category") {
        None | Some(Value::Null) => return Ok(Extracted::NoCategory { title }),
        Some(Value::String(s)) => s.trim(),
        Some(_) => return Err(ExtractError::Invalid("category must be a string or null".to_string())),
    };

    let wanted = category.to_lowercase();
    match categories.iter().find(|c| c.to_lowercase() == wanted) {
        Some(known) => Ok(Extracted::Candidate(GrantCandidate {
            url: url.to_string(),
            title,
            deadline,
            category: known.clone(),
        })),
        None => {
            if !category.is_empty() {
                tracing::debug!(url, category, "Category outside vocabulary");
            }
            Ok(Extracted::NoCategory { title })
        }
    }
}
