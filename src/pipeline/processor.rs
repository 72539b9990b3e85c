use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::ai::ExtractionClient;
use crate::db::RejectionSink;
use crate::models::{RejectedCandidate, RejectionReason};
use crate::services::{ContentFetcher, FetchError};

use super::batch::{Outcome, UrlProcessor};
use super::classifier::{classify, Classification};

/// fetch → extract → classify for one URL. Every rejection is recorded
/// before the outcome is returned.
pub struct GrantPipeline {
    fetcher: ContentFetcher,
    extractor: Arc<ExtractionClient>,
    rejections: Arc<dyn RejectionSink>,
    soon_threshold_days: u32,
    today: NaiveDate,
}

impl GrantPipeline {
    pub fn new(
        fetcher: ContentFetcher,
        extractor: Arc<ExtractionClient>,
        rejections: Arc<dyn RejectionSink>,
        soon_threshold_days: u32,
        today: NaiveDate,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            rejections,
            soon_threshold_days,
            today,
        }
    }
}

#[async_trait]
impl UrlProcessor for GrantPipeline {
    async fn process(&self, url: String) -> Outcome {
        let text = match self.fetcher.fetch(&url).await {
            Ok(text) => text,
            Err(FetchError::NoMeaningfulContent) => {
                return Outcome::Rejected {
                    url,
                    reason: RejectionReason::NoMeaningfulContent,
                }
            }
            Err(FetchError::Render(e)) => {
                tracing::warn!(url = %url, error = %e, "Failed to fetch page");
                return Outcome::Failed {
                    url,
                    error: e.to_string(),
                };
            }
        };

        let candidate = match self.extractor.extract(&text, &url).await {
            Ok(candidate) => candidate,
            Err(reason) => return Outcome::Rejected { url, reason },
        };

        let title = candidate.title.clone();
        match classify(candidate, self.today, self.soon_threshold_days) {
            Classification::Accept(grant) => Outcome::Accepted(grant),
            Classification::Reject(reason) => {
                tracing::info!(url = %url, reason = %reason, "Rejected by deadline");
                let rejection = RejectedCandidate::new(url.clone(), reason.clone()).with_title(title);
                if let Err(e) = self.rejections.record_rejection(rejection).await {
                    tracing::error!(url = %url, error = %e, "Failed to record rejected candidate");
                }
                Outcome::Rejected { url, reason }
            }
        }
    }
}
