use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a URL was resolved as "not a grant". Rendered as the short
/// machine-readable tag stored in `rejected_candidates.rejection_reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    NoMeaningfulContent,
    NoMatchingCategory,
    ExpiredDeadline,
    DeadlineTooSoon { threshold_days: u32 },
    ExtractionFailed(String),
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::NoMeaningfulContent => f.write_str("no_meaningful_content"),
            RejectionReason::NoMatchingCategory => f.write_str("no_matching_category"),
            RejectionReason::ExpiredDeadline => f.write_str("expired_deadline"),
            RejectionReason::DeadlineTooSoon { threshold_days } => {
                write!(f, "deadline_less_than_{}_days", threshold_days)
            }
            RejectionReason::ExtractionFailed(detail) => {
                write!(f, "extraction_failed: {}", detail)
            }
        }
    }
}

/// A rejection about to be recorded.
#[derive(Debug, Clone)]
pub struct RejectedCandidate {
    pub url: String,
    pub title: Option<String>,
    pub reason: RejectionReason,
    pub extracted_text: Option<String>,
}

impl RejectedCandidate {
    pub fn new(url: impl Into<String>, reason: RejectionReason) -> Self {
        Self {
            url: url.into(),
            title: None,
            reason,
            extracted_text: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.extracted_text = Some(text.into());
        self
    }
}

/// A rejection as read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub rejection_reason: String,
    pub extracted_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_render_as_storage_tags() {
        assert_eq!(
            RejectionReason::NoMeaningfulContent.to_string(),
            "no_meaningful_content"
        );
        assert_eq!(
            RejectionReason::DeadlineTooSoon { threshold_days: 10 }.to_string(),
            "deadline_less_than_10_days"
        );
        assert_eq!(
            RejectionReason::ExtractionFailed("HTTP 500".into()).to_string(),
            "extraction_failed: HTTP 500"
        );
    }
}
