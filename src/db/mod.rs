mod repository;
mod schema;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::RejectedCandidate;

pub use repository::Repository;

/// Membership check over every URL ever accepted or rejected.
#[async_trait]
pub trait DiscoveryLedger: Send + Sync {
    async fn known_urls(&self, urls: &[String]) -> Result<HashSet<String>>;

    /// URLs present in neither the grants nor the rejections.
    ///
    /// Fails open: when the lookup errors the whole input comes back, so an
    /// outage costs extra extraction calls instead of missed grants.
    async fn filter_undiscovered(&self, urls: HashSet<String>) -> HashSet<String> {
        if urls.is_empty() {
            return urls;
        }

        let list: Vec<String> = urls.iter().cloned().collect();
        match self.known_urls(&list).await {
            Ok(known) => {
                tracing::info!(
                    checked = urls.len(),
                    known = known.len(),
                    "Filtered already discovered URLs"
                );
                urls.into_iter().filter(|u| !known.contains(u)).collect()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discovery lookup failed, treating all URLs as new");
                urls
            }
        }
    }
}

/// Where rejections are recorded.
#[async_trait]
pub trait RejectionSink: Send + Sync {
    /// Returns false when the URL was already resolved.
    async fn record_rejection(&self, rejection: RejectedCandidate) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    struct BrokenLedger;

    #[async_trait]
    impl DiscoveryLedger for BrokenLedger {
        async fn known_urls(&self, _urls: &[String]) -> Result<HashSet<String>> {
            Err(AppError::Other(anyhow::anyhow!("connection refused")))
        }
    }

    struct PanickingLedger;

    #[async_trait]
    impl DiscoveryLedger for PanickingLedger {
        async fn known_urls(&self, _urls: &[String]) -> Result<HashSet<String>> {
            panic!("empty input must not reach storage");
        }
    }

    #[tokio::test]
    async fn lookup_failure_returns_input_unchanged() {
        let urls: HashSet<String> = ["https://a.example/1", "https://a.example/2"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let result = BrokenLedger.filter_undiscovered(urls.clone()).await;
        assert_eq!(result, urls);
    }

    #[tokio::test]
    async fn empty_input_skips_storage() {
        let result = PanickingLedger.filter_undiscovered(HashSet::new()).await;
        assert!(result.is_empty());
    }
}
