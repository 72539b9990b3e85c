use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use crate::ai::ExtractionClient;
use crate::config::Config;
use crate::db::{DiscoveryLedger, RejectionSink};
use crate::error::Result;
use crate::models::NewGrant;
use crate::services::{ContentFetcher, FetchSettings, RenderPool, Renderer};
use crate::sources::SourceAdapter;

use super::batch::{BatchExecutor, BatchSettings, Outcome};
use super::processor::GrantPipeline;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub batch: BatchSettings,
    pub fetch: FetchSettings,
    pub render_timeout: Duration,
    /// Zero means no cap.
    pub max_items_per_source: usize,
    pub soon_threshold_days: u32,
}

impl From<&Config> for CoordinatorSettings {
    fn from(config: &Config) -> Self {
        Self {
            batch: BatchSettings::from(&config.pipeline),
            fetch: FetchSettings::from(&config.pipeline),
            render_timeout: config.renderer.timeout(),
            max_items_per_source: config.pipeline.max_items_per_source,
            soon_threshold_days: config.pipeline.soon_threshold_days,
        }
    }
}

/// Per-source tally for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceReport {
    pub name: String,
    pub discovered: usize,
    pub undiscovered: usize,
    pub processed: usize,
    pub batches: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub failed: usize,
    pub error: Option<String>,
}

impl SourceReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    fn log(&self) {
        match &self.error {
            Some(error) => tracing::warn!(
                source = %self.name,
                error = %error,
                "Source failed"
            ),
            None => tracing::info!(
                source = %self.name,
                discovered = self.discovered,
                new = self.undiscovered,
                processed = self.processed,
                batches = self.batches,
                accepted = self.accepted,
                rejected = self.rejected,
                failed = self.failed,
                "Source finished"
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct CoordinatorRun {
    /// Accepted grants across every source, ready to be saved together.
    pub accepted: Vec<NewGrant>,
    pub reports: Vec<SourceReport>,
}

pub struct SourceCoordinator {
    ledger: Arc<dyn DiscoveryLedger>,
    rejections: Arc<dyn RejectionSink>,
    extractor: Arc<ExtractionClient>,
    renderer: Arc<dyn Renderer>,
    settings: CoordinatorSettings,
}

impl SourceCoordinator {
    pub fn new(
        ledger: Arc<dyn DiscoveryLedger>,
        rejections: Arc<dyn RejectionSink>,
        extractor: Arc<ExtractionClient>,
        renderer: Arc<dyn Renderer>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            ledger,
            rejections,
            extractor,
            renderer,
            settings,
        }
    }

    /// Runs every source in turn. A failing source is logged and skipped;
    /// `cleanup` is called on each source whatever happened.
    pub async fn run(&self, sources: &[Box<dyn SourceAdapter>], today: NaiveDate) -> CoordinatorRun {
        let mut run = CoordinatorRun::default();
        let mut claimed = HashSet::new();

        for source in sources {
            tracing::info!(source = source.name(), "Processing source");
            let mut report = SourceReport::new(source.name());

            match self
                .run_source(source.as_ref(), today, &mut claimed, &mut report)
                .await
            {
                Ok(accepted) => run.accepted.extend(accepted),
                Err(e) => report.error = Some(e.to_string()),
            }

            source.cleanup().await;
            report.log();
            run.reports.push(report);
        }

        tracing::info!(
            sources = run.reports.len(),
            accepted = run.accepted.len(),
            "Discovery run finished"
        );
        run
    }

    async fn run_source(
        &self,
        source: &dyn SourceAdapter,
        today: NaiveDate,
        claimed: &mut HashSet<String>,
        report: &mut SourceReport,
    ) -> Result<Vec<NewGrant>> {
        let discovered = source.discover().await?;
        report.discovered = discovered.len();

        // URLs handled by an earlier source this run are not persisted yet.
        let ordered = dedup_preserving_order(discovered)
            .into_iter()
            .filter(|url| !claimed.contains(url))
            .collect::<Vec<_>>();
        let fresh = self
            .ledger
            .filter_undiscovered(ordered.iter().cloned().collect())
            .await;
        let mut urls: Vec<String> = ordered.into_iter().filter(|u| fresh.contains(u)).collect();
        report.undiscovered = urls.len();

        let cap = self.settings.max_items_per_source;
        if cap > 0 && urls.len() > cap {
            tracing::info!(
                source = source.name(),
                new = urls.len(),
                cap,
                "Capping URLs for this run"
            );
            urls.truncate(cap);
        }
        if urls.is_empty() {
            tracing::info!(source = source.name(), "No new URLs");
            return Ok(Vec::new());
        }
        claimed.extend(urls.iter().cloned());
        report.processed = urls.len();

        let pool_size = self
            .settings
            .batch
            .concurrency
            .clamp(1, self.settings.batch.batch_size.max(1));
        let pool = Arc::new(RenderPool::new(
            self.renderer.clone(),
            pool_size,
            self.settings.render_timeout,
        ));
        let pipeline = GrantPipeline::new(
            ContentFetcher::new(pool.clone(), self.rejections.clone(), self.settings.fetch.clone()),
            self.extractor.clone(),
            self.rejections.clone(),
            self.settings.soon_threshold_days,
            today,
        );

        let batch_run = BatchExecutor::new(self.settings.batch.clone())
            .run(urls, &pipeline)
            .await;
        pool.close();
        report.batches = batch_run.batch_sizes.len();

        let mut accepted = Vec::new();
        for outcome in batch_run.outcomes {
            match outcome {
                Outcome::Accepted(grant) => {
                    report.accepted += 1;
                    accepted.push(grant);
                }
                Outcome::Rejected { .. } => report.rejected += 1,
                Outcome::Failed { .. } => report.failed += 1,
            }
        }
        Ok(accepted)
    }
}

fn dedup_preserving_order(urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter().filter(|u| seen.insert(u.clone())).collect()
}
