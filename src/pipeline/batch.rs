use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::config::PipelineConfig;
use crate::models::{NewGrant, RejectionReason};

/// Final state of one URL after its pipeline ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted(NewGrant),
    Rejected { url: String, reason: RejectionReason },
    /// Not resolved this run (e.g. rendering kept failing); may be retried next run.
    Failed { url: String, error: String },
}

impl Outcome {
    #[cfg(test)]
    pub fn url(&self) -> &str {
        match self {
            Outcome::Accepted(grant) => &grant.url,
            Outcome::Rejected { url, .. } | Outcome::Failed { url, .. } => url,
        }
    }
}

/// One URL's fetch → extract → classify → route pipeline.
#[async_trait]
pub trait UrlProcessor: Send + Sync {
    async fn process(&self, url: String) -> Outcome;
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub inter_batch_delay: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            concurrency: 5,
            inter_batch_delay: Duration::from_millis(1000),
        }
    }
}

impl From<&PipelineConfig> for BatchSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            concurrency: config.concurrency,
            inter_batch_delay: Duration::from_millis(config.inter_batch_delay_ms),
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchRun {
    /// In completion order, not input order.
    pub outcomes: Vec<Outcome>,
    pub batch_sizes: Vec<usize>,
}

pub struct BatchExecutor {
    settings: BatchSettings,
}

impl BatchExecutor {
    pub fn new(settings: BatchSettings) -> Self {
        Self { settings }
    }

    /// Processes `urls` in fixed-size batches. URLs inside a batch run
    /// concurrently and independently; batches are separated by the
    /// configured delay.
    pub async fn run<P>(&self, urls: Vec<String>, processor: &P) -> BatchRun
    where
        P: UrlProcessor + ?Sized,
    {
        let batch_size = self.settings.batch_size.max(1);
        let concurrency = self.settings.concurrency.clamp(1, batch_size);
        let total_batches = urls.len().div_ceil(batch_size);
        let mut run = BatchRun::default();

        for (index, batch) in urls.chunks(batch_size).enumerate() {
            let batch_number = index + 1;
            tracing::info!(
                batch = batch_number,
                total_batches,
                size = batch.len(),
                "Processing batch"
            );

            let outcomes: Vec<Outcome> = stream::iter(batch.iter().cloned())
                .map(|url| processor.process(url))
                .buffer_unordered(concurrency)
                .collect()
                .await;

            let accepted = outcomes
                .iter()
                .filter(|o| matches!(o, Outcome::Accepted(_)))
                .count();
            tracing::info!(
                batch = batch_number,
                accepted,
                size = batch.len(),
                "Batch completed"
            );

            run.batch_sizes.push(batch.len());
            run.outcomes.extend(outcomes);

            if batch_number < total_batches && !self.settings.inter_batch_delay.is_zero() {
                tracing::debug!(
                    delay_ms = self.settings.inter_batch_delay.as_millis() as u64,
                    "Waiting before next batch"
                );
                tokio::time::sleep(self.settings.inter_batch_delay).await;
            }
        }

        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Tracks how many URLs are in flight at once.
    #[derive(Default)]
    struct Recorder {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UrlProcessor for Recorder {
        async fn process(&self, url: String) -> Outcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(url.clone());

            if url.ends_with("/bad") {
                Outcome::Failed {
                    url,
                    error: "render timeout".to_string(),
                }
            } else {
                Outcome::Rejected {
                    url,
                    reason: RejectionReason::NoMatchingCategory,
                }
            }
        }
    }

    fn urls(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("https://g.example/{i}")).collect()
    }

    fn settings(batch_size: usize, concurrency: usize) -> BatchSettings {
        BatchSettings {
            batch_size,
            concurrency,
            inter_batch_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn seven_urls_make_two_batches_covering_each_once() {
        let recorder = Recorder::default();
        let executor = BatchExecutor::new(settings(5, 5));

        let run = executor.run(urls(7), &recorder).await;

        assert_eq!(run.batch_sizes, vec![5, 2]);
        assert_eq!(run.outcomes.len(), 7);
        let covered: HashSet<&str> = run.outcomes.iter().map(|o| o.url()).collect();
        assert_eq!(covered.len(), 7);
        assert_eq!(recorder.seen.lock().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let recorder = Recorder::default();
        let executor = BatchExecutor::new(settings(6, 3));

        executor.run(urls(12), &recorder).await;

        let peak = recorder.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency was {peak}");
        assert!(peak >= 2, "batch did not run concurrently");
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_siblings() {
        let recorder = Recorder::default();
        let executor = BatchExecutor::new(settings(5, 5));
        let mut input = urls(3);
        input.insert(1, "https://g.example/bad".to_string());

        let run = executor.run(input, &recorder).await;

        assert_eq!(run.outcomes.len(), 4);
        let failed = run
            .outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Failed { .. }))
            .count();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn empty_input_runs_no_batches() {
        let executor = BatchExecutor::new(settings(5, 5));
        let run = executor.run(Vec::new(), &Recorder::default()).await;
        assert!(run.batch_sizes.is_empty());
        assert!(run.outcomes.is_empty());
    }

    #[tokio::test]
    async fn delay_separates_batches_but_not_the_last() {
        let executor = BatchExecutor::new(BatchSettings {
            batch_size: 2,
            concurrency: 2,
            inter_batch_delay: Duration::from_millis(30),
        });

        let started = std::time::Instant::now();
        executor.run(urls(4), &Recorder::default()).await;

        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
