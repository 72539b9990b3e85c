use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use tokio::time::MissedTickBehavior;

use crate::ai::{ExtractionClient, ExtractionSettings, OpenAiOracle};
use crate::config::Config;
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::models::{Grant, GrantPage, GrantQuery, NewGrant, RejectedRecord};
use crate::pipeline::{CoordinatorSettings, SourceCoordinator};
use crate::services::{build_renderer, LogNotifier, Notifier, Renderer, TelegramNotifier};
use crate::sources::build_sources;

pub struct App {
    config: Config,
    pub repository: Arc<Repository>,
    renderer: Arc<dyn Renderer>,
    coordinator: Option<SourceCoordinator>,
    notifier: Box<dyn Notifier>,
}

impl App {
    pub async fn new(config: Config) -> Result<Self> {
        let repository = Arc::new(Repository::new(&config.db_path).await?);
        let renderer = build_renderer(&config.renderer)?;

        let coordinator = config.openai_api_key.as_ref().map(|key| {
            let oracle = OpenAiOracle::new(
                key.clone(),
                config.openai_model.clone(),
                config.categories.clone(),
                config.oracle_timeout(),
            );
            let extractor = ExtractionClient::new(
                Arc::new(oracle),
                repository.clone(),
                ExtractionSettings::from(&config),
            );
            SourceCoordinator::new(
                repository.clone(),
                repository.clone(),
                Arc::new(extractor),
                renderer.clone(),
                CoordinatorSettings::from(&config),
            )
        });
        if coordinator.is_none() {
            tracing::warn!("openai_api_key is not set, discovery runs are disabled");
        }

        let notifier: Box<dyn Notifier> =
            match (&config.telegram_bot_token, &config.telegram_chat_id) {
                (Some(token), Some(chat_id)) => {
                    Box::new(TelegramNotifier::new(token.clone(), chat_id.clone()))
                }
                _ => {
                    tracing::info!("Telegram is not configured, new grants will be logged");
                    Box::new(LogNotifier)
                }
            };

        Ok(Self {
            config,
            repository,
            renderer,
            coordinator,
            notifier,
        })
    }

    fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    /// One discovery run: every source, one save, one notification.
    /// Returns the grants inserted for the first time.
    pub async fn run_once(&self) -> Result<Vec<Grant>> {
        let coordinator = self
            .coordinator
            .as_ref()
            .ok_or_else(|| AppError::Config("openai_api_key is not set".into()))?;

        tracing::info!("Discovery run started");
        // Adapters are rebuilt per run since cleanup tears down their pools.
        let sources = build_sources(&self.config, self.renderer.clone())?;
        let run = coordinator.run(&sources, Self::today()).await;

        save_and_notify(&self.repository, self.notifier.as_ref(), run.accepted).await
    }

    /// Repeats [`App::run_once`] forever. Failed runs are logged.
    pub async fn run_scheduled(&self) -> Result<()> {
        let hours = self.config.schedule_interval_hours.max(1) as u64;
        let mut interval = tokio::time::interval(Duration::from_secs(hours * 3600));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(every_hours = hours, "Scheduled discovery started");

        loop {
            interval.tick().await;
            if let Err(e) = self.run_once().await {
                tracing::error!(error = %e, "Discovery run failed");
            }
        }
    }

    /// Stored grants still open for applications, soonest deadline first
    /// unless the query asks otherwise.
    pub async fn list(&self, query: GrantQuery) -> Result<GrantPage> {
        visible_grants(
            &self.repository,
            query,
            self.config.pipeline.soon_threshold_days,
            Self::today(),
        )
        .await
    }

    pub async fn rejected(&self, limit: u32) -> Result<Vec<RejectedRecord>> {
        self.repository.rejected_candidates(limit).await
    }

    pub async fn purge(&self) -> Result<usize> {
        let removed = self.repository.purge_expired(Self::today()).await?;
        tracing::info!(removed, "Purged expired grants");
        Ok(removed)
    }
}

/// Persists the accepted grants and reports the new ones. A failed save
/// aborts before anything is sent; a failed notification is only logged.
async fn save_and_notify(
    repository: &Repository,
    notifier: &dyn Notifier,
    accepted: Vec<NewGrant>,
) -> Result<Vec<Grant>> {
    let inserted = repository.save_grants(accepted).await?;
    tracing::info!(new = inserted.len(), "Discovery run finished");

    if let Err(e) = notifier.notify(&inserted).await {
        tracing::warn!(error = %e, "Failed to deliver notification");
    }
    Ok(inserted)
}

/// Hides expired grants and those closing within the same window the
/// classifier rejects, so listings never show what a run would drop.
async fn visible_grants(
    repository: &Repository,
    query: GrantQuery,
    soon_threshold_days: u32,
    today: NaiveDate,
) -> Result<GrantPage> {
    let query = query.hide_expired().hide_expiring_soon(soon_threshold_days);
    repository.grants(query, today).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Days;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _grants: &[Grant]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(AppError::Notify("chat not found".into()))
            } else {
                Ok(())
            }
        }
    }

    fn new_grant(url: &str, title: &str, deadline: Option<NaiveDate>) -> NewGrant {
        NewGrant {
            url: url.to_string(),
            title: title.to_string(),
            deadline,
            category: "освіта".to_string(),
        }
    }

    #[tokio::test]
    async fn notification_failure_does_not_fail_the_run() {
        let repo = Repository::open_in_memory().await.unwrap();
        let notifier = CountingNotifier {
            fail: true,
            ..Default::default()
        };

        let inserted = save_and_notify(
            &repo,
            &notifier,
            vec![new_grant("https://g.example/1", "Grant", None)],
        )
        .await
        .unwrap();

        assert_eq!(inserted.len(), 1);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_save_skips_notification() {
        let repo = Repository::open_in_memory().await.unwrap();
        let notifier = CountingNotifier::default();

        let result = save_and_notify(
            &repo,
            &notifier,
            vec![
                new_grant("https://g.example/1", "Grant", None),
                new_grant("https://g.example/2", "", None),
            ],
        )
        .await;

        assert!(result.is_err());
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_run_still_notifies() {
        let repo = Repository::open_in_memory().await.unwrap();
        let notifier = CountingNotifier::default();

        let inserted = save_and_notify(&repo, &notifier, Vec::new()).await.unwrap();

        assert!(inserted.is_empty());
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listing_hides_grants_closing_inside_the_threshold() {
        let repo = Repository::open_in_memory().await.unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let in_days = |n: u64| today.checked_add_days(Days::new(n));
        repo.save_grants(vec![
            new_grant("https://g.example/soon", "Soon", in_days(3)),
            new_grant("https://g.example/edge", "Edge", in_days(10)),
            new_grant("https://g.example/later", "Later", in_days(30)),
            new_grant("https://g.example/open", "Open", None),
            new_grant("https://g.example/past", "Past", today.checked_sub_days(Days::new(1))),
        ])
        .await
        .unwrap();

        let page = visible_grants(&repo, GrantQuery::default(), 10, today)
            .await
            .unwrap();
        let titles: Vec<&str> = page.grants.iter().map(|g| g.title.as_str()).collect();

        assert_eq!(titles, vec!["Edge", "Later", "Open"]);
        assert_eq!(page.total, 3);
    }
}
