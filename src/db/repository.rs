use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::Result;
use crate::models::{Grant, GrantPage, GrantQuery, NewGrant, RejectedCandidate, RejectedRecord};
use crate::pipeline::classifier::soon_cutoff;

use super::schema::SCHEMA;
use super::{DiscoveryLedger, RejectionSink};

// Stay well under SQLITE_MAX_VARIABLE_NUMBER for IN (...) lookups.
const LOOKUP_CHUNK: usize = 500;
const DATE_FORMAT: &str = "%Y-%m-%d";

const GRANT_COLUMNS: &str = "id, title, url, deadline, category, created_at, updated_at";

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;
        Self::init(conn).await
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    // Grant operations

    /// Upserts the batch in one transaction and returns the rows that were
    /// inserted for the first time. Any failure rolls back the whole batch.
    pub async fn save_grants(&self, grants: Vec<NewGrant>) -> Result<Vec<Grant>> {
        if grants.is_empty() {
            tracing::info!("No grants to save");
            return Ok(Vec::new());
        }

        // Last occurrence wins so a URL repeated in one batch is written once
        // with its final values.
        let mut seen = HashSet::new();
        let mut grants: Vec<NewGrant> = grants
            .into_iter()
            .rev()
            .filter(|g| seen.insert(g.url.clone()))
            .collect();
        grants.reverse();

        let total = grants.len();
        let (inserted, skipped) = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut inserted = Vec::new();
                let mut skipped = Vec::new();

                for grant in grants {
                    let deadline = grant.deadline.map(|d| d.format(DATE_FORMAT).to_string());

                    let rejected: bool = tx.query_row(
                        "SELECT EXISTS(SELECT 1 FROM rejected_candidates WHERE url = ?1)",
                        params![grant.url],
                        |row| row.get(0),
                    )?;
                    if rejected {
                        skipped.push(grant.url);
                        continue;
                    }

                    let existing: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM grants WHERE url = ?1",
                            params![grant.url],
                            |row| row.get(0),
                        )
                        .optional()?;

                    match existing {
                        Some(id) => {
                            tx.execute(
                                r#"UPDATE grants
                                   SET title = ?1, deadline = ?2, category = ?3, updated_at = datetime('now')
                                   WHERE id = ?4"#,
                                params![grant.title, deadline, grant.category, id],
                            )?;
                        }
                        None => {
                            tx.execute(
                                "INSERT INTO grants (title, url, deadline, category) VALUES (?1, ?2, ?3, ?4)",
                                params![grant.title, grant.url, deadline, grant.category],
                            )?;
                            let id = tx.last_insert_rowid();
                            let row = tx.query_row(
                                &format!("SELECT {GRANT_COLUMNS} FROM grants WHERE id = ?1"),
                                params![id],
                                grant_from_row,
                            )?;
                            inserted.push(row);
                        }
                    }
                }

                tx.commit()?;
                Ok((inserted, skipped))
            })
            .await?;

        for url in &skipped {
            tracing::warn!(url = %url, "Skipped grant whose URL was already rejected");
        }
        tracing::info!(
            total,
            inserted = inserted.len(),
            skipped = skipped.len(),
            "Saved grants"
        );

        Ok(inserted)
    }

    pub async fn grants(&self, query: GrantQuery, today: NaiveDate) -> Result<GrantPage> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(category) = query.category.filter(|c| c != "all") {
            conditions.push("category = ?");
            values.push(category);
        }
        if query.hide_expired {
            conditions.push("(deadline IS NULL OR deadline >= ?)");
            values.push(today.format(DATE_FORMAT).to_string());
        }
        if let Some(threshold) = query.hide_expiring_soon {
            conditions.push("(deadline IS NULL OR deadline >= ?)");
            values.push(soon_cutoff(today, threshold).format(DATE_FORMAT).to_string());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let mut sql = format!(
            r#"SELECT {GRANT_COLUMNS} FROM grants{where_clause}
               ORDER BY CASE WHEN deadline IS NULL THEN 1 ELSE 0 END, deadline {}, created_at DESC"#,
            query.sort.as_sql()
        );
        if let (Some(page), Some(limit)) = (query.page, query.limit) {
            let offset = (page.max(1) - 1) as u64 * limit as u64;
            sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
        }
        let count_sql = format!("SELECT COUNT(*) FROM grants{where_clause}");

        let page = self
            .conn
            .call(move |conn| {
                let total: i64 =
                    conn.query_row(&count_sql, params_from_iter(values.iter()), |row| row.get(0))?;
                let mut stmt = conn.prepare(&sql)?;
                let grants = stmt
                    .query_map(params_from_iter(values.iter()), grant_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(GrantPage { grants, total })
            })
            .await?;
        Ok(page)
    }

    pub async fn categories(&self) -> Result<Vec<String>> {
        let categories = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT DISTINCT category FROM grants ORDER BY category ASC")?;
                let categories = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?;
                Ok(categories)
            })
            .await?;
        Ok(categories)
    }

    /// Grants first discovered within the last `days` days.
    pub async fn recent_grants(&self, days: u32) -> Result<Vec<Grant>> {
        let window = format!("-{} days", days);
        let grants = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    r#"SELECT {GRANT_COLUMNS} FROM grants
                       WHERE created_at >= datetime('now', ?1)
                       ORDER BY CASE WHEN deadline IS NULL THEN 1 ELSE 0 END, deadline ASC, created_at DESC"#
                ))?;
                let grants = stmt
                    .query_map(params![window], grant_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(grants)
            })
            .await?;
        Ok(grants)
    }

    /// Housekeeping: drop grants whose deadline is already behind us.
    pub async fn purge_expired(&self, today: NaiveDate) -> Result<usize> {
        let today = today.format(DATE_FORMAT).to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM grants WHERE deadline IS NOT NULL AND deadline < ?1",
                    params![today],
                )?;
                Ok(removed)
            })
            .await?;
        Ok(removed)
    }

    // Rejection operations

    pub async fn rejected_candidates(&self, limit: u32) -> Result<Vec<RejectedRecord>> {
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT id, url, title, rejection_reason, extracted_text, created_at
                       FROM rejected_candidates
                       ORDER BY created_at DESC, id DESC
                       LIMIT ?1"#,
                )?;
                let records = stmt
                    .query_map(params![limit], rejected_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await?;
        Ok(records)
    }
}

#[async_trait]
impl DiscoveryLedger for Repository {
    async fn known_urls(&self, urls: &[String]) -> Result<HashSet<String>> {
        if urls.is_empty() {
            return Ok(HashSet::new());
        }

        let urls = urls.to_vec();
        let known = self
            .conn
            .call(move |conn| {
                let mut known = HashSet::new();
                for chunk in urls.chunks(LOOKUP_CHUNK) {
                    let placeholders = vec!["?"; chunk.len()].join(",");
                    for table in ["grants", "rejected_candidates"] {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT url FROM {table} WHERE url IN ({placeholders})"
                        ))?;
                        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                            row.get::<_, String>(0)
                        })?;
                        for url in rows {
                            known.insert(url?);
                        }
                    }
                }
                Ok(known)
            })
            .await?;
        Ok(known)
    }
}

#[async_trait]
impl RejectionSink for Repository {
    async fn record_rejection(&self, rejection: RejectedCandidate) -> Result<bool> {
        let url = rejection.url.clone();
        let reason = rejection.reason.to_string();
        let log_reason = reason.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    r#"INSERT INTO rejected_candidates (url, title, rejection_reason, extracted_text)
                       SELECT ?1, ?2, ?3, ?4
                       WHERE NOT EXISTS (SELECT 1 FROM grants WHERE url = ?1)
                       ON CONFLICT(url) DO NOTHING"#,
                    params![rejection.url, rejection.title, reason, rejection.extracted_text],
                )?;
                Ok(changed > 0)
            })
            .await?;

        if inserted {
            tracing::info!(url = %url, reason = %log_reason, "Recorded rejected candidate");
        } else {
            tracing::debug!(url = %url, "URL already resolved, rejection not recorded");
        }
        Ok(inserted)
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56+00:00")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // SQLite datetime('now') format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

fn grant_from_row(row: &Row) -> rusqlite::Result<Grant> {
    Ok(Grant {
        id: row.get(0)?,
        title: row.get(1)?,
        url: row.get(2)?,
        deadline: row
            .get::<_, Option<String>>(3)?
            .and_then(|s| NaiveDate::parse_from_str(&s, DATE_FORMAT).ok()),
        category: row.get(4)?,
        created_at: row
            .get::<_, String>(5)
            .ok()
            .and_then(|s| parse_datetime(&s))
            .unwrap_or_else(Utc::now),
        updated_at: row
            .get::<_, String>(6)
            .ok()
            .and_then(|s| parse_datetime(&s))
            .unwrap_or_else(Utc::now),
    })
}

fn rejected_from_row(row: &Row) -> rusqlite::Result<RejectedRecord> {
    Ok(RejectedRecord {
        id: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        rejection_reason: row.get(3)?,
        extracted_text: row.get(4)?,
        created_at: row
            .get::<_, String>(5)
            .ok()
            .and_then(|s| parse_datetime(&s))
            .unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RejectionReason, SortOrder};
    use tokio_test::{assert_err, assert_ok};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn new_grant(url: &str, title: &str, deadline: Option<NaiveDate>) -> NewGrant {
        NewGrant {
            url: url.to_string(),
            title: title.to_string(),
            deadline,
            category: "освіта".to_string(),
        }
    }

    async fn count(repo: &Repository, table: &'static str) -> i64 {
        repo.conn
            .call(move |conn| {
                let n = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })?;
                Ok(n)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn save_reports_only_first_time_inserts() {
        let repo = Repository::open_in_memory().await.unwrap();

        let first = repo
            .save_grants(vec![
                new_grant("https://g.example/1", "First", Some(date(2024, 3, 1))),
                new_grant("https://g.example/2", "Second", None),
            ])
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].deadline, Some(date(2024, 3, 1)));

        let second = repo
            .save_grants(vec![
                new_grant("https://g.example/1", "First (updated)", Some(date(2024, 4, 1))),
                new_grant("https://g.example/3", "Third", None),
            ])
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].url, "https://g.example/3");

        assert_eq!(count(&repo, "grants").await, 3);
        let page = repo.grants(GrantQuery::default(), date(2024, 1, 1)).await.unwrap();
        let updated = page
            .grants
            .iter()
            .find(|g| g.url == "https://g.example/1")
            .unwrap();
        assert_eq!(updated.title, "First (updated)");
        assert_eq!(updated.deadline, Some(date(2024, 4, 1)));
    }

    #[tokio::test]
    async fn repeated_url_in_one_batch_updates_instead_of_duplicating() {
        let repo = Repository::open_in_memory().await.unwrap();
        let inserted = repo
            .save_grants(vec![
                new_grant("https://g.example/1", "Draft", None),
                new_grant("https://g.example/1", "Final", None),
            ])
            .await
            .unwrap();

        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].title, "Final");
        assert_eq!(count(&repo, "grants").await, 1);

        let page = repo.grants(GrantQuery::default(), date(2024, 1, 1)).await.unwrap();
        assert_eq!(page.grants[0].title, "Final");
    }

    #[tokio::test]
    async fn empty_save_is_a_no_op() {
        let repo = Repository::open_in_memory().await.unwrap();
        let inserted = assert_ok!(repo.save_grants(Vec::new()).await);
        assert!(inserted.is_empty());
    }

    #[tokio::test]
    async fn failed_candidate_rolls_back_whole_batch() {
        let repo = Repository::open_in_memory().await.unwrap();
        repo.save_grants(vec![new_grant("https://g.example/0", "Existing", None)])
            .await
            .unwrap();

        // Candidate #3 violates the non-empty title constraint.
        let batch = vec![
            new_grant("https://g.example/1", "One", None),
            new_grant("https://g.example/0", "Existing renamed", None),
            new_grant("https://g.example/3", "", None),
            new_grant("https://g.example/4", "Four", None),
            new_grant("https://g.example/5", "Five", None),
        ];
        assert_err!(repo.save_grants(batch).await);

        assert_eq!(count(&repo, "grants").await, 1);
        let page = repo.grants(GrantQuery::default(), date(2024, 1, 1)).await.unwrap();
        assert_eq!(page.grants[0].title, "Existing");
    }

    #[tokio::test]
    async fn known_urls_spans_both_tables() {
        let repo = Repository::open_in_memory().await.unwrap();
        repo.save_grants(vec![new_grant("https://g.example/accepted", "A", None)])
            .await
            .unwrap();
        repo.record_rejection(RejectedCandidate::new(
            "https://g.example/rejected",
            RejectionReason::NoMatchingCategory,
        ))
        .await
        .unwrap();

        let candidates: HashSet<String> = [
            "https://g.example/accepted",
            "https://g.example/rejected",
            "https://g.example/new",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let fresh = repo.filter_undiscovered(candidates).await;
        assert_eq!(fresh.len(), 1);
        assert!(fresh.contains("https://g.example/new"));
    }

    #[tokio::test]
    async fn rejection_is_recorded_once_and_never_shadows_a_grant() {
        let repo = Repository::open_in_memory().await.unwrap();
        repo.save_grants(vec![new_grant("https://g.example/1", "Grant", None)])
            .await
            .unwrap();

        let shadow = repo
            .record_rejection(RejectedCandidate::new(
                "https://g.example/1",
                RejectionReason::ExpiredDeadline,
            ))
            .await
            .unwrap();
        assert!(!shadow);

        let rejection = RejectedCandidate::new("https://g.example/2", RejectionReason::NoMeaningfulContent)
            .with_text("snippet");
        assert!(repo.record_rejection(rejection.clone()).await.unwrap());
        assert!(!repo.record_rejection(rejection).await.unwrap());

        assert_eq!(count(&repo, "rejected_candidates").await, 1);
    }

    #[tokio::test]
    async fn rejected_url_is_never_promoted_to_grant() {
        let repo = Repository::open_in_memory().await.unwrap();
        repo.record_rejection(RejectedCandidate::new(
            "https://g.example/1",
            RejectionReason::NoMatchingCategory,
        ))
        .await
        .unwrap();

        let inserted = repo
            .save_grants(vec![new_grant("https://g.example/1", "Sneaky", None)])
            .await
            .unwrap();
        assert!(inserted.is_empty());
        assert_eq!(count(&repo, "grants").await, 0);
    }

    #[tokio::test]
    async fn grant_query_filters_sorts_and_paginates() {
        let repo = Repository::open_in_memory().await.unwrap();
        let mut later = new_grant("https://g.example/later", "Later", Some(date(2024, 3, 1)));
        later.category = "HR".to_string();
        repo.save_grants(vec![
            new_grant("https://g.example/open", "Open", None),
            new_grant("https://g.example/expired", "Expired", Some(date(2024, 1, 1))),
            new_grant("https://g.example/soon", "Soon", Some(date(2024, 1, 20))),
            later,
        ])
        .await
        .unwrap();
        let today = date(2024, 1, 15);

        let all = repo.grants(GrantQuery::default(), today).await.unwrap();
        let order: Vec<_> = all.grants.iter().map(|g| g.title.as_str()).collect();
        assert_eq!(order, vec!["Expired", "Soon", "Later", "Open"]);

        let desc = repo
            .grants(GrantQuery::default().sort(SortOrder::Desc), today)
            .await
            .unwrap();
        assert_eq!(desc.grants[0].title, "Later");
        assert_eq!(desc.grants[3].title, "Open");

        let active = repo
            .grants(GrantQuery::default().hide_expired(), today)
            .await
            .unwrap();
        assert_eq!(active.total, 3);

        let actionable = repo
            .grants(GrantQuery::default().hide_expiring_soon(10), today)
            .await
            .unwrap();
        let titles: Vec<_> = actionable.grants.iter().map(|g| g.title.as_str()).collect();
        assert_eq!(titles, vec!["Later", "Open"]);

        let hr = repo.grants(GrantQuery::default().category("HR"), today).await.unwrap();
        assert_eq!(hr.total, 1);

        let page_two = repo
            .grants(GrantQuery::default().paginate(2, 3), today)
            .await
            .unwrap();
        assert_eq!(page_two.total, 4);
        assert_eq!(page_two.grants.len(), 1);
        assert_eq!(page_two.grants[0].title, "Open");
    }

    #[tokio::test]
    async fn categories_recent_and_purge() {
        let repo = Repository::open_in_memory().await.unwrap();
        let mut hr = new_grant("https://g.example/hr", "HR grant", None);
        hr.category = "HR".to_string();
        repo.save_grants(vec![
            hr,
            new_grant("https://g.example/old", "Old", Some(date(2020, 1, 1))),
        ])
        .await
        .unwrap();

        assert_eq!(repo.categories().await.unwrap(), vec!["HR", "освіта"]);
        assert_eq!(repo.recent_grants(7).await.unwrap().len(), 2);

        let removed = repo.purge_expired(date(2024, 1, 15)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(count(&repo, "grants").await, 1);
    }

    #[tokio::test]
    async fn rejected_candidates_read_back_with_reason_tags() {
        let repo = Repository::open_in_memory().await.unwrap();
        repo.record_rejection(
            RejectedCandidate::new(
                "https://g.example/1",
                RejectionReason::DeadlineTooSoon { threshold_days: 10 },
            )
            .with_title("Closing soon"),
        )
        .await
        .unwrap();

        let records = repo.rejected_candidates(50).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rejection_reason, "deadline_less_than_10_days");
        assert_eq!(records[0].title.as_deref(), Some("Closing soon"));
    }

    #[tokio::test]
    async fn state_survives_reopening_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grants.db");
        let path = path.to_string_lossy().to_string();

        {
            let repo = Repository::new(&path).await.unwrap();
            repo.save_grants(vec![new_grant("https://g.example/1", "Kept", None)])
                .await
                .unwrap();
        }

        let repo = Repository::new(&path).await.unwrap();
        let inserted = repo
            .save_grants(vec![new_grant("https://g.example/1", "Kept", None)])
            .await
            .unwrap();
        assert!(inserted.is_empty());
    }
}
