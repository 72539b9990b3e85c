use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// An accepted grant as stored in the `grants` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub deadline: Option<NaiveDate>,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the extraction step hands over: validated title and category,
/// deadline still in the raw day-month-year form the oracle produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantCandidate {
    pub url: String,
    pub title: String,
    pub deadline: Option<String>,
    pub category: String,
}

/// A candidate that passed deadline routing and is ready to be saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGrant {
    pub url: String,
    pub title: String,
    pub deadline: Option<NaiveDate>,
    pub category: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Read-side filter for listing stored grants.
#[derive(Debug, Clone, Default)]
pub struct GrantQuery {
    pub category: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub sort: SortOrder,
    pub hide_expired: bool,
    /// Hide grants whose deadline falls inside this many days from today.
    pub hide_expiring_soon: Option<u32>,
}

impl GrantQuery {
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn paginate(mut self, page: u32, limit: u32) -> Self {
        self.page = Some(page.max(1));
        self.limit = Some(limit);
        self
    }

    pub fn sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    pub fn hide_expired(mut self) -> Self {
        self.hide_expired = true;
        self
    }

    pub fn hide_expiring_soon(mut self, threshold_days: u32) -> Self {
        self.hide_expiring_soon = Some(threshold_days);
        self
    }
}

#[derive(Debug, Clone)]
pub struct GrantPage {
    pub grants: Vec<Grant>,
    pub total: i64,
}
