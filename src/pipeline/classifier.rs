//! Deadline routing. Pure functions, no I/O.

use chrono::{Days, NaiveDate};

use crate::models::{GrantCandidate, NewGrant, RejectionReason};

pub const DEFAULT_SOON_THRESHOLD_DAYS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Accept(NewGrant),
    Reject(RejectionReason),
}

/// Parses the oracle's day-month-year deadline (`31-12-2024`, `31.12.2024`
/// or `31/12/2024`). Anything else means "open-ended".
pub fn parse_deadline(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("n/a") || raw.eq_ignore_ascii_case("null") {
        return None;
    }

    let parts: Vec<&str> = raw.split(['-', '.', '/']).map(str::trim).collect();
    let [day, month, year] = parts.as_slice() else {
        return None;
    };

    let day: u32 = day.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    let year: i32 = year.parse().ok()?;
    if year < 2000 {
        return None;
    }

    NaiveDate::from_ymd_opt(year, month, day)
}

/// First date that is far enough out to act on. The display filter that
/// hides soon-expiring grants uses the same cutoff.
pub fn soon_cutoff(today: NaiveDate, threshold_days: u32) -> NaiveDate {
    today
        .checked_add_days(Days::new(threshold_days as u64))
        .unwrap_or(NaiveDate::MAX)
}

pub fn classify(candidate: GrantCandidate, today: NaiveDate, threshold_days: u32) -> Classification {
    let deadline = candidate.deadline.as_deref().and_then(parse_deadline);

    if let Some(deadline) = deadline {
        let days_until = (deadline - today).num_days();
        if days_until < 0 {
            return Classification::Reject(RejectionReason::ExpiredDeadline);
        }
        if days_until < threshold_days as i64 {
            return Classification::Reject(RejectionReason::DeadlineTooSoon { threshold_days });
        }
    }

    Classification::Accept(NewGrant {
        url: candidate.url,
        title: candidate.title,
        deadline,
        category: candidate.category,
    })
}
