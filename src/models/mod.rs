mod grant;
mod rejection;

pub use grant::{Grant, GrantCandidate, GrantPage, GrantQuery, NewGrant, SortOrder};
pub use rejection::{RejectedCandidate, RejectedRecord, RejectionReason};
