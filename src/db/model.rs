//! View models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};

/// Progress slice of a staging row, used for status listings.
#[derive(Debug, Clone)]
pub struct StagingSummary {
    pub id: String,
    pub title: Option<String>,
    pub route_count: i64,
    pub uploaded_count: i64,
    pub total_upload_count: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StagingSummary {
    pub fn is_pending(&self) -> bool {
        self.finished_at.is_none()
    }
}
