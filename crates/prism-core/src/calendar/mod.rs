//! Calendar service abstraction used by the task mirror.
//!
//! Events are all-day entries. An event the mirror created carries the
//! `source_id` of the knowledge-store record it mirrors, which makes
//! [`CalendarService::upsert_event`] idempotent and lets the pull direction
//! skip the mirror's own events.

pub mod memory;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::store::ProviderError;

/// Prefix of `source_id`s for store records created from calendar events.
pub const CALENDAR_SOURCE_PREFIX: &str = "calendar:";

/// Build the store `source_id` for a calendar event.
pub fn calendar_source_id(event_id: &str) -> String {
    format!("{}{}", CALENDAR_SOURCE_PREFIX, event_id)
}

/// True when a store record was created from a calendar event.
pub fn originates_from_calendar(source_id: &str) -> bool {
    source_id.starts_with(CALENDAR_SOURCE_PREFIX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub date: NaiveDate,
    /// Set on events created by the mirror.
    pub source_id: Option<String>,
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// `[today, today + days]`. Negative `days` is treated as zero and the
    /// end saturates at the last representable date.
    pub fn lookahead(today: NaiveDate, days: i64) -> Self {
        let end = today
            .checked_add_days(Days::new(days.max(0).unsigned_abs()))
            .unwrap_or(NaiveDate::MAX);
        Self { start: today, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<CalendarEvent>,
    pub next_page_token: Option<String>,
}

/// Abstract calendar provider.
#[async_trait]
pub trait CalendarService: Send + Sync {
    async fn list_events(
        &self,
        range: &DateRange,
        page_token: Option<&str>,
    ) -> Result<EventPage, ProviderError>;

    /// Create the event for `source_id`, or update it if one exists.
    ///
    /// Returns the event id.
    async fn upsert_event(
        &self,
        source_id: &str,
        title: &str,
        when: NaiveDate,
        description: Option<&str>,
    ) -> Result<String, ProviderError>;
}
