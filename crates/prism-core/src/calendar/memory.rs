//! In-memory [`CalendarService`] for tests and dry runs.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::NaiveDate;

use super::{CalendarEvent, CalendarService, DateRange, EventPage};
use crate::store::ProviderError;

const PAGE_SIZE: usize = 50;

#[derive(Default)]
struct Inner {
    events: Vec<CalendarEvent>,
    next_id: u64,
}

#[derive(Default)]
pub struct InMemoryCalendar {
    inner: RwLock<Inner>,
}

impl InMemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event created outside the mirror. Returns its id.
    pub fn add_external(&self, title: &str, date: NaiveDate) -> String {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let id = format!("evt-{}", inner.next_id);
        inner.events.push(CalendarEvent {
            id: id.clone(),
            title: title.to_string(),
            description: None,
            date,
            source_id: None,
        });
        id
    }

    pub fn events(&self) -> Vec<CalendarEvent> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.events.clone()
    }
}

#[async_trait]
impl CalendarService for InMemoryCalendar {
    async fn list_events(
        &self,
        range: &DateRange,
        page_token: Option<&str>,
    ) -> Result<EventPage, ProviderError> {
        let offset: usize = match page_token {
            None => 0,
            Some(t) => t.parse().map_err(|_| ProviderError::Rejected {
                status: 400,
                message: format!("invalid pageToken '{}'", t),
            })?,
        };
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let matching: Vec<CalendarEvent> = inner
            .events
            .iter()
            .filter(|e| range.contains(e.date))
            .cloned()
            .collect();
        let start = offset.min(matching.len());
        let end = (start + PAGE_SIZE).min(matching.len());
        Ok(EventPage {
            events: matching[start..end].to_vec(),
            next_page_token: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn upsert_event(
        &self,
        source_id: &str,
        title: &str,
        when: NaiveDate,
        description: Option<&str>,
    ) -> Result<String, ProviderError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = inner
            .events
            .iter_mut()
            .find(|e| e.source_id.as_deref() == Some(source_id))
        {
            existing.title = title.to_string();
            existing.date = when;
            existing.description = description.map(str::to_string);
            return Ok(existing.id.clone());
        }
        inner.next_id += 1;
        let id = format!("evt-{}", inner.next_id);
        inner.events.push(CalendarEvent {
            id: id.clone(),
            title: title.to_string(),
            description: description.map(str::to_string),
            date: when,
            source_id: Some(source_id.to_string()),
        });
        Ok(id)
    }
}
