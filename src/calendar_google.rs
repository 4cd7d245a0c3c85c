//! [`CalendarService`] over the Google Calendar v3 REST API.
//!
//! Mirrored events are all-day events. The record they mirror is stored in
//! the event's private extended property `prismSourceId`, which is also how
//! [`upsert_event`](CalendarService::upsert_event) finds an existing event.
//!
//! As with the Notion adapter, every method makes single attempts; the
//! mirror wraps them in [`crate::ratelimit::RateLimiter::call`].

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use prism_core::calendar::{CalendarEvent, CalendarService, DateRange, EventPage};
use prism_core::store::ProviderError;
use reqwest::{Method, Url};
use serde_json::{json, Value};

use crate::config::MirrorConfig;
use crate::http::{self, send_json};

const SOURCE_ID_PROPERTY: &str = "prismSourceId";
const MAX_RESULTS: &str = "250";

pub struct GoogleCalendar {
    client: reqwest::Client,
    events_url: Url,
    token: String,
}

impl GoogleCalendar {
    pub fn new(config: &MirrorConfig, token: String) -> anyhow::Result<Self> {
        let mut events_url = Url::parse(&config.base_url)?;
        events_url
            .path_segments_mut()
            .map_err(|_| anyhow::anyhow!("mirror.base_url cannot be a base URL: {}", config.base_url))?
            .pop_if_empty()
            .extend(["calendars", config.calendar_id.as_str(), "events"]);
        Ok(Self {
            client: http::client()?,
            events_url,
            token,
        })
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.client.request(method, url).bearer_auth(&self.token)
    }

    fn event_url(&self, event_id: &str) -> Url {
        let mut url = self.events_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(event_id);
        }
        url
    }

    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<String>, ProviderError> {
        let mut url = self.events_url.clone();
        url.query_pairs_mut()
            .append_pair("privateExtendedProperty", &format!("{}={}", SOURCE_ID_PROPERTY, source_id))
            .append_pair("maxResults", "1");
        let response = send_json(self.request(Method::GET, url)).await?;
        Ok(response
            .pointer("/items/0/id")
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

fn event_body(source_id: &str, title: &str, when: NaiveDate, description: Option<&str>) -> Value {
    let end = when.checked_add_days(Days::new(1)).unwrap_or(when);
    json!({
        "summary": title,
        "description": description.unwrap_or_default(),
        "start": { "date": when.to_string() },
        "end": { "date": end.to_string() },
        "extendedProperties": { "private": { SOURCE_ID_PROPERTY: source_id } },
    })
}

/// Convert one event resource. Events without a usable start are skipped.
fn parse_event(event: &Value) -> Option<CalendarEvent> {
    let id = event.get("id")?.as_str()?.to_string();
    let start = event.get("start")?;
    let date = start
        .get("date")
        .or_else(|| start.get("dateTime"))
        .and_then(Value::as_str)
        .and_then(|s| s.get(..10))
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())?;
    Some(CalendarEvent {
        id,
        title: event.get("summary").and_then(Value::as_str).unwrap_or_default().to_string(),
        description: event
            .get("description")
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
            .map(str::to_string),
        date,
        source_id: event
            .pointer(&format!("/extendedProperties/private/{}", SOURCE_ID_PROPERTY))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[async_trait]
impl CalendarService for GoogleCalendar {
    async fn list_events(&self, range: &DateRange, page_token: Option<&str>) -> Result<EventPage, ProviderError> {
        let time_max = range.end.checked_add_days(Days::new(1)).unwrap_or(range.end);
        let mut url = self.events_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("timeMin", &format!("{}T00:00:00Z", range.start))
                .append_pair("timeMax", &format!("{}T00:00:00Z", time_max))
                .append_pair("singleEvents", "true")
                .append_pair("orderBy", "startTime")
                .append_pair("maxResults", MAX_RESULTS);
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }

        let response = send_json(self.request(Method::GET, url)).await?;
        let events = response
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(parse_event)
                    .filter(|e| range.contains(e.date))
                    .collect()
            })
            .unwrap_or_default();
        Ok(EventPage {
            events,
            next_page_token: response
                .get("nextPageToken")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn upsert_event(
        &self,
        source_id: &str,
        title: &str,
        when: NaiveDate,
        description: Option<&str>,
    ) -> Result<String, ProviderError> {
        let body = event_body(source_id, title, when, description);
        let response = match self.find_by_source_id(source_id).await? {
            Some(event_id) => {
                send_json(self.request(Method::PATCH, self.event_url(&event_id)).json(&body)).await?
            }
            None => send_json(self.request(Method::POST, self.events_url.clone()).json(&body)).await?,
        };
        response
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Transient("event response without id".to_string()))
    }
}
