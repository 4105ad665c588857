/*!
 * iCal Feed Adapter
 *
 * Fetches a remote `.ics` feed over HTTP(S) and normalizes its `VEVENT`
 * components, grounded on the engine's legacy iCalendar parsing
 * (`parse_icalendar_events`/`convert_ical_event_to_calendar_event`).
 */

use async_trait::async_trait;
use chrono::Utc;
use icalendar::{Calendar as IcalCalendar, CalendarComponent, Component, EventLike};
use reqwest::Client;

use crate::calendar::datetime::parse_source_datetime;
use crate::calendar::error::{CalendarError, CalendarResult};
use crate::calendar::providers::traits::Adapter;
use crate::calendar::types::{CalendarSource, EventLocation, HealthStatus, NormalizedEvent, RawEvent, SourceType};

pub struct IcalAdapter {
    client: Client,
}

impl IcalAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn fetch_ics(&self, source: &CalendarSource) -> CalendarResult<String> {
        let response = self.client.get(&source.url).send().await.map_err(|e| CalendarError::NetworkError {
            message: e.to_string(),
            source_id: source.id.clone(),
            is_timeout: e.is_timeout(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CalendarError::ProtocolError {
                message: format!("unexpected status {} fetching ical feed", status),
                source_id: source.id.clone(),
            });
        }

        response.text().await.map_err(|e| CalendarError::NetworkError {
            message: e.to_string(),
            source_id: source.id.clone(),
            is_timeout: e.is_timeout(),
        })
    }
}

#[async_trait]
impl Adapter for IcalAdapter {
    fn supported_type(&self) -> SourceType {
        SourceType::Ical
    }

    async fn fetch_events(&self, source: &CalendarSource) -> CalendarResult<Vec<RawEvent>> {
        let body = self.fetch_ics(source).await?;

        let calendar: IcalCalendar = body.parse().map_err(|e| CalendarError::ProtocolError {
            message: format!("failed to parse ical feed: {}", e),
            source_id: source.id.clone(),
        })?;

        let mut raw_events = Vec::new();
        for component in calendar.components {
            if let CalendarComponent::Event(event) = component {
                let uid = event.get_uid().unwrap_or_default().to_string();
                let payload = event_payload(&event);
                raw_events.push(RawEvent { id: uid, payload });
            }
        }
        Ok(raw_events)
    }

    fn normalize_event(&self, source: &CalendarSource, raw: RawEvent) -> CalendarResult<NormalizedEvent> {
        normalize_payload(source, raw)
    }

    async fn validate_source(&self, source: &CalendarSource) -> CalendarResult<()> {
        if !source.url.starts_with("http://") && !source.url.starts_with("https://") {
            return Err(CalendarError::ConfigurationError {
                message: "ical source url must be http(s)".to_string(),
                field: Some("url".to_string()),
            });
        }
        self.fetch_ics(source).await?;
        Ok(())
    }

    async fn get_source_status(&self, source: &CalendarSource) -> CalendarResult<HealthStatus> {
        let started = std::time::Instant::now();
        match self.fetch_ics(source).await {
            Ok(_) => Ok(HealthStatus {
                source_id: source.id.clone(),
                is_healthy: true,
                last_check: Utc::now(),
                response_time_ms: Some(started.elapsed().as_millis() as u64),
                error_message: None,
            }),
            Err(e) => Ok(HealthStatus {
                source_id: source.id.clone(),
                is_healthy: false,
                last_check: Utc::now(),
                response_time_ms: Some(started.elapsed().as_millis() as u64),
                error_message: Some(e.to_string()),
            }),
        }
    }
}

/// Converts a parsed `VEVENT` component into the JSON payload both the iCal
/// and CalDAV adapters carry inside `RawEvent` (they share the same wire
/// shape, since CalDAV's `calendar-data` blocks are themselves iCalendar).
pub(super) fn event_payload(event: &icalendar::Event) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    if let Some(summary) = event.get_summary() {
        map.insert("summary".to_string(), serde_json::Value::String(summary.to_string()));
    }
    if let Some(description) = event.get_description() {
        map.insert("description".to_string(), serde_json::Value::String(description.to_string()));
    }
    if let Some(location) = event.get_location() {
        map.insert("location".to_string(), serde_json::Value::String(location.to_string()));
    }
    if let Some(start) = event.properties().get("DTSTART") {
        map.insert("dtstart".to_string(), serde_json::Value::String(start.value().to_string()));
        if let Some(tzid) = start.params().get("TZID") {
            map.insert("tzid".to_string(), serde_json::Value::String(tzid.value().to_string()));
        }
    }
    if let Some(end) = event.properties().get("DTEND") {
        map.insert("dtend".to_string(), serde_json::Value::String(end.value().to_string()));
    }
    if let Some(rrule) = event.properties().get("RRULE") {
        map.insert("rrule".to_string(), serde_json::Value::String(rrule.value().to_string()));
    }
    serde_json::Value::Object(map)
}

/// Shared normalization from the JSON payload produced by [`event_payload`]
/// into a [`NormalizedEvent`].
pub(super) fn normalize_payload(source: &CalendarSource, raw: RawEvent) -> CalendarResult<NormalizedEvent> {
    let title = raw.payload.get("summary").and_then(|v| v.as_str()).unwrap_or("(no title)").to_string();
    let description = raw.payload.get("description").and_then(|v| v.as_str()).map(|s| s.to_string());
    let location_name = raw.payload.get("location").and_then(|v| v.as_str());

    let start_raw = raw.payload.get("dtstart").and_then(|v| v.as_str()).ok_or_else(|| CalendarError::NormalizationError {
        message: "missing DTSTART".to_string(),
        source_id: source.id.clone(),
    })?;
    let end_raw = raw.payload.get("dtend").and_then(|v| v.as_str());
    let tz_hint = raw.payload.get("tzid").and_then(|v| v.as_str());

    let start_date = parse_source_datetime(start_raw, tz_hint, &source.id)?;
    let end_date = match end_raw {
        Some(raw_end) => parse_source_datetime(raw_end, tz_hint, &source.id)?,
        None => start_date + chrono::Duration::hours(1),
    };

    Ok(NormalizedEvent {
        id: format!("{}:{}", source.id, raw.id),
        source_id: source.id.clone(),
        title,
        description,
        start_date,
        end_date,
        location: location_name.map(|name| EventLocation { name: name.to_string(), address: None }),
        organizer: None,
        categories: vec![],
        url: None,
        last_modified: Utc::now(),
        recurrence: raw.payload.get("rrule").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> CalendarSource {
        CalendarSource::new("s1", "Test", SourceType::Ical, "https://example.com/cal.ics")
    }

    #[test]
    fn rejects_non_http_urls() {
        let adapter = IcalAdapter::new(Client::new());
        let mut src = source();
        src.url = "file:///etc/passwd".to_string();
        let result = tokio_test::block_on(adapter.validate_source(&src));
        assert!(result.is_err());
    }

    #[test]
    fn normalizes_minimal_event() {
        let adapter = IcalAdapter::new(Client::new());
        let mut payload = serde_json::Map::new();
        payload.insert("summary".to_string(), serde_json::Value::String("Standup".to_string()));
        payload.insert("dtstart".to_string(), serde_json::Value::String("20240115T090000Z".to_string()));
        let raw = RawEvent { id: "evt1".to_string(), payload: serde_json::Value::Object(payload) };

        let normalized = adapter.normalize_event(&source(), raw).unwrap();
        assert_eq!(normalized.title, "Standup");
        assert_eq!(normalized.id, "s1:evt1");
    }

    #[test]
    fn missing_dtstart_is_normalization_error() {
        let adapter = IcalAdapter::new(Client::new());
        let raw = RawEvent { id: "evt1".to_string(), payload: serde_json::json!({"summary": "No start"}) };
        let err = adapter.normalize_event(&source(), raw).unwrap_err();
        assert!(matches!(err, CalendarError::NormalizationError { .. }));
    }
}
