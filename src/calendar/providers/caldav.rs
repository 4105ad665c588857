/*!
 * CalDAV Adapter
 *
 * A minimal RFC 4791 client: issues a `calendar-query` `REPORT` over the
 * configured URL and parses the returned `calendar-data` blocks. Calendar
 * discovery, scheduling extensions, and webhook subscriptions are out of
 * scope for this adapter; it only implements the contract's five
 * operations.
 */

use async_trait::async_trait;
use chrono::Utc;
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use reqwest::{Client, Method};

use crate::calendar::error::{CalendarError, CalendarResult};
use crate::calendar::providers::traits::Adapter;
use crate::calendar::types::{CalendarSource, HealthStatus, NormalizedEvent, RawEvent, SourceType};

pub struct CalDavAdapter {
    client: Client,
}

impl CalDavAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn basic_auth(&self, source: &CalendarSource) -> Option<(String, Option<String>)> {
        let username = source.credentials.get("username")?.as_str()?.to_string();
        let password = source.credentials.get("password").and_then(|v| v.as_str()).map(|s| s.to_string());
        Some((username, password))
    }

    fn calendar_query_body(&self) -> String {
        let time_min = (Utc::now() - chrono::Duration::days(30)).format("%Y%m%dT%H%M%SZ");
        let time_max = (Utc::now() + chrono::Duration::days(90)).format("%Y%m%dT%H%M%SZ");
        format!(
            r#"<?xml version="1.0" encoding="utf-8" ?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <D:getetag/>
    <C:calendar-data/>
  </D:prop>
  <C:filter>
    <C:comp-filter name="VCALENDAR">
      <C:comp-filter name="VEVENT">
        <C:time-range start="{}" end="{}"/>
      </C:comp-filter>
    </C:comp-filter>
  </C:filter>
</C:calendar-query>"#,
            time_min, time_max
        )
    }

    async fn report(&self, source: &CalendarSource) -> CalendarResult<String> {
        let method = Method::from_bytes(b"REPORT").expect("REPORT is a valid HTTP method token");
        let mut request = self.client.request(method, &source.url).header("Depth", "1").header("Content-Type", "application/xml");

        if let Some((username, password)) = self.basic_auth(source) {
            request = request.basic_auth(username, password);
        }

        let response = request.body(self.calendar_query_body()).send().await.map_err(|e| CalendarError::NetworkError {
            message: e.to_string(),
            source_id: source.id.clone(),
            is_timeout: e.is_timeout(),
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| CalendarError::NetworkError {
            message: e.to_string(),
            source_id: source.id.clone(),
            is_timeout: e.is_timeout(),
        })?;

        if status.is_success() || status.as_u16() == 207 {
            Ok(body)
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            Err(CalendarError::AuthError { message: format!("server returned {}", status), source_id: source.id.clone() })
        } else {
            Err(CalendarError::ProtocolError { message: format!("REPORT failed with status {}", status), source_id: source.id.clone() })
        }
    }

    /// Extracts each `<C:calendar-data>` block's text content from a
    /// `calendar-query` multistatus response.
    fn extract_calendar_data_blocks(xml: &str) -> Vec<String> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut blocks = Vec::new();
        let mut buf = Vec::new();
        let mut in_calendar_data = false;
        let mut current = String::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(XmlEvent::Start(ref e)) if e.name().as_ref().ends_with(b"calendar-data") => {
                    in_calendar_data = true;
                    current.clear();
                }
                Ok(XmlEvent::Text(e)) if in_calendar_data => {
                    current.push_str(&e.unescape().unwrap_or_default());
                }
                Ok(XmlEvent::CData(e)) if in_calendar_data => {
                    current.push_str(&String::from_utf8_lossy(&e));
                }
                Ok(XmlEvent::End(ref e)) if e.name().as_ref().ends_with(b"calendar-data") => {
                    in_calendar_data = false;
                    blocks.push(std::mem::take(&mut current));
                }
                Ok(XmlEvent::Eof) => break,
                Err(e) => {
                    tracing::warn!("caldav REPORT response XML error: {:?}", e);
                    break;
                }
                _ => {}
            }
            buf.clear();
        }

        blocks
    }
}

#[async_trait]
impl Adapter for CalDavAdapter {
    fn supported_type(&self) -> SourceType {
        SourceType::CalDav
    }

    async fn fetch_events(&self, source: &CalendarSource) -> CalendarResult<Vec<RawEvent>> {
        let xml = self.report(source).await?;
        let blocks = Self::extract_calendar_data_blocks(&xml);

        let mut raw_events = Vec::new();
        for (i, block) in blocks.into_iter().enumerate() {
            let calendar: icalendar::Calendar = match block.parse() {
                Ok(cal) => cal,
                Err(e) => {
                    tracing::warn!(source_id = %source.id, "skipping malformed calendar-data block {}: {}", i, e);
                    continue;
                }
            };
            for component in calendar.components {
                if let icalendar::CalendarComponent::Event(event) = component {
                    use icalendar::Component;
                    let uid = event.get_uid().unwrap_or_default().to_string();
                    raw_events.push(RawEvent { id: uid, payload: super::ical::event_payload(&event) });
                }
            }
        }
        Ok(raw_events)
    }

    fn normalize_event(&self, source: &CalendarSource, raw: RawEvent) -> CalendarResult<NormalizedEvent> {
        super::ical::normalize_payload(source, raw)
    }

    async fn validate_source(&self, source: &CalendarSource) -> CalendarResult<()> {
        self.report(source).await?;
        Ok(())
    }

    async fn get_source_status(&self, source: &CalendarSource) -> CalendarResult<HealthStatus> {
        let started = std::time::Instant::now();
        match self.report(source).await {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_calendar_data_block() {
        let xml = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:response>
    <D:propstat>
      <D:prop>
        <C:calendar-data>BEGIN:VCALENDAR
END:VCALENDAR</C:calendar-data>
      </D:prop>
    </D:propstat>
  </D:response>
</D:multistatus>"#;
        let blocks = CalDavAdapter::extract_calendar_data_blocks(xml);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].contains("BEGIN:VCALENDAR"));
    }

    #[test]
    fn malformed_xml_yields_no_blocks_without_panicking() {
        let blocks = CalDavAdapter::extract_calendar_data_blocks("<not><valid");
        assert!(blocks.is_empty());
    }
}
