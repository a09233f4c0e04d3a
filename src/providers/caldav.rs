/// CalDAV adapter
///
/// There is no delta protocol to lean on, so incremental sync compares
/// per-object ETags: a `calendar-query` REPORT lists hrefs and ETags in the
/// window, only new or changed objects are fetched with `calendar-multiget`,
/// and hrefs that vanished since the last run are reported as removed. The
/// cursor is the href-to-ETag map.
use super::credentials::BasicCredentials;
use super::http::{check, send};
use super::{
    unsupported, CalendarProvider, CreatedEvent, CredentialManager, EventDraft, EventPage,
    FetchWindow, PushHandle, RawEvent, RemoteCalendar, SyncCursor,
};
use crate::config::SyncConfig;
use crate::db::models::{Calendar, ConnectedAccount, ProviderKind, PushSubscription};
use crate::error::{CalError, CalResult, ProviderError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use icalendar::{Component, EventLike};
use reqwest::{Client, Method};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

const MULTIGET_BATCH: usize = 50;

const PROPFIND_CALENDARS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav" xmlns:A="http://apple.com/ns/ical/">
  <D:prop>
    <D:displayname/>
    <D:resourcetype/>
    <A:calendar-color/>
    <C:calendar-timezone/>
  </D:prop>
</D:propfind>"#;

/// One `<response>` of a multistatus body
#[derive(Debug, Default)]
struct DavResource {
    href: String,
    etag: Option<String>,
    calendar_data: Option<String>,
    display_name: Option<String>,
    color: Option<String>,
    timezone: Option<String>,
    is_calendar: bool,
}

fn parse_multistatus(body: &str) -> CalResult<Vec<DavResource>> {
    let doc = roxmltree::Document::parse(body)
        .map_err(|e| CalError::Provider(ProviderError::Malformed(e.to_string())))?;

    let text_of = |node: roxmltree::Node, name: &str| {
        node.descendants()
            .find(|n| n.tag_name().name() == name)
            .and_then(|n| n.text())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let mut resources = Vec::new();
    for response in doc
        .root_element()
        .descendants()
        .filter(|n| n.tag_name().name() == "response")
    {
        let href = response
            .children()
            .find(|n| n.tag_name().name() == "href")
            .and_then(|n| n.text())
            .map(|s| s.trim().to_string());
        let Some(href) = href else { continue };

        let is_calendar = response
            .descendants()
            .find(|n| n.tag_name().name() == "resourcetype")
            .map(|rt| rt.children().any(|c| c.tag_name().name() == "calendar"))
            .unwrap_or(false);

        resources.push(DavResource {
            href,
            etag: text_of(response, "getetag"),
            calendar_data: text_of(response, "calendar-data"),
            display_name: text_of(response, "displayname"),
            color: text_of(response, "calendar-color"),
            timezone: text_of(response, "calendar-timezone").and_then(|vtz| tzid_of(&vtz)),
            is_calendar,
        });
    }

    Ok(resources)
}

/// Pull the TZID out of a VTIMEZONE blob.
fn tzid_of(vtimezone: &str) -> Option<String> {
    vtimezone
        .lines()
        .find_map(|line| line.trim().strip_prefix("TZID:"))
        .map(|tzid| tzid.trim().to_string())
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// CalDAV wants UTC basic format: `YYYYMMDDTHHMMSSZ`
fn caldav_time(instant: DateTime<Utc>) -> String {
    instant.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Stable external key for a CalDAV login
pub fn provider_account_id(credentials: &BasicCredentials) -> CalResult<String> {
    let url = Url::parse(&credentials.server_url)
        .map_err(|e| CalError::Validation(format!("Invalid CalDAV server URL: {}", e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| CalError::Validation("CalDAV server URL has no host".to_string()))?;
    Ok(format!("{}@{}", credentials.username, host))
}

/// Generic CalDAV (RFC 4791) adapter with basic authentication
pub struct CalDavProvider {
    http: Client,
    sync: SyncConfig,
    credentials: CredentialManager,
}

impl CalDavProvider {
    pub fn new(http: Client, sync: SyncConfig, credentials: CredentialManager) -> Self {
        Self {
            http,
            sync,
            credentials,
        }
    }

    fn resolve(&self, credentials: &BasicCredentials, href: &str) -> CalResult<Url> {
        Url::parse(&credentials.server_url)
            .and_then(|base| base.join(href))
            .map_err(|e| CalError::Validation(format!("Invalid CalDAV URL: {}", e)))
    }

    async fn dav_request(
        &self,
        credentials: &BasicCredentials,
        method: &[u8],
        url: Url,
        depth: &str,
        body: String,
    ) -> CalResult<String> {
        let method = Method::from_bytes(method)
            .map_err(|e| CalError::Internal(format!("Invalid HTTP method: {}", e)))?;

        let response = send(
            self.http
                .request(method, url)
                .basic_auth(&credentials.username, Some(&credentials.password))
                .header("Depth", depth)
                .header("Content-Type", "application/xml; charset=utf-8")
                .body(body),
        )
        .await?;

        let response = check(response).await?;
        response
            .text()
            .await
            .map_err(|e| CalError::Provider(ProviderError::from(e)))
    }

    /// List calendar collections under the account's server URL.
    pub async fn discover(&self, credentials: &BasicCredentials) -> CalResult<Vec<RemoteCalendar>> {
        let url = self.resolve(credentials, &credentials.server_url)?;
        let body = self
            .dav_request(credentials, b"PROPFIND", url, "1", PROPFIND_CALENDARS.to_string())
            .await?;

        let calendars: Vec<RemoteCalendar> = parse_multistatus(&body)?
            .into_iter()
            .filter(|resource| resource.is_calendar)
            .enumerate()
            .map(|(index, resource)| RemoteCalendar {
                name: resource
                    .display_name
                    .unwrap_or_else(|| resource.href.clone()),
                provider_calendar_id: resource.href,
                color: resource.color,
                timezone: resource.timezone,
                is_primary: index == 0,
            })
            .collect();

        Ok(calendars)
    }

    /// href -> ETag for every object overlapping the window
    async fn etags_in_window(
        &self,
        credentials: &BasicCredentials,
        calendar: &Calendar,
        window: &FetchWindow,
    ) -> CalResult<BTreeMap<String, String>> {
        let body = format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <D:getetag/>
  </D:prop>
  <C:filter>
    <C:comp-filter name="VCALENDAR">
      <C:comp-filter name="VEVENT">
        <C:time-range start="{}" end="{}"/>
      </C:comp-filter>
    </C:comp-filter>
  </C:filter>
</C:calendar-query>"#,
            caldav_time(window.start),
            caldav_time(window.end)
        );

        let url = self.resolve(credentials, &calendar.provider_calendar_id)?;
        let response = self.dav_request(credentials, b"REPORT", url, "1", body).await?;

        Ok(parse_multistatus(&response)?
            .into_iter()
            .filter(|resource| resource.href != calendar.provider_calendar_id)
            .map(|resource| {
                let etag = resource.etag.unwrap_or_default();
                (resource.href, etag)
            })
            .collect())
    }

    async fn multiget(
        &self,
        credentials: &BasicCredentials,
        calendar: &Calendar,
        hrefs: &[String],
    ) -> CalResult<Vec<RawEvent>> {
        let mut events = Vec::new();

        for chunk in hrefs.chunks(MULTIGET_BATCH) {
            let href_elements: String = chunk
                .iter()
                .map(|href| format!("  <D:href>{}</D:href>\n", xml_escape(href)))
                .collect();
            let body = format!(
                r#"<?xml version="1.0" encoding="utf-8"?>
<C:calendar-multiget xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <D:getetag/>
    <C:calendar-data/>
  </D:prop>
{}</C:calendar-multiget>"#,
                href_elements
            );

            let url = self.resolve(credentials, &calendar.provider_calendar_id)?;
            let response = self.dav_request(credentials, b"REPORT", url, "1", body).await?;

            for resource in parse_multistatus(&response)? {
                match resource.calendar_data {
                    Some(body) => events.push(RawEvent::Ics {
                        href: resource.href,
                        etag: resource.etag,
                        body,
                    }),
                    // Deleted between the query and the multiget
                    None => events.push(RawEvent::Removed {
                        provider_event_id: resource.href,
                    }),
                }
            }
        }

        Ok(events)
    }
}

fn draft_to_ics(uid: &str, draft: &EventDraft) -> String {
    let mut event = icalendar::Event::new();
    event.uid(uid).summary(&draft.title);

    if draft.is_all_day {
        let tz: chrono_tz::Tz = draft.timezone_name().parse().unwrap_or(chrono_tz::UTC);
        event
            .starts(draft.starts_at.with_timezone(&tz).date_naive())
            .ends(draft.ends_at.with_timezone(&tz).date_naive());
    } else {
        event.starts(draft.starts_at).ends(draft.ends_at);
    }
    if let Some(description) = &draft.description {
        event.description(description);
    }
    if let Some(location) = &draft.location {
        event.location(location);
    }
    for attendee in &draft.attendees {
        event.add_multi_property("ATTENDEE", &format!("mailto:{}", attendee));
    }

    let mut calendar = icalendar::Calendar::new();
    calendar.push(event.done());
    calendar.done().to_string()
}

#[async_trait]
impl CalendarProvider for CalDavProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CalDav
    }

    async fn list_calendars(&self, account: &ConnectedAccount) -> CalResult<Vec<RemoteCalendar>> {
        let credentials = self.credentials.basic_credentials(account).await?;
        self.discover(&credentials).await
    }

    async fn list_events(
        &self,
        account: &ConnectedAccount,
        calendar: &Calendar,
        cursor: Option<&SyncCursor>,
    ) -> CalResult<EventPage> {
        let credentials = self.credentials.basic_credentials(account).await?;
        let window = FetchWindow::around(Utc::now(), &self.sync);

        let previous = match cursor {
            Some(SyncCursor::CalDav { etags }) => Some(etags),
            Some(other) => {
                warn!(calendar_id = %calendar.id, ?other, "foreign cursor on caldav calendar, ignoring");
                None
            }
            None => None,
        };

        let current = self.etags_in_window(&credentials, calendar, &window).await?;

        let changed: Vec<String> = current
            .iter()
            .filter(|(href, etag)| {
                previous
                    .and_then(|prev| prev.get(*href))
                    .map_or(true, |old| old != *etag || etag.is_empty())
            })
            .map(|(href, _)| href.clone())
            .collect();

        let mut events = if changed.is_empty() {
            Vec::new()
        } else {
            self.multiget(&credentials, calendar, &changed).await?
        };

        if let Some(prev) = previous {
            events.extend(
                prev.keys()
                    .filter(|href| !current.contains_key(*href))
                    .map(|href| RawEvent::Removed {
                        provider_event_id: href.clone(),
                    }),
            );
        }

        debug!(
            calendar_id = %calendar.id,
            objects = current.len(),
            fetched = changed.len(),
            "caldav etag comparison"
        );

        Ok(EventPage {
            events,
            snapshot: previous.is_none().then_some(window),
            next_cursor: Some(SyncCursor::CalDav { etags: current }),
        })
    }

    async fn create_event(
        &self,
        account: &ConnectedAccount,
        calendar: &Calendar,
        draft: &EventDraft,
    ) -> CalResult<CreatedEvent> {
        let credentials = self.credentials.basic_credentials(account).await?;
        let uid = Uuid::new_v4().to_string();
        let collection = calendar.provider_calendar_id.trim_end_matches('/');
        let href = format!("{}/{}.ics", collection, uid);
        let url = self.resolve(&credentials, &href)?;

        let response = send(
            self.http
                .put(url.clone())
                .basic_auth(&credentials.username, Some(&credentials.password))
                .header("If-None-Match", "*")
                .header("Content-Type", "text/calendar; charset=utf-8")
                .body(draft_to_ics(&uid, draft)),
        )
        .await?;
        check(response).await?;

        Ok(CreatedEvent {
            external_id: href,
            link: Some(url.to_string()),
        })
    }

    async fn register_push(
        &self,
        _account: &ConnectedAccount,
        _calendar: &Calendar,
    ) -> CalResult<PushHandle> {
        unsupported("push notifications")
    }

    async fn renew_push(
        &self,
        _account: &ConnectedAccount,
        _calendar: &Calendar,
        _subscription: &PushSubscription,
    ) -> CalResult<PushHandle> {
        unsupported("push notifications")
    }

    async fn stop_push(
        &self,
        _account: &ConnectedAccount,
        _subscription: &PushSubscription,
    ) -> CalResult<()> {
        Ok(())
    }
}
