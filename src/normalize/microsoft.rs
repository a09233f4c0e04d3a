/// Microsoft Graph event mapping
use super::malformed;
use super::timezone::{local_to_utc, resolve_zone, zone_or_utc};
use crate::db::models::{Attendee, EventStatus, NormalizedEvent, ResponseStatus, Visibility};
use crate::error::CalResult;
use crate::providers::microsoft::{GraphDateTime, GraphEvent};
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;

/// Graph wall-clock times carry up to seven fractional digits and no offset.
fn resolve_time(value: &GraphDateTime) -> CalResult<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(&value.date_time, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&value.date_time, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|e| malformed(format!("bad dateTime {}: {}", value.date_time, e)))?;
    let tz = zone_or_utc([value.time_zone.as_deref()]);
    Ok(local_to_utc(naive, tz))
}

fn response_status(value: Option<&str>) -> ResponseStatus {
    match value {
        Some("accepted") | Some("organizer") => ResponseStatus::Accepted,
        Some("declined") => ResponseStatus::Declined,
        Some("tentativelyAccepted") => ResponseStatus::Tentative,
        _ => ResponseStatus::NeedsAction,
    }
}

pub fn normalize_graph(event: &GraphEvent, calendar_tz: Option<&str>) -> CalResult<NormalizedEvent> {
    let start = event
        .start
        .as_ref()
        .ok_or_else(|| malformed(format!("event {} has no start", event.id)))?;
    let end = event
        .end
        .as_ref()
        .ok_or_else(|| malformed(format!("event {} has no end", event.id)))?;

    let starts_at = resolve_time(start)?;
    let ends_at = resolve_time(end)?;
    if ends_at < starts_at {
        return Err(malformed(format!("event {} ends before it starts", event.id)));
    }

    // Display zone: where the organizer created it, not the zone Graph rendered it in
    let display_tz: Tz = event
        .original_start_time_zone
        .as_deref()
        .and_then(resolve_zone)
        .unwrap_or_else(|| zone_or_utc([start.time_zone.as_deref(), calendar_tz]));

    let own_response = event
        .response_status
        .as_ref()
        .and_then(|r| r.response.as_deref());
    let status = if event.is_cancelled {
        EventStatus::Cancelled
    } else if own_response == Some("tentativelyAccepted") || event.show_as.as_deref() == Some("tentative") {
        EventStatus::Tentative
    } else {
        EventStatus::Confirmed
    };

    let visibility = match event.sensitivity.as_deref() {
        Some("personal") | Some("private") => Visibility::Private,
        Some("confidential") => Visibility::Confidential,
        _ => Visibility::Default,
    };

    let attendees: Vec<Attendee> = event
        .attendees
        .iter()
        .filter(|a| a.attendee_type.as_deref() != Some("resource"))
        .filter_map(|a| {
            let email = a.email_address.as_ref()?;
            Some(Attendee {
                email: email.address.clone()?,
                name: email.name.clone(),
                response: response_status(a.status.as_ref().and_then(|s| s.response.as_deref())),
                optional: a.attendee_type.as_deref() == Some("optional"),
            })
        })
        .collect();

    let is_recurring = event.series_master_id.is_some()
        || event.recurrence.is_some()
        || matches!(
            event.event_type.as_deref(),
            Some("occurrence") | Some("exception") | Some("seriesMaster")
        );

    let original_start_time = event
        .original_start
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let description = match &event.body {
        Some(body) if body.content_type.as_deref() == Some("text") => body.content.clone(),
        _ => event.body_preview.clone(),
    };

    Ok(NormalizedEvent {
        provider_event_id: event.id.clone(),
        provider_ical_uid: event.ical_uid.clone(),
        title: event
            .subject
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "(No title)".to_string()),
        description: description.filter(|d| !d.is_empty()),
        location: event
            .location
            .as_ref()
            .and_then(|l| l.display_name.clone())
            .filter(|l| !l.is_empty()),
        url: event.web_link.clone(),
        starts_at,
        ends_at,
        is_all_day: event.is_all_day,
        timezone: display_tz.name().to_string(),
        is_recurring,
        recurrence_rule: event.recurrence.as_ref().map(|r| r.to_string()),
        recurring_event_id: event.series_master_id.clone(),
        original_start_time,
        status,
        visibility,
        organizer: event
            .organizer
            .as_ref()
            .and_then(|o| o.email_address.as_ref())
            .and_then(|e| e.address.clone()),
        attendee_count: attendees.len() as i64,
        attendees,
        provider_etag: event.change_key.clone(),
        provider_raw: serde_json::to_string(event).ok(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> GraphEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_utc_rendering_keeps_original_zone_for_display() {
        let event = parse(json!({
            "id": "m1",
            "subject": "Sync",
            "start": { "dateTime": "2030-01-15T14:00:00.0000000", "timeZone": "UTC" },
            "end": { "dateTime": "2030-01-15T15:00:00.0000000", "timeZone": "UTC" },
            "originalStartTimeZone": "Pacific Standard Time",
            "changeKey": "ck1",
        }));

        let normalized = normalize_graph(&event, None).unwrap();
        assert_eq!(normalized.starts_at.to_rfc3339(), "2030-01-15T14:00:00+00:00");
        assert_eq!(normalized.timezone, "America/Los_Angeles");
        assert_eq!(normalized.provider_etag.as_deref(), Some("ck1"));
    }

    #[test]
    fn test_occurrence_and_attendees() {
        let event = parse(json!({
            "id": "occ-1",
            "type": "occurrence",
            "seriesMasterId": "master-1",
            "sensitivity": "private",
            "showAs": "tentative",
            "start": { "dateTime": "2030-01-15T09:00:00", "timeZone": "Tokyo Standard Time" },
            "end": { "dateTime": "2030-01-15T10:00:00", "timeZone": "Tokyo Standard Time" },
            "attendees": [
                { "type": "required", "emailAddress": { "address": "a@example.com", "name": "A" }, "status": { "response": "accepted" } },
                { "type": "optional", "emailAddress": { "address": "b@example.com" }, "status": { "response": "tentativelyAccepted" } },
                { "type": "resource", "emailAddress": { "address": "room@example.com" } },
            ],
        }));

        let normalized = normalize_graph(&event, None).unwrap();
        assert_eq!(normalized.starts_at.to_rfc3339(), "2030-01-15T00:00:00+00:00");
        assert!(normalized.is_recurring);
        assert_eq!(normalized.recurring_event_id.as_deref(), Some("master-1"));
        assert_eq!(normalized.status, EventStatus::Tentative);
        assert_eq!(normalized.visibility, Visibility::Private);
        assert_eq!(normalized.attendee_count, 2);
        assert_eq!(normalized.attendees[1].response, ResponseStatus::Tentative);
        assert!(normalized.attendees[1].optional);
    }

    #[test]
    fn test_cancelled_flag_maps_to_cancelled_status() {
        let event = parse(json!({
            "id": "m2",
            "isCancelled": true,
            "start": { "dateTime": "2030-01-15T09:00:00", "timeZone": "UTC" },
            "end": { "dateTime": "2030-01-15T10:00:00", "timeZone": "UTC" },
        }));
        assert_eq!(normalize_graph(&event, None).unwrap().status, EventStatus::Cancelled);
    }
}
