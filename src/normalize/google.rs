/// Google Calendar event mapping
use super::malformed;
use super::timezone::{local_to_utc, zone_or_utc};
use crate::db::models::{Attendee, EventStatus, NormalizedEvent, ResponseStatus, Visibility};
use crate::error::CalResult;
use crate::providers::google::{GoogleDateTime, GoogleEvent};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

/// Instant plus whether it came from a date-only field
fn resolve_time(value: &GoogleDateTime, fallback_tz: Tz) -> CalResult<(DateTime<Utc>, bool)> {
    if let Some(date_time) = &value.date_time {
        let parsed = DateTime::parse_from_rfc3339(date_time)
            .map_err(|e| malformed(format!("bad dateTime {}: {}", date_time, e)))?;
        return Ok((parsed.with_timezone(&Utc), false));
    }

    if let Some(date) = &value.date {
        let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|e| malformed(format!("bad date {}: {}", date, e)))?;
        let midnight = day
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| malformed("invalid midnight"))?;
        return Ok((local_to_utc(midnight, fallback_tz), true));
    }

    Err(malformed("time has neither date nor dateTime"))
}

fn response_status(value: Option<&str>) -> ResponseStatus {
    match value {
        Some("accepted") => ResponseStatus::Accepted,
        Some("declined") => ResponseStatus::Declined,
        Some("tentative") => ResponseStatus::Tentative,
        _ => ResponseStatus::NeedsAction,
    }
}

pub fn normalize_google(event: &GoogleEvent, calendar_tz: Option<&str>) -> CalResult<NormalizedEvent> {
    let start = event
        .start
        .as_ref()
        .ok_or_else(|| malformed(format!("event {} has no start", event.id)))?;
    let end = event
        .end
        .as_ref()
        .ok_or_else(|| malformed(format!("event {} has no end", event.id)))?;

    let tz = zone_or_utc([start.time_zone.as_deref(), calendar_tz]);
    let (starts_at, is_all_day) = resolve_time(start, tz)?;
    let (ends_at, _) = resolve_time(end, tz)?;
    if ends_at < starts_at {
        return Err(malformed(format!("event {} ends before it starts", event.id)));
    }

    let status = match event.status.as_deref() {
        Some("tentative") => EventStatus::Tentative,
        Some("cancelled") => EventStatus::Cancelled,
        _ => EventStatus::Confirmed,
    };

    let visibility = match event.visibility.as_deref() {
        Some("public") => Visibility::Public,
        Some("private") => Visibility::Private,
        Some("confidential") => Visibility::Confidential,
        _ => Visibility::Default,
    };

    // Rooms and other resources are not people
    let attendees: Vec<Attendee> = event
        .attendees
        .iter()
        .filter(|a| !a.resource)
        .filter_map(|a| {
            a.email.as_ref().map(|email| Attendee {
                email: email.clone(),
                name: a.display_name.clone(),
                response: response_status(a.response_status.as_deref()),
                optional: a.optional,
            })
        })
        .collect();

    let recurrence_rule = event
        .recurrence
        .iter()
        .find(|line| line.starts_with("RRULE:"))
        .cloned();

    let original_start_time = match &event.original_start_time {
        Some(original) => Some(resolve_time(original, tz)?.0),
        None => None,
    };

    Ok(NormalizedEvent {
        provider_event_id: event.id.clone(),
        provider_ical_uid: event.ical_uid.clone(),
        title: event
            .summary
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "(No title)".to_string()),
        description: event.description.clone(),
        location: event.location.clone(),
        url: event.hangout_link.clone().or_else(|| event.html_link.clone()),
        starts_at,
        ends_at,
        is_all_day,
        timezone: tz.name().to_string(),
        is_recurring: !event.recurrence.is_empty() || event.recurring_event_id.is_some(),
        recurrence_rule,
        recurring_event_id: event.recurring_event_id.clone(),
        original_start_time,
        status,
        visibility,
        organizer: event.organizer.as_ref().and_then(|o| o.email.clone()),
        attendee_count: attendees.len() as i64,
        attendees,
        provider_etag: event.etag.clone(),
        provider_raw: serde_json::to_string(event).ok(),
    })
}
