/// iCalendar (RFC 5545) event mapping for CalDAV objects
use super::malformed;
use super::timezone::{local_to_utc, resolve_zone, zone_or_utc};
use crate::db::models::{Attendee, EventStatus, NormalizedEvent, ResponseStatus, Visibility};
use crate::error::CalResult;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use icalendar::parser::{read_calendar, unfold, Component, Property};
use icalendar::{CalendarDateTime, DatePerhapsTime};

/// Undo RFC 5545 TEXT escaping.
pub fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn param<'a>(prop: &'a Property, key: &str) -> Option<&'a str> {
    prop.params
        .iter()
        .find(|p| p.key == key)
        .and_then(|p| p.val.as_ref().map(|v| v.as_ref()))
}

fn value<'a>(prop: &'a Property) -> &'a str {
    prop.val.as_ref()
}

fn text(vevent: &Component, name: &str) -> Option<String> {
    vevent
        .find_prop(name)
        .map(|p| unescape_text(value(p)))
        .filter(|s| !s.trim().is_empty())
}

/// Instant, all-day flag and the zone the value was written in
fn resolve_time(prop: &Property, fallback_tz: Tz) -> CalResult<(DateTime<Utc>, bool, Option<Tz>)> {
    let value = DatePerhapsTime::try_from(prop)
        .map_err(|_| malformed(format!("unparseable {} value", prop.name)))?;

    Ok(match value {
        DatePerhapsTime::Date(day) => {
            let midnight = day
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| malformed("invalid midnight"))?;
            (local_to_utc(midnight, fallback_tz), true, None)
        }
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(instant)) => (instant, false, None),
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(naive)) => {
            (local_to_utc(naive, fallback_tz), false, None)
        }
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, tzid }) => {
            let tz = resolve_zone(&tzid);
            (local_to_utc(date_time, tz.unwrap_or(fallback_tz)), false, tz)
        }
    })
}

fn response_status(value: Option<&str>) -> ResponseStatus {
    match value {
        Some("ACCEPTED") => ResponseStatus::Accepted,
        Some("DECLINED") => ResponseStatus::Declined,
        Some("TENTATIVE") => ResponseStatus::Tentative,
        _ => ResponseStatus::NeedsAction,
    }
}

fn mailbox(prop: &Property) -> String {
    let address = value(prop);
    address
        .strip_prefix("mailto:")
        .or_else(|| address.strip_prefix("MAILTO:"))
        .unwrap_or(address)
        .to_string()
}

pub fn normalize_ics(
    href: &str,
    etag: Option<&str>,
    body: &str,
    calendar_tz: Option<&str>,
) -> CalResult<NormalizedEvent> {
    let unfolded = unfold(body);
    let calendar = read_calendar(&unfolded)
        .map_err(|e| malformed(format!("unparseable ICS at {}: {}", href, e)))?;

    // One resource can carry a series master plus overridden instances
    let vevents: Vec<&Component> = calendar
        .components
        .iter()
        .filter(|c| c.name == "VEVENT")
        .collect();
    let vevent = vevents
        .iter()
        .find(|c| c.find_prop("RECURRENCE-ID").is_none())
        .or_else(|| vevents.first())
        .copied()
        .ok_or_else(|| malformed(format!("no VEVENT at {}", href)))?;

    let fallback_tz = zone_or_utc([calendar_tz]);
    let dtstart = vevent
        .find_prop("DTSTART")
        .ok_or_else(|| malformed(format!("no DTSTART at {}", href)))?;
    let (starts_at, is_all_day, start_tz) = resolve_time(dtstart, fallback_tz)?;
    let event_tz = start_tz.unwrap_or(fallback_tz);

    let ends_at = if let Some(dtend) = vevent.find_prop("DTEND") {
        resolve_time(dtend, event_tz)?.0
    } else if let Some(duration) = vevent.find_prop("DURATION") {
        let parsed = iso8601::duration(value(duration))
            .map_err(|e| malformed(format!("bad DURATION at {}: {}", href, e)))?;
        let std_duration: std::time::Duration = parsed.into();
        let span = Duration::from_std(std_duration)
            .map_err(|e| malformed(format!("DURATION out of range: {}", e)))?;
        starts_at + span
    } else if is_all_day {
        starts_at + Duration::days(1)
    } else {
        starts_at
    };
    if ends_at < starts_at {
        return Err(malformed(format!("event at {} ends before it starts", href)));
    }

    let status = match vevent.find_prop("STATUS").map(value) {
        Some("TENTATIVE") => EventStatus::Tentative,
        Some("CANCELLED") => EventStatus::Cancelled,
        _ => EventStatus::Confirmed,
    };

    let visibility = match vevent.find_prop("CLASS").map(value) {
        Some("PUBLIC") => Visibility::Public,
        Some("PRIVATE") => Visibility::Private,
        Some("CONFIDENTIAL") => Visibility::Confidential,
        _ => Visibility::Default,
    };

    let attendees: Vec<Attendee> = vevent
        .properties
        .iter()
        .filter(|p| p.name == "ATTENDEE")
        .filter(|p| !matches!(param(p, "CUTYPE"), Some("ROOM") | Some("RESOURCE")))
        .map(|p| Attendee {
            email: mailbox(p),
            name: param(p, "CN").map(unescape_text),
            response: response_status(param(p, "PARTSTAT")),
            optional: matches!(param(p, "ROLE"), Some("OPT-PARTICIPANT") | Some("NON-PARTICIPANT")),
        })
        .collect();

    let recurrence_rule = vevent.find_prop("RRULE").map(|p| p.val.to_string());
    let recurrence_id = vevent.find_prop("RECURRENCE-ID");
    let original_start_time = match recurrence_id {
        Some(prop) => Some(resolve_time(prop, event_tz)?.0),
        None => None,
    };
    let uid = vevent.find_prop("UID").map(|p| p.val.to_string());

    Ok(NormalizedEvent {
        provider_event_id: href.to_string(),
        provider_ical_uid: uid.clone(),
        title: text(vevent, "SUMMARY").unwrap_or_else(|| "(No title)".to_string()),
        description: text(vevent, "DESCRIPTION"),
        location: text(vevent, "LOCATION"),
        url: vevent.find_prop("URL").map(|p| p.val.to_string()),
        starts_at,
        ends_at,
        is_all_day,
        timezone: event_tz.name().to_string(),
        is_recurring: recurrence_rule.is_some() || recurrence_id.is_some(),
        recurrence_rule,
        recurring_event_id: recurrence_id.and(uid),
        original_start_time,
        status,
        visibility,
        organizer: vevent.find_prop("ORGANIZER").map(mailbox),
        attendee_count: attendees.len() as i64,
        attendees,
        provider_etag: etag.map(str::to_string),
        provider_raw: Some(body.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOLDED: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
BEGIN:VEVENT\r\n\
UID:evt-1@example.com\r\n\
DTSTART;TZID=America/New_York:20300304T090000\r\n\
DTEND;TZID=America/New_York:20300304T100000\r\n\
SUMMARY:Budget review\\, Q2\r\n\
DESCRIPTION:First line\\nsecond line that is long enough to be folded by a\r\n \x20server at seventy-five octets\r\n\
STATUS:TENTATIVE\r\n\
CLASS:CONFIDENTIAL\r\n\
ORGANIZER;CN=Boss:mailto:boss@example.com\r\n\
ATTENDEE;CN=Ann;PARTSTAT=ACCEPTED:mailto:ann@example.com\r\n\
ATTENDEE;ROLE=OPT-PARTICIPANT;PARTSTAT=DECLINED:mailto:bob@example.com\r\n\
ATTENDEE;CUTYPE=ROOM:mailto:room@example.com\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

    #[test]
    fn test_folded_and_escaped_fields() {
        let event = normalize_ics("/cal/1.ics", Some("\"e1\""), FOLDED, None).unwrap();

        assert_eq!(event.provider_event_id, "/cal/1.ics");
        assert_eq!(event.provider_ical_uid.as_deref(), Some("evt-1@example.com"));
        assert_eq!(event.title, "Budget review, Q2");
        let description = event.description.unwrap();
        assert!(description.starts_with("First line\nsecond line"));
        assert!(description.contains("folded by a server"));
        assert_eq!(event.starts_at.to_rfc3339(), "2030-03-04T14:00:00+00:00");
        assert_eq!(event.timezone, "America/New_York");
        assert_eq!(event.status, EventStatus::Tentative);
        assert_eq!(event.visibility, Visibility::Confidential);
        assert_eq!(event.organizer.as_deref(), Some("boss@example.com"));
        assert_eq!(event.attendee_count, 2);
        assert_eq!(event.attendees[0].name.as_deref(), Some("Ann"));
        assert_eq!(event.attendees[1].response, ResponseStatus::Declined);
        assert!(event.attendees[1].optional);
        assert_eq!(event.provider_etag.as_deref(), Some("\"e1\""));
    }

    #[test]
    fn test_all_day_with_duration_and_rrule() {
        let body = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:bday\r\nDTSTART;VALUE=DATE:20300601\r\nDURATION:P1D\r\nRRULE:FREQ=YEARLY\r\nSUMMARY:Birthday\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let event = normalize_ics("/cal/bday.ics", None, body, Some("Europe/Paris")).unwrap();

        assert!(event.is_all_day);
        assert!(event.is_recurring);
        assert_eq!(event.recurrence_rule.as_deref(), Some("FREQ=YEARLY"));
        assert_eq!(event.starts_at.to_rfc3339(), "2030-05-31T22:00:00+00:00");
        assert_eq!(event.ends_at - event.starts_at, Duration::days(1));
        assert_eq!(event.timezone, "Europe/Paris");
    }

    #[test]
    fn test_master_is_preferred_over_override() {
        let body = "BEGIN:VCALENDAR\r\n\
BEGIN:VEVENT\r\nUID:s1\r\nRECURRENCE-ID:20300305T090000Z\r\nDTSTART:20300305T110000Z\r\nDTEND:20300305T120000Z\r\nSUMMARY:Moved\r\nEND:VEVENT\r\n\
BEGIN:VEVENT\r\nUID:s1\r\nDTSTART:20300304T090000Z\r\nDTEND:20300304T100000Z\r\nRRULE:FREQ=DAILY\r\nSUMMARY:Series\r\nEND:VEVENT\r\n\
END:VCALENDAR\r\n";
        let event = normalize_ics("/cal/s1.ics", None, body, None).unwrap();
        assert_eq!(event.title, "Series");
        assert!(event.recurring_event_id.is_none());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(normalize_ics("/cal/x.ics", None, "not a calendar", None).is_err());
        let no_start = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:x\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        assert!(normalize_ics("/cal/x.ics", None, no_start, None).is_err());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape_text(r"a\;b\,c\\d\Ne"), "a;b,c\\d\ne");
    }
}
