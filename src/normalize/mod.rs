/// Event normalizer
///
/// Pure mapping from each provider's raw event onto [`NormalizedEvent`].
/// No I/O happens here; a payload that cannot be mapped comes back as a
/// `Malformed` provider error so the caller can skip that one event.

pub mod google;
pub mod ics;
pub mod microsoft;
pub mod timezone;

use crate::db::models::NormalizedEvent;
use crate::error::{CalError, CalResult, ProviderError};
use crate::providers::RawEvent;

/// What a raw event means for the local store
#[derive(Debug, Clone)]
pub enum Normalized {
    Upsert(NormalizedEvent),
    /// Soft-delete by provider event id
    Remove(String),
}

/// Normalize one raw event. `calendar_tz` is the owning calendar's zone,
/// used when the event itself names none.
pub fn normalize(raw: &RawEvent, calendar_tz: Option<&str>) -> CalResult<Normalized> {
    let event = match raw {
        RawEvent::Google(event) => google::normalize_google(event, calendar_tz)?,
        RawEvent::Microsoft(event) => microsoft::normalize_graph(event, calendar_tz)?,
        RawEvent::Ics { href, etag, body } => {
            ics::normalize_ics(href, etag.as_deref(), body, calendar_tz)?
        }
        RawEvent::Removed { provider_event_id } => {
            return Ok(Normalized::Remove(provider_event_id.clone()))
        }
    };
    Ok(Normalized::Upsert(event))
}

pub(crate) fn malformed(message: impl Into<String>) -> CalError {
    CalError::Provider(ProviderError::Malformed(message.into()))
}
