/// Free-slot search inside working hours
use crate::error::{CalError, CalResult};
use crate::normalize::timezone::local_to_utc;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use validator::Validate;

const MAX_WINDOW_DAYS: i64 = 31;

/// Local times slots are nudged towards
const PREFERRED_HOURS: [(u32, u32); 2] = [(10, 12), (14, 16)];
const PREFERENCE_BONUS: f64 = 0.5;

fn default_day_start() -> u32 {
    9
}

fn default_day_end() -> u32 {
    17
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FreeSlotRequest {
    #[validate(range(min = 5, max = 720))]
    pub duration_minutes: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default = "default_day_start")]
    #[validate(range(max = 23))]
    pub work_day_start_hour: u32,
    #[serde(default = "default_day_end")]
    #[validate(range(min = 1, max = 24))]
    pub work_day_end_hour: u32,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[validate(range(min = 1, max = 50))]
    pub limit: Option<usize>,
}

impl FreeSlotRequest {
    /// Validate and resolve the zone.
    pub fn check(&self) -> CalResult<Tz> {
        self.validate()?;
        if self.window_end <= self.window_start {
            return Err(CalError::Validation(
                "Search window must end after it starts".to_string(),
            ));
        }
        if self.window_end - self.window_start > Duration::days(MAX_WINDOW_DAYS) {
            return Err(CalError::Validation(format!(
                "Search window is limited to {} days",
                MAX_WINDOW_DAYS
            )));
        }
        if self.work_day_end_hour <= self.work_day_start_hour {
            return Err(CalError::Validation(
                "Working day must end after it starts".to_string(),
            ));
        }
        self.timezone
            .parse::<Tz>()
            .map_err(|_| CalError::Validation(format!("Unknown timezone: {}", self.timezone)))
    }
}

/// Gap between busy blocks, long enough for the requested meeting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_minutes: i64,
    pub score: f64,
}

/// Busy interval
pub type Busy = (DateTime<Utc>, DateTime<Utc>);

fn at_hour(date: chrono::NaiveDate, hour: u32, tz: Tz) -> DateTime<Utc> {
    // Hour 24 is the following midnight
    let (date, hour) = if hour >= 24 {
        (date.succ_opt().unwrap_or(date), 0)
    } else {
        (date, hour)
    };
    let time = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
    local_to_utc(date.and_time(time), tz)
}

fn merge(mut busy: Vec<Busy>) -> Vec<Busy> {
    busy.sort();
    let mut merged: Vec<Busy> = Vec::with_capacity(busy.len());
    for (start, end) in busy {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

fn score(slot_start: DateTime<Utc>, slot_end: DateTime<Utc>, request: &FreeSlotRequest, tz: Tz) -> f64 {
    let days_out = (slot_start - request.window_start).num_minutes() as f64 / (24.0 * 60.0);
    let proximity = 1.0 / (1.0 + days_out.max(0.0));

    let duration = Duration::minutes(request.duration_minutes);
    let local_date = slot_start.with_timezone(&tz).date_naive();
    let preferred = PREFERRED_HOURS.iter().any(|&(from, to)| {
        let window_start = at_hour(local_date, from, tz).max(slot_start);
        let window_end = at_hour(local_date, to, tz).min(slot_end);
        window_end - window_start >= duration
    });

    if preferred {
        proximity + PREFERENCE_BONUS
    } else {
        proximity
    }
}

/// Gaps of at least the requested length inside each day's working hours,
/// best first.
pub fn find_free_slots(busy: &[Busy], request: &FreeSlotRequest, tz: Tz, limit: usize) -> Vec<FreeSlot> {
    let duration = Duration::minutes(request.duration_minutes);
    let merged = merge(busy.to_vec());

    let mut slots = Vec::new();
    let mut day = request.window_start.with_timezone(&tz).date_naive();
    let last_day = request.window_end.with_timezone(&tz).date_naive();

    while day <= last_day {
        let day_start = at_hour(day, request.work_day_start_hour, tz).max(request.window_start);
        let day_end = at_hour(day, request.work_day_end_hour, tz).min(request.window_end);

        if day_start < day_end {
            let mut cursor = day_start;
            for &(start, end) in merged.iter().filter(|(s, e)| *s < day_end && *e > day_start) {
                if start > cursor && start - cursor >= duration {
                    slots.push((cursor, start));
                }
                cursor = cursor.max(end);
            }
            if day_end > cursor && day_end - cursor >= duration {
                slots.push((cursor, day_end));
            }
        }

        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }

    let mut ranked: Vec<FreeSlot> = slots
        .into_iter()
        .map(|(start, end)| FreeSlot {
            start,
            end,
            duration_minutes: (end - start).num_minutes(),
            score: score(start, end, request, tz),
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.start.cmp(&b.start))
    });
    ranked.truncate(limit);
    ranked
}
