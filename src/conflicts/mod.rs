/// Conflict detection and free-slot search
///
/// A scan walks a user's candidate events in start order, pairs every two
/// that overlap by at least the configured minimum, classifies the overlap
/// and reconciles the result with the stored flags: new pairs are created,
/// vanished ones auto-resolved, and acknowledged or resolved pairs reopened
/// when either event moved.

pub mod free_slots;

pub use self::free_slots::{FreeSlot, FreeSlotRequest};

use crate::cache::{self, keys, Cache};
use crate::config::ConflictConfig;
use crate::db::models::{ConflictFlag, ConflictStatus, Event, EventStatus, Severity};
use crate::error::{CalError, CalResult};
use crate::store::Store;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Overlap between two candidate events, `a.id < b.id`
#[derive(Debug, Clone)]
pub struct Overlap<'a> {
    pub a: &'a Event,
    pub b: &'a Event,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Overlap<'_> {
    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

/// Every pair overlapping by at least `min_overlap`. `events` must be sorted by start.
pub fn find_overlaps(events: &[Event], min_overlap: Duration) -> Vec<Overlap<'_>> {
    let mut overlaps = Vec::new();

    for (i, first) in events.iter().enumerate() {
        for second in &events[i + 1..] {
            // Sorted by start: nothing further can overlap `first`
            if second.data.starts_at >= first.data.ends_at {
                break;
            }
            if same_meeting(first, second) {
                continue;
            }

            let start = first.data.starts_at.max(second.data.starts_at);
            let end = first.data.ends_at.min(second.data.ends_at);
            if end - start < min_overlap {
                continue;
            }

            let (a, b) = if first.id < second.id {
                (first, second)
            } else {
                (second, first)
            };
            overlaps.push(Overlap { a, b, start, end });
        }
    }

    overlaps
}

/// One meeting seen through two connected calendars
fn same_meeting(first: &Event, second: &Event) -> bool {
    match (&first.data.provider_ical_uid, &second.data.provider_ical_uid) {
        (Some(x), Some(y)) => {
            x == y
                && first.data.starts_at == second.data.starts_at
                && first.data.ends_at == second.data.ends_at
        }
        _ => false,
    }
}

fn contains(outer: &Event, inner: &Event) -> bool {
    outer.data.starts_at <= inner.data.starts_at && outer.data.ends_at >= inner.data.ends_at
}

/// Hard when attending both is impossible, soft when the overlap is marginal.
pub fn classify(overlap: &Overlap<'_>, config: &ConflictConfig) -> Severity {
    let (a, b) = (overlap.a, overlap.b);

    if contains(a, b) || contains(b, a) {
        return Severity::Hard;
    }
    if a.data.status == EventStatus::Tentative || b.data.status == EventStatus::Tentative {
        return Severity::Soft;
    }
    if overlap.minutes() <= config.edge_tolerance_minutes {
        return Severity::Soft;
    }
    if a.data.attendee_count > 1 && b.data.attendee_count > 1 {
        return Severity::Hard;
    }
    Severity::Soft
}

/// Both intervals; changes whenever either event moves.
pub fn fingerprint(overlap: &Overlap<'_>) -> String {
    let mut hasher = Sha256::new();
    for event in [overlap.a, overlap.b] {
        hasher.update(event.id.as_bytes());
        hasher.update(event.data.starts_at.timestamp().to_be_bytes());
        hasher.update(event.data.ends_at.timestamp().to_be_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub detected: usize,
    pub created: usize,
    pub reopened: usize,
    pub auto_resolved: usize,
}

/// Conflict scans and flag lifecycle for one store
pub struct ConflictDetector {
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    config: ConflictConfig,
}

impl ConflictDetector {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn Cache>, config: ConflictConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Detect overlaps for a user and reconcile stored flags.
    #[instrument(skip(self))]
    pub async fn scan(&self, user_id: &str) -> CalResult<ScanReport> {
        let events = self.store.conflict_candidates(user_id).await?;
        let overlaps = find_overlaps(&events, Duration::minutes(self.config.min_overlap_minutes));

        let existing: HashMap<(String, String), ConflictFlag> = self
            .store
            .list_conflict_flags(user_id, None)
            .await?
            .into_iter()
            .map(|flag| ((flag.event_id_a.clone(), flag.event_id_b.clone()), flag))
            .collect();

        let now = Utc::now();
        let mut report = ScanReport {
            detected: overlaps.len(),
            ..ScanReport::default()
        };
        let mut writes = Vec::new();
        let mut seen = HashSet::new();

        for overlap in &overlaps {
            let key = (overlap.a.id.clone(), overlap.b.id.clone());
            let severity = classify(overlap, &self.config);
            let print = fingerprint(overlap);

            let flag = match existing.get(&key) {
                None => {
                    report.created += 1;
                    ConflictFlag {
                        id: Uuid::new_v4().to_string(),
                        user_id: user_id.to_string(),
                        event_id_a: key.0.clone(),
                        event_id_b: key.1.clone(),
                        overlap_start: overlap.start,
                        overlap_end: overlap.end,
                        overlap_minutes: overlap.minutes(),
                        severity,
                        status: ConflictStatus::Active,
                        fingerprint: Some(print),
                        resolved_at: None,
                        created_at: now,
                        updated_at: now,
                    }
                }
                Some(flag) => {
                    let moved = flag.fingerprint.as_deref() != Some(print.as_str());
                    if !moved && flag.severity == severity {
                        seen.insert(key);
                        continue;
                    }

                    let mut updated = flag.clone();
                    if moved && updated.status != ConflictStatus::Active {
                        report.reopened += 1;
                        updated.status = ConflictStatus::Active;
                        updated.resolved_at = None;
                    }
                    updated.overlap_start = overlap.start;
                    updated.overlap_end = overlap.end;
                    updated.overlap_minutes = overlap.minutes();
                    updated.severity = severity;
                    updated.fingerprint = Some(print);
                    updated.updated_at = now;
                    updated
                }
            };

            seen.insert(key);
            writes.push(flag);
        }

        // Pairs that no longer overlap
        for (key, flag) in &existing {
            if seen.contains(key) || flag.fingerprint.is_none() {
                continue;
            }
            let mut resolved = flag.clone();
            if resolved.status != ConflictStatus::Resolved {
                resolved.status = ConflictStatus::Resolved;
                resolved.resolved_at = Some(now);
                report.auto_resolved += 1;
            }
            // Any later re-overlap counts as a change
            resolved.fingerprint = None;
            resolved.updated_at = now;
            writes.push(resolved);
        }

        if !writes.is_empty() {
            self.store.save_conflict_flags(&writes).await?;
            cache::invalidate_user(self.cache.as_ref(), user_id).await?;
        }

        let severities: Vec<&str> = writes
            .iter()
            .filter(|f| f.status == ConflictStatus::Active)
            .map(|f| f.severity.as_str())
            .collect();
        crate::metrics::record_conflict_scan(&severities);

        info!(
            detected = report.detected,
            created = report.created,
            reopened = report.reopened,
            auto_resolved = report.auto_resolved,
            "conflict scan finished"
        );
        Ok(report)
    }

    /// Flags of a user, optionally filtered by status; cached per user version.
    pub async fn list(
        &self,
        user_id: &str,
        status: Option<ConflictStatus>,
    ) -> CalResult<Vec<ConflictFlag>> {
        let version = cache::user_cache_version(self.cache.as_ref(), user_id).await?;
        let key = keys::conflict_list(
            user_id,
            &version,
            status.map(|s| s.as_str()).unwrap_or("all"),
        );

        if let Some(flags) = cache::get_json(self.cache.as_ref(), &key).await? {
            debug!("conflict list served from cache");
            return Ok(flags);
        }

        let flags = self.store.list_conflict_flags(user_id, status).await?;
        cache::set_json(self.cache.as_ref(), &key, &flags, None).await?;
        Ok(flags)
    }

    pub async fn acknowledge(&self, user_id: &str, flag_id: &str) -> CalResult<ConflictFlag> {
        self.transition(user_id, flag_id, |flag| match flag.status {
            ConflictStatus::Active | ConflictStatus::Acknowledged => {
                flag.status = ConflictStatus::Acknowledged;
                Ok(())
            }
            ConflictStatus::Resolved => Err(CalError::Conflict(
                "Resolved conflicts cannot be acknowledged".to_string(),
            )),
        })
        .await
    }

    pub async fn resolve(&self, user_id: &str, flag_id: &str) -> CalResult<ConflictFlag> {
        self.transition(user_id, flag_id, |flag| {
            if flag.status != ConflictStatus::Resolved {
                flag.status = ConflictStatus::Resolved;
                flag.resolved_at = Some(Utc::now());
            }
            Ok(())
        })
        .await
    }

    pub async fn reopen(&self, user_id: &str, flag_id: &str) -> CalResult<ConflictFlag> {
        self.transition(user_id, flag_id, |flag| {
            flag.status = ConflictStatus::Active;
            flag.resolved_at = None;
            Ok(())
        })
        .await
    }

    async fn transition<F>(&self, user_id: &str, flag_id: &str, apply: F) -> CalResult<ConflictFlag>
    where
        F: FnOnce(&mut ConflictFlag) -> CalResult<()>,
    {
        let mut flag = self
            .store
            .get_conflict_flag(flag_id)
            .await?
            .filter(|f| f.user_id == user_id)
            .ok_or_else(|| CalError::NotFound(format!("Conflict {} not found", flag_id)))?;

        apply(&mut flag)?;
        flag.updated_at = Utc::now();
        self.store.save_conflict_flags(std::slice::from_ref(&flag)).await?;
        cache::invalidate_user(self.cache.as_ref(), user_id).await?;
        Ok(flag)
    }

    /// Free gaps in the user's enabled calendars.
    pub async fn free_slots(&self, user_id: &str, request: &FreeSlotRequest) -> CalResult<Vec<FreeSlot>> {
        let tz = request.check()?;
        let events = self
            .store
            .list_events(user_id, request.window_start, request.window_end)
            .await?;

        let busy: Vec<free_slots::Busy> = events
            .iter()
            .filter(|e| !e.data.is_all_day && e.data.status != EventStatus::Cancelled)
            .map(|e| (e.data.starts_at, e.data.ends_at))
            .collect();

        let limit = request.limit.unwrap_or(self.config.max_free_slots);
        Ok(free_slots::find_free_slots(&busy, request, tz, limit))
    }
}
