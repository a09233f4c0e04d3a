/// SQLite implementation of the store using runtime queries
use super::{BatchOutcome, EventBatch, Store};
use crate::db::models::{
    Attendee, Calendar, ConflictFlag, ConflictStatus, ConnectedAccount, Credential, Event,
    NormalizedEvent, PushSubscription, SealedSecret, SyncStatus,
};
use crate::error::{CalError, CalResult};
use crate::providers::{RemoteCalendar, SyncCursor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }
}

fn account_from_row(row: &SqliteRow) -> CalResult<ConnectedAccount> {
    Ok(ConnectedAccount {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        provider: row.try_get::<String, _>("provider")?.parse()?,
        provider_account_id: row.try_get("provider_account_id")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        scopes: row.try_get("scopes")?,
        is_active: row.try_get("is_active")?,
        sync_status: row.try_get::<String, _>("sync_status")?.parse()?,
        error_message: row.try_get("error_message")?,
        reconnect_required: row.try_get("reconnect_required")?,
        last_synced_at: row.try_get("last_synced_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn credential_from_row(row: &SqliteRow) -> CalResult<Credential> {
    let refresh_ciphertext: Option<String> = row.try_get("refresh_ciphertext")?;
    let refresh_iv: Option<String> = row.try_get("refresh_iv")?;

    Ok(Credential {
        account_id: row.try_get("account_id")?,
        access: SealedSecret {
            ciphertext: row.try_get("access_ciphertext")?,
            iv: row.try_get("access_iv")?,
        },
        refresh: refresh_ciphertext
            .zip(refresh_iv)
            .map(|(ciphertext, iv)| SealedSecret { ciphertext, iv }),
        token_type: row.try_get("token_type")?,
        expires_at: row.try_get("expires_at")?,
        refresh_expires_at: row.try_get("refresh_expires_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn calendar_from_row(row: &SqliteRow) -> CalResult<Calendar> {
    Ok(Calendar {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        provider_calendar_id: row.try_get("provider_calendar_id")?,
        name: row.try_get("name")?,
        color: row.try_get("color")?,
        timezone: row.try_get("timezone")?,
        is_primary: row.try_get("is_primary")?,
        is_enabled: row.try_get("is_enabled")?,
        provider_removed: row.try_get("provider_removed")?,
    })
}

fn event_from_row(row: &SqliteRow) -> CalResult<Event> {
    let attendees: Vec<Attendee> = serde_json::from_str(&row.try_get::<String, _>("attendees")?)?;

    Ok(Event {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        calendar_id: row.try_get("calendar_id")?,
        provider: row.try_get::<String, _>("provider")?.parse()?,
        data: NormalizedEvent {
            provider_event_id: row.try_get("provider_event_id")?,
            provider_ical_uid: row.try_get("provider_ical_uid")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            location: row.try_get("location")?,
            url: row.try_get("url")?,
            starts_at: row.try_get("starts_at")?,
            ends_at: row.try_get("ends_at")?,
            is_all_day: row.try_get("is_all_day")?,
            timezone: row.try_get("timezone")?,
            is_recurring: row.try_get("is_recurring")?,
            recurrence_rule: row.try_get("recurrence_rule")?,
            recurring_event_id: row.try_get("recurring_event_id")?,
            original_start_time: row.try_get("original_start_time")?,
            status: row.try_get::<String, _>("status")?.parse()?,
            visibility: row.try_get::<String, _>("visibility")?.parse()?,
            organizer: row.try_get("organizer")?,
            attendees,
            attendee_count: row.try_get("attendee_count")?,
            provider_etag: row.try_get("provider_etag")?,
            provider_raw: row.try_get("provider_raw")?,
        },
        deleted_at: row.try_get("deleted_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn flag_from_row(row: &SqliteRow) -> CalResult<ConflictFlag> {
    Ok(ConflictFlag {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        event_id_a: row.try_get("event_id_a")?,
        event_id_b: row.try_get("event_id_b")?,
        overlap_start: row.try_get("overlap_start")?,
        overlap_end: row.try_get("overlap_end")?,
        overlap_minutes: row.try_get("overlap_minutes")?,
        severity: row.try_get::<String, _>("severity")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        fingerprint: row.try_get("fingerprint")?,
        resolved_at: row.try_get("resolved_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn subscription_from_row(row: &SqliteRow) -> CalResult<PushSubscription> {
    Ok(PushSubscription {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        calendar_id: row.try_get("calendar_id")?,
        provider: row.try_get::<String, _>("provider")?.parse()?,
        channel_id: row.try_get("channel_id")?,
        resource_id: row.try_get("resource_id")?,
        client_state: row.try_get("client_state")?,
        expires_at: row.try_get("expires_at")?,
    })
}

async fn upsert_credential(conn: &mut SqliteConnection, credential: &Credential) -> CalResult<()> {
    let (refresh_ciphertext, refresh_iv) = match &credential.refresh {
        Some(sealed) => (Some(sealed.ciphertext.as_str()), Some(sealed.iv.as_str())),
        None => (None, None),
    };

    sqlx::query(
        "INSERT INTO credentials (account_id, access_ciphertext, access_iv, refresh_ciphertext, refresh_iv, token_type, expires_at, refresh_expires_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(account_id) DO UPDATE SET
            access_ciphertext = excluded.access_ciphertext,
            access_iv = excluded.access_iv,
            refresh_ciphertext = excluded.refresh_ciphertext,
            refresh_iv = excluded.refresh_iv,
            token_type = excluded.token_type,
            expires_at = excluded.expires_at,
            refresh_expires_at = excluded.refresh_expires_at,
            updated_at = excluded.updated_at",
    )
    .bind(&credential.account_id)
    .bind(&credential.access.ciphertext)
    .bind(&credential.access.iv)
    .bind(refresh_ciphertext)
    .bind(refresh_iv)
    .bind(&credential.token_type)
    .bind(credential.expires_at)
    .bind(credential.refresh_expires_at)
    .bind(credential.updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn upsert_event(
    conn: &mut SqliteConnection,
    batch: &EventBatch,
    event: &NormalizedEvent,
    now: DateTime<Utc>,
) -> CalResult<u64> {
    let cancelled = event.status == crate::db::models::EventStatus::Cancelled;
    let attendees = serde_json::to_string(&event.attendees)?;

    let result = sqlx::query(
        "INSERT INTO events (id, user_id, calendar_id, provider, provider_event_id, provider_ical_uid, title, description, location, url,
                             starts_at, ends_at, is_all_day, timezone, is_recurring, recurrence_rule, recurring_event_id, original_start_time,
                             status, visibility, organizer, attendees, attendee_count, provider_etag, provider_raw, deleted_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?27)
         ON CONFLICT(calendar_id, provider_event_id) DO UPDATE SET
            provider_ical_uid = excluded.provider_ical_uid,
            title = excluded.title,
            description = excluded.description,
            location = excluded.location,
            url = excluded.url,
            starts_at = excluded.starts_at,
            ends_at = excluded.ends_at,
            is_all_day = excluded.is_all_day,
            timezone = excluded.timezone,
            is_recurring = excluded.is_recurring,
            recurrence_rule = excluded.recurrence_rule,
            recurring_event_id = excluded.recurring_event_id,
            original_start_time = excluded.original_start_time,
            status = excluded.status,
            visibility = excluded.visibility,
            organizer = excluded.organizer,
            attendees = excluded.attendees,
            attendee_count = excluded.attendee_count,
            provider_etag = excluded.provider_etag,
            provider_raw = excluded.provider_raw,
            deleted_at = CASE WHEN excluded.status = 'cancelled'
                              THEN COALESCE(events.deleted_at, excluded.updated_at)
                              ELSE NULL END,
            updated_at = excluded.updated_at
         WHERE events.provider_etag IS NOT excluded.provider_etag
            OR events.starts_at IS NOT excluded.starts_at
            OR events.ends_at IS NOT excluded.ends_at
            OR events.status IS NOT excluded.status
            OR events.title IS NOT excluded.title
            OR (events.deleted_at IS NOT NULL AND excluded.status <> 'cancelled')",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&batch.user_id)
    .bind(&batch.calendar_id)
    .bind(batch.provider.as_str())
    .bind(&event.provider_event_id)
    .bind(&event.provider_ical_uid)
    .bind(&event.title)
    .bind(&event.description)
    .bind(&event.location)
    .bind(&event.url)
    .bind(event.starts_at)
    .bind(event.ends_at)
    .bind(event.is_all_day)
    .bind(&event.timezone)
    .bind(event.is_recurring)
    .bind(&event.recurrence_rule)
    .bind(&event.recurring_event_id)
    .bind(event.original_start_time)
    .bind(event.status.as_str())
    .bind(event.visibility.as_str())
    .bind(&event.organizer)
    .bind(attendees)
    .bind(event.attendee_count)
    .bind(&event.provider_etag)
    .bind(&event.provider_raw)
    .bind(if cancelled { Some(now) } else { None })
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

async fn soft_delete_event(
    conn: &mut SqliteConnection,
    calendar_id: &str,
    provider_event_id: &str,
    now: DateTime<Utc>,
) -> CalResult<u64> {
    let result = sqlx::query(
        "UPDATE events SET deleted_at = ?1, updated_at = ?1
         WHERE calendar_id = ?2 AND provider_event_id = ?3 AND deleted_at IS NULL",
    )
    .bind(now)
    .bind(calendar_id)
    .bind(provider_event_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

#[async_trait]
impl Store for SqliteStore {
    async fn connect_account(
        &self,
        account: &ConnectedAccount,
        credential: &Credential,
    ) -> CalResult<ConnectedAccount> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO connected_accounts (id, user_id, provider, provider_account_id, email, display_name, scopes, is_active, sync_status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, 'pending', ?8, ?8)
             ON CONFLICT(user_id, provider, provider_account_id) DO UPDATE SET
                email = excluded.email,
                display_name = excluded.display_name,
                scopes = excluded.scopes,
                is_active = 1,
                sync_status = 'pending',
                error_message = NULL,
                reconnect_required = 0,
                updated_at = excluded.updated_at",
        )
        .bind(&account.id)
        .bind(&account.user_id)
        .bind(account.provider.as_str())
        .bind(&account.provider_account_id)
        .bind(&account.email)
        .bind(&account.display_name)
        .bind(&account.scopes)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM connected_accounts WHERE user_id = ?1 AND provider = ?2 AND provider_account_id = ?3",
        )
        .bind(&account.user_id)
        .bind(account.provider.as_str())
        .bind(&account.provider_account_id)
        .fetch_one(&mut *tx)
        .await?;
        let stored = account_from_row(&row)?;

        let credential = Credential {
            account_id: stored.id.clone(),
            ..credential.clone()
        };
        upsert_credential(&mut tx, &credential).await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn get_account(&self, account_id: &str) -> CalResult<Option<ConnectedAccount>> {
        let row = sqlx::query("SELECT * FROM connected_accounts WHERE id = ?1")
            .bind(account_id)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn list_accounts_for_user(&self, user_id: &str) -> CalResult<Vec<ConnectedAccount>> {
        let rows = sqlx::query(
            "SELECT * FROM connected_accounts WHERE user_id = ?1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(account_from_row).collect()
    }

    async fn list_active_accounts(&self) -> CalResult<Vec<ConnectedAccount>> {
        let rows = sqlx::query("SELECT * FROM connected_accounts WHERE is_active = 1 AND reconnect_required = 0")
            .fetch_all(&self.db)
            .await?;

        rows.iter().map(account_from_row).collect()
    }

    async fn set_sync_status(
        &self,
        account_id: &str,
        status: SyncStatus,
        error_message: Option<&str>,
    ) -> CalResult<()> {
        sqlx::query(
            "UPDATE connected_accounts
             SET sync_status = ?1,
                 error_message = ?2,
                 last_synced_at = CASE WHEN ?1 = 'synced' THEN ?3 ELSE last_synced_at END,
                 updated_at = ?3
             WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(Utc::now())
        .bind(account_id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn mark_reconnect_required(&self, account_id: &str, error_message: &str) -> CalResult<()> {
        sqlx::query(
            "UPDATE connected_accounts
             SET sync_status = 'error', error_message = ?1, reconnect_required = 1, updated_at = ?2
             WHERE id = ?3",
        )
        .bind(error_message)
        .bind(Utc::now())
        .bind(account_id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn deactivate_account(&self, account_id: &str) -> CalResult<()> {
        let mut tx = self.db.begin().await?;

        let result = sqlx::query(
            "UPDATE connected_accounts
             SET is_active = 0, sync_status = 'paused', error_message = NULL, updated_at = ?1
             WHERE id = ?2",
        )
        .bind(Utc::now())
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CalError::NotFound(format!("Account {} not found", account_id)));
        }

        for table in ["credentials", "push_subscriptions", "sync_cursors"] {
            sqlx::query(&format!("DELETE FROM {} WHERE account_id = ?1", table))
                .bind(account_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_user_data(&self, user_id: &str) -> CalResult<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query("DELETE FROM conflict_flags WHERE user_id = ?1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM events WHERE user_id = ?1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        for table in ["push_subscriptions", "sync_cursors", "credentials", "calendars"] {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE account_id IN (SELECT id FROM connected_accounts WHERE user_id = ?1)",
                table
            ))
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM connected_accounts WHERE user_id = ?1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_credential(&self, account_id: &str) -> CalResult<Option<Credential>> {
        let row = sqlx::query("SELECT * FROM credentials WHERE account_id = ?1")
            .bind(account_id)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(credential_from_row).transpose()
    }

    async fn save_credential(&self, credential: &Credential) -> CalResult<()> {
        let mut conn = self.db.acquire().await?;
        upsert_credential(&mut conn, credential).await
    }

    async fn list_calendars(&self, account_id: &str) -> CalResult<Vec<Calendar>> {
        let rows = sqlx::query(
            "SELECT * FROM calendars WHERE account_id = ?1 ORDER BY is_primary DESC, name",
        )
        .bind(account_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(calendar_from_row).collect()
    }

    async fn get_calendar(&self, calendar_id: &str) -> CalResult<Option<Calendar>> {
        let row = sqlx::query("SELECT * FROM calendars WHERE id = ?1")
            .bind(calendar_id)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(calendar_from_row).transpose()
    }

    async fn upsert_calendar(
        &self,
        account_id: &str,
        remote: &RemoteCalendar,
    ) -> CalResult<Calendar> {
        let now = Utc::now();

        // A calendar that reappears after removal is re-enabled
        sqlx::query(
            "INSERT INTO calendars (id, account_id, provider_calendar_id, name, color, timezone, is_primary, is_enabled, provider_removed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, 0, ?8, ?8)
             ON CONFLICT(account_id, provider_calendar_id) DO UPDATE SET
                name = excluded.name,
                color = excluded.color,
                timezone = excluded.timezone,
                is_primary = excluded.is_primary,
                is_enabled = CASE WHEN calendars.provider_removed = 1 THEN 1 ELSE calendars.is_enabled END,
                provider_removed = 0,
                updated_at = excluded.updated_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(account_id)
        .bind(&remote.provider_calendar_id)
        .bind(&remote.name)
        .bind(&remote.color)
        .bind(&remote.timezone)
        .bind(remote.is_primary)
        .bind(now)
        .execute(&self.db)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM calendars WHERE account_id = ?1 AND provider_calendar_id = ?2",
        )
        .bind(account_id)
        .bind(&remote.provider_calendar_id)
        .fetch_one(&self.db)
        .await?;

        calendar_from_row(&row)
    }

    async fn mark_calendar_removed(&self, calendar_id: &str) -> CalResult<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "UPDATE calendars SET provider_removed = 1, is_enabled = 0, updated_at = ?1 WHERE id = ?2",
        )
        .bind(Utc::now())
        .bind(calendar_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM sync_cursors WHERE calendar_id = ?1")
            .bind(calendar_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_calendar_enabled(&self, calendar_id: &str, enabled: bool) -> CalResult<()> {
        let result = sqlx::query("UPDATE calendars SET is_enabled = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(enabled)
            .bind(Utc::now())
            .bind(calendar_id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CalError::NotFound(format!("Calendar {} not found", calendar_id)));
        }
        Ok(())
    }

    async fn get_cursor(&self, calendar_id: &str) -> CalResult<Option<SyncCursor>> {
        let row = sqlx::query("SELECT cursor FROM sync_cursors WHERE calendar_id = ?1")
            .bind(calendar_id)
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => {
                let json: String = row.try_get("cursor")?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn clear_cursor(&self, calendar_id: &str) -> CalResult<()> {
        sqlx::query("DELETE FROM sync_cursors WHERE calendar_id = ?1")
            .bind(calendar_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn apply_event_batch(&self, batch: &EventBatch) -> CalResult<BatchOutcome> {
        let now = Utc::now();
        let mut outcome = BatchOutcome::default();
        let mut tx = self.db.begin().await?;

        for event in &batch.upserts {
            outcome.upserted += upsert_event(&mut tx, batch, event, now).await?;
        }

        for provider_event_id in &batch.removals {
            outcome.removed +=
                soft_delete_event(&mut tx, &batch.calendar_id, provider_event_id, now).await?;
        }

        if let Some((window, seen)) = &batch.snapshot {
            let rows = sqlx::query(
                "SELECT provider_event_id FROM events
                 WHERE calendar_id = ?1 AND deleted_at IS NULL AND starts_at < ?2 AND ends_at > ?3",
            )
            .bind(&batch.calendar_id)
            .bind(window.end)
            .bind(window.start)
            .fetch_all(&mut *tx)
            .await?;

            for row in rows {
                let provider_event_id: String = row.try_get("provider_event_id")?;
                if !seen.contains(&provider_event_id) {
                    outcome.removed +=
                        soft_delete_event(&mut tx, &batch.calendar_id, &provider_event_id, now)
                            .await?;
                }
            }
        }

        // Cursor goes last so it never runs ahead of the data it describes
        match &batch.next_cursor {
            Some(cursor) => {
                sqlx::query(
                    "INSERT INTO sync_cursors (calendar_id, account_id, cursor, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(calendar_id) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
                )
                .bind(&batch.calendar_id)
                .bind(&batch.account_id)
                .bind(serde_json::to_string(cursor)?)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM sync_cursors WHERE calendar_id = ?1")
                    .bind(&batch.calendar_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_event(&self, event_id: &str) -> CalResult<Option<Event>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?1")
            .bind(event_id)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn list_events(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CalResult<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT e.* FROM events e
             JOIN calendars c ON c.id = e.calendar_id
             JOIN connected_accounts a ON a.id = c.account_id
             WHERE e.user_id = ?1 AND e.deleted_at IS NULL
               AND c.is_enabled = 1 AND a.is_active = 1
               AND e.starts_at < ?3 AND e.ends_at > ?2
             ORDER BY e.starts_at, e.id",
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn conflict_candidates(&self, user_id: &str) -> CalResult<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT e.* FROM events e
             JOIN calendars c ON c.id = e.calendar_id
             JOIN connected_accounts a ON a.id = c.account_id
             WHERE e.user_id = ?1 AND e.deleted_at IS NULL
               AND e.status <> 'cancelled' AND e.is_all_day = 0
               AND c.is_enabled = 1 AND a.is_active = 1
             ORDER BY e.starts_at, e.id",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn list_conflict_flags(
        &self,
        user_id: &str,
        status: Option<ConflictStatus>,
    ) -> CalResult<Vec<ConflictFlag>> {
        let rows = sqlx::query(
            "SELECT * FROM conflict_flags
             WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY overlap_start, id",
        )
        .bind(user_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(flag_from_row).collect()
    }

    async fn get_conflict_flag(&self, flag_id: &str) -> CalResult<Option<ConflictFlag>> {
        let row = sqlx::query("SELECT * FROM conflict_flags WHERE id = ?1")
            .bind(flag_id)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(flag_from_row).transpose()
    }

    async fn save_conflict_flags(&self, flags: &[ConflictFlag]) -> CalResult<()> {
        let mut tx = self.db.begin().await?;

        for flag in flags {
            sqlx::query(
                "INSERT INTO conflict_flags (id, user_id, event_id_a, event_id_b, overlap_start, overlap_end, overlap_minutes, severity, status, fingerprint, resolved_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(event_id_a, event_id_b) DO UPDATE SET
                    overlap_start = excluded.overlap_start,
                    overlap_end = excluded.overlap_end,
                    overlap_minutes = excluded.overlap_minutes,
                    severity = excluded.severity,
                    status = excluded.status,
                    fingerprint = excluded.fingerprint,
                    resolved_at = excluded.resolved_at,
                    updated_at = excluded.updated_at",
            )
            .bind(&flag.id)
            .bind(&flag.user_id)
            .bind(&flag.event_id_a)
            .bind(&flag.event_id_b)
            .bind(flag.overlap_start)
            .bind(flag.overlap_end)
            .bind(flag.overlap_minutes)
            .bind(flag.severity.as_str())
            .bind(flag.status.as_str())
            .bind(&flag.fingerprint)
            .bind(flag.resolved_at)
            .bind(flag.created_at)
            .bind(flag.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_push_subscription(&self, subscription: &PushSubscription) -> CalResult<()> {
        sqlx::query(
            "INSERT INTO push_subscriptions (id, account_id, calendar_id, provider, channel_id, resource_id, client_state, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                channel_id = excluded.channel_id,
                resource_id = excluded.resource_id,
                client_state = excluded.client_state,
                expires_at = excluded.expires_at",
        )
        .bind(&subscription.id)
        .bind(&subscription.account_id)
        .bind(&subscription.calendar_id)
        .bind(subscription.provider.as_str())
        .bind(&subscription.channel_id)
        .bind(&subscription.resource_id)
        .bind(&subscription.client_state)
        .bind(subscription.expires_at)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn find_push_subscription(
        &self,
        channel_id: &str,
    ) -> CalResult<Option<PushSubscription>> {
        let row = sqlx::query("SELECT * FROM push_subscriptions WHERE channel_id = ?1")
            .bind(channel_id)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn list_push_subscriptions(&self, account_id: &str) -> CalResult<Vec<PushSubscription>> {
        let rows = sqlx::query("SELECT * FROM push_subscriptions WHERE account_id = ?1")
            .bind(account_id)
            .fetch_all(&self.db)
            .await?;

        rows.iter().map(subscription_from_row).collect()
    }

    async fn list_expiring_push_subscriptions(
        &self,
        before: DateTime<Utc>,
    ) -> CalResult<Vec<PushSubscription>> {
        let rows = sqlx::query(
            "SELECT * FROM push_subscriptions WHERE expires_at < ?1 ORDER BY expires_at",
        )
        .bind(before)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(subscription_from_row).collect()
    }

    async fn delete_push_subscription(&self, subscription_id: &str) -> CalResult<()> {
        sqlx::query("DELETE FROM push_subscriptions WHERE id = ?1")
            .bind(subscription_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::EventStatus;
    use crate::providers::FetchWindow;
    use crate::testing::{normalized_event, seed_account, test_store};
    use chrono::{Duration, TimeZone};
    use std::collections::HashSet;

    fn batch(
        account: &ConnectedAccount,
        calendar: &Calendar,
        upserts: Vec<NormalizedEvent>,
    ) -> EventBatch {
        EventBatch {
            user_id: account.user_id.clone(),
            account_id: account.id.clone(),
            calendar_id: calendar.id.clone(),
            provider: account.provider,
            upserts,
            removals: vec![],
            snapshot: None,
            next_cursor: None,
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 3, 4, hour, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn test_reconnect_upserts_same_account() {
        let store = test_store().await;
        let (account, _) = seed_account(&store, "user-1").await;

        store
            .set_sync_status(&account.id, SyncStatus::Error, Some("revoked"))
            .await
            .unwrap();

        let again = ConnectedAccount {
            id: Uuid::new_v4().to_string(),
            display_name: Some("Renamed".to_string()),
            ..account.clone()
        };
        let credential = store.get_credential(&account.id).await.unwrap().unwrap();
        let stored = store.connect_account(&again, &credential).await.unwrap();

        assert_eq!(stored.id, account.id);
        assert_eq!(stored.display_name.as_deref(), Some("Renamed"));
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert!(stored.error_message.is_none());
        assert_eq!(store.list_accounts_for_user("user-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_writes_events_then_cursor() {
        let store = test_store().await;
        let (account, calendar) = seed_account(&store, "user-1").await;

        let mut b = batch(
            &account,
            &calendar,
            vec![normalized_event("evt-1", at(9, 0), at(10, 0))],
        );
        b.next_cursor = Some(SyncCursor::Google {
            token: "sync-1".to_string(),
        });

        let outcome = store.apply_event_batch(&b).await.unwrap();
        assert_eq!(outcome.upserted, 1);
        assert!(matches!(
            store.get_cursor(&calendar.id).await.unwrap(),
            Some(SyncCursor::Google { token }) if token == "sync-1"
        ));

        // Same content again is not a change
        let outcome = store.apply_event_batch(&b).await.unwrap();
        assert!(!outcome.changed());

        let events = store.list_events("user-1", at(0, 0), at(23, 0)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.title, "evt-1");
    }

    #[tokio::test]
    async fn test_cancelled_and_removed_events_are_soft_deleted() {
        let store = test_store().await;
        let (account, calendar) = seed_account(&store, "user-1").await;

        store
            .apply_event_batch(&batch(
                &account,
                &calendar,
                vec![
                    normalized_event("evt-1", at(9, 0), at(10, 0)),
                    normalized_event("evt-2", at(11, 0), at(12, 0)),
                ],
            ))
            .await
            .unwrap();

        let mut cancelled = normalized_event("evt-1", at(9, 0), at(10, 0));
        cancelled.status = EventStatus::Cancelled;
        let mut b = batch(&account, &calendar, vec![cancelled]);
        b.removals = vec!["evt-2".to_string()];
        let outcome = store.apply_event_batch(&b).await.unwrap();
        assert_eq!(outcome.removed, 1);

        assert!(store
            .list_events("user-1", at(0, 0), at(23, 0))
            .await
            .unwrap()
            .is_empty());

        // Rows are kept
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE deleted_at IS NOT NULL")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_snapshot_prunes_unseen_events_in_window() {
        let store = test_store().await;
        let (account, calendar) = seed_account(&store, "user-1").await;

        store
            .apply_event_batch(&batch(
                &account,
                &calendar,
                vec![
                    normalized_event("keep", at(9, 0), at(10, 0)),
                    normalized_event("gone", at(11, 0), at(12, 0)),
                ],
            ))
            .await
            .unwrap();

        let mut b = batch(
            &account,
            &calendar,
            vec![normalized_event("keep", at(9, 0), at(10, 0))],
        );
        let window = FetchWindow {
            start: at(0, 0),
            end: at(23, 0),
        };
        b.snapshot = Some((window, HashSet::from(["keep".to_string()])));
        let outcome = store.apply_event_batch(&b).await.unwrap();
        assert_eq!(outcome.removed, 1);

        let live = store.list_events("user-1", at(0, 0), at(23, 0)).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].data.provider_event_id, "keep");
    }

    #[tokio::test]
    async fn test_deactivate_keeps_history() {
        let store = test_store().await;
        let (account, calendar) = seed_account(&store, "user-1").await;
        store.set_calendar_enabled(&calendar.id, false).await.unwrap();

        let mut b = batch(
            &account,
            &calendar,
            vec![normalized_event("evt-1", at(9, 0), at(10, 0))],
        );
        b.next_cursor = Some(SyncCursor::Google {
            token: "t".to_string(),
        });
        store.apply_event_batch(&b).await.unwrap();

        store.deactivate_account(&account.id).await.unwrap();

        let stored = store.get_account(&account.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert!(store.get_credential(&account.id).await.unwrap().is_none());
        assert!(store.get_cursor(&calendar.id).await.unwrap().is_none());

        let calendar = store.get_calendar(&calendar.id).await.unwrap().unwrap();
        assert!(!calendar.is_enabled);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE deleted_at IS NULL")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_delete_user_data_removes_everything() {
        let store = test_store().await;
        let (account, calendar) = seed_account(&store, "user-1").await;
        seed_account(&store, "user-2").await;

        store
            .apply_event_batch(&batch(
                &account,
                &calendar,
                vec![normalized_event("evt-1", at(9, 0), at(10, 0))],
            ))
            .await
            .unwrap();

        store.delete_user_data("user-1").await.unwrap();

        assert!(store.get_account(&account.id).await.unwrap().is_none());
        assert!(store.get_calendar(&calendar.id).await.unwrap().is_none());
        assert_eq!(store.list_accounts_for_user("user-2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_removed_calendar_is_disabled_and_revived() {
        let store = test_store().await;
        let (account, calendar) = seed_account(&store, "user-1").await;

        store.mark_calendar_removed(&calendar.id).await.unwrap();
        let removed = store.get_calendar(&calendar.id).await.unwrap().unwrap();
        assert!(removed.provider_removed);
        assert!(!removed.is_enabled);

        let remote = RemoteCalendar {
            provider_calendar_id: calendar.provider_calendar_id.clone(),
            name: "Back".to_string(),
            color: None,
            timezone: None,
            is_primary: false,
        };
        let revived = store.upsert_calendar(&account.id, &remote).await.unwrap();
        assert_eq!(revived.id, calendar.id);
        assert!(revived.is_enabled);
        assert!(!revived.provider_removed);
    }

    #[tokio::test]
    async fn test_expiring_push_subscriptions() {
        let store = test_store().await;
        let (account, calendar) = seed_account(&store, "user-1").await;
        let now = Utc::now();

        for (id, hours) in [("soon", 2), ("later", 72)] {
            store
                .save_push_subscription(&PushSubscription {
                    id: id.to_string(),
                    account_id: account.id.clone(),
                    calendar_id: calendar.id.clone(),
                    provider: account.provider,
                    channel_id: format!("channel-{}", id),
                    resource_id: None,
                    client_state: "secret".to_string(),
                    expires_at: now + Duration::hours(hours),
                })
                .await
                .unwrap();
        }

        let expiring = store
            .list_expiring_push_subscriptions(now + Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].id, "soon");
        assert!(store
            .find_push_subscription("channel-later")
            .await
            .unwrap()
            .is_some());
    }
}
