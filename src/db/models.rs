/// Entity models persisted by the store
use crate::error::CalError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declares a string-backed enum stored as TEXT.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = CalError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(CalError::Internal(format!(
                        "unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(
    /// Calendar provider
    ProviderKind {
        Google => "google",
        Microsoft => "microsoft",
        CalDav => "caldav",
    }
);

text_enum!(
    /// Account sync state machine
    SyncStatus {
        Pending => "pending",
        Syncing => "syncing",
        Synced => "synced",
        Error => "error",
        Paused => "paused",
    }
);

text_enum!(
    EventStatus {
        Confirmed => "confirmed",
        Tentative => "tentative",
        Cancelled => "cancelled",
    }
);

text_enum!(
    Visibility {
        Default => "default",
        Public => "public",
        Private => "private",
        Confidential => "confidential",
    }
);

text_enum!(
    /// Attendee response
    ResponseStatus {
        NeedsAction => "needs_action",
        Accepted => "accepted",
        Declined => "declined",
        Tentative => "tentative",
    }
);

text_enum!(
    Severity {
        Hard => "hard",
        Soft => "soft",
    }
);

text_enum!(
    ConflictStatus {
        Active => "active",
        Acknowledged => "acknowledged",
        Resolved => "resolved",
    }
);

/// One external identity for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedAccount {
    pub id: String,
    pub user_id: String,
    pub provider: ProviderKind,
    pub provider_account_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub scopes: String,
    pub is_active: bool,
    pub sync_status: SyncStatus,
    pub error_message: Option<String>,
    /// Credential rejected by the provider; no automatic sync until the user reconnects
    #[serde(default)]
    pub reconnect_required: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// AES-GCM sealed secret: base64 ciphertext (tag appended) and base64 nonce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub ciphertext: String,
    pub iv: String,
}

/// Encrypted credential for a connected account.
///
/// For CalDAV the access secret is the account password and the refresh
/// secret is the server URL.
#[derive(Debug, Clone)]
pub struct Credential {
    pub account_id: String,
    pub access: SealedSecret,
    pub refresh: Option<SealedSecret>,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Sub-calendar of a connected account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calendar {
    pub id: String,
    pub account_id: String,
    pub provider_calendar_id: String,
    pub name: String,
    pub color: Option<String>,
    pub timezone: Option<String>,
    pub is_primary: bool,
    pub is_enabled: bool,
    /// No longer reported by the provider
    pub provider_removed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attendee {
    pub email: String,
    pub name: Option<String>,
    pub response: ResponseStatus,
    #[serde(default)]
    pub optional: bool,
}

/// Canonical event content produced by the normalizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub provider_event_id: String,
    pub provider_ical_uid: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub is_all_day: bool,
    pub timezone: String,
    pub is_recurring: bool,
    pub recurrence_rule: Option<String>,
    pub recurring_event_id: Option<String>,
    pub original_start_time: Option<DateTime<Utc>>,
    pub status: EventStatus,
    pub visibility: Visibility,
    pub organizer: Option<String>,
    pub attendees: Vec<Attendee>,
    pub attendee_count: i64,
    pub provider_etag: Option<String>,
    /// Diagnostic copy of the provider payload; never read by application logic
    #[serde(skip)]
    pub provider_raw: Option<String>,
}

/// Stored event row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub user_id: String,
    pub calendar_id: String,
    pub provider: ProviderKind,
    #[serde(flatten)]
    pub data: NormalizedEvent,
    pub deleted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Detected overlap between two events of one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictFlag {
    pub id: String,
    pub user_id: String,
    /// Lexicographically smaller event id
    pub event_id_a: String,
    pub event_id_b: String,
    pub overlap_start: DateTime<Utc>,
    pub overlap_end: DateTime<Utc>,
    pub overlap_minutes: i64,
    pub severity: Severity,
    pub status: ConflictStatus,
    /// Interval fingerprint of both events when the flag was last written; cleared on auto-resolve
    #[serde(skip)]
    pub fingerprint: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Active provider push channel (Google) or subscription (Microsoft)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub id: String,
    pub account_id: String,
    pub calendar_id: String,
    pub provider: ProviderKind,
    pub channel_id: String,
    pub resource_id: Option<String>,
    #[serde(skip)]
    pub client_state: String,
    pub expires_at: DateTime<Utc>,
}
