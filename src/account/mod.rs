/// Connected account management
///
/// Connecting, disconnecting and deleting provider accounts, toggling
/// calendars, creating single events and serving cached event lists.

mod manager;

pub use manager::AccountManager;

use crate::db::models::{Calendar, ConnectedAccount, ProviderKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// OAuth connection completed by the client after the consent redirect
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConnectOAuthRequest {
    pub provider: ProviderKind,
    #[validate(length(min = 1, max = 2048))]
    pub code: String,
    #[validate(url)]
    pub redirect_uri: String,
}

/// CalDAV login (app password)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConnectCalDavRequest {
    #[validate(url)]
    pub server_url: String,
    #[validate(length(min = 1, max = 320))]
    pub username: String,
    #[validate(length(min = 1, max = 1024))]
    pub password: String,
}

/// Account with its calendars
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountView {
    #[serde(flatten)]
    pub account: ConnectedAccount,
    pub calendars: Vec<Calendar>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetCalendarEnabledRequest {
    pub enabled: bool,
}
