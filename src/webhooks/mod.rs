/// Provider push notification ingress
///
/// Notifications carry no event data, only "something changed on channel X".
/// Resolution maps the channel to its stored subscription, checks the shared
/// secret and enqueues a delta sync for that one calendar. Duplicate
/// notifications produce duplicate tasks; the per-account sync lock
/// collapses them.
use crate::db::models::ProviderKind;
use crate::error::CalResult;
use crate::jobs::{Task, TaskDispatcher};
use crate::metrics;
use crate::store::Store;
use axum::http::HeaderMap;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Header-only Google channel notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoogleNotification {
    pub channel_id: String,
    pub resource_state: String,
    pub token: Option<String>,
}

impl GoogleNotification {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };

        Some(Self {
            channel_id: header("x-goog-channel-id")?,
            resource_state: header("x-goog-resource-state").unwrap_or_default(),
            token: header("x-goog-channel-token"),
        })
    }

    /// Google sends `sync` once when a channel is created
    pub fn is_handshake(&self) -> bool {
        self.resource_state == "sync"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MicrosoftNotificationBatch {
    #[serde(default)]
    pub value: Vec<MicrosoftNotification>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicrosoftNotification {
    pub subscription_id: String,
    pub client_state: Option<String>,
    pub change_type: Option<String>,
}

/// What became of one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Enqueued,
    UnknownChannel,
    StateMismatch,
    Inactive,
    Handshake,
    /// Lookup or dispatch failed; the next periodic sync covers the change
    Failed,
}

impl Resolution {
    fn as_str(&self) -> &'static str {
        match self {
            Resolution::Enqueued => "enqueued",
            Resolution::UnknownChannel => "unknown_channel",
            Resolution::StateMismatch => "state_mismatch",
            Resolution::Inactive => "inactive",
            Resolution::Handshake => "handshake",
            Resolution::Failed => "error",
        }
    }
}

pub struct WebhookIngress {
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn TaskDispatcher>,
}

impl WebhookIngress {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    pub async fn handle_google(&self, notification: &GoogleNotification) -> CalResult<Resolution> {
        if notification.is_handshake() {
            debug!(channel_id = %notification.channel_id, "google channel handshake");
            metrics::record_webhook(ProviderKind::Google.as_str(), Resolution::Handshake.as_str());
            return Ok(Resolution::Handshake);
        }

        self.resolve(
            ProviderKind::Google,
            &notification.channel_id,
            notification.token.as_deref(),
        )
        .await
    }

    /// One resolution per distinct subscription in the batch. A failing
    /// notification does not hold up the rest.
    pub async fn handle_microsoft(
        &self,
        batch: &MicrosoftNotificationBatch,
    ) -> CalResult<Vec<Resolution>> {
        let mut seen = HashSet::new();
        let mut resolutions = Vec::new();

        for notification in &batch.value {
            if !seen.insert(notification.subscription_id.as_str()) {
                continue;
            }
            debug!(
                subscription_id = %notification.subscription_id,
                change_type = notification.change_type.as_deref().unwrap_or("unknown"),
                "microsoft change notification"
            );
            let resolution = self
                .resolve(
                    ProviderKind::Microsoft,
                    &notification.subscription_id,
                    notification.client_state.as_deref(),
                )
                .await
                .unwrap_or_else(|e| {
                    warn!(
                        subscription_id = %notification.subscription_id,
                        "failed to resolve microsoft notification: {}",
                        e
                    );
                    Resolution::Failed
                });
            resolutions.push(resolution);
        }

        Ok(resolutions)
    }

    async fn resolve(
        &self,
        provider: ProviderKind,
        channel_id: &str,
        presented_state: Option<&str>,
    ) -> CalResult<Resolution> {
        let resolution = self.resolve_inner(provider, channel_id, presented_state).await;
        let result = match &resolution {
            Ok(r) => r.as_str(),
            Err(_) => "error",
        };
        metrics::record_webhook(provider.as_str(), result);
        resolution
    }

    async fn resolve_inner(
        &self,
        provider: ProviderKind,
        channel_id: &str,
        presented_state: Option<&str>,
    ) -> CalResult<Resolution> {
        let subscription = match self.store.find_push_subscription(channel_id).await? {
            Some(s) if s.provider == provider => s,
            _ => {
                debug!(%provider, channel_id, "notification for unknown channel");
                return Ok(Resolution::UnknownChannel);
            }
        };

        if presented_state != Some(subscription.client_state.as_str()) {
            warn!(%provider, channel_id, "notification with wrong client state ignored");
            return Ok(Resolution::StateMismatch);
        }

        let active = self
            .store
            .get_account(&subscription.account_id)
            .await?
            .map(|a| a.is_active && !a.reconnect_required)
            .unwrap_or(false);
        if !active {
            return Ok(Resolution::Inactive);
        }

        self.dispatcher
            .dispatch(Task::DeltaSync {
                account_id: subscription.account_id,
                calendar_id: Some(subscription.calendar_id),
            })
            .await?;
        Ok(Resolution::Enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::PushSubscription;
    use crate::store::SqliteStore;
    use crate::error::CalError;
    use crate::testing::{seed_account, test_store, RecordingDispatcher};
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use chrono::{Duration, Utc};
    use std::sync::Mutex;

    /// Fails the first dispatch, records the rest
    #[derive(Default)]
    struct FailingOnceDispatcher {
        failed: Mutex<bool>,
        tasks: Mutex<Vec<Task>>,
    }

    #[async_trait]
    impl TaskDispatcher for FailingOnceDispatcher {
        async fn dispatch(&self, task: Task) -> CalResult<()> {
            let mut failed = self.failed.lock().unwrap();
            if !*failed {
                *failed = true;
                return Err(CalError::Internal("queue unavailable".to_string()));
            }
            self.tasks.lock().unwrap().push(task);
            Ok(())
        }
    }

    struct Harness {
        ingress: WebhookIngress,
        store: Arc<SqliteStore>,
        dispatcher: Arc<RecordingDispatcher>,
        account_id: String,
        calendar_id: String,
    }

    async fn harness(provider: ProviderKind, channel_id: &str) -> Harness {
        let store = Arc::new(test_store().await);
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let (account, calendar) = seed_account(&store, "user-1").await;

        store
            .save_push_subscription(&PushSubscription {
                id: "sub-1".to_string(),
                account_id: account.id.clone(),
                calendar_id: calendar.id.clone(),
                provider,
                channel_id: channel_id.to_string(),
                resource_id: None,
                client_state: "shared-secret".to_string(),
                expires_at: Utc::now() + Duration::days(1),
            })
            .await
            .unwrap();

        Harness {
            ingress: WebhookIngress::new(store.clone(), dispatcher.clone()),
            store,
            dispatcher,
            account_id: account.id,
            calendar_id: calendar.id,
        }
    }

    fn google(channel: &str, state: &str, token: Option<&str>) -> GoogleNotification {
        GoogleNotification {
            channel_id: channel.to_string(),
            resource_state: state.to_string(),
            token: token.map(|t| t.to_string()),
        }
    }

    #[test]
    fn test_google_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Goog-Channel-Id", HeaderValue::from_static("chan-1"));
        headers.insert("X-Goog-Resource-State", HeaderValue::from_static("exists"));
        headers.insert("X-Goog-Channel-Token", HeaderValue::from_static("tok"));

        assert_eq!(
            GoogleNotification::from_headers(&headers),
            Some(google("chan-1", "exists", Some("tok")))
        );
        assert_eq!(GoogleNotification::from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn test_microsoft_body_shape() {
        let batch: MicrosoftNotificationBatch = serde_json::from_str(
            r#"{"value":[{"subscriptionId":"s1","clientState":"x","changeType":"updated","resource":"me/events/1"}]}"#,
        )
        .unwrap();
        assert_eq!(batch.value[0].subscription_id, "s1");
        assert_eq!(batch.value[0].change_type.as_deref(), Some("updated"));
    }

    #[tokio::test]
    async fn test_google_change_enqueues_delta_sync() {
        let h = harness(ProviderKind::Google, "chan-1").await;

        let resolution = h
            .ingress
            .handle_google(&google("chan-1", "exists", Some("shared-secret")))
            .await
            .unwrap();

        assert_eq!(resolution, Resolution::Enqueued);
        assert_eq!(
            h.dispatcher.recorded(),
            vec![Task::DeltaSync {
                account_id: h.account_id.clone(),
                calendar_id: Some(h.calendar_id.clone()),
            }]
        );
    }

    #[tokio::test]
    async fn test_google_handshake_and_bad_token_enqueue_nothing() {
        let h = harness(ProviderKind::Google, "chan-1").await;

        let handshake = h
            .ingress
            .handle_google(&google("chan-1", "sync", Some("shared-secret")))
            .await
            .unwrap();
        let forged = h
            .ingress
            .handle_google(&google("chan-1", "exists", Some("guess")))
            .await
            .unwrap();
        let missing = h
            .ingress
            .handle_google(&google("chan-1", "exists", None))
            .await
            .unwrap();
        let unknown = h
            .ingress
            .handle_google(&google("chan-9", "exists", Some("shared-secret")))
            .await
            .unwrap();

        assert_eq!(handshake, Resolution::Handshake);
        assert_eq!(forged, Resolution::StateMismatch);
        assert_eq!(missing, Resolution::StateMismatch);
        assert_eq!(unknown, Resolution::UnknownChannel);
        assert!(h.dispatcher.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_provider_must_match_subscription() {
        let h = harness(ProviderKind::Microsoft, "sub-remote-1").await;

        let resolution = h
            .ingress
            .handle_google(&google("sub-remote-1", "exists", Some("shared-secret")))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::UnknownChannel);
    }

    #[tokio::test]
    async fn test_microsoft_batch_is_deduplicated() {
        let h = harness(ProviderKind::Microsoft, "sub-remote-1").await;
        let batch: MicrosoftNotificationBatch = serde_json::from_value(serde_json::json!({
            "value": [
                {"subscriptionId": "sub-remote-1", "clientState": "shared-secret", "changeType": "created"},
                {"subscriptionId": "sub-remote-1", "clientState": "shared-secret", "changeType": "updated"},
                {"subscriptionId": "other", "clientState": "shared-secret", "changeType": "updated"}
            ]
        }))
        .unwrap();

        let resolutions = h.ingress.handle_microsoft(&batch).await.unwrap();
        assert_eq!(resolutions, vec![Resolution::Enqueued, Resolution::UnknownChannel]);
        assert_eq!(h.dispatcher.recorded().len(), 1);
    }

    #[tokio::test]
    async fn test_one_failed_notification_does_not_drop_the_batch() {
        let store = Arc::new(test_store().await);
        let dispatcher = Arc::new(FailingOnceDispatcher::default());
        let (account, calendar) = seed_account(&store, "user-1").await;
        for channel in ["sub-a", "sub-b"] {
            store
                .save_push_subscription(&PushSubscription {
                    id: format!("local-{}", channel),
                    account_id: account.id.clone(),
                    calendar_id: calendar.id.clone(),
                    provider: ProviderKind::Microsoft,
                    channel_id: channel.to_string(),
                    resource_id: None,
                    client_state: "shared-secret".to_string(),
                    expires_at: Utc::now() + Duration::days(1),
                })
                .await
                .unwrap();
        }
        let ingress = WebhookIngress::new(store.clone(), dispatcher.clone());
        let batch: MicrosoftNotificationBatch = serde_json::from_value(serde_json::json!({
            "value": [
                {"subscriptionId": "sub-a", "clientState": "shared-secret"},
                {"subscriptionId": "sub-b", "clientState": "shared-secret"}
            ]
        }))
        .unwrap();

        let resolutions = ingress.handle_microsoft(&batch).await.unwrap();

        assert_eq!(resolutions, vec![Resolution::Failed, Resolution::Enqueued]);
        assert_eq!(dispatcher.tasks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_account_needing_reconnect_is_ignored() {
        let h = harness(ProviderKind::Google, "chan-1").await;
        h.store
            .mark_reconnect_required(&h.account_id, "revoked")
            .await
            .unwrap();

        let resolution = h
            .ingress
            .handle_google(&google("chan-1", "exists", Some("shared-secret")))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Inactive);
        assert!(h.dispatcher.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_account_is_ignored() {
        let h = harness(ProviderKind::Google, "chan-1").await;
        // Deactivation drops subscriptions; put one back to simulate a late notification
        h.store.deactivate_account(&h.account_id).await.unwrap();
        h.store
            .save_push_subscription(&PushSubscription {
                id: "sub-late".to_string(),
                account_id: h.account_id.clone(),
                calendar_id: h.calendar_id.clone(),
                provider: ProviderKind::Google,
                channel_id: "chan-1".to_string(),
                resource_id: None,
                client_state: "shared-secret".to_string(),
                expires_at: Utc::now() + Duration::days(1),
            })
            .await
            .unwrap();

        let resolution = h
            .ingress
            .handle_google(&google("chan-1", "exists", Some("shared-secret")))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Inactive);
        assert!(h.dispatcher.recorded().is_empty());
    }
}
