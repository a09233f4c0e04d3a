/// Credential retrieval and proactive token refresh
///
/// Adapters ask for a usable access token before every API call. When the
/// stored token expires within the refresh buffer it is exchanged first and
/// the new sealed token written back (last writer wins; concurrent refreshes
/// just leave the newer valid token behind).
use super::{OAuthClient, TokenGrant};
use crate::db::models::{ConnectedAccount, Credential};
use crate::error::{CalError, CalResult};
use crate::metrics;
use crate::store::Store;
use crate::vault::CredentialVault;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Decrypted CalDAV login
#[derive(Clone)]
pub struct BasicCredentials {
    pub server_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone)]
pub struct CredentialManager {
    store: Arc<dyn Store>,
    vault: Arc<CredentialVault>,
    refresh_buffer: Duration,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn Store>, vault: Arc<CredentialVault>, refresh_buffer_minutes: i64) -> Self {
        Self {
            store,
            vault,
            refresh_buffer: Duration::minutes(refresh_buffer_minutes),
        }
    }

    async fn load(&self, account: &ConnectedAccount) -> CalResult<Credential> {
        self.store
            .get_credential(&account.id)
            .await?
            .ok_or_else(|| {
                CalError::ReauthorizationRequired(format!(
                    "no credential stored for account {}",
                    account.id
                ))
            })
    }

    /// Return a valid access token, refreshing it first when it is about to expire.
    pub async fn access_token(
        &self,
        account: &ConnectedAccount,
        oauth: &dyn OAuthClient,
    ) -> CalResult<String> {
        let credential = self.load(account).await?;
        let now = Utc::now();

        let fresh = credential
            .expires_at
            .is_some_and(|expires_at| expires_at > now + self.refresh_buffer);
        if fresh {
            return self.vault.decrypt(&credential.access, &account.user_id);
        }

        if credential
            .refresh_expires_at
            .is_some_and(|refresh_expires_at| refresh_expires_at <= now)
        {
            metrics::record_token_refresh(account.provider.as_str(), "expired");
            return Err(CalError::ReauthorizationRequired(
                "refresh token window has lapsed".to_string(),
            ));
        }

        let sealed_refresh = credential.refresh.as_ref().ok_or_else(|| {
            CalError::ReauthorizationRequired("no refresh token stored".to_string())
        })?;
        let refresh_token = self.vault.decrypt(sealed_refresh, &account.user_id)?;

        let grant = match oauth.refresh(&refresh_token).await {
            Ok(grant) => grant,
            Err(err) => {
                let outcome = if err.requires_reauthorization() { "revoked" } else { "failed" };
                metrics::record_token_refresh(account.provider.as_str(), outcome);
                warn!(account_id = %account.id, provider = %account.provider, "token refresh failed: {}", err);
                return Err(err);
            }
        };

        let updated = self.seal_grant(account, &grant, Some(&credential))?;
        self.store.save_credential(&updated).await?;

        metrics::record_token_refresh(account.provider.as_str(), "refreshed");
        info!(
            account_id = %account.id,
            provider = %account.provider,
            expires_at = %grant.expires_at,
            "access token refreshed"
        );

        Ok(grant.access_token)
    }

    /// Seal a grant into a credential row. A grant without a refresh token keeps the previous one.
    pub fn seal_grant(
        &self,
        account: &ConnectedAccount,
        grant: &TokenGrant,
        previous: Option<&Credential>,
    ) -> CalResult<Credential> {
        let refresh = match &grant.refresh_token {
            Some(token) => Some(self.vault.encrypt(token, &account.user_id)?),
            None => previous.and_then(|p| p.refresh.clone()),
        };

        Ok(Credential {
            account_id: account.id.clone(),
            access: self.vault.encrypt(&grant.access_token, &account.user_id)?,
            refresh,
            token_type: grant.token_type.clone(),
            expires_at: Some(grant.expires_at),
            refresh_expires_at: grant
                .refresh_expires_at
                .or_else(|| previous.and_then(|p| p.refresh_expires_at)),
            updated_at: Utc::now(),
        })
    }

    /// Seal a CalDAV login. The password is the access secret, the server URL the refresh secret.
    pub fn seal_basic(
        &self,
        account: &ConnectedAccount,
        server_url: &str,
        password: &str,
    ) -> CalResult<Credential> {
        Ok(Credential {
            account_id: account.id.clone(),
            access: self.vault.encrypt(password, &account.user_id)?,
            refresh: Some(self.vault.encrypt(server_url, &account.user_id)?),
            token_type: "Basic".to_string(),
            expires_at: None,
            refresh_expires_at: None,
            updated_at: Utc::now(),
        })
    }

    /// Decrypt a CalDAV login; the username is kept on the account.
    pub async fn basic_credentials(&self, account: &ConnectedAccount) -> CalResult<BasicCredentials> {
        let credential = self.load(account).await?;
        let sealed_url = credential.refresh.as_ref().ok_or_else(|| {
            CalError::ReauthorizationRequired("CalDAV server URL missing".to_string())
        })?;

        Ok(BasicCredentials {
            server_url: self.vault.decrypt(sealed_url, &account.user_id)?,
            username: account.email.clone().unwrap_or_default(),
            password: self.vault.decrypt(&credential.access, &account.user_id)?,
        })
    }
}
