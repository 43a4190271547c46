use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, warn};

use crate::constants;
use crate::models::{Account, Platform};
use crate::modules::persistence::AccountStore;
use crate::proxy::upstream::{read_body_limited, UpstreamClient};

const SESSION_EXCHANGE_BODY_LIMIT: u64 = 2 * 1024 * 1024;
const EXPIRY_BUFFER_MINUTES: i64 = 2;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("access_token not found{}", detail(.last))]
    AccessTokenMissing { last: Option<String> },
    #[error("access_token refresh failed{}", detail(.last))]
    RefreshFailed { last: Option<String> },
}

fn detail(last: &Option<String>) -> String {
    match last {
        Some(e) => format!(": {}", e),
        None => String::new(),
    }
}

// External token source consulted before the credential bag, when enabled.
pub trait OpenAiTokenProvider: Send + Sync {
    fn get_access_token<'a>(
        &'a self,
        account: &'a Account,
    ) -> BoxFuture<'a, Result<String, String>>;
}

// Resolves an account's access token, recovering it from the session or
// refresh credential when missing or about to expire. The token manager is
// the only component that mutates an account's credential bag.
pub struct TokenManager {
    upstream: Arc<UpstreamClient>,
    store: Arc<AccountStore>,
    provider: Option<Arc<dyn OpenAiTokenProvider>>,
    use_openai_token_provider: bool,
    session_exchange_url: String,
    oauth_token_url: String,
}

impl TokenManager {
    pub fn new(
        upstream: Arc<UpstreamClient>,
        store: Arc<AccountStore>,
        provider: Option<Arc<dyn OpenAiTokenProvider>>,
        use_openai_token_provider: bool,
    ) -> Self {
        Self {
            upstream,
            store,
            provider,
            use_openai_token_provider,
            session_exchange_url: constants::SORA_SESSION_EXCHANGE_URL.to_string(),
            oauth_token_url: constants::OAUTH_TOKEN_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn new_for_test(
        upstream: Arc<UpstreamClient>,
        store: Arc<AccountStore>,
        session_exchange_url: &str,
        oauth_token_url: &str,
    ) -> Self {
        Self {
            upstream,
            store,
            provider: None,
            use_openai_token_provider: false,
            session_exchange_url: session_exchange_url.to_string(),
            oauth_token_url: oauth_token_url.to_string(),
        }
    }

    pub async fn get_access_token(&self, account: &mut Account) -> Result<String, TokenError> {
        // An external provider, when allowed, is consulted first; its
        // failure is remembered but never fatal on its own.
        let mut provider_err: Option<String> = None;
        if self.allow_token_provider(account) {
            if let Some(provider) = &self.provider {
                match provider.get_access_token(account).await {
                    Ok(token) if !token.trim().is_empty() => {
                        debug!(
                            "token_selected account_id={} source=openai_token_provider",
                            account.id
                        );
                        return Ok(token);
                    }
                    Ok(_) => provider_err = Some("provider returned empty token".to_string()),
                    Err(e) => {
                        debug!("token_provider_failed account_id={} err={}", account.id, e);
                        provider_err = Some(e);
                    }
                }
            }
        }

        if let Some(token) = account.credential("access_token") {
            let expiring = account
                .credential_as_time("expires_at")
                .map(|t| t - Utc::now() <= ChronoDuration::minutes(EXPIRY_BUFFER_MINUTES))
                .unwrap_or(false);
            if expiring {
                match self.recover_access_token(account).await {
                    Ok(refreshed) if !refreshed.trim().is_empty() => return Ok(refreshed),
                    // Recovery failed: hand out the soon-to-expire token.
                    _ => return Ok(token),
                }
            }
            return Ok(token);
        }

        match self.recover_access_token(account).await {
            Ok(recovered) if !recovered.trim().is_empty() => Ok(recovered),
            Ok(_) | Err(_) if provider_err.is_some() => Err(TokenError::AccessTokenMissing {
                last: provider_err,
            }),
            Ok(_) => Err(TokenError::AccessTokenMissing { last: None }),
            Err(e) => Err(e),
        }
    }

    // Recovery order: session-token exchange first, then refresh-token
    // grants over the candidate client ids.
    async fn recover_access_token(&self, account: &mut Account) -> Result<String, TokenError> {
        if let Some(session_token) = account.credential("session_token") {
            match self.exchange_session_token(account, &session_token).await {
                Ok((access_token, expires_at)) if !access_token.trim().is_empty() => {
                    self.apply_recovered_token(
                        account,
                        &access_token,
                        "",
                        &expires_at,
                        &session_token,
                    );
                    return Ok(access_token);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("session_exchange_failed account_id={} err={}", account.id, e);
                }
            }
        }

        let refresh_token = match account.credential("refresh_token") {
            Some(t) => t,
            None => {
                return Err(TokenError::AccessTokenMissing {
                    last: Some("session_token/refresh_token not found".to_string()),
                })
            }
        };

        let mut candidates: Vec<String> = Vec::new();
        for id in [
            account.credential("client_id").unwrap_or_default(),
            constants::SORA_OAUTH_CLIENT_ID.to_string(),
            constants::OPENAI_OAUTH_CLIENT_ID.to_string(),
        ] {
            if !id.is_empty() && !candidates.contains(&id) {
                candidates.push(id);
            }
        }

        let mut last_err: Option<String> = None;
        for client_id in candidates {
            match self.refresh_with_client_id(account, &refresh_token, &client_id).await {
                Ok((new_access, new_refresh, expires_at)) => {
                    if new_access.trim().is_empty() {
                        last_err = Some("refreshed access_token is empty".to_string());
                        continue;
                    }
                    self.apply_recovered_token(account, &new_access, &new_refresh, &expires_at, "");
                    return Ok(new_access);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(TokenError::RefreshFailed { last: last_err })
    }

    async fn exchange_session_token(
        &self,
        account: &Account,
        session_token: &str,
    ) -> Result<(String, String), String> {
        let client = self.upstream.client_for(account.proxy_url())?;
        let response = client
            .get(&self.session_exchange_url)
            .header(
                "Cookie",
                format!("__Secure-next-auth.session-token={}", session_token),
            )
            .header("Accept", "application/json")
            .header("Origin", "https://sora.chatgpt.com")
            .header("Referer", "https://sora.chatgpt.com/")
            .header("User-Agent", constants::SORA_SESSION_EXCHANGE_UA)
            .send()
            .await
            .map_err(|e| format!("session exchange request failed: {}", e))?;

        let status = response.status();
        let body = read_body_limited(response.bytes_stream(), SESSION_EXCHANGE_BODY_LIMIT)
            .await
            .map_err(|e| e.to_string())?;
        if !status.is_success() {
            return Err(format!("session exchange failed: {}", status.as_u16()));
        }

        let json: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| format!("session exchange parse: {}", e))?;
        let access_token = json
            .get("accessToken")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if access_token.is_empty() {
            return Err("session exchange missing accessToken".to_string());
        }
        let expires_at = json
            .get("expires")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        Ok((access_token, expires_at))
    }

    async fn refresh_with_client_id(
        &self,
        account: &Account,
        refresh_token: &str,
        client_id: &str,
    ) -> Result<(String, String, String), String> {
        let client = self.upstream.client_for(account.proxy_url())?;
        let response = client
            .post(&self.oauth_token_url)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": client_id,
            }))
            .send()
            .await
            .map_err(|e| format!("refresh request failed: {}", e))?;

        let status = response.status();
        let body = read_body_limited(response.bytes_stream(), SESSION_EXCHANGE_BODY_LIMIT)
            .await
            .map_err(|e| e.to_string())?;
        if !status.is_success() {
            return Err(format!(
                "refresh failed with client_id {}: {}",
                client_id,
                status.as_u16()
            ));
        }

        let json: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| format!("refresh parse: {}", e))?;
        let access_token = json
            .get("access_token")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let new_refresh = json
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let expires_at = json
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .map(|secs| (Utc::now() + ChronoDuration::seconds(secs)).to_rfc3339())
            .unwrap_or_default();
        Ok((access_token, new_refresh, expires_at))
    }

    // Writes recovered credentials into the in-memory bag, then persists
    // through the account store and the platform extension. Persistence
    // failures are logged, never propagated.
    fn apply_recovered_token(
        &self,
        account: &mut Account,
        access_token: &str,
        refresh_token: &str,
        expires_at: &str,
        session_token: &str,
    ) {
        if !access_token.trim().is_empty() {
            account.set_credential("access_token", access_token);
        }
        if !refresh_token.trim().is_empty() {
            account.set_credential("refresh_token", refresh_token);
        }
        if !expires_at.trim().is_empty() {
            account.set_credential("expires_at", expires_at);
        }
        if !session_token.trim().is_empty() {
            account.set_credential("session_token", session_token);
        }

        if let Err(e) = self.store.update(account) {
            warn!(
                "[W-TOKEN-PERSIST] persist_recovered_token_failed account_id={} err={}",
                account.id, e
            );
        }
        let access = (!access_token.trim().is_empty() && !refresh_token.trim().is_empty())
            .then_some(access_token);
        let refresh = access.is_some().then_some(refresh_token);
        let session = (!session_token.trim().is_empty()).then_some(session_token);
        if access.is_some() || session.is_some() {
            if let Err(e) = self
                .store
                .upsert_sora_extension(account.id, access, refresh, session)
            {
                warn!(
                    "[W-TOKEN-PERSIST] persist_sora_extension_failed account_id={} err={}",
                    account.id, e
                );
            }
        }
    }

    fn allow_token_provider(&self, account: &Account) -> bool {
        if self.provider.is_none() {
            return false;
        }
        if account.platform == Platform::Sora {
            return self.use_openai_token_provider;
        }
        true
    }
}
