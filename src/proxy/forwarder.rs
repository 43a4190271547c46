use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use reqwest::header::HeaderMap;
use thiserror::Error;

use crate::models::{Account, AppConfig, Platform};
use crate::proxy::cooldown::{
    is_cloudflare_challenge, ChallengeCooldownRegistry, SidecarSessionRegistry,
};
use crate::proxy::identity::IdentityStore;
use crate::proxy::token::{TokenError, TokenManager};
use crate::proxy::upstream::{
    body_limit::read_body_limited, retry::parse_rate_limit_reset, BodyLimitError, UpstreamClient,
};

pub type UpstreamByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverKind {
    TokenInvalid,
    RateLimited,
    UpstreamUnavailable,
    ChallengeBlocked,
}

// A classified upstream failure the orchestrator may retry on another
// account. Carries the raw upstream evidence for exhaustion reporting.
#[derive(Debug)]
pub struct UpstreamFailoverError {
    pub kind: FailoverKind,
    pub status_code: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    // Provider reset hint for rate limits, in seconds.
    pub reset_after: Option<u64>,
}

impl std::fmt::Display for UpstreamFailoverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "upstream failover {:?} ({}): {}",
            self.kind,
            self.status_code,
            String::from_utf8_lossy(&self.body)
        )
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("{0}")]
    Failover(UpstreamFailoverError),
    // Non-failover 4xx: surfaced to the client, possibly via passthrough rules.
    #[error("upstream client error: {status}")]
    ClientError {
        status: u16,
        headers: HeaderMap,
        body: Vec<u8>,
    },
    #[error("upstream response body too large: limit={limit}")]
    BodyTooLarge { limit: u64 },
    #[error("forward failed: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageTotals {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

pub enum ForwardPayload {
    Json {
        body: Vec<u8>,
        usage: Option<UsageTotals>,
    },
    Stream(UpstreamByteStream),
}

impl std::fmt::Debug for ForwardPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardPayload::Json { body, usage } => f
                .debug_struct("Json")
                .field("body_len", &body.len())
                .field("usage", usage)
                .finish(),
            ForwardPayload::Stream(_) => f.debug_tuple("Stream").field(&"..").finish(),
        }
    }
}

#[derive(Debug)]
pub struct ForwardSuccess {
    pub status: u16,
    pub payload: ForwardPayload,
}

// Builds the outbound request for one account, sends it, and classifies the
// response. Streaming bodies are handed back unread; everything else is
// read under the configured byte cap.
pub struct UpstreamForwarder {
    config: Arc<AppConfig>,
    upstream: Arc<UpstreamClient>,
    identity: Arc<IdentityStore>,
    tokens: Arc<TokenManager>,
    cooldowns: Arc<ChallengeCooldownRegistry>,
    sidecar_sessions: Arc<SidecarSessionRegistry>,
}

impl UpstreamForwarder {
    pub fn new(
        config: Arc<AppConfig>,
        upstream: Arc<UpstreamClient>,
        identity: Arc<IdentityStore>,
        tokens: Arc<TokenManager>,
        cooldowns: Arc<ChallengeCooldownRegistry>,
        sidecar_sessions: Arc<SidecarSessionRegistry>,
    ) -> Self {
        Self {
            config,
            upstream,
            identity,
            tokens,
            cooldowns,
            sidecar_sessions,
        }
    }

    pub async fn forward(
        &self,
        account: &mut Account,
        client_headers: &HeaderMap,
        body: &[u8],
        model: &str,
        stream: bool,
    ) -> Result<ForwardSuccess, ForwardError> {
        let proxy_url = account.proxy_url().to_string();
        let cooldown_seconds = self
            .config
            .sora
            .client
            .cloudflare_challenge_cooldown_seconds;

        // Cooldown precheck short-circuits with a synthesized 429 so the
        // orchestrator rotates to another account without touching the edge.
        if let Err(rejection) = self
            .cooldowns
            .check(account.id, &proxy_url, cooldown_seconds)
        {
            return Err(ForwardError::Failover(UpstreamFailoverError {
                kind: FailoverKind::ChallengeBlocked,
                status_code: rejection.status_code,
                headers: HeaderMap::new(),
                body: rejection.message.into_bytes(),
                reset_after: None,
            }));
        }

        let token = self.tokens.get_access_token(account).await.map_err(|e| {
            // An account that cannot produce a token behaves like an
            // upstream 401: mark it failing and let failover move on.
            let status = match &e {
                TokenError::AccessTokenMissing { .. } | TokenError::RefreshFailed { .. } => 401,
            };
            ForwardError::Failover(UpstreamFailoverError {
                kind: FailoverKind::TokenInvalid,
                status_code: status,
                headers: HeaderMap::new(),
                body: e.to_string().into_bytes(),
                reset_after: None,
            })
        })?;

        let fingerprint = self
            .identity
            .get_or_create_fingerprint(account.id, client_headers);
        let body = self.identity.rewrite_user_id(
            body,
            account.id,
            &account.uuid,
            &fingerprint.client_id,
        );
        let body = inject_instructions(body, self.config.gateway.instructions.as_deref());

        let url = format!(
            "{}/responses",
            self.config.gateway.openai_base_url.trim_end_matches('/')
        );
        let client = self
            .upstream
            .client_for(&proxy_url)
            .map_err(ForwardError::Internal)?;
        let mut request = client
            .post(&url)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", token))
            .body(body)
            .build()
            .map_err(|e| ForwardError::Internal(format!("failed to build request: {}", e)))?;
        self.identity
            .apply_fingerprint(request.headers_mut(), &fingerprint);
        if account.platform == Platform::Claude {
            if let Ok(value) = crate::constants::claude_beta_header(model).parse() {
                request.headers_mut().insert("anthropic-beta", value);
            }
        }
        if account.platform == Platform::Sora {
            let session_key = self.sidecar_sessions.get_or_create(
                account.id,
                &proxy_url,
                self.config.sora.client.sidecar_session_reuse,
                self.config.sora.client.sidecar_session_ttl_seconds,
            );
            if !session_key.is_empty() {
                if let Ok(value) = session_key.parse() {
                    request.headers_mut().insert("x-sidecar-session", value);
                }
            }
        }

        let response = self
            .upstream
            .execute(request, &proxy_url, account.id, account.concurrency)
            .await
            .map_err(|e| {
                ForwardError::Failover(UpstreamFailoverError {
                    kind: FailoverKind::UpstreamUnavailable,
                    status_code: 502,
                    headers: HeaderMap::new(),
                    body: e.into_bytes(),
                    reset_after: None,
                })
            })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        if self.config.gateway.gemini_debug_response_headers {
            tracing::debug!(
                "upstream_response_headers account_id={} status={} headers={:?}",
                account.id,
                status,
                headers
            );
        }

        if response.status().is_success() {
            // First healthy response lifts any cooldown for this key.
            self.cooldowns.clear(account.id, &proxy_url);
            if stream {
                let byte_stream: UpstreamByteStream = Box::pin(futures::StreamExt::map(
                    response.bytes_stream(),
                    |chunk| chunk.map_err(|e| e.to_string()),
                ));
                return Ok(ForwardSuccess {
                    status,
                    payload: ForwardPayload::Stream(byte_stream),
                });
            }
            let limit = self.config.gateway.upstream_response_read_max_bytes;
            let body = read_body_limited(response.bytes_stream(), limit)
                .await
                .map_err(|e| match e {
                    BodyLimitError::TooLarge { limit } => ForwardError::BodyTooLarge { limit },
                    BodyLimitError::Read(msg) => ForwardError::Internal(msg),
                })?;
            let usage = parse_usage(&body);
            return Ok(ForwardSuccess {
                status,
                payload: ForwardPayload::Json { body, usage },
            });
        }

        // Error responses are small; still never read them unbounded.
        let limit = self.config.gateway.upstream_response_read_max_bytes;
        let body = read_body_limited(response.bytes_stream(), limit)
            .await
            .unwrap_or_default();

        if is_cloudflare_challenge(status, &headers, &body) {
            self.cooldowns.record(
                account.id,
                &proxy_url,
                cooldown_seconds,
                status,
                &headers,
                &body,
            );
            return Err(ForwardError::Failover(UpstreamFailoverError {
                kind: FailoverKind::ChallengeBlocked,
                status_code: status,
                headers,
                body,
                reset_after: None,
            }));
        }

        match status {
            401 | 403 => Err(ForwardError::Failover(UpstreamFailoverError {
                kind: FailoverKind::TokenInvalid,
                status_code: status,
                headers,
                body,
                reset_after: None,
            })),
            429 => {
                let reset_after = parse_rate_limit_reset(&headers, &body);
                Err(ForwardError::Failover(UpstreamFailoverError {
                    kind: FailoverKind::RateLimited,
                    status_code: status,
                    headers,
                    body,
                    reset_after,
                }))
            }
            500..=599 => Err(ForwardError::Failover(UpstreamFailoverError {
                kind: FailoverKind::UpstreamUnavailable,
                status_code: status,
                headers,
                body,
                reset_after: None,
            })),
            _ => Err(ForwardError::ClientError {
                status,
                headers,
                body,
            }),
        }
    }
}

// Writes the configured system prompt into `instructions` without ever
// overwriting a non-blank value the client provided.
fn inject_instructions(body: Vec<u8>, instructions: Option<&str>) -> Vec<u8> {
    let instructions = match instructions {
        Some(i) if !i.trim().is_empty() => i,
        _ => return body,
    };
    let mut root: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return body,
    };
    let obj = match root.as_object_mut() {
        Some(o) => o,
        None => return body,
    };
    let existing_blank = obj
        .get("instructions")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().is_empty())
        .unwrap_or(true);
    if !existing_blank {
        return body;
    }
    obj.insert(
        "instructions".to_string(),
        serde_json::Value::String(instructions.to_string()),
    );
    serde_json::to_vec(&root).unwrap_or(body)
}

fn parse_usage(body: &[u8]) -> Option<UsageTotals> {
    let json: serde_json::Value = serde_json::from_slice(body).ok()?;
    let usage = json.get("usage")?;
    Some(UsageTotals {
        input_tokens: usage.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
        output_tokens: usage
            .get("output_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
    })
}
