use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Openai,
    Claude,
    Gemini,
    Sora,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Openai => "openai",
            Platform::Claude => "claude",
            Platform::Gemini => "gemini",
            Platform::Sora => "sora",
        }
    }
}

// Outbound proxy descriptor. An account owns at most one; the pair
// (account, normalized proxy url) keys the cooldown and sidecar registries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

// Sora-specific extension, owned by value so the aggregate has one owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SoraAccountExtension {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyEndpoint>,
    // Opaque credential bag: access_token, refresh_token, session_token,
    // expires_at, client_id. Only the token manager mutates it.
    #[serde(default)]
    pub credentials: Map<String, Value>,
    // Declared supported models; empty means the account accepts any model.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_rate_multiplier")]
    pub rate_multiplier: f64,
    #[serde(default = "default_concurrency")]
    pub concurrency: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sora: Option<SoraAccountExtension>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_rate_multiplier() -> f64 {
    1.0
}
fn default_concurrency() -> i32 {
    1
}
fn default_enabled() -> bool {
    true
}

impl Account {
    pub fn proxy_url(&self) -> &str {
        self.proxy.as_ref().map(|p| p.url.as_str()).unwrap_or("")
    }

    // Concurrency cap scaled by the per-account rate multiplier; an account
    // is always allowed at least one slot.
    pub fn effective_concurrency(&self) -> i32 {
        if self.concurrency <= 0 {
            return self.concurrency;
        }
        let scaled = (self.concurrency as f64 * self.rate_multiplier).round() as i32;
        scaled.max(1)
    }

    pub fn supports_model(&self, model: &str) -> bool {
        if self.models.is_empty() {
            // No declared list: a Claude account serves its default
            // catalogue, everything else accepts any model.
            return match self.platform {
                Platform::Claude => crate::constants::DEFAULT_CLAUDE_MODELS.contains(&model),
                _ => true,
            };
        }
        self.models.iter().any(|m| m == "*" || m == model)
    }

    // Trimmed, non-empty credential lookup.
    pub fn credential(&self, key: &str) -> Option<String> {
        let v = self.credentials.get(key)?;
        let s = match v {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    }

    pub fn set_credential(&mut self, key: &str, value: &str) {
        self.credentials
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    // `expires_at` is stored either as RFC 3339 or as unix seconds.
    pub fn credential_as_time(&self, key: &str) -> Option<DateTime<Utc>> {
        let raw = self.credential(key)?;
        if let Ok(ts) = raw.parse::<i64>() {
            return Utc.timestamp_opt(ts, 0).single();
        }
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

// The authenticated caller, resolved by the API-key gate.
#[derive(Debug, Clone)]
pub struct Subject {
    pub user_id: i64,
    pub concurrency: i32,
    pub group_id: Option<i64>,
    pub plan: Option<String>,
}
