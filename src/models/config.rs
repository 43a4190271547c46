use serde::{Deserialize, Serialize};

use crate::proxy::passthrough::PassthroughRule;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub port: u16,
    pub api_key: String,
    pub allow_lan_access: bool,
    // Inbound request body cap; exceeding it yields 413.
    pub request_body_max_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8045,
            api_key: String::new(),
            allow_lan_access: false,
            request_body_max_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    // Failover budget: maximum transparent account switches per request.
    pub max_account_switches: usize,
    // Non-streaming upstream body cap.
    pub upstream_response_read_max_bytes: u64,
    pub gemini_debug_response_headers: bool,
    pub openai_base_url: String,
    // Injected into `instructions` when the client left it blank.
    pub instructions: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_account_switches: 3,
            upstream_response_read_max_bytes: 8 * 1024 * 1024,
            gemini_debug_response_headers: false,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            instructions: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SoraConfig {
    pub client: SoraClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoraClientConfig {
    // Base cooldown after a Cloudflare challenge; 0 disables the registry.
    pub cloudflare_challenge_cooldown_seconds: i64,
    // 0 means sessions live for a year.
    pub sidecar_session_ttl_seconds: i64,
    pub sidecar_session_reuse: bool,
    pub use_openai_token_provider: bool,
    pub debug: bool,
}

impl Default for SoraClientConfig {
    fn default() -> Self {
        Self {
            cloudflare_challenge_cooldown_seconds: 900,
            sidecar_session_ttl_seconds: 0,
            sidecar_session_reuse: true,
            use_openai_token_provider: false,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    // SSE liveness-ping period (seconds) while a streaming caller waits on a slot.
    pub ping_interval: u64,
    // Account-slot wait deadline used to build a WaitPlan.
    pub account_wait_timeout_seconds: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            ping_interval: 15,
            account_wait_timeout_seconds: 30,
        }
    }
}

// One entry of the configured API-key table. Resolves to a Subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(default = "default_user_concurrency")]
    pub concurrency: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
}

fn default_user_concurrency() -> i32 {
    2
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub proxy: ProxyConfig,
    pub gateway: GatewayConfig,
    pub sora: SoraConfig,
    pub concurrency: ConcurrencyConfig,
    pub api_keys: Vec<ApiKeyEntry>,
    pub error_passthrough: Vec<PassthroughRule>,
}
