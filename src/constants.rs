// Client-identity constants shared by the identity store and the token manager.

// Default fingerprint applied when the caller's request carries no usable
// identity headers. Mirrors the current Claude Code CLI build.
pub const DEFAULT_USER_AGENT: &str = "claude-cli/2.1.2 (external, cli)";
pub const DEFAULT_STAINLESS_LANG: &str = "js";
pub const DEFAULT_STAINLESS_PACKAGE_VERSION: &str = "0.70.0";
pub const DEFAULT_STAINLESS_OS: &str = "Linux";
pub const DEFAULT_STAINLESS_ARCH: &str = "x64";
pub const DEFAULT_STAINLESS_RUNTIME: &str = "node";
pub const DEFAULT_STAINLESS_RUNTIME_VERSION: &str = "v24.3.0";

// OAuth client ids tried (in order, after the account's own credential)
// when recovering an access token from a refresh token.
pub const SORA_OAUTH_CLIENT_ID: &str = "app_CTpS38LRQzBkL2LRVQGKPMAN";
pub const OPENAI_OAUTH_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

// Session-token exchange endpoint and the mobile UA it expects.
pub const SORA_SESSION_EXCHANGE_URL: &str = "https://sora.chatgpt.com/api/auth/session";
pub const SORA_SESSION_EXCHANGE_UA: &str =
    "Sora/1.2026.007 (Android 15; 24122RKC7C; build 2600700)";
pub const OAUTH_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";

// Model ids a Claude account serves when it declares no model list.
pub const DEFAULT_CLAUDE_MODELS: [&str; 3] = [
    "claude-opus-4-5-20251101",
    "claude-sonnet-4-5-20250929",
    "claude-haiku-4-5-20251001",
];

// anthropic-beta values sent with Claude-platform upstream requests:
// claude-code, oauth, interleaved-thinking, and fine-grained tool
// streaming. Haiku models drop the claude-code feature.
pub const DEFAULT_BETA_HEADER: &str =
    "claude-code-20250219,oauth-2025-04-20,interleaved-thinking-2025-05-14,fine-grained-tool-streaming-2025-05-14";
pub const HAIKU_BETA_HEADER: &str = "oauth-2025-04-20,interleaved-thinking-2025-05-14";

pub fn claude_beta_header(model: &str) -> &'static str {
    if model.contains("haiku") {
        HAIKU_BETA_HEADER
    } else {
        DEFAULT_BETA_HEADER
    }
}

pub const SSE_PING_COMMENT: &str = ": ping\n\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haiku_models_get_the_reduced_beta_set() {
        assert_eq!(
            claude_beta_header("claude-haiku-4-5-20251001"),
            HAIKU_BETA_HEADER
        );
        assert_eq!(
            claude_beta_header("claude-sonnet-4-5-20250929"),
            DEFAULT_BETA_HEADER
        );
        assert_eq!(claude_beta_header(""), DEFAULT_BETA_HEADER);
    }
}
