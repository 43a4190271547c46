use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;
use url::Url;

// Entry lifetime is bounded by lazy purges inside every write path.
#[derive(Debug, Clone)]
struct ChallengeCooldownEntry {
    until: SystemTime,
    status_code: u16,
    cf_ray: String,
    consecutive_challenges: u32,
    last_challenge_at: SystemTime,
}

#[derive(Debug, Clone)]
struct SidecarSessionEntry {
    session_key: String,
    expires_at: SystemTime,
    last_used_at: SystemTime,
}

// Synthesized rejection for an account still cooling down after a
// Cloudflare challenge.
#[derive(Debug, Clone)]
pub struct CooldownRejection {
    pub status_code: u16,
    pub message: String,
}

const CHALLENGE_STREAK_WINDOW: Duration = Duration::from_secs(30 * 60);
const MAX_STREAK_MULTIPLIER: u32 = 4;
const MAX_COOLDOWN_SECONDS: i64 = 3600;

static CF_RAY_BODY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:cf-ray|ray id)\s*[:=]?\s*([0-9a-f]{8,}(?:-[A-Za-z]+)?)").unwrap());

// Converts a proxy URL to `scheme://host[:port]` lowercased, collapsing
// default ports. Empty input maps to the literal `direct`; inputs the URL
// parser rejects fall back to the lowercased raw string, which keeps the
// function idempotent.
pub fn normalize_proxy_key(proxy_url: &str) -> String {
    let raw = proxy_url.trim();
    if raw.is_empty() {
        return "direct".to_string();
    }
    let parsed = if raw.starts_with("//") {
        Url::parse(&format!("proxy:{}", raw))
    } else {
        Url::parse(raw)
    };
    let parsed = match parsed {
        Ok(p) => p,
        Err(_) => return raw.to_lowercase(),
    };
    let host = match parsed.host_str() {
        Some(h) if !h.is_empty() => h.to_lowercase(),
        _ => return raw.to_lowercase(),
    };
    let scheme = parsed.scheme().to_lowercase();
    // The url crate already reports None for a scheme's default port.
    match parsed.port() {
        Some(port) if !is_default_port(&scheme, port) => format!("{}://{}:{}", scheme, host, port),
        _ => format!("{}://{}", scheme, host),
    }
}

fn is_default_port(scheme: &str, port: u16) -> bool {
    (scheme == "http" && port == 80) || (scheme == "https" && port == 443)
}

pub fn account_proxy_key(account_id: i64, proxy_url: &str) -> String {
    format!("account:{}|proxy:{}", account_id, normalize_proxy_key(proxy_url))
}

pub fn compute_challenge_cooldown_seconds(base_seconds: i64, streak: u32) -> i64 {
    if base_seconds <= 0 {
        return 0;
    }
    let multiplier = streak.clamp(1, MAX_STREAK_MULTIPLIER) as i64;
    (base_seconds * multiplier).min(MAX_COOLDOWN_SECONDS)
}

pub fn extract_cloudflare_ray_id(headers: &HeaderMap, body: &[u8]) -> String {
    if let Some(ray) = headers.get("cf-ray").and_then(|v| v.to_str().ok()) {
        let ray = ray.trim();
        if !ray.is_empty() {
            return ray.to_string();
        }
    }
    let text = String::from_utf8_lossy(body);
    CF_RAY_BODY_REGEX
        .captures(&text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

// Challenge pages come from the edge, not the API: an HTML interstitial or
// a `cf-mitigated: challenge` marker on a 403/503.
pub fn is_cloudflare_challenge(status: u16, headers: &HeaderMap, body: &[u8]) -> bool {
    if status != 403 && status != 503 {
        return false;
    }
    if headers
        .get("cf-mitigated")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("challenge"))
        .unwrap_or(false)
    {
        return true;
    }
    let text = String::from_utf8_lossy(body);
    text.contains("Just a moment")
        || text.contains("challenge-platform")
        || text.contains("cf_chl_")
}

#[derive(Default)]
pub struct ChallengeCooldownRegistry {
    entries: DashMap<String, ChallengeCooldownEntry>,
}

impl ChallengeCooldownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Ok when no active cooldown exists for (account, proxy). An expired
    // entry is dropped on the way through.
    pub fn check(
        &self,
        account_id: i64,
        proxy_url: &str,
        cooldown_seconds: i64,
    ) -> Result<(), CooldownRejection> {
        if account_id <= 0 || cooldown_seconds <= 0 {
            return Ok(());
        }
        let key = account_proxy_key(account_id, proxy_url);
        let now = SystemTime::now();

        let entry = match self.entries.get(&key) {
            Some(e) => e.clone(),
            None => return Ok(()),
        };
        if entry.until <= now {
            self.entries.remove(&key);
            return Ok(());
        }

        let remaining = entry
            .until
            .duration_since(now)
            .map(|d| d.as_secs_f64().ceil() as i64)
            .unwrap_or(1)
            .max(1);
        let mut message = format!(
            "Sora request cooling down due to recent Cloudflare challenge. Retry in {} seconds.",
            remaining
        );
        if entry.consecutive_challenges > 1 {
            message = format!("{} (streak={})", message, entry.consecutive_challenges);
        }
        if !entry.cf_ray.is_empty() {
            message = format!("{} (last cf-ray: {})", message, entry.cf_ray);
        }
        Err(CooldownRejection {
            status_code: 429,
            message,
        })
    }

    pub fn record(
        &self,
        account_id: i64,
        proxy_url: &str,
        cooldown_seconds: i64,
        status_code: u16,
        headers: &HeaderMap,
        body: &[u8],
    ) {
        if account_id <= 0 || cooldown_seconds <= 0 {
            return;
        }
        let key = account_proxy_key(account_id, proxy_url);
        let now = SystemTime::now();
        let mut cf_ray = extract_cloudflare_ray_id(headers, body);

        self.purge_expired(now);

        let existing = self.entries.get(&key).map(|e| e.clone());
        let mut streak = 1u32;
        if let Some(prev) = &existing {
            let within_window = now
                .duration_since(prev.last_challenge_at)
                .map(|d| d <= CHALLENGE_STREAK_WINDOW)
                .unwrap_or(false);
            if within_window {
                streak = prev.consecutive_challenges + 1;
            }
        }
        let effective = compute_challenge_cooldown_seconds(cooldown_seconds, streak);
        let mut until = now + Duration::from_secs(effective as u64);
        if let Some(prev) = &existing {
            // Never shorten an active cooldown.
            if prev.until > until {
                until = prev.until;
                streak = streak.max(prev.consecutive_challenges);
            }
            if cf_ray.is_empty() {
                cf_ray = prev.cf_ray.clone();
            }
        }
        tracing::debug!(
            "cloudflare_challenge_cooldown_set key={} status={} streak={} cf_ray={}",
            key,
            status_code,
            streak,
            cf_ray
        );
        self.entries.insert(
            key,
            ChallengeCooldownEntry {
                until,
                status_code,
                cf_ray,
                consecutive_challenges: streak,
                last_challenge_at: now,
            },
        );
    }

    // Called on the first successful response after a cooldown.
    pub fn clear(&self, account_id: i64, proxy_url: &str) {
        if account_id <= 0 {
            return;
        }
        let key = account_proxy_key(account_id, proxy_url);
        if self.entries.remove(&key).is_some() {
            tracing::debug!("cloudflare_challenge_cooldown_cleared key={}", key);
        }
    }

    pub fn is_active(&self, account_id: i64, proxy_url: &str) -> bool {
        let key = account_proxy_key(account_id, proxy_url);
        match self.entries.get(&key) {
            Some(e) => e.until > SystemTime::now(),
            None => false,
        }
    }

    fn purge_expired(&self, now: SystemTime) {
        self.entries.retain(|_, e| e.until > now);
    }

    #[cfg(test)]
    fn remaining_seconds(&self, account_id: i64, proxy_url: &str) -> i64 {
        let key = account_proxy_key(account_id, proxy_url);
        self.entries
            .get(&key)
            .and_then(|e| e.until.duration_since(SystemTime::now()).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[derive(Default)]
pub struct SidecarSessionRegistry {
    entries: DashMap<String, SidecarSessionEntry>,
}

impl SidecarSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Returns the session key for (account, proxy), minting one on first use.
    // Disabled reuse or an anonymous account yields an empty key.
    pub fn get_or_create(
        &self,
        account_id: i64,
        proxy_url: &str,
        enabled: bool,
        ttl_seconds: i64,
    ) -> String {
        if !enabled || account_id <= 0 {
            return String::new();
        }
        let key = account_proxy_key(account_id, proxy_url);
        let now = SystemTime::now();

        self.entries.retain(|_, e| e.expires_at > now);

        if let Some(mut existing) = self.entries.get_mut(&key) {
            existing.last_used_at = now;
            return existing.session_key.clone();
        }

        let expires_at = if ttl_seconds <= 0 {
            now + Duration::from_secs(365 * 24 * 3600)
        } else {
            now + Duration::from_secs(ttl_seconds as u64)
        };
        let entry = SidecarSessionEntry {
            session_key: format!("sora-{}", uuid::Uuid::new_v4()),
            expires_at,
            last_used_at: now,
        };
        let session_key = entry.session_key.clone();
        tracing::debug!("sidecar_session_created key={} ttl_s={}", key, ttl_seconds);
        self.entries.insert(key, entry);
        session_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_default_ports() {
        assert_eq!(
            normalize_proxy_key("HTTP://Proxy.Example.COM:80/"),
            "http://proxy.example.com"
        );
        assert_eq!(
            normalize_proxy_key("https://proxy.example.com:443"),
            "https://proxy.example.com"
        );
        assert_eq!(
            normalize_proxy_key("http://proxy.example.com:8080"),
            "http://proxy.example.com:8080"
        );
        assert_eq!(
            normalize_proxy_key("socks5://10.0.0.1:1080"),
            "socks5://10.0.0.1:1080"
        );
    }

    #[test]
    fn normalize_handles_empty_and_garbage() {
        assert_eq!(normalize_proxy_key(""), "direct");
        assert_eq!(normalize_proxy_key("   "), "direct");
        assert_eq!(normalize_proxy_key("Not A Url"), "not a url");
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in [
            "",
            "direct",
            "http://Proxy:80",
            "https://p.example.com:443",
            "socks5://h:1080",
            "//bare-host:3128",
            "garbage value",
        ] {
            let once = normalize_proxy_key(input);
            assert_eq!(normalize_proxy_key(&once), once, "input: {:?}", input);
        }
    }

    #[test]
    fn streak_multiplier_is_clamped() {
        assert_eq!(compute_challenge_cooldown_seconds(60, 1), 60);
        assert_eq!(compute_challenge_cooldown_seconds(60, 2), 120);
        assert_eq!(compute_challenge_cooldown_seconds(60, 4), 240);
        assert_eq!(compute_challenge_cooldown_seconds(60, 9), 240);
        assert_eq!(compute_challenge_cooldown_seconds(1800, 4), 3600);
        assert_eq!(compute_challenge_cooldown_seconds(0, 3), 0);
    }

    #[test]
    fn cooldown_escalates_then_resets_after_clear() {
        let registry = ChallengeCooldownRegistry::new();
        let headers = HeaderMap::new();

        registry.record(1, "", 60, 403, &headers, b"");
        let first = registry.remaining_seconds(1, "");
        assert!(first >= 58 && first <= 60);

        registry.record(1, "", 60, 403, &headers, b"");
        assert!(registry.remaining_seconds(1, "") >= 118);

        registry.record(1, "", 60, 403, &headers, b"");
        assert!(registry.remaining_seconds(1, "") >= 178);

        registry.record(1, "", 60, 403, &headers, b"");
        assert!(registry.remaining_seconds(1, "") >= 238);

        // Fifth hit stays at the 4x clamp.
        registry.record(1, "", 60, 403, &headers, b"");
        let clamped = registry.remaining_seconds(1, "");
        assert!(clamped >= 238 && clamped <= 241);

        registry.clear(1, "");
        registry.record(1, "", 60, 403, &headers, b"");
        let reset = registry.remaining_seconds(1, "");
        assert!(reset >= 58 && reset <= 60);
    }

    #[test]
    fn record_never_shortens_an_active_cooldown() {
        let registry = ChallengeCooldownRegistry::new();
        let headers = HeaderMap::new();

        registry.record(1, "", 600, 403, &headers, b"");
        let long = registry.remaining_seconds(1, "");
        // A subsequent record with a smaller base keeps the later deadline.
        registry.record(1, "", 10, 403, &headers, b"");
        assert!(registry.remaining_seconds(1, "") >= long - 1);
    }

    #[test]
    fn check_formats_streak_and_ray_details() {
        let registry = ChallengeCooldownRegistry::new();
        let mut headers = HeaderMap::new();
        headers.insert("cf-ray", "8a1b2c3d4e5f-SJC".parse().unwrap());

        registry.record(1, "http://p:8080", 60, 403, &headers, b"");
        registry.record(1, "http://p:8080", 60, 403, &headers, b"");

        let err = registry
            .check(1, "http://p:8080", 60)
            .expect_err("cooldown active");
        assert_eq!(err.status_code, 429);
        assert!(err.message.contains("Retry in"));
        assert!(err.message.contains("(streak=2)"));
        assert!(err.message.contains("8a1b2c3d4e5f-SJC"));
    }

    #[test]
    fn check_passes_when_disabled_or_absent() {
        let registry = ChallengeCooldownRegistry::new();
        assert!(registry.check(1, "", 0).is_ok());
        assert!(registry.check(1, "", 900).is_ok());
        let headers = HeaderMap::new();
        registry.record(1, "", 900, 403, &headers, b"");
        // A different proxy key is unaffected.
        assert!(registry.check(1, "http://other:3128", 900).is_ok());
        assert!(registry.check(2, "", 900).is_ok());
    }

    #[test]
    fn ray_id_extraction_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-ray", "9f00aa11bb22-LAX".parse().unwrap());
        assert_eq!(
            extract_cloudflare_ray_id(&headers, b"Ray ID: deadbeef01"),
            "9f00aa11bb22-LAX"
        );
        let empty = HeaderMap::new();
        assert_eq!(
            extract_cloudflare_ray_id(&empty, b"<p>Ray ID: deadbeef01</p>"),
            "deadbeef01"
        );
        assert_eq!(extract_cloudflare_ray_id(&empty, b"no ray here"), "");
    }

    #[test]
    fn challenge_detection_requires_edge_status() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-mitigated", "challenge".parse().unwrap());
        assert!(is_cloudflare_challenge(403, &headers, b""));
        assert!(!is_cloudflare_challenge(429, &headers, b""));

        let plain = HeaderMap::new();
        assert!(is_cloudflare_challenge(
            503,
            &plain,
            b"<html><title>Just a moment...</title></html>"
        ));
        assert!(!is_cloudflare_challenge(503, &plain, b"{\"error\":\"x\"}"));
    }

    #[test]
    fn sidecar_sessions_are_reused_until_expiry() {
        let registry = SidecarSessionRegistry::new();
        let first = registry.get_or_create(1, "", true, 3600);
        assert!(first.starts_with("sora-"));
        let second = registry.get_or_create(1, "", true, 3600);
        assert_eq!(first, second);
        // Different proxy gets its own session.
        let other = registry.get_or_create(1, "http://p:3128", true, 3600);
        assert_ne!(first, other);
        assert!(registry.get_or_create(1, "", false, 3600).is_empty());
        assert!(registry.get_or_create(0, "", true, 3600).is_empty());
    }

    #[test]
    fn sidecar_zero_ttl_means_one_year() {
        let registry = SidecarSessionRegistry::new();
        let key = registry.get_or_create(1, "", true, 0);
        assert!(!key.is_empty());
        let entry_key = account_proxy_key(1, "");
        let entry = registry.entries.get(&entry_key).expect("entry");
        let ttl = entry
            .expires_at
            .duration_since(SystemTime::now())
            .expect("future expiry");
        assert!(ttl > Duration::from_secs(360 * 24 * 3600));
    }
}
