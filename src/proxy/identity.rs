use dashmap::DashMap;
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use reqwest::header::HeaderMap;
use sha2::{Digest, Sha256};

use crate::constants;

// Caller user_id shape: user_{64-hex}_account__session_{uuid}
static USER_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^user_[a-f0-9]{64}_account__session_([a-f0-9-]{36})$").unwrap());
// First product/x.y.z occurrence in a User-Agent.
static UA_VERSION_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"/(\d+)\.(\d+)\.(\d+)").unwrap());

// Per-account request identity: the UA / x-stainless-* tuple a specific
// client SDK build would send, plus a stable random client id.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub client_id: String,
    pub user_agent: String,
    pub stainless_lang: String,
    pub stainless_package_version: String,
    pub stainless_os: String,
    pub stainless_arch: String,
    pub stainless_runtime: String,
    pub stainless_runtime_version: String,
}

impl Fingerprint {
    fn default_values() -> Self {
        Self {
            client_id: String::new(),
            user_agent: constants::DEFAULT_USER_AGENT.to_string(),
            stainless_lang: constants::DEFAULT_STAINLESS_LANG.to_string(),
            stainless_package_version: constants::DEFAULT_STAINLESS_PACKAGE_VERSION.to_string(),
            stainless_os: constants::DEFAULT_STAINLESS_OS.to_string(),
            stainless_arch: constants::DEFAULT_STAINLESS_ARCH.to_string(),
            stainless_runtime: constants::DEFAULT_STAINLESS_RUNTIME.to_string(),
            stainless_runtime_version: constants::DEFAULT_STAINLESS_RUNTIME_VERSION.to_string(),
        }
    }
}

// Process-wide fingerprint cache; entries never expire.
#[derive(Default)]
pub struct IdentityStore {
    cache: DashMap<i64, Fingerprint>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Cached fingerprints only move forward: the UA is replaced when the
    // caller presents a strictly newer semver on the same product axis.
    pub fn get_or_create_fingerprint(&self, account_id: i64, headers: &HeaderMap) -> Fingerprint {
        if let Some(mut cached) = self.cache.get_mut(&account_id) {
            if let Some(client_ua) = header_value(headers, "user-agent") {
                if is_newer_version(&client_ua, &cached.user_agent) {
                    cached.user_agent = client_ua.clone();
                    tracing::info!(
                        "Updated fingerprint user-agent for account {}: {}",
                        account_id,
                        client_ua
                    );
                }
            }
            return cached.clone();
        }

        let mut fp = fingerprint_from_headers(headers);
        fp.client_id = generate_client_id();
        tracing::info!(
            "Created new fingerprint for account {} with client_id: {}",
            account_id,
            fp.client_id
        );
        self.cache.insert(account_id, fp.clone());
        fp
    }

    // Overwrite the identity headers on an outbound request.
    pub fn apply_fingerprint(&self, headers: &mut HeaderMap, fp: &Fingerprint) {
        let pairs = [
            ("user-agent", &fp.user_agent),
            ("x-stainless-lang", &fp.stainless_lang),
            ("x-stainless-package-version", &fp.stainless_package_version),
            ("x-stainless-os", &fp.stainless_os),
            ("x-stainless-arch", &fp.stainless_arch),
            ("x-stainless-runtime", &fp.stainless_runtime),
            ("x-stainless-runtime-version", &fp.stainless_runtime_version),
        ];
        for (name, value) in pairs {
            if value.is_empty() {
                continue;
            }
            if let Ok(v) = value.parse() {
                headers.insert(name, v);
            }
        }
    }

    // Rewrites metadata.user_id from the caller's pseudo-identity to this
    // account's. Any parse or shape mismatch returns the body verbatim.
    pub fn rewrite_user_id(
        &self,
        body: &[u8],
        account_id: i64,
        account_uuid: &str,
        client_id: &str,
    ) -> Vec<u8> {
        if body.is_empty() || account_uuid.is_empty() || client_id.is_empty() {
            return body.to_vec();
        }
        let mut root: serde_json::Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(_) => return body.to_vec(),
        };
        let user_id = match root
            .get("metadata")
            .and_then(|m| m.get("user_id"))
            .and_then(|v| v.as_str())
        {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => return body.to_vec(),
        };
        let session_tail = match USER_ID_REGEX
            .captures(&user_id)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
        {
            Some(t) => t,
            None => return body.to_vec(),
        };

        let seed = format!("{}::{}", account_id, session_tail);
        let new_session = uuid_from_seed(&seed);
        let new_user_id = format!(
            "user_{}_account_{}_session_{}",
            client_id, account_uuid, new_session
        );

        if let Some(metadata) = root.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            metadata.insert("user_id".to_string(), serde_json::Value::String(new_user_id));
        }
        serde_json::to_vec(&root).unwrap_or_else(|_| body.to_vec())
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn fingerprint_from_headers(headers: &HeaderMap) -> Fingerprint {
    let defaults = Fingerprint::default_values();
    Fingerprint {
        client_id: String::new(),
        user_agent: header_value(headers, "user-agent").unwrap_or(defaults.user_agent),
        stainless_lang: header_value(headers, "x-stainless-lang").unwrap_or(defaults.stainless_lang),
        stainless_package_version: header_value(headers, "x-stainless-package-version")
            .unwrap_or(defaults.stainless_package_version),
        stainless_os: header_value(headers, "x-stainless-os").unwrap_or(defaults.stainless_os),
        stainless_arch: header_value(headers, "x-stainless-arch").unwrap_or(defaults.stainless_arch),
        stainless_runtime: header_value(headers, "x-stainless-runtime")
            .unwrap_or(defaults.stainless_runtime),
        stainless_runtime_version: header_value(headers, "x-stainless-runtime-version")
            .unwrap_or(defaults.stainless_runtime_version),
    }
}

// 32 random bytes, hex-encoded, from the OS CSPRNG.
fn generate_client_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// Deterministic UUIDv4-format string from a seed: SHA-256, first 16 bytes,
// version and variant nibbles set per RFC 4122.
fn uuid_from_seed(seed: &str) -> String {
    let hash = Sha256::digest(seed.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&bytes[0..4]),
        hex::encode(&bytes[4..6]),
        hex::encode(&bytes[6..8]),
        hex::encode(&bytes[8..10]),
        hex::encode(&bytes[10..16])
    )
}

fn parse_ua_version(ua: &str) -> Option<(u32, u32, u32)> {
    let caps = UA_VERSION_REGEX.captures(ua)?;
    let major = caps.get(1)?.as_str().parse().ok()?;
    let minor = caps.get(2)?.as_str().parse().ok()?;
    let patch = caps.get(3)?.as_str().parse().ok()?;
    Some((major, minor, patch))
}

// Both sides must carry a parsable version; otherwise no upgrade.
fn is_newer_version(new_ua: &str, cached_ua: &str) -> bool {
    match (parse_ua_version(new_ua), parse_ua_version(cached_ua)) {
        (Some(new), Some(cached)) => new > cached,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_ua(ua: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", ua.parse().unwrap());
        headers
    }

    #[test]
    fn creates_fingerprint_from_defaults_when_headers_missing() {
        let store = IdentityStore::new();
        let fp = store.get_or_create_fingerprint(1, &HeaderMap::new());
        assert_eq!(fp.user_agent, constants::DEFAULT_USER_AGENT);
        assert_eq!(fp.stainless_lang, "js");
        assert_eq!(fp.client_id.len(), 64);
        assert!(fp.client_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn caller_headers_win_over_defaults() {
        let store = IdentityStore::new();
        let mut headers = headers_with_ua("claude-cli/2.2.0 (external, cli)");
        headers.insert("x-stainless-os", "MacOS".parse().unwrap());
        let fp = store.get_or_create_fingerprint(1, &headers);
        assert_eq!(fp.user_agent, "claude-cli/2.2.0 (external, cli)");
        assert_eq!(fp.stainless_os, "MacOS");
        assert_eq!(fp.stainless_arch, "x64");
    }

    #[test]
    fn ua_upgrades_are_monotone() {
        let store = IdentityStore::new();
        let fp1 = store.get_or_create_fingerprint(1, &headers_with_ua("claude-cli/2.1.2 (cli)"));

        // Newer patch upgrades.
        let fp2 = store.get_or_create_fingerprint(1, &headers_with_ua("claude-cli/2.1.5 (cli)"));
        assert_eq!(fp2.user_agent, "claude-cli/2.1.5 (cli)");
        assert_eq!(fp2.client_id, fp1.client_id);

        // Older version never downgrades.
        let fp3 = store.get_or_create_fingerprint(1, &headers_with_ua("claude-cli/2.0.9 (cli)"));
        assert_eq!(fp3.user_agent, "claude-cli/2.1.5 (cli)");

        // Unparsable UA never replaces a cached one.
        let fp4 = store.get_or_create_fingerprint(1, &headers_with_ua("curl"));
        assert_eq!(fp4.user_agent, "claude-cli/2.1.5 (cli)");
    }

    #[test]
    fn version_comparison_orders_triples() {
        assert!(is_newer_version("x/2.0.0", "x/1.9.9"));
        assert!(is_newer_version("x/1.10.0", "x/1.9.0"));
        assert!(is_newer_version("x/1.0.1", "x/1.0.0"));
        assert!(!is_newer_version("x/1.0.0", "x/1.0.0"));
        assert!(!is_newer_version("x/1.0.0", "x/1.0.1"));
        assert!(!is_newer_version("no-version", "x/1.0.0"));
    }

    #[test]
    fn apply_overwrites_identity_headers() {
        let store = IdentityStore::new();
        let fp = store.get_or_create_fingerprint(1, &HeaderMap::new());
        let mut out = HeaderMap::new();
        out.insert("user-agent", "old/0.0.1".parse().unwrap());
        out.insert("x-stainless-lang", "python".parse().unwrap());
        store.apply_fingerprint(&mut out, &fp);
        assert_eq!(out.get("user-agent").unwrap(), constants::DEFAULT_USER_AGENT);
        assert_eq!(out.get("x-stainless-lang").unwrap(), "js");
        assert_eq!(out.get("x-stainless-runtime-version").unwrap(), "v24.3.0");
    }

    #[test]
    fn rewrite_replaces_matching_user_id() {
        let store = IdentityStore::new();
        let client_id = "b".repeat(64);
        let body = format!(
            r#"{{"model":"gpt-5.2","metadata":{{"user_id":"user_{}_account__session_11111111-1111-1111-1111-111111111111"}}}}"#,
            "a".repeat(64)
        );
        let out = store.rewrite_user_id(body.as_bytes(), 7, "acct-uuid-7", &client_id);
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let user_id = parsed["metadata"]["user_id"].as_str().unwrap();
        assert!(user_id.starts_with(&format!("user_{}_account_acct-uuid-7_session_", client_id)));

        let session = user_id.rsplit("_session_").next().unwrap();
        // Version nibble 4, variant nibble in {8,9,a,b}.
        assert_eq!(session.len(), 36);
        assert_eq!(&session[14..15], "4");
        assert!(matches!(&session[19..20], "8" | "9" | "a" | "b"));
    }

    #[test]
    fn rewrite_is_deterministic_per_account_and_session() {
        let store = IdentityStore::new();
        let client_id = "b".repeat(64);
        let body = format!(
            r#"{{"metadata":{{"user_id":"user_{}_account__session_11111111-1111-1111-1111-111111111111"}}}}"#,
            "a".repeat(64)
        );
        let one = store.rewrite_user_id(body.as_bytes(), 7, "acct", &client_id);
        let two = store.rewrite_user_id(body.as_bytes(), 7, "acct", &client_id);
        assert_eq!(one, two);

        // A different account produces a different session uuid.
        let other = store.rewrite_user_id(body.as_bytes(), 8, "acct", &client_id);
        assert_ne!(one, other);
    }

    #[test]
    fn rewrite_leaves_mismatched_bodies_verbatim() {
        let store = IdentityStore::new();
        let cid = "b".repeat(64);

        for body in [
            &b""[..],
            b"not json",
            br#"{"metadata":{}}"#,
            br#"{"metadata":{"user_id":42}}"#,
            br#"{"metadata":{"user_id":"user_short_account__session_x"}}"#,
        ] {
            assert_eq!(store.rewrite_user_id(body, 7, "acct", &cid), body.to_vec());
        }

        // Valid shape but empty account uuid: untouched.
        let body = format!(
            r#"{{"metadata":{{"user_id":"user_{}_account__session_11111111-1111-1111-1111-111111111111"}}}}"#,
            "a".repeat(64)
        );
        assert_eq!(
            store.rewrite_user_id(body.as_bytes(), 7, "", &cid),
            body.as_bytes().to_vec()
        );
    }
}
