use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;

static MINUTES_SECONDS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)try again in (\d+)m\s*(\d+)s").unwrap());
static SECONDS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:try again in|backoff for|wait)\s*(\d+)s").unwrap());
static RETRY_AFTER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)retry after (\d+) second").unwrap());

// Provider rate-limit reset hint, in seconds. Checks the Retry-After
// header, then the JSON `error.retry_after` field, then message phrasing.
pub fn parse_rate_limit_reset(headers: &HeaderMap, body: &[u8]) -> Option<u64> {
    if let Some(value) = headers.get("retry-after").and_then(|v| v.to_str().ok()) {
        if let Ok(seconds) = value.trim().parse::<u64>() {
            return Some(seconds);
        }
    }

    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if let Some(retry) = json
                .get("error")
                .and_then(|e| e.get("retry_after"))
                .and_then(|v| v.as_u64())
            {
                return Some(retry);
            }
        }
    }

    if let Some(caps) = MINUTES_SECONDS_REGEX.captures(&text) {
        if let (Ok(m), Ok(s)) = (caps[1].parse::<u64>(), caps[2].parse::<u64>()) {
            return Some(m * 60 + s);
        }
    }
    if let Some(caps) = SECONDS_REGEX.captures(&text) {
        if let Ok(s) = caps[1].parse::<u64>() {
            return Some(s);
        }
    }
    if let Some(caps) = RETRY_AFTER_REGEX.captures(&text) {
        if let Ok(s) = caps[1].parse::<u64>() {
            return Some(s);
        }
    }

    None
}
