use reqwest::header::HeaderMap;
use sha2::{Digest, Sha256};

// Derives the sticky-session hash for a request.
//
// Priority:
// 1. `x-session-id` header (explicitly provided by the client)
// 2. `prompt_cache_key` in the body
// 3. SHA-256 of the first meaningful user input text
//
// Only stable request material is hashed, so every turn of the same
// conversation lands on the same account and keeps prompt caches warm.
pub fn derive_session_hash(headers: &HeaderMap, body: &[u8]) -> String {
    if let Some(sid) = headers.get("x-session-id").and_then(|v| v.to_str().ok()) {
        let sid = sid.trim();
        if !sid.is_empty() {
            return hash_source(sid.as_bytes());
        }
    }

    let json: Option<serde_json::Value> = serde_json::from_slice(body).ok();
    if let Some(json) = &json {
        if let Some(key) = json.get("prompt_cache_key").and_then(|v| v.as_str()) {
            if !key.trim().is_empty() {
                return hash_source(key.trim().as_bytes());
            }
        }
        if let Some(text) = first_user_input_text(json) {
            return hash_source(text.as_bytes());
        }
    }

    hash_source(body)
}

fn hash_source(data: &[u8]) -> String {
    let hash = hex::encode(Sha256::digest(data));
    format!("sid-{}", &hash[..16])
}

// First user-authored text anchor in a Responses-style `input`. Short probe
// messages and system-reminder blocks are skipped.
fn first_user_input_text(json: &serde_json::Value) -> Option<String> {
    let input = json.get("input")?;
    if let Some(text) = input.as_str() {
        let clean = text.trim();
        if !clean.is_empty() {
            return Some(clean.to_string());
        }
        return None;
    }

    for item in input.as_array()? {
        if item.get("role").and_then(|v| v.as_str()) != Some("user") {
            continue;
        }
        let text = match item.get("content") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(" "),
            _ => continue,
        };
        let clean = text.trim();
        if clean.len() > 10 && !clean.contains("<system-reminder>") {
            return Some(clean.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_takes_priority() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", "conv-42".parse().unwrap());
        let a = derive_session_hash(&headers, br#"{"prompt_cache_key":"other"}"#);
        let b = derive_session_hash(&headers, br#"{"input":"different body"}"#);
        assert_eq!(a, b);
        assert!(a.starts_with("sid-"));
        assert_eq!(a.len(), 4 + 16);
    }

    #[test]
    fn prompt_cache_key_before_input_hash() {
        let headers = HeaderMap::new();
        let a = derive_session_hash(&headers, br#"{"prompt_cache_key":"k1","input":"hello"}"#);
        let b = derive_session_hash(&headers, br#"{"prompt_cache_key":"k1","input":"world"}"#);
        assert_eq!(a, b);
    }

    #[test]
    fn same_first_user_message_same_hash() {
        let headers = HeaderMap::new();
        let turn1 = br#"{"input":[{"role":"user","content":"please review this function"}]}"#;
        let turn2 = br#"{"input":[{"role":"user","content":"please review this function"},{"role":"assistant","content":"sure"}]}"#;
        assert_eq!(
            derive_session_hash(&headers, turn1),
            derive_session_hash(&headers, turn2)
        );
    }

    #[test]
    fn content_part_arrays_are_joined() {
        let headers = HeaderMap::new();
        let body = br#"{"input":[{"role":"user","content":[{"type":"input_text","text":"summarize the attached report"}]}]}"#;
        let hash = derive_session_hash(&headers, body);
        assert!(hash.starts_with("sid-"));
    }

    #[test]
    fn short_probes_fall_back_to_body_hash() {
        let headers = HeaderMap::new();
        let a = derive_session_hash(&headers, br#"{"input":[{"role":"user","content":"hi"}]}"#);
        let b = derive_session_hash(&headers, br#"{"input":[{"role":"user","content":"yo"}]}"#);
        assert_ne!(a, b);
    }
}
