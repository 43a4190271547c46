use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

// Client-visible error body: {"error":{"type","message"}}.
pub fn error_body(err_type: &str, message: &str) -> serde_json::Value {
    json!({
        "error": {
            "type": err_type,
            "message": message,
        }
    })
}

pub fn error_response(status: u16, err_type: &str, message: &str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(error_body(err_type, message))).into_response()
}

// Errors that arrive after stream start become a single SSE frame; the
// already-sent status and headers stay untouched.
pub fn sse_error_frame(err_type: &str, message: &str) -> String {
    format!("event: error\ndata: {}\n\n", error_body(err_type, message))
}

// Default client mapping for an upstream failure that exhausted the switch
// budget.
pub fn map_upstream_error(status_code: u16) -> (u16, &'static str, &'static str) {
    match status_code {
        401 => (
            502,
            "upstream_error",
            "Upstream authentication failed, please contact administrator",
        ),
        403 => (
            502,
            "upstream_error",
            "Upstream access forbidden, please contact administrator",
        ),
        429 => (
            429,
            "rate_limit_error",
            "Upstream rate limit exceeded, please retry later",
        ),
        529 => (
            503,
            "upstream_error",
            "Upstream service overloaded, please retry later",
        ),
        500 | 502 | 503 | 504 => (
            502,
            "upstream_error",
            "Upstream service temporarily unavailable",
        ),
        _ => (502, "upstream_error", "Upstream request failed"),
    }
}

// Pulls a human-readable message out of an upstream error body:
// `error.message`, then top-level `message`, then the (truncated) raw text.
pub fn extract_upstream_error_message(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(msg) = json
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
        {
            if !msg.trim().is_empty() {
                return Some(msg.to_string());
            }
        }
        if let Some(msg) = json.get("message").and_then(|v| v.as_str()) {
            if !msg.trim().is_empty() {
                return Some(msg.to_string());
            }
        }
    }
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(256).collect())
}

pub fn build_body_too_large_message(limit: usize) -> String {
    format!("Request body exceeds the {} byte limit", limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frames_keep_json_intact_under_escaping() {
        let cases = [
            ("server_error", r#"upstream returned "invalid" response"#),
            ("server_error", r"path C:\Users\test\file.txt not found"),
            ("upstream_error", "error parsing \"key\\value\": unexpected token"),
            ("server_error", "line1\nline2\ttab"),
            ("upstream_error", "Upstream service temporarily unavailable"),
        ];
        for (err_type, message) in cases {
            let frame = sse_error_frame(err_type, message);
            assert!(frame.starts_with("event: error\n"), "frame: {}", frame);
            assert!(frame.ends_with("\n\n"));

            let lines: Vec<&str> = frame.trim_end_matches("\n\n").split('\n').collect();
            assert_eq!(lines.len(), 2, "one event line, one data line");
            let data = lines[1].strip_prefix("data: ").expect("data prefix");
            let parsed: serde_json::Value = serde_json::from_str(data).expect("valid JSON");
            assert_eq!(parsed["error"]["type"], err_type);
            assert_eq!(parsed["error"]["message"], message);
        }
    }

    #[test]
    fn upstream_mapping_table() {
        assert_eq!(map_upstream_error(401).0, 502);
        assert_eq!(map_upstream_error(403).0, 502);
        assert_eq!(map_upstream_error(429), (429, "rate_limit_error", "Upstream rate limit exceeded, please retry later"));
        assert_eq!(map_upstream_error(529).0, 503);
        assert_eq!(map_upstream_error(500).0, 502);
        assert_eq!(map_upstream_error(504).0, 502);
        assert_eq!(map_upstream_error(418).2, "Upstream request failed");
    }

    #[test]
    fn message_extraction_prefers_error_message() {
        assert_eq!(
            extract_upstream_error_message(br#"{"error":{"message":"model overloaded"}}"#),
            Some("model overloaded".to_string())
        );
        assert_eq!(
            extract_upstream_error_message(br#"{"message":"bad"}"#),
            Some("bad".to_string())
        );
        assert_eq!(
            extract_upstream_error_message(b"plain text failure"),
            Some("plain text failure".to_string())
        );
        assert_eq!(extract_upstream_error_message(b""), None);
        assert_eq!(extract_upstream_error_message(b"   "), None);
    }
}
