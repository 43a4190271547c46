use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::models::Subject;
use crate::proxy::state::AppState;

// Key comparison must not short-circuit, or response timing would let a
// caller probe a configured key byte by byte.
fn api_keys_match(provided: &str, expected: &str) -> bool {
    if provided.len() != expected.len() {
        // Still sweep the expected key so length mismatches cost the same.
        std::hint::black_box(expected.bytes().fold(0u8, |acc, b| acc | b));
        return false;
    }
    provided
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (p, e)| acc | (p ^ e))
        == 0
}

fn extract_api_key(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s))
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|h| h.to_str().ok())
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// The API-key gate. Resolves the caller to a Subject and attaches it to the
// request; everything behind this layer can assume an authenticated caller.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if path == "/healthz" {
        return next.run(request).await;
    }

    let provided = match extract_api_key(&request) {
        Some(k) => k,
        None => return unauthorized(),
    };

    let matched = state
        .config
        .api_keys
        .iter()
        .find(|entry| api_keys_match(&provided, &entry.key));
    match matched {
        Some(entry) => {
            let subject = Subject {
                user_id: entry.user_id,
                concurrency: entry.concurrency,
                group_id: entry.group_id,
                plan: entry.plan.clone(),
            };
            request.extensions_mut().insert(subject);
            next.run(request).await
        }
        None => unauthorized(),
    }
}

fn unauthorized() -> Response {
    (
        axum::http::StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "type": "authentication_error",
                "message": "Invalid API key"
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_comparison_matches_exact_keys_only() {
        assert!(api_keys_match("sk-key", "sk-key"));
        assert!(!api_keys_match("sk-key", "sk-kez"));
        assert!(!api_keys_match("sk-key", "sk-key-longer"));
        assert!(!api_keys_match("", "x"));
        assert!(api_keys_match("", ""));
    }

    #[test]
    fn api_key_extraction_supports_both_headers() {
        let req = Request::builder()
            .header("authorization", "Bearer sk-abc")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_api_key(&req).as_deref(), Some("sk-abc"));

        let req = Request::builder()
            .header("x-api-key", "sk-xyz")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_api_key(&req).as_deref(), Some("sk-xyz"));

        let req = Request::builder().body(axum::body::Body::empty()).unwrap();
        assert_eq!(extract_api_key(&req), None);
    }
}
