use serde::{Deserialize, Serialize};

// One configured override for how an upstream error is surfaced to clients.
// Rules are evaluated in order; the first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassthroughRule {
    pub platform: String,
    pub statuses: Vec<u16>,
    // Substring the upstream body must contain, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_contains: Option<String>,
    #[serde(default)]
    pub passthrough_code: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(default)]
    pub passthrough_body: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_message: Option<String>,
    #[serde(default)]
    pub skip_monitoring: bool,
}

#[derive(Default)]
pub struct ErrorPassthrough {
    rules: Vec<PassthroughRule>,
}

impl ErrorPassthrough {
    pub fn new(rules: Vec<PassthroughRule>) -> Self {
        Self { rules }
    }

    pub fn match_rule(&self, platform: &str, status: u16, body: &[u8]) -> Option<&PassthroughRule> {
        let text = String::from_utf8_lossy(body);
        self.rules.iter().find(|rule| {
            rule.platform == platform
                && rule.statuses.contains(&status)
                && rule
                    .body_contains
                    .as_ref()
                    .map(|needle| text.contains(needle.as_str()))
                    .unwrap_or(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(platform: &str, statuses: &[u16], body_contains: Option<&str>) -> PassthroughRule {
        PassthroughRule {
            platform: platform.to_string(),
            statuses: statuses.to_vec(),
            body_contains: body_contains.map(|s| s.to_string()),
            passthrough_code: false,
            response_code: Some(400),
            passthrough_body: false,
            custom_message: Some("custom".to_string()),
            skip_monitoring: false,
        }
    }

    #[test]
    fn matches_on_platform_and_status() {
        let pt = ErrorPassthrough::new(vec![rule("openai", &[403, 418], None)]);
        assert!(pt.match_rule("openai", 418, b"{}").is_some());
        assert!(pt.match_rule("openai", 500, b"{}").is_none());
        assert!(pt.match_rule("claude", 418, b"{}").is_none());
    }

    #[test]
    fn body_substring_gates_the_match() {
        let pt = ErrorPassthrough::new(vec![rule("openai", &[400], Some("unsupported_country"))]);
        assert!(pt
            .match_rule("openai", 400, br#"{"error":{"code":"unsupported_country"}}"#)
            .is_some());
        assert!(pt.match_rule("openai", 400, br#"{"error":{}}"#).is_none());
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut first = rule("openai", &[400], None);
        first.custom_message = Some("first".to_string());
        let mut second = rule("openai", &[400], None);
        second.custom_message = Some("second".to_string());
        let pt = ErrorPassthrough::new(vec![first, second]);
        assert_eq!(
            pt.match_rule("openai", 400, b"").unwrap().custom_message.as_deref(),
            Some("first")
        );
    }
}
