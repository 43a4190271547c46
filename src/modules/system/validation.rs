use std::fmt;

use crate::models::AppConfig;

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub field: String,
    pub message: String,
    pub actual_value: Option<String>,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.actual_value {
            Some(val) => write!(f, "  • {}: {} (got: {})", self.field, self.message, val),
            None => write!(f, "  • {}: {}", self.field, self.message),
        }
    }
}

impl ConfigError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            actual_value: None,
        }
    }

    fn with_value(
        field: impl Into<String>,
        message: impl Into<String>,
        value: impl ToString,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            actual_value: Some(value.to_string()),
        }
    }
}

pub fn validate_app_config(config: &AppConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    if config.proxy.port == 0 {
        errors.push(ConfigError::new("proxy.port", "must be greater than 0"));
    }
    if config.proxy.request_body_max_bytes == 0 {
        errors.push(ConfigError::new(
            "proxy.request_body_max_bytes",
            "must be greater than 0",
        ));
    }
    if config.gateway.upstream_response_read_max_bytes == 0 {
        errors.push(ConfigError::new(
            "gateway.upstream_response_read_max_bytes",
            "must be greater than 0",
        ));
    }
    if config.gateway.openai_base_url.trim().is_empty() {
        errors.push(ConfigError::new(
            "gateway.openai_base_url",
            "must not be empty",
        ));
    }
    if config.sora.client.cloudflare_challenge_cooldown_seconds > 3600 {
        errors.push(ConfigError::with_value(
            "sora.client.cloudflare_challenge_cooldown_seconds",
            "base cooldown above the 3600s clamp is never effective",
            config.sora.client.cloudflare_challenge_cooldown_seconds,
        ));
    }
    for (i, entry) in config.api_keys.iter().enumerate() {
        if entry.key.trim().is_empty() {
            errors.push(ConfigError::new(
                format!("api_keys[{}].key", i),
                "must not be empty",
            ));
        }
        if entry.concurrency <= 0 {
            errors.push(ConfigError::with_value(
                format!("api_keys[{}].concurrency", i),
                "must be greater than 0",
                entry.concurrency,
            ));
        }
    }
    for (i, rule) in config.error_passthrough.iter().enumerate() {
        if rule.statuses.is_empty() {
            errors.push(ConfigError::new(
                format!("error_passthrough[{}].statuses", i),
                "must not be empty",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
