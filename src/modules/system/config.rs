use std::fs;
use std::path::PathBuf;

use crate::models::AppConfig;

const DATA_DIR_NAME: &str = ".poolgate";
const CONFIG_FILE: &str = "config.json";

pub fn get_data_dir() -> Result<PathBuf, String> {
    fn ensure_dir(path: &PathBuf) -> Result<(), String> {
        if !path.exists() {
            fs::create_dir_all(path).map_err(|e| format!("failed_to_create_data_dir: {}", e))?;
        }
        Ok(())
    }
    if let Ok(env_path) = std::env::var("DATA_DIR") {
        if !env_path.trim().is_empty() {
            let data_dir = PathBuf::from(env_path);
            ensure_dir(&data_dir)?;
            return Ok(data_dir);
        }
    }
    if cfg!(test) {
        let data_dir = std::env::temp_dir().join(format!(".poolgate-test-{}", std::process::id()));
        ensure_dir(&data_dir)?;
        return Ok(data_dir);
    }

    if let Some(home) = dirs::home_dir() {
        let data_dir = home.join(DATA_DIR_NAME);
        if ensure_dir(&data_dir).is_ok() {
            return Ok(data_dir);
        }
    }

    Err("failed_to_resolve_data_dir".to_string())
}

pub fn load_app_config() -> Result<AppConfig, String> {
    let data_dir = get_data_dir()?;
    let config_path = data_dir.join(CONFIG_FILE);

    if !config_path.exists() {
        let config = AppConfig::default();
        let _ = save_app_config(&config);
        return Ok(config);
    }

    let content = fs::read_to_string(&config_path)
        .map_err(|e| format!("failed_to_read_config_file: {}", e))?;
    serde_json::from_str(&content).map_err(|e| format!("failed_to_parse_config_file: {}", e))
}

pub fn save_app_config(config: &AppConfig) -> Result<(), String> {
    let data_dir = get_data_dir()?;
    let config_path = data_dir.join(CONFIG_FILE);
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("failed_to_serialize_config: {}", e))?;
    fs::write(&config_path, content).map_err(|e| format!("failed_to_write_config_file: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let parsed: AppConfig = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed.proxy.port, config.proxy.port);
        assert_eq!(
            parsed.gateway.max_account_switches,
            config.gateway.max_account_switches
        );
        assert_eq!(
            parsed.sora.client.cloudflare_challenge_cooldown_seconds,
            900
        );
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let parsed: AppConfig =
            serde_json::from_str(r#"{"proxy":{"port":9000},"future_section":{"x":1}}"#)
                .expect("parse with unknown fields");
        assert_eq!(parsed.proxy.port, 9000);
        assert_eq!(parsed.gateway.max_account_switches, 3);
    }
}
