pub mod constants;
pub mod error;
pub mod models;
pub mod modules;
pub mod proxy;
#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use error::{AppError, AppResult};
use modules::system::logger;
use tracing::{error, info, warn};

fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn apply_env_overrides(config: &mut crate::models::AppConfig) {
    if let Ok(key) = std::env::var("API_KEY") {
        if !key.trim().is_empty() {
            info!("Using API key from environment");
            config.proxy.api_key = key;
        }
    }

    if let Ok(port) = std::env::var("PORT") {
        let trimmed = port.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(p) if p > 0 => {
                    config.proxy.port = p;
                    info!("Using proxy port from environment: {}", p);
                }
                _ => warn!("[W-PORT-INVALID] ignoring_invalid_port_value: {}", port),
            }
        }
    }

    if let Ok(allow_lan) = std::env::var("ALLOW_LAN_ACCESS") {
        if let Some(parsed) = parse_env_bool(&allow_lan) {
            config.proxy.allow_lan_access = parsed;
            info!(
                "Using LAN access setting from environment: {}",
                config.proxy.allow_lan_access
            );
        } else {
            warn!(
                "[W-LAN-ACCESS-INVALID] ignoring_invalid_lan_access_value: {}",
                allow_lan
            );
        }
    }
}

// The standalone API key from `proxy.api_key` (or API_KEY) becomes a
// catch-all entry in the key table when no explicit table is configured.
fn ensure_api_key_table(config: &mut crate::models::AppConfig) {
    if config.api_keys.is_empty() && !config.proxy.api_key.trim().is_empty() {
        config.api_keys.push(crate::models::ApiKeyEntry {
            key: config.proxy.api_key.clone(),
            user_id: 1,
            group_id: None,
            concurrency: 4,
            plan: None,
        });
    }
}

async fn start_runtime() -> AppResult<()> {
    let mut config = modules::system::config::load_app_config()
        .map_err(|e| AppError::Config(format!("failed_to_load_config: {}", e)))?;

    apply_env_overrides(&mut config);
    ensure_api_key_table(&mut config);
    modules::system::validation::validate_app_config(&config).map_err(|errors| {
        AppError::Config(format!(
            "configuration_validation_failed:\n{}",
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n")
        ))
    })?;

    let data_dir = modules::system::config::get_data_dir().map_err(AppError::Config)?;
    let state =
        proxy::server::build_state(Arc::new(config), &data_dir).map_err(AppError::Config)?;
    info!(
        "Starting gateway on port {} with {} account(s)",
        state.config.proxy.port,
        state.accounts.accounts_for_group(None).len()
    );
    if state.config.proxy.allow_lan_access {
        warn!("[W-LAN-ACCESS-ENABLED] lan_access_enabled_bind_address_0_0_0_0");
    }

    proxy::server::serve(state).await.map_err(AppError::Unknown)
}

pub fn run() {
    logger::init_logger();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        if let Err(e) = start_runtime().await {
            error!("[E-RUNTIME-STARTUP] {}", e);
            std::process::exit(1);
        }
    });
}
