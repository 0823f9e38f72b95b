use crate::error::AppError;
use crate::models::config_types::AppConfig;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "config.json";

/// Loads `config.json` from the app data directory. A missing file means defaults.
pub fn load_config(app_data_dir: &Path) -> Result<AppConfig, AppError> {
    let path = app_data_dir.join(CONFIG_FILE_NAME);
    if !path.exists() {
        log::info!("No {} found, using default model settings", path.display());
        return Ok(AppConfig::default());
    }

    let content = std::fs::read_to_string(&path).map_err(|e| {
        AppError::from(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    let config: AppConfig = serde_json::from_str(&content).map_err(|e| {
        AppError::from(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;

    log::info!(
        "Loaded config from {} (MobileNet v{} alpha {})",
        path.display(),
        u8::from(config.model.version),
        config.model.alpha
    );

    Ok(config)
}
