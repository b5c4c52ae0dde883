//! Configuration file loading.

use crate::models::settings::Settings;
use log::{debug, warn};
use std::fs;
use std::path::Path;

/// Upper bound on configuration file size, to keep a mangled path from
/// pulling something huge into memory.
const MAX_CONFIG_SIZE: u64 = 10 * 1024 * 1024;

/// Loads limiter settings from the JSON configuration file.
///
/// The path comes from the `LIMITRATE_CONFIG_PATH` environment variable,
/// defaulting to `./limitrate.json`. The loaded settings are parsed but
/// not yet validated; call [`Settings::validate`] (or run
/// [`crate::config::validation::ConfigValidator`] for the full report)
/// before building the middleware.
///
/// # Errors
///
/// Fails when the file is missing, unreadable, oversized, or not valid
/// JSON for the [`Settings`] schema.
pub fn load_settings() -> Result<Settings, Box<dyn std::error::Error>> {
    let config_path =
        std::env::var("LIMITRATE_CONFIG_PATH").unwrap_or_else(|_| "./limitrate.json".to_string());
    debug!("loading limiter configuration from {}", config_path);

    let path = Path::new(&config_path);
    let metadata = fs::metadata(path)
        .map_err(|e| format!("cannot access config file '{}': {}", config_path, e))?;
    if metadata.len() > MAX_CONFIG_SIZE {
        return Err(format!(
            "config file '{}' is {} bytes, larger than the {} byte limit",
            config_path,
            metadata.len(),
            MAX_CONFIG_SIZE
        )
        .into());
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| format!("cannot read config file '{}': {}", config_path, e))?;
    let settings: Settings = serde_json::from_str(&raw)
        .map_err(|e| format!("config file '{}' is not valid: {}", config_path, e))?;

    if settings.plans.is_empty() {
        warn!("configuration declares no plans; every request resolves to the empty policy");
    }
    debug!(
        "loaded configuration: {} plans, base plan '{}'",
        settings.plans.len(),
        settings.base_plan
    );
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Serializes the tests that mutate LIMITRATE_CONFIG_PATH.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn loads_settings_from_env_path() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "version": 1,
                "plans": {{
                    "free": {{ "defaults": {{ "rate": {{ "maxPerMinute": 10 }} }} }}
                }}
            }}"#
        )
        .unwrap();
        std::env::set_var("LIMITRATE_CONFIG_PATH", file.path());
        let settings = load_settings().unwrap();
        std::env::remove_var("LIMITRATE_CONFIG_PATH");
        assert_eq!(settings.plans.len(), 1);
        assert_eq!(settings.base_plan, "free");
    }

    #[test]
    fn missing_file_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("LIMITRATE_CONFIG_PATH", "/definitely/not/here.json");
        let result = load_settings();
        std::env::remove_var("LIMITRATE_CONFIG_PATH");
        assert!(result.is_err());
    }
}
