use std::path::Path;

use relaycall_core::Config;

const DEFAULT_CONFIG_FILE: &str = "relaycall.yaml";

/// Pick the config file: explicit path (or `RELAYCALL_CONFIG_PATH`) > `./relaycall.yaml`
fn config_path(explicit: Option<&str>) -> Option<String> {
    explicit
        .filter(|p| Path::new(p).exists())
        .map(str::to_string)
        .or_else(|| {
            Path::new(DEFAULT_CONFIG_FILE)
                .exists()
                .then(|| DEFAULT_CONFIG_FILE.to_string())
        })
}

/// Load configuration, falling back to environment variables and then defaults
///
/// Runs before logging is initialised, so progress goes to stderr.
pub fn load_config(explicit: Option<&str>) -> Config {
    if let Some(path) = explicit {
        if !Path::new(path).exists() {
            eprintln!("Config file {path} not found");
        }
    }

    match config_path(explicit) {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path).unwrap_or_else(|e| {
                eprintln!("Failed to load {path}: {e}");
                eprintln!("Falling back to environment variables");
                Config::from_env().unwrap_or_default()
            })
        }
        None => Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config from environment: {e}");
            eprintln!("Using default configuration");
            Config::default()
        }),
    }
}
