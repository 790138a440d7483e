use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::{env, fs};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub project_name: String,
    pub log_level: String,
    pub log_file: String,
    pub database_path: String,
    pub host: String,
    pub port: u16,
    /// Default validity window for a freshly issued token, in seconds.
    pub token_ttl_seconds: u64,
    /// Radius applied when a session asks for a geofence without one, in meters.
    pub default_geofence_radius_m: f64,
    /// Scans later than this after session start are recorded as Late.
    pub late_after_seconds: i64,
    /// Upper bound on any single store round trip before it is treated as unreachable.
    pub store_timeout_ms: u64,
}

static CONFIG: OnceCell<Config> = OnceCell::new();

impl Config {
    pub fn init(env_path: &str) -> &'static Self {
        dotenvy::from_filename(env_path).ok();

        CONFIG.get_or_init(|| {
            let project_name = env::var("PROJECT_NAME").unwrap_or_else(|_| "attendance-core".into());
            let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "debug".into());
            let log_file = env::var("LOG_FILE").unwrap_or_else(|_| "logs/attendance.log".into());
            let database_path = env::var("DATABASE_PATH").expect("DATABASE_PATH must be set");
            let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".into());
            let port = env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000);

            if let Some(parent) = std::path::Path::new(&log_file).parent() {
                fs::create_dir_all(parent).expect("Failed to create log directory");
            }

            let token_ttl_seconds = env::var("TOKEN_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300);
            let default_geofence_radius_m = env::var("DEFAULT_GEOFENCE_RADIUS_M")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100.0);
            let late_after_seconds = env::var("LATE_AFTER_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600);
            let store_timeout_ms = env::var("STORE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000);

            Config {
                project_name,
                log_level,
                log_file,
                database_path,
                host,
                port,
                token_ttl_seconds,
                default_geofence_radius_m,
                late_after_seconds,
                store_timeout_ms,
            }
        })
    }

    pub fn get() -> &'static Self {
        CONFIG.get().expect("Config not initialized")
    }
}
