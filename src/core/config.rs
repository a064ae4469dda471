use std::path::PathBuf;

pub const DEFAULT_API_HOST: &str = "127.0.0.1";
pub const DEFAULT_API_PORT: u16 = 8471;
pub const DEFAULT_MODEL_ID: &str = "gemini-2.5-flash";
pub const DEFAULT_PATIENT_ID: &str = "143";
pub const DEFAULT_TTS_VOICE: &str = "Kore";

/// Process-wide settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_host: String,
    pub api_port: u16,
    pub google_api_key: String,
    pub model_id: String,
    pub database_path: PathBuf,
    pub default_patient_id: String,
    pub validate_queries: bool,
    pub audio_dir: PathBuf,
    pub frontend_origin: String,
    pub tts_voice: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = data_dir();
        Self {
            api_host: env_or("CLINQ_API_HOST", DEFAULT_API_HOST),
            api_port: env_port("CLINQ_API_PORT", DEFAULT_API_PORT),
            google_api_key: std::env::var("GOOGLE_API_KEY").unwrap_or_default(),
            model_id: env_or("CLINQ_MODEL", DEFAULT_MODEL_ID),
            database_path: std::env::var("CLINQ_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("clinq.db")),
            default_patient_id: env_or("DEFAULT_PATIENT_ID", DEFAULT_PATIENT_ID),
            validate_queries: env_bool("CLINQ_VALIDATE_QUERIES", false),
            audio_dir: std::env::var("CLINQ_AUDIO_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("audio")),
            frontend_origin: env_or("CLINQ_FRONTEND_ORIGIN", "http://localhost:3000"),
            tts_voice: env_or("CLINQ_TTS_VOICE", DEFAULT_TTS_VOICE),
        }
    }
}

/// Root data directory.
/// Unix: `~/.clinq`, overridable with `CLINQ_DATA_DIR`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CLINQ_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clinq")
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_port(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => parse_bool(&v, default),
        Err(_) => default,
    }
}

pub(crate) fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}
