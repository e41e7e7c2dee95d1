use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Realtime chat relay server with batched durable persistence", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "CHAT_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "CHAT_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "CHAT_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "CHAT_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "DATABASE_URL", help = "PostgreSQL connection URL. When absent, messages persist to the data file instead.")]
    pub db_url: Option<String>,

    #[clap(long, env = "CHAT_DATA_FILE", help = "Path of the JSON message file used when no database is configured.")]
    pub data_file: Option<PathBuf>,

    #[clap(long, env = "CHAT_ADMIN_TOKEN", help = "Shared secret unlocking the privileged report/delete endpoints.")]
    pub admin_token: Option<String>,

    #[clap(long, env = "CHAT_CACHE_BOUND", help = "Number of recent messages kept in memory.")]
    pub cache_bound: Option<usize>,

    #[clap(long, env = "CHAT_MAX_TEXT_LEN", help = "Maximum message length; longer text is truncated.")]
    pub max_text_len: Option<usize>,

    #[clap(long, env = "CHAT_FLUSH_INTERVAL_SECONDS", help = "Seconds between durable-store flushes.")]
    pub flush_interval_seconds: Option<u64>,

    #[clap(long, env = "CHAT_EDIT_WINDOW_SECONDS", help = "Seconds after acceptance during which the author may edit a message.")]
    pub edit_window_seconds: Option<u64>,

    #[clap(long, env = "CHAT_TYPING_EXPIRY_SECONDS", help = "Seconds of inactivity before a typing indicator clears itself.")]
    pub typing_expiry_seconds: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            db_url: other.db_url.or(self.db_url),
            data_file: other.data_file.or(self.data_file),
            admin_token: other.admin_token.or(self.admin_token),
            cache_bound: other.cache_bound.or(self.cache_bound),
            max_text_len: other.max_text_len.or(self.max_text_len),
            flush_interval_seconds: other.flush_interval_seconds.or(self.flush_interval_seconds),
            edit_window_seconds: other.edit_window_seconds.or(self.edit_window_seconds),
            typing_expiry_seconds: other.typing_expiry_seconds.or(self.typing_expiry_seconds),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(3000)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }

    pub fn data_file(&self) -> PathBuf {
        self.data_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("./messages.json"))
    }

    pub fn cache_bound(&self) -> usize {
        self.cache_bound.unwrap_or(10_000)
    }

    pub fn max_text_len(&self) -> usize {
        self.max_text_len.unwrap_or(lib_common::MAX_TEXT_LEN)
    }

    /// Deliberately just under five minutes, so the flush stays
    /// desynchronized from other round-number periodic jobs.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds.unwrap_or(290))
    }

    pub fn edit_window(&self) -> Duration {
        Duration::from_secs(self.edit_window_seconds.unwrap_or(300))
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_secs(self.typing_expiry_seconds.unwrap_or(3))
    }
}

pub fn load_config() -> Config {
    // 1. Parse CLI/env early to pick up a config file path override.
    let cli_args = Config::parse();

    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_chat.conf"));

    let mut current_config = Config::default();

    // 2. Load from the config file if present.
    if config_file_path.exists() {
        if let Ok(config_str) = fs::read_to_string(&config_file_path) {
            if let Ok(file_config) = serde_json::from_str::<Config>(&config_str) {
                current_config = current_config.merge(file_config);
            } else {
                log::warn!(
                    "Failed to parse config file: {}. Falling back to other sources.",
                    config_file_path.display()
                );
            }
        } else {
            log::warn!(
                "Failed to read config file: {}. Falling back to other sources.",
                config_file_path.display()
            );
        }
    }

    // 3. Environment variables and CLI arguments override the file.
    current_config.merge(cli_args)
}
