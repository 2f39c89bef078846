use std::env;
use std::path::PathBuf;

/// Relay configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 4040)
    pub port: u16,
    /// Directory holding one database per thoughtspace (default: ./data)
    pub data_dir: PathBuf,
    /// How the catch-up stream's upper bound is chosen.
    pub upper_limit_policy: UpperLimitPolicy,
    /// Operations per catch-up stream chunk (default: 1000)
    pub pull_chunk_size: usize,
    /// Snapshot rows per hydration chunk (default: 5000)
    pub hydration_row_batch: usize,
    /// Bound on ancestor walks in the engine and the restore policy.
    pub max_ancestor_walk_depth: usize,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
}

/// Upper bound snapshotted at the start of a catch-up stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpperLimitPolicy {
    /// Bound at the relay's current wall-clock stamp.
    Now,
    /// Bound at the greatest sync timestamp already persisted.
    FrozenAtStart,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "4040".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()));

        let upper_limit_policy =
            match env::var("UPPER_LIMIT_POLICY").as_deref().unwrap_or("now") {
                "now" => UpperLimitPolicy::Now,
                "frozen_at_start" => UpperLimitPolicy::FrozenAtStart,
                other => return Err(ConfigError::InvalidUpperLimitPolicy(other.to_string())),
            };

        let pull_chunk_size = env::var("PULL_CHUNK_SIZE")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .unwrap_or(1000);

        let hydration_row_batch = env::var("HYDRATION_ROW_BATCH")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .unwrap_or(5000);

        let max_ancestor_walk_depth = env::var("MAX_ANCESTOR_WALK_DEPTH")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .unwrap_or(100);

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            host,
            port,
            data_dir,
            upper_limit_policy,
            pull_chunk_size,
            hydration_row_batch,
            max_ancestor_walk_depth,
            cors_origins,
        })
    }

    /// Get the server address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidUpperLimitPolicy(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
            ConfigError::InvalidUpperLimitPolicy(value) => {
                write!(f, "Invalid UPPER_LIMIT_POLICY '{value}' (expected 'now' or 'frozen_at_start')")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
