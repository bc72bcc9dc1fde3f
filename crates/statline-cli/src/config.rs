//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Server used when neither the config file nor the command line names one
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Environment variable holding the verification token
pub const TOKEN_ENV: &str = "STATLINE_VERIFICATION_TOKEN";

/// Configuration for statline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the chat backend
    pub base_url: Option<String>,
    /// Human-verification token sent with every request
    pub verification_token: Option<String>,
    /// Send requests without a verification token
    pub bypass_verification: Option<bool>,
    /// Ignore ambiguous tool completions instead of matching the oldest
    pub strict_tool_matching: Option<bool>,
    /// `tracing` filter used when RUST_LOG is unset
    pub log_filter: Option<String>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("statline")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("STATLINE_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            base_url: Some(DEFAULT_BASE_URL.to_string()),
            bypass_verification: Some(false),
            strict_tool_matching: Some(false),
            log_filter: Some("warn".to_string()),
            ..Default::default()
        };

        default_config.save()?;
        Ok(path)
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    /// Get the verification token, checking config then env
    pub fn verification_token(&self) -> Option<String> {
        if self.verification_token.is_some() {
            return self.verification_token.clone();
        }
        std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty())
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# statline configuration file
# Place at ~/.config/statline/config.toml (Linux/Mac) or %APPDATA%\statline\config.toml (Windows)

# Chat backend
base_url = "http://localhost:8000"

# Human-verification token (optional - STATLINE_VERIFICATION_TOKEN also works)
# verification_token = "..."

# Skip verification entirely (local development backends only)
bypass_verification = false

# When the same tool runs concurrently, ignore completions that cannot be
# matched unambiguously instead of completing the oldest invocation
strict_tool_matching = false

# Log filter used when RUST_LOG is unset
log_filter = "warn"
"#
}
