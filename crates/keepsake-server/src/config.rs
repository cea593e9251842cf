use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

pub const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub public_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub card_caption: String,
    pub anthropic_api_key: String,
    pub openai_api_key: String,
}

impl ServerConfig {
    /// Reads the full configuration from the environment. Provider
    /// credentials are mandatory; a missing key aborts startup before any
    /// socket is bound.
    pub fn from_env() -> Result<Self> {
        let anthropic_api_key = required_env("ANTHROPIC_API_KEY")?;
        let openai_api_key = required_env("OPENAI_API_KEY")?;
        let port = match non_empty_env("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("PORT is not a valid port number: {raw}"))?,
            None => DEFAULT_PORT,
        };
        Ok(Self {
            port,
            public_dir: non_empty_env("KEEPSAKE_PUBLIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("public")),
            upload_dir: non_empty_env("KEEPSAKE_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("uploads")),
            card_caption: non_empty_env("KEEPSAKE_CARD_CAPTION")
                .unwrap_or_else(|| "Happy Birthday".to_string()),
            anthropic_api_key,
            openai_api_key,
        })
    }
}

fn required_env(key: &str) -> Result<String> {
    match non_empty_env(key) {
        Some(value) => Ok(value),
        None => bail!("{key} is not set; refusing to start"),
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
