use std::env;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_HOST: &str = "http://localhost:11434";
pub const DEFAULT_PORT: u16 = 11434;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub host: String,
    pub timeout: Duration,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup, `OLLAMA_HOST` and `OLLAMA_TIMEOUT` (seconds).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("OLLAMA_HOST")
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let timeout = lookup("OLLAMA_TIMEOUT")
            .and_then(|t| t.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        Self { host, timeout }
    }

    /// Base of every endpoint URL, e.g. `http://localhost:11434/api`.
    pub fn api_base(&self) -> Result<String> {
        let url = parse_host(&self.host)?;
        Ok(format!("{}/api", url.as_str().trim_end_matches('/')))
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Normalizes a host the way `OLLAMA_HOST` is interpreted: a bare host gets
/// `http://` and, without an explicit port, the default Ollama port.
pub fn parse_host(raw: &str) -> Result<Url> {
    let raw = raw.trim().trim_end_matches('/');
    if raw.is_empty() {
        return Err(Error::InvalidInput("empty host".to_string()));
    }

    let has_scheme = raw.contains("://");
    let candidate = if has_scheme {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };

    let mut url = Url::parse(&candidate)
        .map_err(|e| Error::InvalidInput(format!("invalid host '{}': {}", raw, e)))?;

    if !has_scheme && url.port().is_none() && url.set_port(Some(DEFAULT_PORT)).is_err() {
        return Err(Error::InvalidInput(format!("invalid host '{}'", raw)));
    }

    Ok(url)
}
