use anyhow::{Context, Result};
use keyring::Entry;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:50505";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const KEYRING_SERVICE_PREFIX: &str = "streamchat_api_key";
const KEYRING_USER: &str = "default";

// Represents the client settings resolved from the environment and CLI flags
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub base_url: String,
    /// Use the backend-persisted history endpoints.
    pub history_enabled: bool,
    pub auth_enabled: bool,
    /// `env:VAR_NAME` or `keyring`.
    pub api_key_ref: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            history_enabled: false,
            auth_enabled: false,
            api_key_ref: None,
            connect_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl ClientConfig {
    /// Reads `STREAMCHAT_*` variables; unset ones keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(url) = lookup("STREAMCHAT_BASE_URL").filter(|u| !u.trim().is_empty()) {
            config.base_url = url.trim().to_string();
        }
        if let Some(raw) = lookup("STREAMCHAT_HISTORY_ENABLED") {
            config.history_enabled = parse_flag("STREAMCHAT_HISTORY_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("STREAMCHAT_AUTH_ENABLED") {
            config.auth_enabled = parse_flag("STREAMCHAT_AUTH_ENABLED", &raw)?;
        }
        config.api_key_ref = lookup("STREAMCHAT_API_KEY_REF").filter(|r| !r.is_empty());
        if let Some(raw) = lookup("STREAMCHAT_TIMEOUT_SECS") {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("STREAMCHAT_TIMEOUT_SECS must be a whole number of seconds, got '{}'", raw))?;
            config.connect_timeout = Duration::from_secs(secs);
        }
        log::debug!("Loaded client config: {:?}", config);
        Ok(config)
    }

    /// True when the backend runs on the local loopback address.
    pub fn is_loopback_host(&self) -> bool {
        reqwest::Url::parse(&self.base_url)
            .ok()
            .and_then(|url| url.host_str().map(|host| host == "127.0.0.1"))
            .unwrap_or(false)
    }

    fn keyring_service(&self) -> String {
        let host = reqwest::Url::parse(&self.base_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .unwrap_or_else(|| self.base_url.clone());
        format!("{}-{}", KEYRING_SERVICE_PREFIX, host)
    }
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow::anyhow!("{} must be a boolean, got '{}'", name, other)),
    }
}

// --- API Key Retrieval ---

/// Resolves the bearer token named by `api_key_ref`.
///
/// No reference means the backend is called without credentials.
pub fn get_api_key(config: &ClientConfig) -> Result<Option<String>> {
    match config.api_key_ref.as_deref() {
        None => Ok(None),
        Some(ref_str) if ref_str.starts_with("env:") => {
            let env_var_name = ref_str.trim_start_matches("env:");
            log::debug!("Retrieving API key from environment variable: {}", env_var_name);
            std::env::var(env_var_name)
                .map(Some)
                .context(format!("Failed to get API key from environment variable '{}'", env_var_name))
        }
        Some("keyring") => {
            let service_name = config.keyring_service();
            let entry = Entry::new(&service_name, KEYRING_USER).context("Failed to create keyring entry")?;
            log::debug!("Retrieving API key from keyring for service: {}", service_name);
            entry
                .get_password()
                .map(Some)
                .context(format!("Failed to get API key from keyring for '{}'", service_name))
        }
        Some(other) => Err(anyhow::anyhow!("Unsupported api_key_ref format: {}", other)),
    }
}

/// Stores an API key in the OS keyring for the configured backend.
pub fn set_api_key_in_keyring(config: &ClientConfig, api_key: &str) -> Result<()> {
    let service_name = config.keyring_service();
    let entry = Entry::new(&service_name, KEYRING_USER)
        .context("Failed to create keyring entry for setting password")?;
    log::info!("Setting API key in keyring for service: {}", service_name);
    entry
        .set_password(api_key)
        .context(format!("Failed to set API key in keyring for '{}'", service_name))
}
