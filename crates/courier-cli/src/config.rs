use anyhow::{Context, Result};
use courier_core::Identity;
use courier_engine::ReaperConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    pub identities: IdentitiesConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitiesConfig {
    pub primary: IdentityConfig,
    #[serde(default)]
    pub secondary: Option<IdentityConfig>,
}

impl IdentitiesConfig {
    /// Token for an identity, if it is configured with a non-empty token
    pub fn token(&self, identity: Identity) -> Option<&str> {
        let config = match identity {
            Identity::Primary => Some(&self.primary),
            Identity::Secondary => self.secondary.as_ref(),
        };
        config
            .map(|c| c.token.trim())
            .filter(|token| !token.is_empty())
    }

    pub fn configured(&self) -> Vec<Identity> {
        Identity::ALL
            .into_iter()
            .filter(|identity| self.token(*identity).is_some())
            .collect()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub token: String,
}

impl std::fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("token", &mask_secret(&self.token))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

fn default_api_base_url() -> String {
    courier_channels::telegram::DEFAULT_API_BASE_URL.to_string()
}

fn default_poll_timeout() -> u64 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "~/.courier/courier.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

fn default_event_buffer() -> usize {
    256
}
fn default_reaper_interval() -> u64 {
    3600
}
fn default_retention() -> u64 {
    2 * 24 * 60 * 60
}
fn default_refresh_interval() -> u64 {
    10
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
            reaper_interval_secs: default_reaper_interval(),
            retention_secs: default_retention(),
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

impl RelayConfig {
    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(self.reaper_interval_secs.max(1)),
            retention: Duration::from_secs(self.retention_secs),
        }
    }

    /// How often the daemon re-reads tasks and the forward mode
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

/// Mask a secret string for safe display in Debug output / logs.
/// Shows first 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".courier")
}

impl CourierConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        // Tokens live here; refuse group/other-readable files
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow::anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `courier init` first.",
                path.display()
            )
        })?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        config.warn_hardcoded_tokens(&content);
        Ok(config)
    }

    /// Parse config text after expanding allowlisted environment variables
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        Ok(toml::from_str(&expanded)?)
    }

    fn warn_hardcoded_tokens(&self, raw: &str) {
        for identity in self.identities.configured() {
            if let Some(token) = self.identities.token(identity)
                && raw.contains(token)
            {
                warn!(
                    "The {} token is hardcoded in the config file. For security, use environment variables: token = \"${{COURIER_{}_TOKEN}}\"",
                    identity,
                    identity.as_str().to_uppercase()
                );
            }
        }
    }

    /// Copy with tokens masked, for display
    pub fn redacted(&self) -> Self {
        let mut redacted = self.clone();
        redacted.identities.primary.token = mask_secret(&self.identities.primary.token);
        if let Some(secondary) = redacted.identities.secondary.as_mut() {
            secondary.token = mask_secret(&secondary.token);
        }
        redacted
    }

    pub fn db_path(&self) -> PathBuf {
        expand_home(&self.store.db_path)
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
/// This prevents an attacker who can modify the config from reading arbitrary env vars.
const ALLOWED_ENV_VARS: &[&str] = &[
    "COURIER_PRIMARY_TOKEN",
    "COURIER_SECONDARY_TOKEN",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    expand_vars(s, |name| std::env::var(name).ok())
}

fn expand_vars(s: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Leave the ${VAR} unexpanded so it's obvious
            pos = abs_start + end + 1;
            continue;
        }

        let value = lookup(&var_name).unwrap_or_default();
        let value_len = value.len();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value_len;
    }
    result
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    Path::new(path).to_path_buf()
}
