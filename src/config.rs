//! Configuration loading and defaults for toolstream.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::engine::{DEFAULT_MAX_CONCURRENCY, DEFAULT_TOOL_TIMEOUT, EngineConfig};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const MAX_TOOL_CONCURRENCY: usize = 32;
pub const DEFAULT_MAX_FOLLOW_UP_TURNS: usize = 8;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
const CONFIG_DIR: &str = ".toolstream";

/// Retry settings for the initial model request.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RetryConfig {
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub initial_delay: Option<f64>,
    pub max_delay: Option<f64>,
    pub exponential_base: Option<f64>,
}

/// Resolved retry policy with defaults applied.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay: f64,
    pub max_delay: f64,
    pub exponential_base: f64,
}

impl RetryPolicy {
    /// Compute the backoff delay for a retry attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay * self.exponential_base.powi(exponent);
        let delay = delay.min(self.max_delay);
        // NaN or negative from a bad config collapses to zero.
        let delay = delay.clamp(0.0, 300.0);
        Duration::from_secs_f64(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: 1.0,
            max_delay: 30.0,
            exponential_base: 2.0,
        }
    }
}

/// Resolved configuration, including defaults and environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
    /// Send tools as legacy `functions`.
    pub function_calling: Option<bool>,
    /// Send tools as `tools`.
    pub tool_calling: Option<bool>,
    /// Send message content as text and image parts.
    pub vision: Option<bool>,
    pub connect_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub max_tool_concurrency: Option<usize>,
    pub tool_timeout_ms: Option<u64>,
    pub max_follow_up_turns: Option<usize>,
    pub mcp_config_path: Option<String>,
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(flatten)]
    base: Config,
    profiles: Option<HashMap<String, Config>>,
}

// === Config Loading ===

impl Config {
    /// Load configuration from disk and merge with environment overrides.
    pub fn load(path: Option<PathBuf>, profile: Option<&str>) -> Result<Self> {
        let path = resolve_load_config_path(path);
        let mut config = match path.as_ref() {
            Some(path) if path.exists() => load_config_file(path, profile)?,
            _ => Config::default(),
        };

        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ref key) = self.api_key
            && key.trim().is_empty()
        {
            anyhow::bail!("api_key cannot be empty string");
        }
        if let Some(model) = self.model.as_deref()
            && model.trim().is_empty()
        {
            anyhow::bail!("model cannot be empty string");
        }
        if let Some(temperature) = self.temperature
            && !(0.0..=2.0).contains(&temperature)
        {
            anyhow::bail!("Invalid temperature {temperature}: expected a value between 0 and 2.");
        }
        if self.max_tool_concurrency == Some(0) {
            anyhow::bail!("max_tool_concurrency must be at least 1");
        }
        if self.tool_timeout_ms == Some(0) {
            anyhow::bail!("tool_timeout_ms must be greater than zero");
        }
        if let Some(base) = self.base_url.as_deref()
            && !(base.starts_with("http://") || base.starts_with("https://"))
        {
            anyhow::bail!("Invalid base_url '{base}': expected an http(s) URL.");
        }
        Ok(())
    }

    /// Base URL without a trailing slash or `/v1` suffix.
    #[must_use]
    pub fn base_url(&self) -> String {
        normalize_base_url(self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))
    }

    pub fn api_key(&self) -> Result<String> {
        if let Some(configured) = self.api_key.clone()
            && !configured.trim().is_empty()
        {
            return Ok(configured);
        }
        anyhow::bail!(
            "API key not found. Set TOOLSTREAM_API_KEY or add 'api_key = \"your-key\"' to ~/{CONFIG_DIR}/config.toml"
        )
    }

    #[must_use]
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    #[must_use]
    pub fn function_calling(&self) -> bool {
        self.function_calling.unwrap_or(false)
    }

    #[must_use]
    pub fn tool_calling(&self) -> bool {
        self.tool_calling.unwrap_or(true)
    }

    #[must_use]
    pub fn vision(&self) -> bool {
        self.vision.unwrap_or(false)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS))
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    #[must_use]
    pub fn max_follow_up_turns(&self) -> usize {
        self.max_follow_up_turns.unwrap_or(DEFAULT_MAX_FOLLOW_UP_TURNS)
    }

    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_concurrency: self
                .max_tool_concurrency
                .unwrap_or(DEFAULT_MAX_CONCURRENCY)
                .clamp(1, MAX_TOOL_CONCURRENCY),
            tool_timeout: self
                .tool_timeout_ms
                .map_or(DEFAULT_TOOL_TIMEOUT, Duration::from_millis),
        }
    }

    /// Resolve the MCP server list path.
    #[must_use]
    pub fn mcp_config_path(&self) -> PathBuf {
        self.mcp_config_path
            .as_deref()
            .map(expand_path)
            .or_else(default_mcp_config_path)
            .unwrap_or_else(|| PathBuf::from("mcp.json"))
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        let Some(retry) = self.retry.as_ref() else {
            return defaults;
        };
        RetryPolicy {
            enabled: retry.enabled.unwrap_or(defaults.enabled),
            max_retries: retry.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: retry.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: retry.max_delay.unwrap_or(defaults.max_delay),
            exponential_base: retry.exponential_base.unwrap_or(defaults.exponential_base),
        }
    }
}

fn home_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR).join("config.toml"))
}

fn env_config_path() -> Option<PathBuf> {
    let path = std::env::var("TOOLSTREAM_CONFIG_PATH").ok()?;
    let trimmed = path.trim();
    (!trimmed.is_empty()).then(|| expand_path(trimmed))
}

fn resolve_load_config_path(path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = path {
        return Some(match path.to_str() {
            Some(raw) => expand_path(raw),
            None => path,
        });
    }

    if let Some(path) = env_config_path() {
        if path.exists() {
            return Some(path);
        }
        if let Some(home_path) = home_config_path()
            && home_path.exists()
        {
            return Some(home_path);
        }
        return Some(path);
    }

    home_config_path()
}

fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path);
    PathBuf::from(expanded.as_ref())
}

fn default_mcp_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR).join("mcp.json"))
}

// === Environment Overrides ===

fn apply_env_overrides(config: &mut Config) {
    if let Ok(value) = std::env::var("TOOLSTREAM_API_KEY") {
        config.api_key = Some(value);
    }
    if let Ok(value) = std::env::var("TOOLSTREAM_BASE_URL") {
        config.base_url = Some(value);
    }
    if let Ok(value) = std::env::var("TOOLSTREAM_MODEL") {
        config.model = Some(value);
    }
    if let Ok(value) = std::env::var("TOOLSTREAM_MCP_CONFIG") {
        config.mcp_config_path = Some(value);
    }
    if let Ok(value) = std::env::var("TOOLSTREAM_MAX_TOOL_CONCURRENCY")
        && let Ok(parsed) = value.parse::<usize>()
    {
        config.max_tool_concurrency = Some(parsed.clamp(1, MAX_TOOL_CONCURRENCY));
    }
    if let Ok(value) = std::env::var("TOOLSTREAM_TOOL_TIMEOUT_MS")
        && let Ok(parsed) = value.parse::<u64>()
    {
        config.tool_timeout_ms = Some(parsed);
    }
}

fn normalize_base_url(base: &str) -> String {
    base.trim_end_matches('/')
        .trim_end_matches("/v1")
        .to_string()
}

fn load_config_file(path: &Path, profile: Option<&str>) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let parsed: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    apply_profile(parsed, profile)
}

fn apply_profile(config: ConfigFile, profile: Option<&str>) -> Result<Config> {
    let Some(profile_name) = profile else {
        return Ok(config.base);
    };
    let profiles = config.profiles.as_ref();
    match profiles.and_then(|profiles| profiles.get(profile_name)) {
        Some(override_cfg) => Ok(merge_config(config.base, override_cfg.clone())),
        None => {
            let available = profiles
                .map(|profiles| {
                    let mut keys = profiles.keys().cloned().collect::<Vec<_>>();
                    keys.sort();
                    if keys.is_empty() {
                        "none".to_string()
                    } else {
                        keys.join(", ")
                    }
                })
                .unwrap_or_else(|| "none".to_string());
            anyhow::bail!("Profile '{profile_name}' not found. Available profiles: {available}")
        }
    }
}

fn merge_config(base: Config, override_cfg: Config) -> Config {
    Config {
        api_key: override_cfg.api_key.or(base.api_key),
        base_url: override_cfg.base_url.or(base.base_url),
        model: override_cfg.model.or(base.model),
        temperature: override_cfg.temperature.or(base.temperature),
        system_prompt: override_cfg.system_prompt.or(base.system_prompt),
        function_calling: override_cfg.function_calling.or(base.function_calling),
        tool_calling: override_cfg.tool_calling.or(base.tool_calling),
        vision: override_cfg.vision.or(base.vision),
        connect_timeout_secs: override_cfg.connect_timeout_secs.or(base.connect_timeout_secs),
        request_timeout_secs: override_cfg.request_timeout_secs.or(base.request_timeout_secs),
        max_tool_concurrency: override_cfg.max_tool_concurrency.or(base.max_tool_concurrency),
        tool_timeout_ms: override_cfg.tool_timeout_ms.or(base.tool_timeout_ms),
        max_follow_up_turns: override_cfg.max_follow_up_turns.or(base.max_follow_up_turns),
        mcp_config_path: override_cfg.mcp_config_path.or(base.mcp_config_path),
        retry: override_cfg.retry.or(base.retry),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::lock_test_env;
    use pretty_assertions::assert_eq;
    use std::env;
    use std::ffi::OsString;

    const TOUCHED_VARS: &[&str] = &[
        "HOME",
        "TOOLSTREAM_CONFIG_PATH",
        "TOOLSTREAM_API_KEY",
        "TOOLSTREAM_BASE_URL",
        "TOOLSTREAM_MODEL",
        "TOOLSTREAM_MCP_CONFIG",
        "TOOLSTREAM_MAX_TOOL_CONCURRENCY",
        "TOOLSTREAM_TOOL_TIMEOUT_MS",
    ];

    /// Points HOME at a temp dir and clears overrides; restores on drop.
    struct EnvGuard {
        saved: Vec<(&'static str, Option<OsString>)>,
    }

    impl EnvGuard {
        fn new(home: &Path) -> Self {
            let saved = TOUCHED_VARS
                .iter()
                .map(|name| (*name, env::var_os(name)))
                .collect();
            // Safety: test-only environment mutation guarded by a global mutex.
            unsafe {
                for name in TOUCHED_VARS {
                    env::remove_var(name);
                }
                env::set_var("HOME", home.as_os_str());
            }
            Self { saved }
        }

        fn set(&self, name: &str, value: impl AsRef<std::ffi::OsStr>) {
            // Safety: test-only environment mutation guarded by a global mutex.
            unsafe {
                env::set_var(name, value);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in self.saved.drain(..) {
                // Safety: test-only environment mutation guarded by a global mutex.
                unsafe {
                    match value {
                        Some(value) => env::set_var(name, value),
                        None => env::remove_var(name),
                    }
                }
            }
        }
    }

    fn write_home_config(home: &Path, contents: &str) -> Result<PathBuf> {
        let path = home.join(CONFIG_DIR).join("config.toml");
        fs::create_dir_all(path.parent().context("config path has no parent")?)?;
        fs::write(&path, contents)?;
        Ok(path)
    }

    #[test]
    fn defaults_apply_without_a_config_file() -> Result<()> {
        let _lock = lock_test_env();
        let home = tempfile::tempdir()?;
        let _guard = EnvGuard::new(home.path());

        let config = Config::load(None, None)?;
        assert_eq!(config.model(), DEFAULT_MODEL);
        assert_eq!(config.base_url(), DEFAULT_BASE_URL);
        assert_eq!(config.engine_config(), EngineConfig::default());
        assert!(config.tool_calling());
        assert!(!config.function_calling());
        assert!(config.api_key().is_err());
        Ok(())
    }

    #[test]
    fn loads_home_config_and_profile() -> Result<()> {
        let _lock = lock_test_env();
        let home = tempfile::tempdir()?;
        let _guard = EnvGuard::new(home.path());
        write_home_config(
            home.path(),
            r#"
api_key = "base-key"
model = "gpt-4o"
max_tool_concurrency = 3
tool_timeout_ms = 1500

[profiles.fast]
model = "o3-mini"
tool_timeout_ms = 500
"#,
        )?;

        let config = Config::load(None, Some("fast"))?;
        assert_eq!(config.api_key()?, "base-key");
        assert_eq!(config.model(), "o3-mini");
        assert_eq!(
            config.engine_config(),
            EngineConfig {
                max_concurrency: 3,
                tool_timeout: Duration::from_millis(500),
            }
        );
        Ok(())
    }

    #[test]
    fn env_overrides_win_over_file() -> Result<()> {
        let _lock = lock_test_env();
        let home = tempfile::tempdir()?;
        let guard = EnvGuard::new(home.path());
        write_home_config(home.path(), "api_key = \"file-key\"\nmodel = \"gpt-4o\"\n")?;
        guard.set("TOOLSTREAM_API_KEY", "env-key");
        guard.set("TOOLSTREAM_MAX_TOOL_CONCURRENCY", "500");
        guard.set("TOOLSTREAM_BASE_URL", "http://localhost:8080/v1/");

        let config = Config::load(None, None)?;
        assert_eq!(config.api_key()?, "env-key");
        assert_eq!(config.engine_config().max_concurrency, MAX_TOOL_CONCURRENCY);
        assert_eq!(config.base_url(), "http://localhost:8080");
        Ok(())
    }

    #[test]
    fn config_path_env_supports_tilde() -> Result<()> {
        let _lock = lock_test_env();
        let home = tempfile::tempdir()?;
        let guard = EnvGuard::new(home.path());
        let custom = home.path().join(".custom").join("config.toml");
        fs::create_dir_all(custom.parent().context("no parent")?)?;
        fs::write(&custom, "model = \"custom-model\"\n")?;
        guard.set("TOOLSTREAM_CONFIG_PATH", "~/.custom/config.toml");

        let config = Config::load(None, None)?;
        assert_eq!(config.model(), "custom-model");
        Ok(())
    }

    #[test]
    fn mcp_path_expands_tilde() -> Result<()> {
        let _lock = lock_test_env();
        let home = tempfile::tempdir()?;
        let _guard = EnvGuard::new(home.path());
        let config = Config {
            mcp_config_path: Some("~/servers/mcp.json".to_string()),
            ..Default::default()
        };
        let expected = dirs::home_dir()
            .context("home dir not found")?
            .join("servers")
            .join("mcp.json");
        assert_eq!(
            config.mcp_config_path().components().collect::<Vec<_>>(),
            expected.components().collect::<Vec<_>>()
        );
        Ok(())
    }

    #[test]
    fn nonexistent_profile_lists_available_profiles() {
        let mut profiles = HashMap::new();
        profiles.insert("work".to_string(), Config::default());
        let config = ConfigFile {
            base: Config::default(),
            profiles: Some(profiles),
        };

        let message = apply_profile(config, Some("nonexistent"))
            .unwrap_err()
            .to_string();
        assert!(message.contains("Profile 'nonexistent' not found"));
        assert!(message.contains("work"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let cases = [
            Config {
                api_key: Some("   ".to_string()),
                ..Default::default()
            },
            Config {
                max_tool_concurrency: Some(0),
                ..Default::default()
            },
            Config {
                tool_timeout_ms: Some(0),
                ..Default::default()
            },
            Config {
                temperature: Some(3.5),
                ..Default::default()
            },
            Config {
                base_url: Some("ftp://example.com".to_string()),
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
    }

    #[test]
    fn retry_delay_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_delay: 5.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }
}
