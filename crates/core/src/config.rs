use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::paths::Paths;

/// Environment variable that overrides the front-end build label.
pub const BUILD_LABEL_ENV: &str = "NLMKIT_BL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_batchexecute_path")]
    pub batchexecute_path: String,
    /// Fallback `bl` parameter when neither the env var nor the profile carries one.
    #[serde(default = "default_build_label")]
    pub build_label: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// `None` follows HTTPS_PROXY/HTTP_PROXY, `Some("")` forces a direct connection.
    #[serde(default)]
    pub proxy: Option<String>,
    /// A redirect that lands on this host means the session was rejected.
    #[serde(default = "default_signin_host")]
    pub signin_host: String,
}

fn default_signin_host() -> String {
    "accounts.google.com".to_string()
}

fn default_base_url() -> String {
    "https://notebooklm.google.com".to_string()
}

fn default_batchexecute_path() -> String {
    "/_/LabsTailwindUi/data/batchexecute".to_string()
}

fn default_build_label() -> String {
    "boq_labs-tailwind-frontend_20260108.06_p0".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/131.0.0.0 Safari/537.36"
        .to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            batchexecute_path: default_batchexecute_path(),
            build_label: default_build_label(),
            language: default_language(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
            proxy: None,
            signin_host: default_signin_host(),
        }
    }
}

impl ServiceConfig {
    pub fn batchexecute_url(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.batchexecute_path
        )
    }

    /// Host of `base_url`, used to spot sign-in redirects and pick cookies.
    pub fn host(&self) -> &str {
        let without_scheme = match self.base_url.find("://") {
            Some(pos) => &self.base_url[pos + 3..],
            None => &self.base_url,
        };
        without_scheme
            .split('/')
            .next()
            .unwrap_or(without_scheme)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    8000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }
}

impl TransportConfig {
    /// Delay before retry number `attempt` (1-based), doubling and capped.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(16);
        self.retry_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    #[serde(default = "default_login_url")]
    pub login_url: String,
    /// Explicit browser executable; searched on PATH when absent.
    #[serde(default)]
    pub binary: Option<String>,
    /// Externally managed CDP endpoint to attach to instead of launching.
    #[serde(default)]
    pub cdp_url: Option<String>,
    #[serde(default = "default_debug_port_start")]
    pub debug_port_start: u16,
    #[serde(default = "default_debug_port_count")]
    pub debug_port_count: u16,
    #[serde(default)]
    pub headless: bool,
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
    #[serde(default = "default_cookie_domains")]
    pub cookie_domains: Vec<String>,
    #[serde(default = "default_required_cookies")]
    pub required_cookies: Vec<String>,
    #[serde(default = "default_true")]
    pub close_launched_browser: bool,
    #[serde(default = "default_true")]
    pub cleanup_cache: bool,
}

fn default_login_url() -> String {
    "https://notebooklm.google.com/".to_string()
}

fn default_debug_port_start() -> u16 {
    9222
}

fn default_debug_port_count() -> u16 {
    10
}

fn default_login_timeout_secs() -> u64 {
    300
}

fn default_cookie_domains() -> Vec<String> {
    vec![
        "google.com".to_string(),
        "notebooklm.google.com".to_string(),
        "googleusercontent.com".to_string(),
    ]
}

fn default_required_cookies() -> Vec<String> {
    ["SID", "HSID", "SSID", "APISID", "SAPISID"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            binary: None,
            cdp_url: None,
            debug_port_start: default_debug_port_start(),
            debug_port_count: default_debug_port_count(),
            headless: false,
            login_timeout_secs: default_login_timeout_secs(),
            cookie_domains: default_cookie_domains(),
            required_cookies: default_required_cookies(),
            close_launched_browser: true,
            cleanup_cache: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Build label to send, in priority order: env override, profile, config default.
    pub fn resolve_build_label(&self, profile_label: Option<&str>) -> String {
        if let Ok(env_label) = std::env::var(BUILD_LABEL_ENV) {
            let env_label = env_label.trim();
            if !env_label.is_empty() {
                return env_label.to_string();
            }
        }
        match profile_label {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => self.service.build_label.clone(),
        }
    }
}
