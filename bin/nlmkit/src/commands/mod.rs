pub mod call;
pub mod login;
pub mod profiles;
pub mod studio;

use nlmkit_auth::{AuthManager, BrowserRefresher};
use nlmkit_browser::BrowserSessionExtractor;
use nlmkit_core::{Config, Paths, Profile};
use nlmkit_rpc::RpcTransport;
use nlmkit_storage::CredentialStore;
use std::sync::Arc;
use std::time::Duration;

/// Profile used when none is named and no default is set.
pub const FALLBACK_PROFILE: &str = "default";

/// Everything a command needs, wired from the on-disk config.
pub struct Context {
    pub config: Config,
    pub manager: Arc<AuthManager>,
}

impl Context {
    pub fn load() -> anyhow::Result<Self> {
        let paths = Paths::new();
        paths.ensure_dirs()?;
        let config = Config::load_or_default(&paths)?;
        let extractor =
            BrowserSessionExtractor::new(paths.clone(), config.browser.clone(), &config.service);
        let manager = Arc::new(AuthManager::new(
            CredentialStore::new(paths),
            Arc::new(extractor),
        ));
        Ok(Self { config, manager })
    }

    pub fn login_timeout(&self, override_secs: Option<u64>) -> Duration {
        Duration::from_secs(override_secs.unwrap_or(self.config.browser.login_timeout_secs))
    }

    /// Explicit name, else the stored default, else [`FALLBACK_PROFILE`].
    pub fn profile_name(&self, requested: Option<String>) -> anyhow::Result<String> {
        if let Some(name) = requested {
            return Ok(name);
        }
        Ok(self
            .manager
            .default_profile()?
            .unwrap_or_else(|| FALLBACK_PROFILE.to_string()))
    }

    pub fn load_profile(&self, requested: Option<String>) -> anyhow::Result<Profile> {
        let name = self.profile_name(requested)?;
        Ok(self.manager.load_profile(&name)?)
    }

    /// Transport that re-harvests the browser session once when credentials are refused.
    pub fn transport(&self) -> Arc<RpcTransport> {
        let refresher = BrowserRefresher::new(self.manager.clone(), self.login_timeout(None));
        Arc::new(RpcTransport::new(&self.config).with_refresher(Arc::new(refresher)))
    }
}
