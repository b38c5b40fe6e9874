use crate::manager::AuthManager;
use async_trait::async_trait;
use nlmkit_core::{Profile, Result};
use nlmkit_rpc::CredentialRefresher;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Re-harvests the same profile from the browser when the service rejects
/// its credentials. The account guard still applies.
pub struct BrowserRefresher {
    manager: Arc<AuthManager>,
    timeout: Duration,
}

impl BrowserRefresher {
    pub fn new(manager: Arc<AuthManager>, timeout: Duration) -> Self {
        Self { manager, timeout }
    }
}

#[async_trait]
impl CredentialRefresher for BrowserRefresher {
    async fn refresh(&self, profile: &Profile) -> Result<Profile> {
        info!(profile = %profile.name, "Refreshing rejected credentials");
        self.manager.login(&profile.name, self.timeout, false).await
    }
}
