use crate::lock::profile_lock;
use async_trait::async_trait;
use chrono::Utc;
use nlmkit_browser::{BrowserSessionExtractor, ExtractionResult};
use nlmkit_core::paths::validate_profile_name;
use nlmkit_core::{CookieJar, Error, Profile, Result};
use nlmkit_storage::CredentialStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Somewhere fresh credentials can be harvested from.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn extract(&self, profile_name: &str, timeout: Duration) -> Result<ExtractionResult>;
}

#[async_trait]
impl CredentialSource for BrowserSessionExtractor {
    async fn extract(&self, profile_name: &str, timeout: Duration) -> Result<ExtractionResult> {
        BrowserSessionExtractor::extract(self, profile_name, timeout).await
    }
}

/// Credentials offered to [`AuthManager::save_profile`].
#[derive(Debug, Clone, Default)]
pub struct SaveRequest {
    pub cookies: CookieJar,
    pub csrf_token: Option<String>,
    pub session_id: Option<String>,
    pub account_email: Option<String>,
    pub build_label: Option<String>,
}

impl From<ExtractionResult> for SaveRequest {
    fn from(result: ExtractionResult) -> Self {
        Self {
            cookies: result.cookies,
            csrf_token: result.csrf_token,
            session_id: result.session_id,
            account_email: result.account_email,
            build_label: result.build_label,
        }
    }
}

pub struct AuthManager {
    store: CredentialStore,
    source: Arc<dyn CredentialSource>,
}

impl AuthManager {
    pub fn new(store: CredentialStore, source: Arc<dyn CredentialSource>) -> Self {
        Self { store, source }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Persist credentials for `profile_name`, refusing to silently replace
    /// one account with another unless `force` is set.
    pub async fn save_profile(
        &self,
        profile_name: &str,
        request: SaveRequest,
        force: bool,
    ) -> Result<Profile> {
        validate_profile_name(profile_name)?;
        let lock = profile_lock(self.store.root(), profile_name);
        let _guard = lock.lock().await;

        let existing = match self.store.read(profile_name) {
            Ok(profile) => Some(profile),
            Err(Error::ProfileNotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        let profile = merge_profile(profile_name, existing, request, force)?;
        self.store.write(profile_name, &profile)?;
        info!(
            profile = %profile_name,
            cookies = profile.cookies.len(),
            email = profile.account_email.as_deref().unwrap_or("-"),
            "Profile saved"
        );
        Ok(profile)
    }

    pub fn load_profile(&self, profile_name: &str) -> Result<Profile> {
        self.store.read(profile_name)
    }

    pub fn switch_default(&self, profile_name: &str) -> Result<()> {
        self.store.set_default(profile_name)
    }

    pub fn list_profiles(&self) -> Result<Vec<String>> {
        self.store.list()
    }

    pub fn default_profile(&self) -> Result<Option<String>> {
        self.store.default_profile()
    }

    /// Harvest fresh credentials and save them.
    pub async fn login(&self, profile_name: &str, timeout: Duration, force: bool) -> Result<Profile> {
        validate_profile_name(profile_name)?;
        info!(profile = %profile_name, force, "Starting login");
        let extracted = self.source.extract(profile_name, timeout).await?;
        self.save_profile(profile_name, extracted.into(), force).await
    }

    /// Load the profile, logging in first when it does not exist yet.
    pub async fn ensure_profile(&self, profile_name: &str, timeout: Duration) -> Result<Profile> {
        match self.store.read(profile_name) {
            Ok(profile) => Ok(profile),
            Err(Error::ProfileNotFound { .. }) => {
                debug!(profile = %profile_name, "Profile missing, running login");
                self.login(profile_name, timeout, false).await
            }
            Err(e) => Err(e),
        }
    }
}

fn same_account(stored: &str, incoming: &str) -> bool {
    stored.trim().eq_ignore_ascii_case(incoming.trim())
}

fn merge_profile(
    profile_name: &str,
    existing: Option<Profile>,
    request: SaveRequest,
    force: bool,
) -> Result<Profile> {
    let now = Utc::now();
    let Some(old) = existing else {
        return Ok(Profile {
            name: profile_name.to_string(),
            cookies: request.cookies,
            csrf_token: request.csrf_token,
            session_id: request.session_id,
            account_email: request.account_email,
            build_label: request.build_label,
            last_validated_at: now,
        });
    };

    let identity_changed = match (&old.account_email, &request.account_email) {
        (Some(stored), Some(incoming)) => !same_account(stored, incoming),
        _ => false,
    };

    if identity_changed {
        let stored_email = old.account_email.clone().unwrap_or_default();
        let new_email = request.account_email.clone().unwrap_or_default();
        if !force {
            return Err(Error::AccountMismatch {
                stored_email,
                new_email,
                profile_name: profile_name.to_string(),
            });
        }
        warn!(
            profile = %profile_name,
            stored = %stored_email,
            incoming = %new_email,
            "Replacing profile account"
        );
        return Ok(Profile {
            name: profile_name.to_string(),
            cookies: request.cookies,
            csrf_token: request.csrf_token,
            session_id: request.session_id,
            account_email: request.account_email,
            build_label: request.build_label.or(old.build_label),
            last_validated_at: now,
        });
    }

    let mut cookies = old.cookies;
    cookies.merge(&request.cookies);
    Ok(Profile {
        name: profile_name.to_string(),
        cookies,
        csrf_token: request.csrf_token.or(old.csrf_token),
        session_id: request.session_id.or(old.session_id),
        account_email: request.account_email.or(old.account_email),
        build_label: request.build_label.or(old.build_label),
        last_validated_at: now,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns the same extraction every time and counts calls.
    pub struct FakeSource {
        pub email: Option<String>,
        pub cookie: (String, String),
        pub calls: AtomicUsize,
    }

    impl FakeSource {
        pub fn new(email: Option<&str>, cookie: (&str, &str)) -> Self {
            Self {
                email: email.map(str::to_string),
                cookie: (cookie.0.to_string(), cookie.1.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialSource for FakeSource {
        async fn extract(&self, _profile_name: &str, _timeout: Duration) -> Result<ExtractionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut cookies = CookieJar::new();
            cookies.insert(self.cookie.0.clone(), self.cookie.1.clone());
            Ok(ExtractionResult {
                cookies,
                csrf_token: Some("fresh-csrf".to_string()),
                session_id: Some("fresh-sid".to_string()),
                account_email: self.email.clone(),
                build_label: None,
                reused_existing_instance: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeSource;
    use super::*;
    use nlmkit_core::Paths;
    use tempfile::TempDir;

    fn manager_with(source: Arc<dyn CredentialSource>) -> (TempDir, AuthManager) {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(Paths::with_base(dir.path().to_path_buf()));
        (dir, AuthManager::new(store, source))
    }

    fn request(email: Option<&str>, cookies: &[(&str, &str)]) -> SaveRequest {
        SaveRequest {
            cookies: cookies.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            csrf_token: Some("csrf".to_string()),
            session_id: Some("sid".to_string()),
            account_email: email.map(str::to_string),
            build_label: None,
        }
    }

    #[tokio::test]
    async fn test_first_save_creates_profile() {
        let (_dir, manager) = manager_with(Arc::new(FakeSource::new(None, ("SID", "x"))));
        let saved = manager
            .save_profile("work", request(Some("a@x.com"), &[("SID", "1")]), false)
            .await
            .unwrap();
        assert_eq!(saved.account_email.as_deref(), Some("a@x.com"));
        assert_eq!(manager.load_profile("work").unwrap(), saved);
        assert_eq!(manager.list_profiles().unwrap(), vec!["work"]);
    }

    #[tokio::test]
    async fn test_mismatch_without_force_leaves_store_untouched() {
        let (_dir, manager) = manager_with(Arc::new(FakeSource::new(None, ("SID", "x"))));
        manager
            .save_profile("work", request(Some("a@x.com"), &[("SID", "1")]), false)
            .await
            .unwrap();
        let before = manager.load_profile("work").unwrap();

        let err = manager
            .save_profile("work", request(Some("b@y.com"), &[("SID", "2")]), false)
            .await
            .unwrap_err();
        match err {
            Error::AccountMismatch {
                stored_email,
                new_email,
                profile_name,
            } => {
                assert_eq!(stored_email, "a@x.com");
                assert_eq!(new_email, "b@y.com");
                assert_eq!(profile_name, "work");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.load_profile("work").unwrap(), before);
    }

    #[tokio::test]
    async fn test_force_replaces_identity_and_discards_old_jar() {
        let (_dir, manager) = manager_with(Arc::new(FakeSource::new(None, ("SID", "x"))));
        manager
            .save_profile("work", request(Some("a@x.com"), &[("SID", "1"), ("HSID", "h")]), false)
            .await
            .unwrap();

        let saved = manager
            .save_profile("work", request(Some("b@y.com"), &[("SID", "2")]), true)
            .await
            .unwrap();
        assert_eq!(saved.account_email.as_deref(), Some("b@y.com"));
        assert_eq!(saved.cookies.get("SID"), Some("2"));
        assert!(!saved.cookies.contains("HSID"));
        assert_eq!(manager.load_profile("work").unwrap(), saved);
    }

    #[tokio::test]
    async fn test_force_with_same_account_still_merges() {
        let (_dir, manager) = manager_with(Arc::new(FakeSource::new(None, ("SID", "x"))));
        manager
            .save_profile("work", request(Some("a@x.com"), &[("SID", "1"), ("HSID", "h")]), false)
            .await
            .unwrap();
        let saved = manager
            .save_profile("work", request(Some("A@X.com"), &[("SID", "2")]), true)
            .await
            .unwrap();
        assert_eq!(saved.cookies.get("SID"), Some("2"));
        assert_eq!(saved.cookies.get("HSID"), Some("h"));
    }

    #[tokio::test]
    async fn test_null_emails_preserve_known_identity() {
        let (_dir, manager) = manager_with(Arc::new(FakeSource::new(None, ("SID", "x"))));

        // Stored null, incoming non-null.
        manager
            .save_profile("p1", request(None, &[("SID", "1")]), false)
            .await
            .unwrap();
        let saved = manager
            .save_profile("p1", request(Some("a@x.com"), &[("HSID", "h")]), false)
            .await
            .unwrap();
        assert_eq!(saved.account_email.as_deref(), Some("a@x.com"));
        assert_eq!(saved.cookies.len(), 2);

        // Stored non-null, incoming null.
        let saved = manager
            .save_profile("p1", request(None, &[("SID", "9")]), false)
            .await
            .unwrap();
        assert_eq!(saved.account_email.as_deref(), Some("a@x.com"));
        assert_eq!(saved.cookies.get("SID"), Some("9"));
    }

    #[tokio::test]
    async fn test_merge_keeps_old_tokens_when_new_are_missing() {
        let (_dir, manager) = manager_with(Arc::new(FakeSource::new(None, ("SID", "x"))));
        let mut first = request(Some("a@x.com"), &[("SID", "1")]);
        first.build_label = Some("bl-1".to_string());
        manager.save_profile("work", first, false).await.unwrap();

        let bare = SaveRequest {
            cookies: [("APISID".to_string(), "a".to_string())].into_iter().collect(),
            ..Default::default()
        };
        let saved = manager.save_profile("work", bare, false).await.unwrap();
        assert_eq!(saved.csrf_token.as_deref(), Some("csrf"));
        assert_eq!(saved.session_id.as_deref(), Some("sid"));
        assert_eq!(saved.build_label.as_deref(), Some("bl-1"));
        assert_eq!(saved.cookies.len(), 2);
    }

    #[tokio::test]
    async fn test_work_profile_account_switch_scenario() {
        let (_dir, manager) = manager_with(Arc::new(FakeSource::new(Some("b@y.com"), ("SID", "b"))));
        manager
            .save_profile("work", request(Some("a@x.com"), &[("SID", "a")]), false)
            .await
            .unwrap();

        let err = manager
            .login("work", Duration::from_secs(1), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccountMismatch { .. }));
        assert!(err.hint().unwrap().contains("--force"));
        let stored = manager.load_profile("work").unwrap();
        assert_eq!(stored.account_email.as_deref(), Some("a@x.com"));
        assert_eq!(stored.cookies.get("SID"), Some("a"));

        let forced = manager
            .login("work", Duration::from_secs(1), true)
            .await
            .unwrap();
        assert_eq!(forced.account_email.as_deref(), Some("b@y.com"));
        assert_eq!(forced.cookies.get("SID"), Some("b"));
        assert_eq!(forced.csrf_token.as_deref(), Some("fresh-csrf"));
    }

    #[tokio::test]
    async fn test_ensure_profile_logs_in_only_when_missing() {
        let source = Arc::new(FakeSource::new(Some("a@x.com"), ("SID", "s")));
        let (_dir, manager) = manager_with(source.clone());

        let first = manager
            .ensure_profile("work", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(source.calls(), 1);
        let second = manager
            .ensure_profile("work", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(source.calls(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_switch_default_and_missing_profile() {
        let (_dir, manager) = manager_with(Arc::new(FakeSource::new(None, ("SID", "x"))));
        assert!(matches!(
            manager.load_profile("ghost"),
            Err(Error::ProfileNotFound { .. })
        ));
        assert!(manager.switch_default("ghost").is_err());

        manager
            .save_profile("work", request(None, &[("SID", "1")]), false)
            .await
            .unwrap();
        manager.switch_default("work").unwrap();
        assert_eq!(manager.default_profile().unwrap().as_deref(), Some("work"));
    }

    #[tokio::test]
    async fn test_invalid_profile_name_rejected() {
        let (_dir, manager) = manager_with(Arc::new(FakeSource::new(None, ("SID", "x"))));
        let err = manager
            .save_profile("../escape", request(None, &[("SID", "1")]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_are_serialized() {
        let (_dir, manager) = manager_with(Arc::new(FakeSource::new(None, ("SID", "x"))));
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let name = format!("C{}", i);
                let req = request(Some("a@x.com"), &[(name.as_str(), "v")]);
                manager.save_profile("work", req, false).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = manager.load_profile("work").unwrap();
        for i in 0..8 {
            assert!(stored.cookies.contains(&format!("C{}", i)));
        }
    }
}
