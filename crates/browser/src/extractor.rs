//! Harvest a signed-in session from a debuggable browser.

use crate::cdp::CdpClient;
use crate::launcher::{self, BrowserLease};
use crate::tokens::{self, LoginSignal};
use nlmkit_core::paths::validate_profile_name;
use nlmkit_core::{BrowserConfig, CookieJar, Error, Paths, Result, ServiceConfig};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COOKIE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Disposable browser caches, relative to the user-data dir's `Default` profile.
const CACHE_DIRS: &[&str] = &[
    "Cache",
    "Code Cache",
    "Service Worker",
    "GPUCache",
    "DawnWebGPUCache",
    "DawnGraphiteCache",
    "ShaderCache",
    "GrShaderCache",
];

/// Credentials harvested from one browser session.
#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub cookies: CookieJar,
    pub csrf_token: Option<String>,
    pub session_id: Option<String>,
    pub account_email: Option<String>,
    pub build_label: Option<String>,
    /// The browser was already running; informational only.
    pub reused_existing_instance: bool,
}

pub struct BrowserSessionExtractor {
    paths: Paths,
    browser: BrowserConfig,
    service_host: String,
}

impl BrowserSessionExtractor {
    pub fn new(paths: Paths, browser: BrowserConfig, service: &ServiceConfig) -> Self {
        Self {
            paths,
            browser,
            service_host: service.host().to_string(),
        }
    }

    pub async fn extract(&self, profile_name: &str, timeout: Duration) -> Result<ExtractionResult> {
        validate_profile_name(profile_name)?;
        let deadline = Instant::now() + timeout;
        let user_data_dir = self.paths.chrome_profile_dir(profile_name);

        let lease = tokio::time::timeout_at(
            deadline,
            launcher::acquire(&self.browser, &user_data_dir, deadline),
        )
        .await
        .map_err(|_| login_timeout(profile_name, timeout))??;
        let launched = lease.is_launched();
        let outcome = tokio::time::timeout_at(
            deadline,
            self.harvest_from(&lease, profile_name, timeout, deadline),
        )
        .await
        .unwrap_or_else(|_| Err(login_timeout(profile_name, timeout)));
        lease.release().await;

        let mut result = outcome?;
        result.reused_existing_instance = !launched;
        if launched && self.browser.cleanup_cache {
            let freed = cleanup_cache_dirs(&user_data_dir);
            if freed > 0 {
                info!(profile = %profile_name, bytes = freed, "Removed browser cache");
            }
        }
        info!(
            profile = %profile_name,
            cookies = result.cookies.len(),
            reused = result.reused_existing_instance,
            "Session extracted"
        );
        Ok(result)
    }

    async fn harvest_from(
        &self,
        lease: &BrowserLease,
        profile_name: &str,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<ExtractionResult> {
        let page = launcher::find_or_open_page(
            lease.http_base(),
            &self.service_host,
            &self.browser.login_url,
        )
        .await?;
        let cdp = CdpClient::connect(&page.ws_url).await?;
        self.harvest(&cdp, profile_name, timeout, deadline).await
    }

    /// Wait for sign-in on `cdp`'s page, then collect cookies and tokens.
    /// Nothing here outlives `deadline`, including unanswered CDP commands.
    pub async fn harvest(
        &self,
        cdp: &CdpClient,
        profile_name: &str,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<ExtractionResult> {
        tokio::time::timeout_at(deadline, self.harvest_until(cdp, profile_name, timeout, deadline))
            .await
            .unwrap_or_else(|_| {
                warn!(profile = %profile_name, "Extraction deadline reached");
                Err(login_timeout(profile_name, timeout))
            })
    }

    async fn harvest_until(
        &self,
        cdp: &CdpClient,
        profile_name: &str,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<ExtractionResult> {
        let timed_out = || login_timeout(profile_name, timeout);

        let events = cdp.subscribe_event("Network.requestWillBeSent").await;
        cdp.enable_domain("Network").await?;
        cdp.enable_domain("Page").await?;
        // Reload even if the page is already there so the app issues fresh batch calls.
        cdp.navigate(&self.browser.login_url).await?;
        info!(profile = %profile_name, timeout_secs = timeout.as_secs(), "Waiting for sign-in");

        let signal = wait_for_login_signal(events, deadline)
            .await?
            .ok_or_else(timed_out)?;
        info!(profile = %profile_name, "Sign-in detected");

        let cookies = loop {
            let raw = cdp.get_all_cookies().await?;
            let jar = filter_cookies(&raw, &self.browser.cookie_domains);
            let missing = missing_cookies(&jar, &self.browser.required_cookies);
            if missing.is_empty() {
                break jar;
            }
            if Instant::now() + COOKIE_RETRY_INTERVAL > deadline {
                warn!(profile = %profile_name, missing = ?missing, "Required cookies never appeared");
                return Err(timed_out());
            }
            debug!(missing = ?missing, "Waiting for required cookies");
            tokio::time::sleep(COOKIE_RETRY_INTERVAL).await;
        };

        let html = match cdp
            .evaluate_string("document.documentElement.outerHTML")
            .await
        {
            Ok(html) => html.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Could not read page HTML");
                String::new()
            }
        };

        Ok(ExtractionResult {
            cookies,
            csrf_token: signal.csrf_token.or_else(|| tokens::extract_csrf_token(&html)),
            session_id: signal.session_id.or_else(|| tokens::extract_session_id(&html)),
            account_email: tokens::extract_email(&html),
            build_label: signal.build_label.or_else(|| tokens::extract_build_label(&html)),
            reused_existing_instance: false,
        })
    }
}

fn login_timeout(profile_name: &str, timeout: Duration) -> Error {
    Error::AuthenticationTimeout {
        profile_name: profile_name.to_string(),
        timeout_secs: timeout.as_secs(),
    }
}

/// `Ok(None)` on deadline; error if the connection closes first.
async fn wait_for_login_signal(
    mut events: mpsc::Receiver<Value>,
    deadline: Instant,
) -> Result<Option<LoginSignal>> {
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => return Ok(None),
            Ok(None) => {
                return Err(Error::Browser(
                    "Browser connection closed before sign-in completed".to_string(),
                ))
            }
            Ok(Some(params)) => {
                if let Some(signal) = LoginSignal::from_event(&params) {
                    return Ok(Some(signal));
                }
            }
        }
    }
}

fn domain_matches(cookie_domain: &str, wanted: &[String]) -> bool {
    let domain = cookie_domain.trim_start_matches('.');
    wanted.iter().any(|w| {
        let w = w.trim_start_matches('.');
        domain == w || domain.ends_with(&format!(".{}", w))
    })
}

/// Keep cookies from the wanted domains. On name clashes the `google.com` one wins.
pub fn filter_cookies(raw: &[Value], domains: &[String]) -> CookieJar {
    let mut jar = CookieJar::new();
    for cookie in raw {
        let (Some(name), Some(value)) = (
            cookie.get("name").and_then(|v| v.as_str()),
            cookie.get("value").and_then(|v| v.as_str()),
        ) else {
            continue;
        };
        let domain = cookie.get("domain").and_then(|v| v.as_str()).unwrap_or("");
        if !domain_matches(domain, domains) {
            continue;
        }
        if !jar.contains(name) || domain.trim_start_matches('.') == "google.com" {
            jar.insert(name, value);
        }
    }
    jar
}

pub fn missing_cookies(jar: &CookieJar, required: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|name| !jar.contains(name))
        .cloned()
        .collect()
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| match e.file_type() {
            Ok(ft) if ft.is_dir() => dir_size(&e.path()),
            Ok(ft) if ft.is_file() => e.metadata().map(|m| m.len()).unwrap_or(0),
            _ => 0,
        })
        .sum()
}

/// Remove disposable caches from a browser user-data dir. Returns bytes freed.
pub fn cleanup_cache_dirs(user_data_dir: &Path) -> u64 {
    let default_dir = user_data_dir.join("Default");
    let mut freed = 0;
    for name in CACHE_DIRS {
        let path = default_dir.join(name);
        if !path.is_dir() {
            continue;
        }
        let size = dir_size(&path);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => freed += size,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove cache dir"),
        }
    }
    freed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdp::testing::{spawn_fake_cdp, spawn_silent_cdp, Reply};
    use serde_json::json;

    fn extractor(base: &Path) -> BrowserSessionExtractor {
        BrowserSessionExtractor::new(
            Paths::with_base(base.to_path_buf()),
            BrowserConfig::default(),
            &ServiceConfig::default(),
        )
    }

    fn google_cookies(names: &[&str]) -> Value {
        let list: Vec<Value> = names
            .iter()
            .map(|n| json!({"name": n, "value": format!("v-{}", n), "domain": ".google.com"}))
            .collect();
        json!({ "cookies": list })
    }

    #[test]
    fn test_filter_cookies_by_domain() {
        let raw = vec![
            json!({"name": "SID", "value": "nb", "domain": "notebooklm.google.com"}),
            json!({"name": "SID", "value": "g", "domain": ".google.com"}),
            json!({"name": "HSID", "value": "h", "domain": "accounts.google.com"}),
            json!({"name": "track", "value": "x", "domain": ".ads.example"}),
            json!({"name": "OSID", "value": "o", "domain": "notgoogle.com"}),
        ];
        let domains = BrowserConfig::default().cookie_domains;
        let jar = filter_cookies(&raw, &domains);
        assert_eq!(jar.get("SID"), Some("g"));
        assert_eq!(jar.get("HSID"), Some("h"));
        assert!(!jar.contains("track"));
        assert!(!jar.contains("OSID"));
    }

    #[test]
    fn test_missing_required_cookies() {
        let mut jar = CookieJar::new();
        jar.insert("SID", "1");
        let required = BrowserConfig::default().required_cookies;
        let missing = missing_cookies(&jar, &required);
        assert_eq!(missing, vec!["HSID", "SSID", "APISID", "SAPISID"]);
    }

    #[test]
    fn test_cleanup_cache_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("Default").join("Cache");
        std::fs::create_dir_all(cache.join("sub")).unwrap();
        std::fs::write(cache.join("sub").join("blob"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("Default").join("Cookies"), b"keep").unwrap();
        assert_eq!(cleanup_cache_dirs(dir.path()), 100);
        assert!(!cache.exists());
        assert!(dir.path().join("Default").join("Cookies").exists());
    }

    #[tokio::test]
    async fn test_harvest_uses_login_request_and_html_fallbacks() {
        let url = spawn_fake_cdp(|method, _| match method {
            "Page.navigate" => Reply {
                result: json!({"frameId": "f"}),
                events: vec![
                    (
                        "Network.requestWillBeSent".to_string(),
                        json!({"request": {"url": "https://notebooklm.google.com/app.js"}}),
                    ),
                    (
                        "Network.requestWillBeSent".to_string(),
                        json!({"request": {
                            "url": "https://notebooklm.google.com/_/LabsTailwindUi/data/batchexecute?rpcids=x&f.sid=555&rt=c",
                            "postData": "f.req=x&at=csrf-from-wire&"
                        }}),
                    ),
                ],
            },
            "Network.getAllCookies" => Reply::ok(google_cookies(&[
                "SID", "HSID", "SSID", "APISID", "SAPISID",
            ])),
            "Runtime.evaluate" => Reply::ok(json!({"result": {"type": "string",
                "value": r#"{"SNlM0e":"csrf-from-html","cfb2h":"bl-html","oPEP7c":"a@x.com"}"#}})),
            _ => Reply::ok(json!({})),
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let ex = extractor(dir.path());
        let cdp = CdpClient::connect(&url).await.unwrap();
        let timeout = Duration::from_secs(10);
        let result = ex
            .harvest(&cdp, "work", timeout, Instant::now() + timeout)
            .await
            .unwrap();
        assert_eq!(result.csrf_token.as_deref(), Some("csrf-from-wire"));
        assert_eq!(result.session_id.as_deref(), Some("555"));
        assert_eq!(result.build_label.as_deref(), Some("bl-html"));
        assert_eq!(result.account_email.as_deref(), Some("a@x.com"));
        assert_eq!(result.cookies.len(), 5);
    }

    #[tokio::test]
    async fn test_harvest_times_out_without_sign_in() {
        let url = spawn_fake_cdp(|_, _| Reply::ok(json!({}))).await;
        let dir = tempfile::tempdir().unwrap();
        let ex = extractor(dir.path());
        let cdp = CdpClient::connect(&url).await.unwrap();
        let timeout = Duration::from_millis(300);
        let err = ex
            .harvest(&cdp, "work", timeout, Instant::now() + timeout)
            .await
            .unwrap_err();
        match err {
            Error::AuthenticationTimeout { profile_name, .. } => assert_eq!(profile_name, "work"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_harvest_deadline_covers_unanswered_commands() {
        let url = spawn_silent_cdp().await;
        let dir = tempfile::tempdir().unwrap();
        let ex = extractor(dir.path());
        let cdp = CdpClient::connect(&url).await.unwrap();
        let timeout = Duration::from_millis(500);
        let started = Instant::now();
        let err = ex
            .harvest(&cdp, "work", timeout, Instant::now() + timeout)
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            Error::AuthenticationTimeout { profile_name, .. } => assert_eq!(profile_name, "work"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_harvest_times_out_when_cookies_incomplete() {
        let url = spawn_fake_cdp(|method, _| match method {
            "Page.navigate" => Reply {
                result: json!({}),
                events: vec![(
                    "Network.requestWillBeSent".to_string(),
                    json!({"request": {"url": "https://h/_/X/data/batchexecute?f.sid=1"}}),
                )],
            },
            "Network.getAllCookies" => Reply::ok(google_cookies(&["SID"])),
            _ => Reply::ok(json!({})),
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let ex = extractor(dir.path());
        let cdp = CdpClient::connect(&url).await.unwrap();
        let timeout = Duration::from_millis(1500);
        let err = ex
            .harvest(&cdp, "work", timeout, Instant::now() + timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationTimeout { .. }));
    }
}
