//! Browser process discovery, launch and teardown.

use crate::cdp::CdpClient;
use nlmkit_core::{BrowserConfig, Error, Result};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CDP_READY_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A browser held for the duration of one extraction.
///
/// A launched browser is closed when the lease is released, and killed if the
/// lease is dropped without being released. An attached browser is left alone.
pub struct BrowserLease {
    http_base: String,
    child: Option<Child>,
    browser_ws_url: Option<String>,
    close_on_release: bool,
}

impl BrowserLease {
    pub fn attached(http_base: impl Into<String>) -> Self {
        Self {
            http_base: http_base.into(),
            child: None,
            browser_ws_url: None,
            close_on_release: false,
        }
    }

    fn launched(http_base: String, child: Child, close: bool) -> Self {
        Self {
            http_base,
            child: Some(child),
            browser_ws_url: None,
            close_on_release: close,
        }
    }

    /// Debugging HTTP endpoint, e.g. `http://127.0.0.1:9222`.
    pub fn http_base(&self) -> &str {
        &self.http_base
    }

    pub fn is_launched(&self) -> bool {
        self.child.is_some()
    }

    pub async fn release(mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if !self.close_on_release {
            info!(endpoint = %self.http_base, "Leaving launched browser running");
            return;
        }

        if let Some(ws_url) = self.browser_ws_url.take() {
            match CdpClient::connect(&ws_url).await {
                Ok(cdp) => {
                    let cdp = cdp.with_command_timeout(SHUTDOWN_GRACE);
                    if let Err(e) = cdp.close_browser().await {
                        debug!(error = %e, "Browser.close failed (may already be closed)");
                    }
                }
                Err(e) => debug!(error = %e, "Could not reach browser for graceful close"),
            }
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(status = %status, "Browser exited"),
            _ => {
                warn!(endpoint = %self.http_base, "Browser did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        if self.close_on_release {
            if let Some(child) = self.child.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

/// Command line for a debuggable browser bound to one user-data directory.
pub fn build_browser_args(debug_port: u16, user_data_dir: &Path, headless: bool) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-extensions".to_string(),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--remote-allow-origins=*".to_string(),
    ];
    if headless {
        args.push("--headless=new".to_string());
    }
    args
}

pub fn find_browser_binary() -> Option<String> {
    let candidates: Vec<&str> = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else if cfg!(target_os = "linux") {
        vec![
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
        ]
    } else {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    };

    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        if !candidate.contains('/') && !candidate.contains('\\') && which::which(candidate).is_ok()
        {
            return Some(candidate.to_string());
        }
    }
    None
}

fn resolve_binary(configured: Option<&str>) -> Result<String> {
    match configured {
        Some(path) => {
            if Path::new(path).exists() || which::which(path).is_ok() {
                Ok(path.to_string())
            } else {
                Err(Error::Browser(format!(
                    "Configured browser binary '{}' not found",
                    path
                )))
            }
        }
        None => find_browser_binary().ok_or_else(|| {
            Error::Browser(
                "Chrome/Chromium not found. Install it or set browser.binary in config.json"
                    .to_string(),
            )
        }),
    }
}

/// True when a `SingletonLock` exists, including the dangling-symlink form Chrome leaves behind.
pub fn is_profile_locked(user_data_dir: &Path) -> bool {
    std::fs::symlink_metadata(user_data_dir.join("SingletonLock")).is_ok()
}

/// Turn any accepted CDP endpoint spelling into an HTTP base URL.
///
/// Accepts a bare port, `host:port`, `http(s)://host:port[/]` and
/// `ws(s)://host:port/devtools/...`.
pub fn normalize_cdp_url(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::Validation("CDP URL is empty".to_string()));
    }
    if raw.chars().all(|c| c.is_ascii_digit()) {
        return Ok(format!("http://127.0.0.1:{}", raw));
    }
    if raw.starts_with("ws://") || raw.starts_with("wss://") {
        let parsed = url::Url::parse(raw)
            .map_err(|e| Error::Validation(format!("Invalid CDP WebSocket URL '{}': {}", raw, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::Validation(format!("CDP WebSocket URL '{}' has no host", raw)))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| Error::Validation(format!("CDP WebSocket URL '{}' has no port", raw)))?;
        let scheme = if parsed.scheme() == "wss" { "https" } else { "http" };
        return Ok(format!("{}://{}:{}", scheme, host, port));
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Ok(raw.trim_end_matches('/').to_string());
    }
    Ok(format!("http://{}", raw.trim_end_matches('/')))
}

fn probe_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|e| Error::Browser(format!("Failed to build HTTP client: {}", e)))
}

/// Browser-level WebSocket URL from `/json/version`.
pub async fn fetch_browser_ws_url(http_base: &str) -> Result<String> {
    let client = probe_client()?;
    let url = format!("{}/json/version", http_base);
    let body: Value = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::Browser(format!("Cannot reach CDP endpoint {}: {}", http_base, e)))?
        .json()
        .await
        .map_err(|e| Error::Browser(format!("Bad /json/version from {}: {}", http_base, e)))?;
    body.get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::Browser(format!("{} reported no webSocketDebuggerUrl", http_base)))
}

fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// First port in the range with a live debugging endpoint.
pub async fn scan_existing(start: u16, count: u16) -> Option<u16> {
    for port in start..start.saturating_add(count) {
        // A free port cannot have a browser on it; skip the HTTP probe.
        if port_is_free(port) {
            continue;
        }
        let base = format!("http://127.0.0.1:{}", port);
        if fetch_browser_ws_url(&base).await.is_ok() {
            debug!(port, "Found debuggable browser");
            return Some(port);
        }
    }
    None
}

async fn pick_debug_port(start: u16, count: u16) -> Result<u16> {
    if let Some(port) = (start..start.saturating_add(count)).find(|p| port_is_free(*p)) {
        return Ok(port);
    }
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Poll `/json/version` until it answers or `deadline` passes.
async fn wait_for_cdp_ready(http_base: &str, deadline: Instant) -> Result<String> {
    let started = Instant::now();
    loop {
        match fetch_browser_ws_url(http_base).await {
            Ok(ws) => return Ok(ws),
            Err(e) if Instant::now() >= deadline => {
                return Err(Error::Browser(format!(
                    "Browser CDP not ready after {}ms: {}",
                    started.elapsed().as_millis(),
                    e
                )))
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    }
}

/// Attach to the configured endpoint, reuse a running browser, or launch one.
/// A launched browser must become debuggable before `deadline`.
pub async fn acquire(
    config: &BrowserConfig,
    user_data_dir: &Path,
    deadline: Instant,
) -> Result<BrowserLease> {
    if let Some(cdp_url) = config.cdp_url.as_deref() {
        let base = normalize_cdp_url(cdp_url)?;
        fetch_browser_ws_url(&base).await?;
        info!(endpoint = %base, "Attached to configured CDP endpoint");
        return Ok(BrowserLease::attached(base));
    }

    if let Some(port) = scan_existing(config.debug_port_start, config.debug_port_count).await {
        info!(port, "Reusing running browser");
        return Ok(BrowserLease::attached(format!("http://127.0.0.1:{}", port)));
    }

    if is_profile_locked(user_data_dir) {
        return Err(Error::Browser(format!(
            "Browser profile {} is locked (SingletonLock) but no browser answered on ports {}-{}. \
             Close stuck browser processes or delete the stale SingletonLock.",
            user_data_dir.display(),
            config.debug_port_start,
            config
                .debug_port_start
                .saturating_add(config.debug_port_count.saturating_sub(1))
        )));
    }

    let binary = resolve_binary(config.binary.as_deref())?;
    std::fs::create_dir_all(user_data_dir)?;
    let port = pick_debug_port(config.debug_port_start, config.debug_port_count).await?;
    let args = build_browser_args(port, user_data_dir, config.headless);

    info!(
        port,
        headless = config.headless,
        user_data_dir = %user_data_dir.display(),
        "Launching browser"
    );
    let child = Command::new(&binary)
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(config.close_launched_browser)
        .spawn()
        .map_err(|e| Error::Browser(format!("Failed to launch {}: {}", binary, e)))?;

    let base = format!("http://127.0.0.1:{}", port);
    // The lease owns the child from here so an early return still reaps it.
    let mut lease = BrowserLease::launched(base.clone(), child, config.close_launched_browser);
    let ready_by = deadline.min(Instant::now() + CDP_READY_TIMEOUT);
    let ws = wait_for_cdp_ready(&base, ready_by).await?;
    lease.browser_ws_url = Some(ws);
    Ok(lease)
}

/// A page target from `/json/list`.
#[derive(Debug, Clone)]
pub struct PageTarget {
    pub url: String,
    pub ws_url: String,
}

impl PageTarget {
    fn from_json(value: &Value) -> Option<Self> {
        if value.get("type").and_then(|v| v.as_str()).unwrap_or("page") != "page" {
            return None;
        }
        Some(Self {
            url: value
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            ws_url: value.get("webSocketDebuggerUrl")?.as_str()?.to_string(),
        })
    }
}

/// A page already on `host`, or a freshly opened one pointed at `open_url`.
pub async fn find_or_open_page(http_base: &str, host: &str, open_url: &str) -> Result<PageTarget> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|e| Error::Browser(format!("Failed to build HTTP client: {}", e)))?;

    let list_url = format!("{}/json/list", http_base);
    let targets: Vec<Value> = match client.get(&list_url).send().await {
        Ok(resp) => resp.json().await.unwrap_or_default(),
        Err(e) => {
            debug!(error = %e, "Listing page targets failed");
            Vec::new()
        }
    };
    if let Some(page) = targets
        .iter()
        .filter_map(PageTarget::from_json)
        .find(|p| p.url.contains(host))
    {
        debug!(url = %page.url, "Using existing page");
        return Ok(page);
    }

    let new_url = format!("{}/json/new?{}", http_base, urlencoding::encode(open_url));
    let created: Value = client
        .put(&new_url)
        .send()
        .await
        .map_err(|e| Error::Browser(format!("Failed to open a page: {}", e)))?
        .json()
        .await
        .map_err(|e| Error::Browser(format!("Bad /json/new response: {}", e)))?;
    PageTarget::from_json(&created)
        .ok_or_else(|| Error::Browser("New page has no WebSocket URL".to_string()))
}
