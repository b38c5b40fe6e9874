use crate::client::build_http_client;
use crate::envelope::{build_url, encode_body, RpcCall, UrlParams};
use crate::response::{decode_response, is_auth_rejection, RpcResponse};
use async_trait::async_trait;
use nlmkit_core::{Config, Error, Profile, Result, RpcStatus, ServiceConfig, TransportConfig};
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const REQID_STEP: u64 = 100_000;

/// Obtains fresh credentials for a profile the service just rejected.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, profile: &Profile) -> Result<Profile>;
}

/// Why a single round trip did not produce a response.
enum Failure {
    /// The service refused the credentials; eligible for one refresh.
    Unauthenticated(String),
    Fatal(Error),
}

enum SendError {
    Retryable(reqwest::Error),
    NotRetryable(reqwest::Error),
    Failed(Failure),
}

/// Issues batch-execution calls on behalf of a profile.
pub struct RpcTransport {
    client: reqwest::Client,
    config: Config,
    refresher: Option<Arc<dyn CredentialRefresher>>,
    request_counter: AtomicU64,
    /// Credentials obtained by a refresh, newer than what callers may still hold.
    refreshed: RwLock<HashMap<String, Profile>>,
}

impl RpcTransport {
    pub fn new(config: &Config) -> Self {
        let client = build_http_client(
            config.service.proxy.as_deref(),
            Duration::from_secs(config.service.request_timeout_secs),
        );
        let base = rand::thread_rng().gen_range(1000..10000);
        Self {
            client,
            config: config.clone(),
            refresher: None,
            request_counter: AtomicU64::new(base),
            refreshed: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    fn service(&self) -> &ServiceConfig {
        &self.config.service
    }

    fn transport(&self) -> &TransportConfig {
        &self.config.transport
    }

    pub async fn call(&self, profile: &Profile, operation_id: &str, params: Value) -> Result<RpcResponse> {
        self.execute(profile, &RpcCall::new(operation_id, params)).await
    }

    pub async fn call_at(
        &self,
        profile: &Profile,
        operation_id: &str,
        params: Value,
        source_path: &str,
    ) -> Result<RpcResponse> {
        self.execute(profile, &RpcCall::new(operation_id, params).at(source_path))
            .await
    }

    /// Newest credentials known for `profile`'s name.
    async fn effective_profile(&self, profile: &Profile) -> Profile {
        let refreshed = self.refreshed.read().await;
        match refreshed.get(&profile.name) {
            Some(newer) if newer.last_validated_at > profile.last_validated_at => newer.clone(),
            _ => profile.clone(),
        }
    }

    pub async fn execute(&self, profile: &Profile, call: &RpcCall) -> Result<RpcResponse> {
        let profile = self.effective_profile(profile).await;
        let op = call.operation_id.as_str();

        let reason = match self.send_with_retry(&profile, call).await {
            Ok(resp) => return Ok(resp),
            Err(Failure::Fatal(e)) => return Err(e),
            Err(Failure::Unauthenticated(reason)) => reason,
        };

        let Some(refresher) = self.refresher.as_ref() else {
            return Err(auth_error(&profile, op, reason));
        };

        warn!(
            profile = %profile.name,
            operation_id = %op,
            reason = %reason,
            "Credentials rejected, refreshing once"
        );
        let fresh = refresher.refresh(&profile).await?;
        self.refreshed
            .write()
            .await
            .insert(fresh.name.clone(), fresh.clone());

        match self.send_with_retry(&fresh, call).await {
            Ok(resp) => {
                info!(profile = %fresh.name, operation_id = %op, "Call succeeded after refresh");
                Ok(resp)
            }
            Err(Failure::Fatal(e)) => Err(e),
            Err(Failure::Unauthenticated(reason)) => Err(auth_error(
                &fresh,
                op,
                format!("still rejected after refreshing credentials: {}", reason),
            )),
        }
    }

    async fn send_with_retry(&self, profile: &Profile, call: &RpcCall) -> std::result::Result<RpcResponse, Failure> {
        let max_attempts = self.transport().max_attempts.max(1);
        let op = call.operation_id.as_str();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(profile, call).await {
                Ok(resp) => {
                    if attempt > 1 {
                        info!(operation_id = %op, attempt, "Call succeeded after retry");
                    }
                    return Ok(resp);
                }
                Err(SendError::Failed(f)) => return Err(f),
                Err(SendError::Retryable(e)) if attempt < max_attempts => {
                    let delay_ms = self.transport().backoff_ms(attempt);
                    warn!(
                        operation_id = %op,
                        attempt,
                        max_attempts,
                        delay_ms,
                        error = %e,
                        "Transport error, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(SendError::Retryable(e)) | Err(SendError::NotRetryable(e)) => {
                    warn!(operation_id = %op, attempts = attempt, error = %e, "Transport error, giving up");
                    return Err(Failure::Fatal(Error::Transport {
                        operation_id: op.to_string(),
                        attempts: attempt,
                        message: e.to_string(),
                    }));
                }
            }
        }
    }

    async fn send_once(&self, profile: &Profile, call: &RpcCall) -> std::result::Result<RpcResponse, SendError> {
        let op = call.operation_id.as_str();
        let service = self.service();
        let request_id = self.request_counter.fetch_add(REQID_STEP, Ordering::SeqCst) + REQID_STEP;
        let build_label = self.config.resolve_build_label(profile.build_label.as_deref());
        let url = build_url(
            service,
            &UrlParams {
                operation_id: op,
                source_path: call.source_path(),
                build_label: &build_label,
                session_id: profile.session_id.as_deref(),
                request_id,
            },
        )
        .map_err(|e| SendError::Failed(Failure::Fatal(e)))?;
        let body = encode_body(op, &call.params, profile.csrf_token.as_deref());
        let origin = service.base_url.trim_end_matches('/');

        debug!(operation_id = %op, request_id, profile = %profile.name, "Sending batch call");
        let resp = self
            .client
            .post(url.clone())
            .header("Content-Type", "application/x-www-form-urlencoded;charset=UTF-8")
            .header("Cookie", profile.cookies.to_header())
            .header("Origin", origin)
            .header("Referer", format!("{}/", origin))
            .header("X-Same-Domain", "1")
            .header("User-Agent", &service.user_agent)
            .body(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = resp.status();
        let final_url = resp.url().clone();
        debug!(operation_id = %op, status = status.as_u16(), "Batch call answered");

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(SendError::Failed(Failure::Unauthenticated(format!(
                "HTTP {}",
                status.as_u16()
            ))));
        }
        if final_url != url && final_url.host_str() == Some(service.signin_host.as_str()) {
            return Err(SendError::Failed(Failure::Unauthenticated(
                "redirected to sign-in".to_string(),
            )));
        }
        if !status.is_success() {
            return Err(SendError::Failed(Failure::Fatal(Error::Rpc {
                operation_id: op.to_string(),
                status: RpcStatus::Http(status.as_u16()),
            })));
        }

        let text = resp.text().await.map_err(classify_reqwest_error)?;
        match decode_response(op, &text) {
            Ok(r) => Ok(r),
            Err(Error::Rpc { status, .. }) if is_auth_rejection(&status) => Err(SendError::Failed(
                Failure::Unauthenticated(status.to_string()),
            )),
            Err(e) => Err(SendError::Failed(Failure::Fatal(e))),
        }
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> SendError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        SendError::Retryable(e)
    } else {
        SendError::NotRetryable(e)
    }
}

fn auth_error(profile: &Profile, operation_id: &str, message: impl Into<String>) -> Error {
    Error::Authentication {
        profile_name: profile.name.clone(),
        operation_id: operation_id.to_string(),
        message: message.into(),
    }
}
