//! Minimal Chrome DevTools Protocol client over WebSocket.
//!
//! One connection per target. A writer task owns the sink, a reader task
//! dispatches command responses by id and fans events out to subscribers.
//! Both tasks are aborted when the client is dropped.

use nlmkit_core::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type ListenerMap = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>>;

pub struct CdpClient {
    ws_tx: mpsc::Sender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    event_listeners: ListenerMap,
    command_timeout: Duration,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    pub async fn connect(ws_url: &str) -> Result<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url).await.map_err(|e| {
            Error::Browser(format!("Failed to connect to CDP endpoint {}: {}", ws_url, e))
        })?;

        let (mut ws_sink, mut ws_read) = ws_stream.split();
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();
        let event_listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));
        let events_clone = event_listeners.clone();

        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!(error = %e, "CDP WebSocket write error");
                    break;
                }
            }
        });

        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            debug!("Ignoring non-JSON CDP frame");
                            continue;
                        };
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            let mut pending = pending_clone.lock().await;
                            if let Some(tx) = pending.remove(&id) {
                                let _ = tx.send(val);
                            }
                        } else if let Some(method) = val.get("method").and_then(|v| v.as_str()) {
                            let listeners = events_clone.lock().await;
                            if let Some(senders) = listeners.get(method) {
                                let params = val.get("params").cloned().unwrap_or(Value::Null);
                                for tx in senders {
                                    let _ = tx.try_send(params.clone());
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "CDP WebSocket read error");
                        break;
                    }
                    _ => {}
                }
            }
            // Dropping the senders wakes every waiter and ends every subscription.
            pending_clone.lock().await.clear();
            events_clone.lock().await.clear();
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            event_listeners,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            reader_handle,
            writer_handle,
        })
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Send a command and wait for its `result`.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.ws_tx.send(msg.to_string()).await {
            self.pending.lock().await.remove(&id);
            return Err(Error::Browser(format!(
                "Failed to send CDP command {}: {}",
                method, e
            )));
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some(err) = response.get("error") {
                    Err(Error::Browser(format!("CDP {} failed: {}", method, err)))
                } else {
                    Ok(response.get("result").cloned().unwrap_or(Value::Null))
                }
            }
            Ok(Err(_)) => Err(Error::Browser(format!(
                "CDP connection closed while waiting for {}",
                method
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Browser(format!(
                    "CDP command '{}' timed out after {}s",
                    method,
                    self.command_timeout.as_secs()
                )))
            }
        }
    }

    /// Subscribe before the command that triggers the event, or it may be missed.
    pub async fn subscribe_event(&self, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(256);
        self.event_listeners
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub async fn enable_domain(&self, domain: &str) -> Result<()> {
        self.send_command(&format!("{}.enable", domain), json!({}))
            .await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<Value> {
        self.send_command("Page.navigate", json!({ "url": url })).await
    }

    pub async fn evaluate_js(&self, expression: &str) -> Result<Value> {
        self.send_command(
            "Runtime.evaluate",
            json!({
                "expression": expression,
                "returnByValue": true,
                "awaitPromise": true,
            }),
        )
        .await
    }

    /// String value of a `Runtime.evaluate` result, if it produced one.
    pub async fn evaluate_string(&self, expression: &str) -> Result<Option<String>> {
        let result = self.evaluate_js(expression).await?;
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }

    /// Cookies for every domain the browser holds.
    pub async fn get_all_cookies(&self) -> Result<Vec<Value>> {
        let result = self
            .send_command("Network.getAllCookies", json!({}))
            .await?;
        Ok(result
            .get("cookies")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    pub async fn close_browser(&self) -> Result<()> {
        self.send_command("Browser.close", json!({})).await?;
        Ok(())
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{spawn_fake_cdp, Reply};
    use super::*;

    #[tokio::test]
    async fn test_command_result_and_error() {
        let url = spawn_fake_cdp(|method, _| match method {
            "Runtime.evaluate" => Reply::ok(json!({"result": {"type": "string", "value": "<html/>"}})),
            "Page.navigate" => Reply::ok(json!({"__error": "Cannot navigate"})),
            _ => Reply::ok(json!({})),
        })
        .await;
        let cdp = CdpClient::connect(&url).await.unwrap();
        assert_eq!(
            cdp.evaluate_string("document.title").await.unwrap().as_deref(),
            Some("<html/>")
        );
        let err = cdp.navigate("https://example.com").await.unwrap_err();
        assert!(err.to_string().contains("Page.navigate"));
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let url = spawn_fake_cdp(|method, _| {
            if method == "Network.enable" {
                Reply {
                    result: json!({}),
                    events: vec![(
                        "Network.requestWillBeSent".to_string(),
                        json!({"request": {"url": "https://x/y"}}),
                    )],
                }
            } else {
                Reply::ok(json!({}))
            }
        })
        .await;
        let cdp = CdpClient::connect(&url).await.unwrap();
        let mut rx = cdp.subscribe_event("Network.requestWillBeSent").await;
        cdp.enable_domain("Network").await.unwrap();
        let params = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(params["request"]["url"], "https://x/y");
    }

    #[tokio::test]
    async fn test_connect_failure_is_browser_error() {
        let err = CdpClient::connect("ws://127.0.0.1:1/devtools/page/none")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Browser(_)));
    }
}
