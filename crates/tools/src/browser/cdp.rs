//! Low-level Chrome DevTools Protocol (CDP) client over WebSocket.
//!
//! Communicates with a Chrome/Chromium page target via its debugging WebSocket
//! endpoint. Supports sending commands, receiving responses, and handling events.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type ListenerMap = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>>;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a command's response slot when the waiting future goes away,
/// whether it completed, timed out, or was dropped by a caller's deadline.
struct PendingSlot<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

/// A CDP WebSocket client that can send commands and receive responses/events.
pub struct CdpClient {
    /// Sender to write messages to the WebSocket.
    ws_tx: mpsc::Sender<String>,
    /// Pending command responses, keyed by request ID.
    pending: PendingMap,
    /// Auto-incrementing command ID.
    next_id: AtomicU64,
    /// Event listeners (domain.event -> channels).
    event_listeners: ListenerMap,
    /// Cleared by the reader task when the socket closes or errors.
    connected: Arc<AtomicBool>,
    command_timeout: Duration,
    _reader_handle: tokio::task::JoinHandle<()>,
    _writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a Chrome CDP WebSocket endpoint.
    pub async fn connect(ws_url: &str) -> Result<Self, String> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| format!("Failed to connect to CDP endpoint {}: {}", ws_url, e))?;

        let (mut ws_sink, mut ws_stream_read) = ws_stream.split();

        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();

        let event_listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));
        let events_clone = event_listeners.clone();

        let connected = Arc::new(AtomicBool::new(true));
        let connected_reader = connected.clone();

        // Writer task: owns the sink, forwards messages from channel
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    break;
                }
            }
        });

        // Reader task: reads from WebSocket, dispatches responses and events
        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_stream_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            if let Some(tx) = lock(&pending_clone).remove(&id) {
                                let _ = tx.send(val);
                            }
                        } else if let Some(method) = val.get("method").and_then(|v| v.as_str()) {
                            let mut listeners = lock(&events_clone);
                            if let Some(senders) = listeners.get_mut(method) {
                                senders.retain(|tx| !tx.is_closed());
                                let params = val.get("params").cloned().unwrap_or(Value::Null);
                                for tx in senders.iter() {
                                    if let Err(mpsc::error::TrySendError::Full(_)) =
                                        tx.try_send(params.clone())
                                    {
                                        warn!(event = method, "CDP event listener full, dropping event");
                                    }
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            connected_reader.store(false, Ordering::SeqCst);
            // Wake every waiter: dropping the senders fails their receivers.
            lock(&pending_clone).clear();
            lock(&events_clone).clear();
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            event_listeners,
            connected,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            _reader_handle: reader_handle,
            _writer_handle: writer_handle,
        })
    }

    /// Whether the WebSocket to the browser is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a CDP command and wait for the response.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value, String> {
        if !self.is_connected() {
            return Err(format!("CDP connection closed before '{}'", method));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };

        self.ws_tx
            .send(msg.to_string())
            .await
            .map_err(|e| format!("Failed to send CDP command: {}", e))?;

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.get("error") {
                    Err(format!("CDP error: {}", error))
                } else {
                    Ok(response.get("result").cloned().unwrap_or(Value::Null))
                }
            }
            Ok(Err(_)) => Err(format!("CDP response channel closed during '{}'", method)),
            Err(_) => Err(format!(
                "CDP command '{}' timed out after {}s",
                method,
                self.command_timeout.as_secs()
            )),
        }
    }

    /// Subscribe to a CDP event. Returns a receiver that will get event params.
    ///
    /// The subscription is dropped from the listener table once the receiver
    /// is dropped and the next event of that kind arrives.
    pub fn subscribe_event(&self, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(64);
        lock(&self.event_listeners)
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Enable a CDP domain (e.g., "Page", "Runtime", "Network").
    pub async fn enable_domain(&self, domain: &str) -> Result<(), String> {
        self.send_command(&format!("{}.enable", domain), json!({}))
            .await?;
        Ok(())
    }

    /// Ask the page to emit `Page.lifecycleEvent` (load, networkIdle, ...).
    pub async fn enable_lifecycle_events(&self) -> Result<(), String> {
        self.send_command("Page.setLifecycleEventsEnabled", json!({"enabled": true}))
            .await?;
        Ok(())
    }

    /// Start a navigation. Resolves once the navigation commits (or fails),
    /// not when the page has finished loading.
    pub async fn navigate(&self, url: &str) -> Result<Value, String> {
        self.send_command("Page.navigate", json!({"url": url}))
            .await
    }

    /// Reload the current document. Unlike a same-URL `navigate` on a
    /// fragment URL, this always starts a new loader.
    pub async fn reload(&self) -> Result<(), String> {
        self.send_command("Page.reload", json!({"ignoreCache": false}))
            .await?;
        Ok(())
    }

    /// Abort any in-flight page load.
    pub async fn stop_loading(&self) -> Result<(), String> {
        self.send_command("Page.stopLoading", json!({})).await?;
        Ok(())
    }

    /// Evaluate JavaScript in the page context.
    pub async fn evaluate_js(&self, expression: &str) -> Result<Value, String> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        Ok(result)
    }

    /// Override the user agent for all subsequent requests of this target.
    pub async fn set_user_agent(&self, user_agent: &str) -> Result<(), String> {
        self.send_command(
            "Network.setUserAgentOverride",
            json!({"userAgent": user_agent}),
        )
        .await?;
        Ok(())
    }

    /// Ask the browser process to exit.
    pub async fn close_browser(&self) -> Result<(), String> {
        self.send_command("Browser.close", json!({})).await?;
        Ok(())
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self._reader_handle.abort();
        self._writer_handle.abort();
    }
}

/// Pull the returned value out of a `Runtime.evaluate` response,
/// turning a thrown exception into an error.
pub fn evaluation_value(result: &Value) -> Result<Value, String> {
    if let Some(details) = result.get("exceptionDetails") {
        let text = details
            .get("exception")
            .and_then(|e| e.get("description"))
            .or_else(|| details.get("text"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown exception");
        return Err(format!("script threw: {}", text));
    }
    Ok(result
        .get("result")
        .and_then(|r| r.get("value"))
        .cloned()
        .unwrap_or(Value::Null))
}
