//! Page rendering and target-element extraction.
//!
//! [`PageRenderer::open`] acquires one isolated browser per watch session and
//! hands back a [`RenderHandle`]. The handle splits one attempt into
//! `navigate` (load the page until the network goes quiet) and `extract`
//! (let scripts run, scroll lazy content in, then query the target once), so
//! callers can put a deadline on navigation alone.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use pagewatch_core::config::{BrowserConfig, WatchConfig};
use pagewatch_core::{ElementSnapshot, WatchRequest};

use super::cdp::{evaluation_value, CdpClient};
use super::session::{BrowserSession, LaunchOptions};

/// Selector of the watched element.
pub const TARGET_SELECTOR: &str = "button[data-link]";
/// Class that marks the target as present but not yet available.
pub const HIDDEN_CLASS: &str = "hidden";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("page script failed: {0}")]
    Script(String),
    #[error("browser connection lost: {0}")]
    EngineLost(String),
}

impl RenderError {
    /// Fatal errors mean no later attempt can succeed with this handle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RenderError::Launch(_) | RenderError::EngineLost(_))
    }
}

/// Result of querying the page for the target element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Found(ElementSnapshot),
    /// No element matches the selector.
    Absent,
    /// The element exists but carries the hidden marker.
    Hidden,
}

impl Extraction {
    pub fn describe(&self) -> &'static str {
        match self {
            Extraction::Found(_) => "found",
            Extraction::Absent => "absent",
            Extraction::Hidden => "hidden",
        }
    }
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Acquire a fresh browsing context for one session.
    async fn open(&self, request: &WatchRequest) -> Result<Box<dyn RenderHandle>, RenderError>;
}

#[async_trait]
pub trait RenderHandle: Send {
    /// Load the page and wait for network activity to settle.
    async fn navigate(&mut self) -> Result<(), RenderError>;

    /// Run the post-load pauses and scroll, then query the target element once.
    async fn extract(&mut self) -> Result<Extraction, RenderError>;

    /// Release the browsing context and the engine process.
    async fn close(self: Box<Self>);
}

/// Timings and identity applied to every page load.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub post_load_pause: Duration,
    pub settle_pause: Duration,
    pub scroll_step_px: u32,
    pub scroll_interval: Duration,
    pub max_scroll_steps: u32,
    pub user_agent: String,
}

impl RenderSettings {
    pub fn from_config(watch: &WatchConfig, browser: &BrowserConfig) -> Self {
        Self {
            post_load_pause: Duration::from_millis(watch.post_load_pause_ms),
            settle_pause: Duration::from_millis(watch.settle_pause_ms),
            scroll_step_px: watch.scroll_step_px,
            scroll_interval: Duration::from_millis(watch.scroll_interval_ms),
            max_scroll_steps: watch.max_scroll_steps,
            user_agent: browser.user_agent.clone(),
        }
    }
}

/// Renderer backed by a locally launched Chrome/Chromium.
pub struct ChromeRenderer {
    launch: LaunchOptions,
    settings: RenderSettings,
}

impl ChromeRenderer {
    pub fn new(launch: LaunchOptions, settings: RenderSettings) -> Self {
        Self { launch, settings }
    }

    pub fn from_config(
        watch: &WatchConfig,
        browser: &BrowserConfig,
        profiles_dir: PathBuf,
    ) -> Self {
        let launch = LaunchOptions {
            binary: browser.binary.clone(),
            headless: browser.headless,
            launch_timeout: Duration::from_secs(browser.launch_timeout_secs),
            profiles_dir,
        };
        Self::new(launch, RenderSettings::from_config(watch, browser))
    }
}

#[async_trait]
impl PageRenderer for ChromeRenderer {
    async fn open(&self, request: &WatchRequest) -> Result<Box<dyn RenderHandle>, RenderError> {
        let session = BrowserSession::launch(&self.launch)
            .await
            .map_err(RenderError::Launch)?;

        // A browser that came up but rejects basic setup is as unusable as one
        // that never launched.
        let prepared = prepare_page(&session.cdp, &self.settings.user_agent).await;
        if let Err(e) = prepared {
            session.close().await;
            return Err(RenderError::Launch(e));
        }

        debug!(profile = %session.profile_dir().display(), url = %request, "Render handle opened");
        Ok(Box::new(ChromeHandle {
            session,
            url: request.url().to_string(),
            settings: self.settings.clone(),
            navigations: 0,
            last_loader: None,
        }))
    }
}

async fn prepare_page(cdp: &CdpClient, user_agent: &str) -> Result<(), String> {
    cdp.enable_domain("Page").await?;
    cdp.enable_domain("Runtime").await?;
    cdp.enable_lifecycle_events().await?;
    cdp.set_user_agent(user_agent).await?;
    Ok(())
}

struct ChromeHandle {
    session: BrowserSession,
    url: String,
    settings: RenderSettings,
    navigations: u64,
    /// Loader of the most recent full document load.
    last_loader: Option<String>,
}

impl ChromeHandle {
    /// Classify a CDP failure: a dead engine is fatal, anything else is `other`.
    fn classify(&mut self, e: String, other: fn(String) -> RenderError) -> RenderError {
        if self.session.is_alive() {
            other(e)
        } else {
            RenderError::EngineLost(e)
        }
    }

    async fn eval(&mut self, expression: &str) -> Result<Value, RenderError> {
        let raw = match self.session.cdp.evaluate_js(expression).await {
            Ok(v) => v,
            Err(e) => return Err(self.classify(e, RenderError::Script)),
        };
        evaluation_value(&raw).map_err(RenderError::Script)
    }

    /// Scroll down in fixed steps until the position stops advancing.
    async fn scroll_to_bottom(&mut self) -> Result<u32, RenderError> {
        let script = scroll_step_script(self.settings.scroll_step_px);
        let mut steps = 0;
        while steps < self.settings.max_scroll_steps {
            let moved = self.eval(&script).await?;
            steps += 1;
            if !moved.as_bool().unwrap_or(false) {
                break;
            }
            tokio::time::sleep(self.settings.scroll_interval).await;
        }
        Ok(steps)
    }
}

#[async_trait]
impl RenderHandle for ChromeHandle {
    async fn navigate(&mut self) -> Result<(), RenderError> {
        self.navigations += 1;
        if self.navigations > 1 {
            // A previous attempt may have been abandoned mid-load by its deadline.
            if let Err(e) = self.session.cdp.stop_loading().await {
                return Err(self.classify(e, RenderError::Navigation));
            }
        }

        let mut lifecycle = self.session.cdp.subscribe_event("Page.lifecycleEvent");
        let started = tokio::time::Instant::now();
        let nav = match self.session.cdp.navigate(&self.url).await {
            Ok(v) => v,
            Err(e) => return Err(self.classify(e, RenderError::Navigation)),
        };
        if let Some(text) = nav.get("errorText").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                return Err(RenderError::Navigation(text.to_string()));
            }
        }
        let frame_id = nav.get("frameId").and_then(|v| v.as_str()).map(str::to_string);
        let loader_id = nav.get("loaderId").and_then(|v| v.as_str()).map(str::to_string);

        // No loader means a same-document navigation (the URL differs from the
        // loaded one only by its fragment). It emits no lifecycle events, so
        // force a full load and wait for whichever loader replaces the old one.
        let stale_loader = match &loader_id {
            Some(id) => {
                self.last_loader = Some(id.clone());
                None
            }
            None => {
                debug!(url = %self.url, "Same-document navigation, reloading");
                if let Err(e) = self.session.cdp.reload().await {
                    return Err(self.classify(e, RenderError::Navigation));
                }
                self.last_loader.clone()
            }
        };

        while let Some(event) = lifecycle.recv().await {
            if !is_network_idle(&event, frame_id.as_deref(), loader_id.as_deref()) {
                continue;
            }
            let event_loader = event.get("loaderId").and_then(|v| v.as_str());
            if stale_loader.is_some() && event_loader == stale_loader.as_deref() {
                continue;
            }
            if loader_id.is_none() {
                self.last_loader = event_loader.map(str::to_string);
            }
            debug!(
                url = %self.url,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Network idle"
            );
            return Ok(());
        }
        // Listener table is cleared when the socket dies.
        Err(RenderError::EngineLost(
            "event stream ended while waiting for network idle".to_string(),
        ))
    }

    async fn extract(&mut self) -> Result<Extraction, RenderError> {
        tokio::time::sleep(self.settings.post_load_pause).await;
        let steps = self.scroll_to_bottom().await?;
        debug!(steps, "Scrolled to bottom");
        tokio::time::sleep(self.settings.settle_pause).await;

        let found = self.eval(&target_query_script()).await?;
        parse_target_query(&found)
    }

    async fn close(self: Box<Self>) {
        info!(url = %self.url, navigations = self.navigations, "Closing render handle");
        self.session.close().await;
    }
}

fn is_network_idle(event: &Value, frame_id: Option<&str>, loader_id: Option<&str>) -> bool {
    if event.get("name").and_then(|v| v.as_str()) != Some("networkIdle") {
        return false;
    }
    let matches = |key: &str, expected: Option<&str>| match expected {
        Some(want) => event.get(key).and_then(|v| v.as_str()) == Some(want),
        None => true,
    };
    matches("frameId", frame_id) && matches("loaderId", loader_id)
}

/// One scroll step; evaluates to `true` if the scroll position advanced.
fn scroll_step_script(step_px: u32) -> String {
    format!(
        "(() => {{ const before = window.scrollY; window.scrollBy(0, {}); return window.scrollY > before; }})()",
        step_px
    )
}

fn target_query_script() -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({selector:?});
  if (!el) return {{ state: "absent" }};
  if (el.classList.contains({hidden:?})) return {{ state: "hidden" }};
  return {{
    state: "visible",
    text: (el.textContent || "").trim(),
    ariaLabel: el.getAttribute("aria-label"),
    dataLink: el.getAttribute("data-link"),
  }};
}})()"#,
        selector = TARGET_SELECTOR,
        hidden = HIDDEN_CLASS,
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetQuery {
    state: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    aria_label: Option<String>,
    #[serde(default)]
    data_link: Option<String>,
}

fn parse_target_query(value: &Value) -> Result<Extraction, RenderError> {
    let query: TargetQuery = serde_json::from_value(value.clone())
        .map_err(|e| RenderError::Script(format!("unexpected target query result {}: {}", value, e)))?;
    match query.state.as_str() {
        "absent" => Ok(Extraction::Absent),
        "hidden" => Ok(Extraction::Hidden),
        "visible" => Ok(Extraction::Found(ElementSnapshot {
            text: query.text.unwrap_or_default().trim().to_string(),
            aria_label: query.aria_label,
            data_link: query.data_link,
        })),
        other => {
            warn!(state = other, "Unknown target state");
            Err(RenderError::Script(format!("unknown target state '{}'", other)))
        }
    }
}
