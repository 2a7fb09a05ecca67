//! Browser process lifecycle.
//!
//! Each watch session gets its own Chrome process with a throwaway profile
//! directory, connected over CDP to its first page target.

use super::cdp::CdpClient;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// How to launch a browser instance.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Explicit binary path; searched for when `None`.
    pub binary: Option<String>,
    pub headless: bool,
    pub launch_timeout: Duration,
    /// Parent directory for the per-session profile.
    pub profiles_dir: PathBuf,
}

/// A running browser with its CDP connection.
pub struct BrowserSession {
    /// Remote debugging port.
    pub debug_port: u16,
    /// Browser child process.
    chrome_process: Child,
    /// CDP WebSocket client (page target).
    pub cdp: CdpClient,
    /// Profile directory, removed when the session is dropped.
    profile: TempDir,
}

impl BrowserSession {
    /// Launch a browser instance and connect to its page target via CDP.
    pub async fn launch(options: &LaunchOptions) -> Result<Self, String> {
        let browser_path = match &options.binary {
            Some(path) => path.clone(),
            None => find_browser_binary()
                .ok_or_else(|| "Chrome/Chromium not found. Please install it or set browser.binary".to_string())?,
        };

        std::fs::create_dir_all(&options.profiles_dir)
            .map_err(|e| format!("Failed to create profiles dir: {}", e))?;
        let profile = tempfile::Builder::new()
            .prefix("session-")
            .tempdir_in(&options.profiles_dir)
            .map_err(|e| format!("Failed to create user data dir: {}", e))?;

        let debug_port = find_free_port().await?;
        let args = build_browser_args(debug_port, profile.path(), options.headless);

        info!(
            port = debug_port,
            headless = options.headless,
            browser = %browser_path,
            "Launching browser"
        );

        let mut child = Command::new(&browser_path)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to launch {}: {}", browser_path, e))?;

        wait_for_cdp_ready(&mut child, debug_port, options.launch_timeout).await?;

        // Connect to the page target (not browser-level) so Page.enable etc. work
        let page_ws_url = get_page_ws_url(debug_port).await?;
        let cdp = CdpClient::connect(&page_ws_url).await?;

        info!(ws_url = %page_ws_url, "CDP connection established (page target)");

        Ok(Self {
            debug_port,
            chrome_process: child,
            cdp,
            profile,
        })
    }

    /// Wrap an already running process and connection.
    #[cfg(test)]
    pub(crate) fn attach(cdp: CdpClient, chrome_process: Child, profile: TempDir) -> Self {
        Self {
            debug_port: 0,
            chrome_process,
            cdp,
            profile,
        }
    }

    pub fn profile_dir(&self) -> &Path {
        self.profile.path()
    }

    /// Whether both the process and its CDP socket are still up.
    pub fn is_alive(&mut self) -> bool {
        let exited = matches!(self.chrome_process.try_wait(), Ok(Some(_)));
        !exited && self.cdp.is_connected()
    }

    /// Close the browser: graceful CDP close, then kill and reap the process.
    /// The profile directory is removed when `self` drops.
    pub async fn close(mut self) {
        if self.cdp.is_connected() {
            if let Err(e) = self.cdp.close_browser().await {
                debug!("CDP Browser.close failed (may already be closed): {}", e);
            }
        }
        let _ = self.chrome_process.kill().await;
        debug!(port = self.debug_port, "Browser closed");
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        // Best-effort kill on drop
        let _ = self.chrome_process.start_kill();
    }
}

/// Chrome command line for an isolated, non-interactive instance.
fn build_browser_args(debug_port: u16, user_data_dir: &Path, headless: bool) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--metrics-recording-only".to_string(),
        "--password-store=basic".to_string(),
    ];
    if headless {
        args.push("--headless=new".to_string());
    }
    args.push("--window-size=1280,720".to_string());
    args.push("about:blank".to_string());
    args
}

/// Find a Chrome-family browser binary on the system.
pub fn find_browser_binary() -> Option<String> {
    let candidates = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else if cfg!(target_os = "linux") {
        vec![
            "google-chrome", "google-chrome-stable",
            "chromium", "chromium-browser",
            "/usr/bin/google-chrome", "/usr/bin/chromium",
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
        if !candidate.contains('/') && !candidate.contains('\\') && which::which(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

/// Find a free TCP port.
async fn find_free_port() -> Result<u16, String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| format!("Failed to bind to find free port: {}", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| format!("Failed to get local addr: {}", e))?
        .port();
    drop(listener);
    Ok(port)
}

/// Wait for Chrome's CDP endpoint to become available.
/// Polls /json/version until it responds, the process exits, or `timeout` passes.
async fn wait_for_cdp_ready(child: &mut Child, port: u16, timeout: Duration) -> Result<String, String> {
    let start = Instant::now();
    let url = format!("http://127.0.0.1:{}/json/version", port);

    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(format!("Browser exited during startup ({})", status));
        }
        if start.elapsed() > timeout {
            return Err(format!(
                "Chrome CDP not ready after {}s on port {}",
                timeout.as_secs(),
                port
            ));
        }

        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(body) = resp.json::<Value>().await {
                if let Some(ws_url) = body.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) {
                    return Ok(ws_url.to_string());
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Resolve the WebSocket URL of the first "page" target via /json/list.
/// Retries a few times since the page target may not appear immediately.
pub async fn get_page_ws_url(port: u16) -> Result<String, String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);

    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        let resp = match reqwest::get(&url).await {
            Ok(r) => r,
            Err(_) => continue,
        };
        let targets: Vec<Value> = match resp.json().await {
            Ok(t) => t,
            Err(_) => continue,
        };

        if let Some(ws_url) = first_page_ws_url(&targets) {
            return Ok(ws_url);
        }
    }

    Err("No page target found after retries".to_string())
}

fn first_page_ws_url(targets: &[Value]) -> Option<String> {
    targets
        .iter()
        .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
        .find_map(|t| t.get("webSocketDebuggerUrl").and_then(|v| v.as_str()))
        .map(str::to_string)
}
