//! CDP-based page rendering.
//!
//! - `cdp`: Chrome DevTools Protocol client over WebSocket
//! - `session`: one browser process + profile per watch session
//! - `renderer`: navigation, lazy-content scrolling, target extraction

pub mod cdp;
pub mod renderer;
pub mod session;

pub use renderer::{
    ChromeRenderer, Extraction, PageRenderer, RenderError, RenderHandle, RenderSettings,
    HIDDEN_CLASS, TARGET_SELECTOR,
};
pub use session::{find_browser_binary, BrowserSession, LaunchOptions};
