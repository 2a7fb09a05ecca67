pub mod browser;

pub use browser::{ChromeRenderer, Extraction, PageRenderer, RenderError, RenderHandle};
