use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::error::{Error, Result};

/// What one watch session polls. Immutable once the session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    url: Url,
}

impl WatchRequest {
    /// Parse and validate an operator-supplied URL.
    ///
    /// Only absolute `http`/`https` URLs with a host are accepted; anything
    /// else is a validation error and no session may be created for it.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Validation("missing URL".to_string()));
        }
        let url = Url::parse(raw)
            .map_err(|e| Error::Validation(format!("invalid URL '{}': {}", raw, e)))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::Validation(format!(
                    "unsupported URL scheme '{}', expected http or https",
                    other
                )))
            }
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(Error::Validation(format!("URL '{}' has no host", raw)));
        }
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for WatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Extracted state of the target element, taken only while it is visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSnapshot {
    pub text: String,
    pub aria_label: Option<String>,
    pub data_link: Option<String>,
}

/// Why a session ended without finding the element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The rendering engine could not be started at all.
    EngineLaunch(String),
    /// The engine went away mid-session (process exit, protocol connection closed).
    EngineLost(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::EngineLaunch(e) => write!(f, "browser failed to launch: {}", e),
            FailureReason::EngineLost(e) => write!(f, "browser connection lost: {}", e),
        }
    }
}

/// Terminal result of a watch session. Exactly one per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Found(ElementSnapshot),
    Cancelled,
    Failed(FailureReason),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Found(_) => "found",
            Outcome::Cancelled => "cancelled",
            Outcome::Failed(_) => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_absolute_http_urls() {
        let req = WatchRequest::parse("  https://shop.example.com/item/7 ").unwrap();
        assert_eq!(req.url().host_str(), Some("shop.example.com"));
        assert_eq!(req.to_string(), "https://shop.example.com/item/7");
        assert!(WatchRequest::parse("http://localhost:8080").is_ok());
    }

    #[test]
    fn test_parse_rejects_relative_and_garbage() {
        for raw in ["", "   ", "example.com/page", "/relative/path", "not a url"] {
            let err = WatchRequest::parse(raw).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{raw:?} gave {err:?}");
        }
    }

    #[test]
    fn test_parse_rejects_non_web_schemes() {
        for raw in ["ftp://example.com/file", "file:///etc/passwd", "javascript:alert(1)"] {
            assert!(matches!(WatchRequest::parse(raw), Err(Error::Validation(_))));
        }
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = Outcome::Found(ElementSnapshot {
            text: "Book now".into(),
            aria_label: Some("Book".into()),
            data_link: None,
        });
        let v = serde_json::to_value(&outcome).unwrap();
        assert_eq!(v["status"], "found");
        assert_eq!(v["ariaLabel"], "Book");
        assert_eq!(Outcome::Cancelled.label(), "cancelled");
    }

    #[test]
    fn test_failure_reason_display() {
        let r = FailureReason::EngineLaunch("chrome not found".into());
        assert_eq!(r.to_string(), "browser failed to launch: chrome not found");
    }
}
