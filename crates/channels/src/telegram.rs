use pagewatch_core::config::TelegramConfig;
use pagewatch_core::{Error, InboundMessage, Result};
use reqwest::Client;
use reqwest::Proxy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::rate_limit::OutboundLimiter;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
/// Long-poll window for getUpdates; the HTTP timeout must exceed it.
const POLL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    from: Option<User>,
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

fn build_client(config: &TelegramConfig, timeout: Duration) -> Result<Client> {
    let mut builder = Client::builder().timeout(timeout);
    if let Some(proxy) = config.proxy.as_deref() {
        match Proxy::all(proxy) {
            Ok(p) => {
                builder = builder.proxy(p);
                debug!(proxy = %proxy, "Telegram proxy configured");
            }
            Err(e) => {
                warn!(error = %e, proxy = %proxy, "Invalid Telegram proxy, ignoring");
            }
        }
    }
    builder
        .build()
        .map_err(|e| Error::Channel(format!("Failed to create HTTP client: {}", e)))
}

fn is_allowed(allow_from: &[String], user: &User) -> bool {
    if allow_from.is_empty() {
        return true;
    }
    let user_id = user.id.to_string();
    let username = user.username.as_deref().unwrap_or("");

    allow_from.iter().any(|allowed| {
        allowed
            .split('|')
            .map(|part| part.trim().trim_start_matches('@'))
            .any(|part| part == user_id || (!username.is_empty() && part == username))
    })
}

/// Long-polling receiver for operator commands.
pub struct TelegramChannel {
    config: TelegramConfig,
    client: Client,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig, inbound_tx: mpsc::Sender<InboundMessage>) -> Result<Self> {
        let client = build_client(&config, Duration::from_secs(POLL_TIMEOUT_SECS + 30))?;
        Ok(Self {
            config,
            client,
            inbound_tx,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", TELEGRAM_API_BASE, self.config.token, method)
    }

    async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>> {
        let mut params = vec![
            ("timeout", POLL_TIMEOUT_SECS.to_string()),
            ("allowed_updates", "[\"message\"]".to_string()),
        ];
        if let Some(off) = offset {
            params.push(("offset", off.to_string()));
        }

        let response = self
            .client
            .get(self.api_url("getUpdates"))
            .query(&params)
            .send()
            .await
            .map_err(|e| Error::Channel(format!("Telegram request failed: {}", e)))?;

        let telegram_response: TelegramResponse<Vec<Update>> = response
            .json()
            .await
            .map_err(|e| Error::Channel(format!("Failed to parse Telegram response: {}", e)))?;

        if !telegram_response.ok {
            return Err(Error::Channel(
                telegram_response
                    .description
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }

        Ok(telegram_response.result.unwrap_or_default())
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            info!("Telegram channel disabled");
            return;
        }
        if self.config.token.is_empty() {
            warn!("Telegram token not configured");
            return;
        }

        info!("Telegram channel started");
        let mut offset: Option<i64> = None;

        loop {
            tokio::select! {
                result = self.get_updates(offset) => {
                    match result {
                        Ok(updates) => {
                            for update in updates {
                                offset = Some(update.update_id + 1);
                                if let Some(message) = update.message {
                                    if let Err(e) = self.handle_message(message).await {
                                        error!(error = %e, "Failed to handle Telegram message");
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to get Telegram updates");
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                                _ = shutdown.recv() => break,
                            }
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Telegram channel shutting down");
    }

    async fn handle_message(&self, message: Message) -> Result<()> {
        match self.to_inbound(message) {
            Some(inbound) => self
                .inbound_tx
                .send(inbound)
                .await
                .map_err(|e| Error::Channel(e.to_string())),
            None => Ok(()),
        }
    }

    /// Text messages from allowed users become inbound commands; everything
    /// else is dropped.
    fn to_inbound(&self, message: Message) -> Option<InboundMessage> {
        let user = message.from.as_ref()?;
        if !is_allowed(&self.config.allow_from, user) {
            debug!(user_id = user.id, "User not in allowlist, ignoring");
            return None;
        }
        let text = message.text.as_deref().map(str::trim).unwrap_or("");
        if text.is_empty() {
            return None;
        }

        let mut inbound = InboundMessage::new(
            "telegram",
            &user.id.to_string(),
            &message.chat.id.to_string(),
            text,
        );
        inbound.metadata = serde_json::json!({
            "message_id": message.message_id,
            "username": user.username,
        });
        Some(inbound)
    }
}

/// Sends replies through the Bot API, paced by an [`OutboundLimiter`].
pub struct TelegramSender {
    client: Client,
    token: String,
    limiter: OutboundLimiter,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

impl TelegramSender {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config, Duration::from_secs(30))?,
            token: config.token.clone(),
            limiter: OutboundLimiter::telegram(),
        })
    }

    /// Send plain text; URLs in watch results would break Markdown parsing.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        self.limiter.acquire(chat_id).await;

        let url = format!("{}/bot{}/sendMessage", TELEGRAM_API_BASE, self.token);
        let request = SendMessageRequest {
            chat_id,
            text,
            disable_web_page_preview: true,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Channel(format!("Failed to send Telegram message: {}", e)))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Channel(format!("Telegram API error: {}", text)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64, username: Option<&str>) -> User {
        User {
            id,
            username: username.map(str::to_string),
        }
    }

    fn channel(allow_from: Vec<&str>) -> (TelegramChannel, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(4);
        let config = TelegramConfig {
            enabled: true,
            token: "123:abc".into(),
            allow_from: allow_from.into_iter().map(String::from).collect(),
            proxy: None,
        };
        (TelegramChannel::new(config, tx).unwrap(), rx)
    }

    #[test]
    fn test_allowlist() {
        assert!(is_allowed(&[], &user(1, None)));

        let allow = vec!["42".to_string(), "@alice|77".to_string()];
        assert!(is_allowed(&allow, &user(42, None)));
        assert!(is_allowed(&allow, &user(77, None)));
        assert!(is_allowed(&allow, &user(5, Some("alice"))));
        assert!(!is_allowed(&allow, &user(5, Some("bob"))));
        assert!(!is_allowed(&allow, &user(5, None)));
    }

    #[test]
    fn test_update_parsing() {
        let body = r#"{"ok":true,"result":[
            {"update_id":10,"message":{"message_id":3,"from":{"id":7,"username":"op"},
             "chat":{"id":-100},"text":"/scrape https://a.example.com"}},
            {"update_id":11,"edited_message":{}}
        ]}"#;
        let parsed: TelegramResponse<Vec<Update>> = serde_json::from_str(body).unwrap();
        assert!(parsed.ok);
        let updates = parsed.result.unwrap();
        assert_eq!(updates.len(), 2);
        assert!(updates[1].message.is_none());
        let msg = updates[0].message.as_ref().unwrap();
        assert_eq!(msg.chat.id, -100);
        assert_eq!(msg.text.as_deref(), Some("/scrape https://a.example.com"));
    }

    #[test]
    fn test_to_inbound() {
        let (channel, _rx) = channel(vec!["7"]);
        let message = Message {
            message_id: 3,
            from: Some(user(7, Some("op"))),
            chat: Chat { id: -100 },
            text: Some("  /stop ".into()),
        };
        let inbound = channel.to_inbound(message).unwrap();
        assert_eq!(inbound.session_key(), "telegram:-100");
        assert_eq!(inbound.sender_id, "7");
        assert_eq!(inbound.content, "/stop");
        assert_eq!(inbound.metadata["username"], "op");

        let stranger = Message {
            message_id: 4,
            from: Some(user(8, None)),
            chat: Chat { id: -100 },
            text: Some("/stop".into()),
        };
        assert!(channel.to_inbound(stranger).is_none());

        let photo_only = Message {
            message_id: 5,
            from: Some(user(7, None)),
            chat: Chat { id: -100 },
            text: None,
        };
        assert!(channel.to_inbound(photo_only).is_none());
    }

    #[tokio::test]
    async fn test_handle_message_forwards() {
        let (channel, mut rx) = channel(vec![]);
        channel
            .handle_message(Message {
                message_id: 1,
                from: Some(user(9, None)),
                chat: Chat { id: 9 },
                text: Some("/start".into()),
            })
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().content, "/start");
    }

    #[test]
    fn test_api_url_and_request_body() {
        let (channel, _rx) = channel(vec![]);
        assert_eq!(
            channel.api_url("getUpdates"),
            "https://api.telegram.org/bot123:abc/getUpdates"
        );
        let body = serde_json::to_value(SendMessageRequest {
            chat_id: "42",
            text: "see https://a.example.com/x_y",
            disable_web_page_preview: true,
        })
        .unwrap();
        assert!(body.get("parse_mode").is_none());
        assert_eq!(body["chat_id"], "42");
    }

    #[tokio::test]
    async fn test_disabled_channel_returns() {
        let (tx, _rx) = mpsc::channel(1);
        let channel = Arc::new(TelegramChannel::new(TelegramConfig::default(), tx).unwrap());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        channel.run_loop(shutdown_rx).await;
    }
}
