use pagewatch_core::config::ChannelsConfig;
use pagewatch_core::{OutboundMessage, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::telegram::TelegramSender;

/// Routes outbound messages to the channel they belong to.
pub struct ChannelManager {
    telegram: Option<TelegramSender>,
}

impl ChannelManager {
    pub fn new(config: &ChannelsConfig) -> Result<Self> {
        let telegram = if config.telegram.enabled && !config.telegram.token.is_empty() {
            Some(TelegramSender::new(&config.telegram)?)
        } else {
            None
        };
        Ok(Self { telegram })
    }

    pub async fn start_outbound_dispatcher(&self, mut outbound_rx: mpsc::Receiver<OutboundMessage>) {
        info!("Outbound dispatcher started");

        while let Some(msg) = outbound_rx.recv().await {
            if let Err(e) = self.dispatch_outbound_msg(&msg).await {
                error!(error = %e, channel = %msg.channel, "Failed to dispatch outbound message");
            }
        }

        info!("Outbound dispatcher stopped");
    }

    pub async fn dispatch_outbound_msg(&self, msg: &OutboundMessage) -> Result<()> {
        match msg.channel.as_str() {
            "telegram" => match &self.telegram {
                Some(sender) => sender.send_message(&msg.chat_id, &msg.content).await?,
                None => warn!("Telegram reply dropped, channel not configured"),
            },
            "cli" => info!(chat_id = %msg.chat_id, "{}", msg.content),
            _ => warn!(channel = %msg.channel, "Unknown channel for outbound message"),
        }
        Ok(())
    }

    /// Whether replies can reach Telegram.
    pub fn telegram_enabled(&self) -> bool {
        self.telegram.is_some()
    }
}
