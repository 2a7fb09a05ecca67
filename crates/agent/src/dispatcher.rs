//! Turns operator commands into watch sessions and replies.
//!
//! Each admitted `/scrape` runs as its own task holding a [`SessionLease`].
//! The lease is dropped before the final message goes out, so by the time
//! the operator reads the outcome the conversation can start a new watch.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use pagewatch_core::{Error, InboundMessage, Outcome, OutboundMessage, WatchRequest};

use crate::command::{greeting, Command, USAGE};
use crate::registry::{AdmissionError, SessionLease, SessionRegistry};
use crate::watch::{WatchReport, WatchSession};

/// How long shutdown waits for cancelled sessions to close their browsers.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WatchDispatcher {
    registry: Arc<dyn SessionRegistry>,
    session: Arc<WatchSession>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    drain_timeout: Duration,
}

impl WatchDispatcher {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        session: WatchSession,
        outbound_tx: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        Self {
            registry,
            session: Arc::new(session),
            outbound_tx,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub async fn run_loop(
        &self,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
        mut shutdown_rx: Option<broadcast::Receiver<()>>,
    ) {
        info!("Watch dispatcher started");
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = async {
                    if let Some(ref mut rx) = shutdown_rx {
                        let _ = rx.recv().await;
                    } else {
                        std::future::pending::<()>().await;
                    }
                } => {
                    break;
                }
                msg = inbound_rx.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg, &mut sessions).await,
                        None => break,
                    }
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Watch task panicked");
                    }
                }
            }
        }

        self.drain(&mut sessions).await;
        info!("Watch dispatcher stopped");
    }

    /// Cancel every running watch and wait for the sessions to wind down.
    async fn drain(&self, sessions: &mut JoinSet<()>) {
        if sessions.is_empty() {
            return;
        }
        let signalled = self.registry.cancel_all();
        info!(
            sessions = sessions.len(),
            signalled,
            "Cancelling active watches for shutdown"
        );
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = sessions.len(),
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "Watches did not stop in time, aborting"
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }
    }

    /// Handle one inbound message. Admitted watches are spawned onto `sessions`.
    pub async fn handle(&self, msg: InboundMessage, sessions: &mut JoinSet<()>) {
        let conversation = msg.session_key();
        let command = Command::parse(&msg.content);
        debug!(conversation = %conversation, command = ?command, "Inbound command");

        match command {
            Command::Start => self.reply(&msg, &greeting()).await,
            Command::Help => self.reply(&msg, USAGE).await,
            Command::Unknown(word) => {
                let text = if word.is_empty() {
                    USAGE.to_string()
                } else {
                    format!("Unknown command: {}\n\n{}", word, USAGE)
                };
                self.reply(&msg, &text).await
            }
            Command::Scrape(raw) => self.start_watch(&msg, &conversation, &raw, sessions).await,
            Command::Stop => {
                let text = match self.registry.cancel(&conversation) {
                    Ok(()) => "Stopping the watch. I'll confirm once it has shut down.",
                    Err(_) => "There is no active watch to stop.",
                };
                self.reply(&msg, text).await
            }
            Command::Status => {
                let text = match self.registry.active(&conversation) {
                    Some(active) if active.cancel_requested => {
                        format!("Stopping the watch of {}.", active.url)
                    }
                    Some(active) => format!(
                        "Watching {} since {}.",
                        active.url,
                        active.started_at.format("%Y-%m-%d %H:%M:%S UTC")
                    ),
                    None => "No active watch.".to_string(),
                };
                self.reply(&msg, &text).await
            }
        }
    }

    async fn start_watch(
        &self,
        msg: &InboundMessage,
        conversation: &str,
        raw: &str,
        sessions: &mut JoinSet<()>,
    ) {
        if raw.is_empty() {
            return self.reply(msg, "Usage: /scrape <url>").await;
        }
        let request = match WatchRequest::parse(raw) {
            Ok(request) => request,
            Err(e) => {
                info!(conversation, error = %e, "Rejected watch request");
                let reason = match e {
                    Error::Validation(reason) => reason,
                    other => other.to_string(),
                };
                return self.reply(msg, &format!("Invalid URL: {}", reason)).await;
            }
        };
        let lease = match SessionLease::acquire(self.registry.clone(), conversation, &request) {
            Ok(lease) => lease,
            Err(AdmissionError::AlreadyActive(_)) => {
                return self
                    .reply(
                        msg,
                        "A watch is already running in this chat. Send /stop to cancel it first.",
                    )
                    .await;
            }
        };

        self.reply(
            msg,
            &format!(
                "Watching {}. I'll message you as soon as the button is visible.",
                request
            ),
        )
        .await;

        let session = self.session.clone();
        let outbound_tx = self.outbound_tx.clone();
        let channel = msg.channel.clone();
        let chat_id = msg.chat_id.clone();
        sessions.spawn(async move {
            let report = session.run(&request, lease.token()).await;
            info!(
                conversation = %lease.conversation(),
                outcome = report.outcome.label(),
                attempts = report.attempts,
                "Watch session ended"
            );
            drop(lease);

            let text = format_outcome(&request, &report);
            if let Err(e) = outbound_tx
                .send(OutboundMessage::new(&channel, &chat_id, &text))
                .await
            {
                warn!(error = %e, "Could not deliver watch outcome");
            }
        });
    }

    async fn reply(&self, to: &InboundMessage, text: &str) {
        if let Err(e) = self.outbound_tx.send(OutboundMessage::reply(to, text)).await {
            warn!(error = %e, "Outbound queue closed");
        }
    }
}

/// Human-readable final message for a finished watch.
pub fn format_outcome(request: &WatchRequest, report: &WatchReport) -> String {
    match &report.outcome {
        Outcome::Found(snapshot) => format!(
            "Found the button on {} after {} attempt{}.\nText: {}\nLabel: {}\nLink: {}",
            request,
            report.attempts,
            if report.attempts == 1 { "" } else { "s" },
            display_or_none(&snapshot.text),
            snapshot.aria_label.as_deref().map(display_or_none).unwrap_or("(none)"),
            snapshot.data_link.as_deref().map(display_or_none).unwrap_or("(none)"),
        ),
        Outcome::Cancelled => format!("Watch of {} cancelled.", request),
        Outcome::Failed(reason) => format!("Watch of {} failed: {}", request, reason),
    }
}

fn display_or_none(s: &str) -> &str {
    if s.trim().is_empty() {
        "(none)"
    } else {
        s
    }
}
