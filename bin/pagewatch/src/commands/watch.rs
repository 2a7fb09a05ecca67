use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pagewatch_agent::{format_outcome, WatchSession, WatchSettings};
use pagewatch_core::{Config, Outcome, Paths, WatchRequest};
use pagewatch_tools::ChromeRenderer;

/// Run a single watch in the foreground. Ctrl-C cancels it.
pub async fn run(url: &str) -> anyhow::Result<()> {
    let request = WatchRequest::parse(url)?;
    let paths = Paths::new();
    let config = Config::resolve(&paths)?;
    paths.ensure_dirs()?;

    let renderer = ChromeRenderer::from_config(&config.watch, &config.browser, paths.profiles_dir());
    let session = WatchSession::new(Arc::new(renderer), WatchSettings::from_config(&config.watch));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current attempt");
            on_signal.cancel();
        }
    });

    let report = session.run(&request, &cancel).await;
    println!("{}", format_outcome(&request, &report));

    match report.outcome {
        Outcome::Failed(reason) => Err(anyhow::anyhow!(reason.to_string())),
        Outcome::Found(_) | Outcome::Cancelled => Ok(()),
    }
}
