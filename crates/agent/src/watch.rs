//! The watch session: poll one page until the target element shows up.
//!
//! States run `Starting -> Polling -> {Found, Cancelled, Failed}`. Each polling
//! iteration checks cancellation, navigates under a deadline, extracts, and
//! decides whether to finish or sleep and go again. There is no attempt limit;
//! only success, cancellation, or a fatal engine failure ends the loop. The
//! render handle is closed exactly once on the way out.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pagewatch_core::config::WatchConfig;
use pagewatch_core::{with_deadline, DeadlineExceeded, FailureReason, Outcome, WatchRequest};
use pagewatch_tools::{Extraction, PageRenderer, RenderError, RenderHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSettings {
    pub retry_interval: Duration,
    pub navigation_timeout: Duration,
}

impl WatchSettings {
    pub fn from_config(config: &WatchConfig) -> Self {
        Self {
            retry_interval: config.retry_interval(),
            navigation_timeout: config.navigation_timeout(),
        }
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self::from_config(&WatchConfig::default())
    }
}

/// Why one polling attempt produced no snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    #[error(transparent)]
    NavigationTimeout(#[from] DeadlineExceeded),
    #[error("navigation: {0}")]
    Navigation(RenderError),
    #[error("extraction: {0}")]
    Extraction(RenderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Fatal,
}

impl AttemptError {
    pub fn disposition(&self) -> Disposition {
        match self {
            AttemptError::NavigationTimeout(_) => Disposition::Retry,
            AttemptError::Navigation(e) | AttemptError::Extraction(e) => {
                if e.is_fatal() {
                    Disposition::Fatal
                } else {
                    Disposition::Retry
                }
            }
        }
    }
}

/// What to do after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    KeepPolling,
    Finish(Outcome),
}

/// Map one attempt's result to the next step of the state machine.
pub fn decide(result: &Result<Extraction, AttemptError>) -> Decision {
    match result {
        Ok(Extraction::Found(snapshot)) => Decision::Finish(Outcome::Found(snapshot.clone())),
        Ok(Extraction::Absent) | Ok(Extraction::Hidden) => Decision::KeepPolling,
        Err(e) => match e.disposition() {
            Disposition::Retry => Decision::KeepPolling,
            Disposition::Fatal => Decision::Finish(Outcome::Failed(failure_reason(e))),
        },
    }
}

fn failure_reason(e: &AttemptError) -> FailureReason {
    match e {
        AttemptError::Navigation(RenderError::Launch(m))
        | AttemptError::Extraction(RenderError::Launch(m)) => FailureReason::EngineLaunch(m.clone()),
        other => FailureReason::EngineLost(other.to_string()),
    }
}

/// Terminal outcome plus how many navigation attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchReport {
    pub outcome: Outcome,
    pub attempts: u64,
}

pub struct WatchSession {
    renderer: Arc<dyn PageRenderer>,
    settings: WatchSettings,
}

impl WatchSession {
    pub fn new(renderer: Arc<dyn PageRenderer>, settings: WatchSettings) -> Self {
        Self { renderer, settings }
    }

    pub async fn run(&self, request: &WatchRequest, cancel: &CancellationToken) -> WatchReport {
        info!(url = %request, "Watch starting");
        let mut handle = match self.renderer.open(request).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(url = %request, error = %e, "Could not open renderer");
                let reason = match e {
                    RenderError::Launch(m) => FailureReason::EngineLaunch(m),
                    other => FailureReason::EngineLaunch(other.to_string()),
                };
                return WatchReport {
                    outcome: Outcome::Failed(reason),
                    attempts: 0,
                };
            }
        };

        let mut attempts = 0u64;
        let outcome = loop {
            if cancel.is_cancelled() {
                info!(url = %request, attempts, "Watch cancelled");
                break Outcome::Cancelled;
            }

            attempts += 1;
            info!(
                url = %request,
                attempt = attempts,
                at = %chrono::Utc::now().to_rfc3339(),
                "Watch attempt"
            );

            let result = self.attempt(&mut *handle).await;
            match &result {
                Ok(extraction) => debug!(attempt = attempts, result = extraction.describe(), "Target checked"),
                Err(e) => warn!(attempt = attempts, error = %e, "Watch attempt failed"),
            }

            match decide(&result) {
                Decision::Finish(outcome) => {
                    info!(url = %request, attempts, outcome = outcome.label(), "Watch finished");
                    break outcome;
                }
                Decision::KeepPolling => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.retry_interval) => {}
                _ = cancel.cancelled() => debug!("Cancellation observed during retry wait"),
            }
        };

        handle.close().await;
        WatchReport { outcome, attempts }
    }

    async fn attempt(&self, handle: &mut dyn RenderHandle) -> Result<Extraction, AttemptError> {
        with_deadline(handle.navigate(), self.settings.navigation_timeout, "navigation")
            .await?
            .map_err(AttemptError::Navigation)?;
        handle.extract().await.map_err(AttemptError::Extraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pagewatch_core::ElementSnapshot;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// One scripted attempt.
    #[derive(Clone)]
    enum Step {
        Extract(Extraction),
        NavHang,
        NavFail(RenderError),
        ExtractFail(RenderError),
    }

    #[derive(Default)]
    struct Counters {
        opens: AtomicUsize,
        navigations: AtomicUsize,
        closes: AtomicUsize,
    }

    struct FakeRenderer {
        launch_error: Option<RenderError>,
        steps: Arc<Mutex<VecDeque<Step>>>,
        /// Repeated once the script runs out.
        fallback: Step,
        counters: Arc<Counters>,
        /// Cancelled right after the n-th extraction (1-based).
        cancel_after_extract: Option<(usize, CancellationToken)>,
    }

    impl FakeRenderer {
        fn new(steps: Vec<Step>, fallback: Step) -> Self {
            Self {
                launch_error: None,
                steps: Arc::new(Mutex::new(steps.into())),
                fallback,
                counters: Arc::new(Counters::default()),
                cancel_after_extract: None,
            }
        }
    }

    struct FakeHandle {
        steps: Arc<Mutex<VecDeque<Step>>>,
        fallback: Step,
        current: Option<Step>,
        counters: Arc<Counters>,
        extracts: usize,
        cancel_after_extract: Option<(usize, CancellationToken)>,
    }

    #[async_trait]
    impl PageRenderer for FakeRenderer {
        async fn open(&self, _request: &WatchRequest) -> Result<Box<dyn RenderHandle>, RenderError> {
            self.counters.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = &self.launch_error {
                return Err(e.clone());
            }
            Ok(Box::new(FakeHandle {
                steps: self.steps.clone(),
                fallback: self.fallback.clone(),
                current: None,
                counters: self.counters.clone(),
                extracts: 0,
                cancel_after_extract: self.cancel_after_extract.clone(),
            }))
        }
    }

    #[async_trait]
    impl RenderHandle for FakeHandle {
        async fn navigate(&mut self) -> Result<(), RenderError> {
            self.counters.navigations.fetch_add(1, Ordering::SeqCst);
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            self.current = Some(step.clone());
            match step {
                Step::NavHang => std::future::pending().await,
                Step::NavFail(e) => Err(e),
                _ => Ok(()),
            }
        }

        async fn extract(&mut self) -> Result<Extraction, RenderError> {
            self.extracts += 1;
            if let Some((n, token)) = &self.cancel_after_extract {
                if self.extracts == *n {
                    token.cancel();
                }
            }
            match self.current.take() {
                Some(Step::Extract(x)) => Ok(x),
                Some(Step::ExtractFail(e)) => Err(e),
                _ => panic!("extract called without a successful navigation"),
            }
        }

        async fn close(self: Box<Self>) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn snapshot(text: &str) -> ElementSnapshot {
        ElementSnapshot {
            text: text.to_string(),
            aria_label: Some(format!("{} label", text)),
            data_link: Some(format!("/go/{}", text)),
        }
    }

    fn request() -> WatchRequest {
        WatchRequest::parse("https://tickets.example.com/event/1").unwrap()
    }

    fn session(renderer: FakeRenderer) -> (WatchSession, Arc<Counters>) {
        let counters = renderer.counters.clone();
        let settings = WatchSettings {
            retry_interval: Duration::from_millis(5000),
            navigation_timeout: Duration::from_millis(30000),
        };
        (WatchSession::new(Arc::new(renderer), settings), counters)
    }

    #[tokio::test(start_paused = true)]
    async fn test_found_on_third_attempt() {
        let renderer = FakeRenderer::new(
            vec![
                Step::Extract(Extraction::Absent),
                Step::Extract(Extraction::Absent),
                Step::Extract(Extraction::Found(snapshot("third"))),
            ],
            Step::Extract(Extraction::Found(snapshot("never"))),
        );
        let (session, counters) = session(renderer);
        let report = session.run(&request(), &CancellationToken::new()).await;

        assert_eq!(report.outcome, Outcome::Found(snapshot("third")));
        assert_eq!(report.attempts, 3);
        assert_eq!(counters.navigations.load(Ordering::SeqCst), 3);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_element_never_found() {
        let renderer = FakeRenderer::new(vec![], Step::Extract(Extraction::Hidden));
        let (session, counters) = session(renderer);
        let session = Arc::new(session);
        let token = CancellationToken::new();

        let task = {
            let session = session.clone();
            let token = token.clone();
            tokio::spawn(async move { session.run(&request(), &token).await })
        };
        // Ten retry intervals' worth of virtual time.
        tokio::time::sleep(Duration::from_millis(50_500)).await;
        assert!(!task.is_finished());
        assert!(counters.navigations.load(Ordering::SeqCst) >= 10);

        token.cancel();
        let report = task.await.unwrap();
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_between_attempts_stops_navigation() {
        let token = CancellationToken::new();
        let mut renderer = FakeRenderer::new(vec![], Step::Extract(Extraction::Absent));
        renderer.cancel_after_extract = Some((2, token.clone()));
        let (session, counters) = session(renderer);

        let report = session.run(&request(), &token).await;
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(report.attempts, 2);
        assert_eq!(counters.navigations.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_makes_no_attempt() {
        let renderer = FakeRenderer::new(vec![], Step::Extract(Extraction::Absent));
        let (session, counters) = session(renderer);
        let token = CancellationToken::new();
        token.cancel();

        let report = session.run(&request(), &token).await;
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(report.attempts, 0);
        assert_eq!(counters.navigations.load(Ordering::SeqCst), 0);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wakes_retry_sleep() {
        let renderer = FakeRenderer::new(vec![], Step::Extract(Extraction::Absent));
        let (session, _counters) = session(renderer);
        let token = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                token.cancel();
            })
        };
        let report = session.run(&request(), &token).await;
        canceller.await.unwrap();

        assert_eq!(report.outcome, Outcome::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_navigation_times_out_and_retries() {
        let renderer = FakeRenderer::new(
            vec![Step::NavHang, Step::Extract(Extraction::Found(snapshot("after")))],
            Step::Extract(Extraction::Absent),
        );
        let (session, counters) = session(renderer);
        let started = tokio::time::Instant::now();

        let report = session.run(&request(), &CancellationToken::new()).await;
        let elapsed = started.elapsed();

        assert_eq!(report.outcome, Outcome::Found(snapshot("after")));
        assert_eq!(report.attempts, 2);
        assert_eq!(counters.navigations.load(Ordering::SeqCst), 2);
        // One navigation timeout plus one retry interval, give or take scheduling.
        assert!(elapsed >= Duration::from_millis(35_000));
        assert!(elapsed < Duration::from_millis(35_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let renderer = FakeRenderer::new(
            vec![
                Step::NavFail(RenderError::Navigation("net::ERR_CONNECTION_RESET".into())),
                Step::ExtractFail(RenderError::Script("document not ready".into())),
                Step::Extract(Extraction::Found(snapshot("ok"))),
            ],
            Step::Extract(Extraction::Absent),
        );
        let (session, counters) = session(renderer);
        let report = session.run(&request(), &CancellationToken::new()).await;
        assert_eq!(report.outcome, Outcome::Found(snapshot("ok")));
        assert_eq!(report.attempts, 3);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_failure_is_immediate() {
        let mut renderer = FakeRenderer::new(vec![], Step::Extract(Extraction::Absent));
        renderer.launch_error = Some(RenderError::Launch("chrome not found".into()));
        let (session, counters) = session(renderer);
        let started = tokio::time::Instant::now();

        let report = session.run(&request(), &CancellationToken::new()).await;
        assert_eq!(
            report.outcome,
            Outcome::Failed(FailureReason::EngineLaunch("chrome not found".into()))
        );
        assert_eq!(report.attempts, 0);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
        assert_eq!(counters.navigations.load(Ordering::SeqCst), 0);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_lost_mid_session_fails() {
        let renderer = FakeRenderer::new(
            vec![
                Step::Extract(Extraction::Absent),
                Step::NavFail(RenderError::EngineLost("socket closed".into())),
            ],
            Step::Extract(Extraction::Absent),
        );
        let (session, counters) = session(renderer);
        let report = session.run(&request(), &CancellationToken::new()).await;
        assert!(matches!(
            report.outcome,
            Outcome::Failed(FailureReason::EngineLost(_))
        ));
        assert_eq!(report.attempts, 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_decide() {
        assert_eq!(decide(&Ok(Extraction::Absent)), Decision::KeepPolling);
        assert_eq!(decide(&Ok(Extraction::Hidden)), Decision::KeepPolling);
        assert_eq!(
            decide(&Ok(Extraction::Found(snapshot("x")))),
            Decision::Finish(Outcome::Found(snapshot("x")))
        );
        let timeout = AttemptError::NavigationTimeout(DeadlineExceeded {
            reason: "navigation".into(),
            after: Duration::from_secs(30),
        });
        assert_eq!(timeout.disposition(), Disposition::Retry);
        assert_eq!(decide(&Err(timeout)), Decision::KeepPolling);
        assert_eq!(
            AttemptError::Extraction(RenderError::EngineLost("gone".into())).disposition(),
            Disposition::Fatal
        );
    }

    #[test]
    fn test_settings_from_config() {
        let settings = WatchSettings::default();
        assert_eq!(settings.retry_interval, Duration::from_millis(5000));
        assert_eq!(settings.navigation_timeout, Duration::from_millis(30000));
    }
}
