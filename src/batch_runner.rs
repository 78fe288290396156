use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::classifier::Classifier;
use crate::config::RunnerConfig;
use crate::ledger::Ledger;
use crate::rate_limiter::{DAY, MINUTE, RateLimiter};
use crate::source;
use crate::types::{FailureKind, ItemOutcome, LedgerEntry, RunReport, WorkItem};

/// Drives work items through the classifier under the rate limiter and
/// writes every outcome to the ledger as soon as it is known.
pub struct BatchRunner<C: Classifier, L: Ledger> {
    config: RunnerConfig,
    classifier: C,
    ledger: Arc<L>,
    // Single writer on the rate window; held across waits and backoff.
    limiter: Mutex<RateLimiter>,
    cancel: CancellationToken,
    halted: AtomicBool,
}

impl<C: Classifier, L: Ledger> BatchRunner<C, L> {
    pub fn new(config: RunnerConfig, classifier: C, ledger: L, limiter: RateLimiter) -> Self {
        Self {
            config,
            classifier,
            ledger: Arc::new(ledger),
            limiter: Mutex::new(limiter),
            cancel: CancellationToken::new(),
            halted: AtomicBool::new(false),
        }
    }

    /// Stop dispatching new items once `cancel` fires. Calls already in
    /// flight finish and are recorded.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    #[tracing::instrument(skip_all, fields(run_id = %Uuid::new_v4().simple(), discovered = items.len()))]
    pub async fn run(&self, mut items: Vec<WorkItem>) -> Result<RunReport> {
        items.sort();
        items.dedup_by(|a, b| a.identity == b.identity);

        let mut report = RunReport::default();
        let mut pending = Vec::new();
        for item in items {
            if self.ledger.has(&item.identity) {
                tracing::debug!(identity = %item.identity, "Already in ledger, skipping");
                report.push(&item, ItemOutcome::Skipped);
            } else {
                pending.push(item);
            }
        }
        counter!("items_skipped_total").increment(report.skipped as u64);

        let over_limit = match self.config.limit {
            Some(limit) if pending.len() > limit => pending.split_off(limit),
            _ => Vec::new(),
        };

        let limits = self.limiter.lock().await.limits();
        tracing::info!(
            skipped = report.skipped,
            pending = pending.len(),
            over_limit = over_limit.len(),
            workers = self.config.workers,
            per_minute = limits.effective_per_minute(),
            per_day = limits.effective_per_day(),
            "Starting run"
        );

        let total = pending.len();
        let mut outcomes = futures::stream::iter(pending.iter())
            .map(|item| async move { (item, self.process(item).await) })
            .buffered(self.config.workers.max(1));

        let mut done = 0;
        while let Some((item, outcome)) = outcomes.next().await {
            let outcome = outcome?;
            done += 1;
            tracing::debug!(done, total, identity = %item.identity, outcome = ?outcome, "Item finished");
            report.push(item, outcome);
        }

        for item in &over_limit {
            report.push(item, ItemOutcome::Deferred);
        }

        tracing::info!(
            total = report.total(),
            skipped = report.skipped,
            succeeded = report.succeeded,
            failed = report.failed,
            deferred = report.deferred,
            "Run complete"
        );
        Ok(report)
    }

    #[tracing::instrument(skip_all, fields(identity = %item.identity))]
    async fn process(&self, item: &WorkItem) -> Result<ItemOutcome> {
        if self.stopped() {
            return Ok(ItemOutcome::Deferred);
        }

        let image = match source::read_image(item).await {
            Ok(image) => image,
            Err(err) => {
                return self
                    .fail(item, FailureKind::InvalidInput, format!("unreadable image: {err}"))
                    .await;
            }
        };

        let mut rate_limited = 0;
        loop {
            if !self.acquire().await {
                return Ok(ItemOutcome::Deferred);
            }

            counter!("classifier_requests_total").increment(1);
            let started = Instant::now();
            let result = self.classifier.classify(&image).await;
            histogram!("classify_duration_seconds").record(started.elapsed().as_secs_f64());

            let err = match result {
                Ok(classification) => {
                    let entry = LedgerEntry::succeeded(&item.identity, classification, Utc::now());
                    tracing::info!(
                        primary = %entry.primary_style,
                        secondary = %entry.secondary_style,
                        "Classified"
                    );
                    self.record(entry)
                        .await
                        .with_context(|| format!("failed to record result for {}", item.identity))?;
                    counter!("items_succeeded_total").increment(1);
                    return Ok(ItemOutcome::Succeeded);
                }
                Err(err) => err,
            };

            let Some(kind) = err.kind() else {
                return Err(anyhow::Error::new(err).context("classifier refused the run"));
            };
            if kind == FailureKind::RateLimited && rate_limited < self.config.rate_limit_retries {
                rate_limited += 1;
                tracing::warn!(
                    attempt = rate_limited,
                    backoff_secs = self.config.rate_limit_backoff.as_secs(),
                    error = %err,
                    "Provider rate limited the call, backing off"
                );
                if !self.back_off().await {
                    return Ok(ItemOutcome::Deferred);
                }
                continue;
            }
            return self.fail(item, kind, err.to_string()).await;
        }
    }

    async fn fail(&self, item: &WorkItem, kind: FailureKind, message: String) -> Result<ItemOutcome> {
        let recorded = self.config.on_failure.records(kind);
        if recorded {
            let entry = LedgerEntry::failed(&item.identity, kind, &message, Utc::now());
            self.record(entry)
                .await
                .with_context(|| format!("failed to record failure for {}", item.identity))?;
        }
        counter!("items_failed_total", "kind" => kind.as_str()).increment(1);
        tracing::warn!(%kind, recorded, error = %message, "Item failed");
        Ok(ItemOutcome::Failed {
            kind,
            message,
            recorded,
        })
    }

    /// Appends to the ledger on the blocking pool so a slow fsync does not
    /// stall the other workers or their rate-limit timers.
    async fn record(&self, entry: LedgerEntry) -> Result<()> {
        let ledger = Arc::clone(&self.ledger);
        tokio::task::spawn_blocking(move || ledger.record(entry)).await??;
        Ok(())
    }

    /// Waits until the limiter admits a call and reserves it. Returns false
    /// if the run was cancelled or the wait exceeds the configured patience.
    async fn acquire(&self) -> bool {
        let mut limiter = self.limiter.lock().await;
        loop {
            if self.stopped() {
                return false;
            }
            let now = Instant::now();
            let wait = limiter.before_call(now);
            if wait.is_zero() {
                limiter.record_call(now);
                return true;
            }
            if wait > self.config.max_wait {
                tracing::warn!(
                    wait_secs = wait.as_secs(),
                    max_wait_secs = self.config.max_wait.as_secs(),
                    calls_last_minute = limiter.calls_within(now, MINUTE),
                    calls_last_day = limiter.calls_within(now, DAY),
                    "Required wait exceeds patience, no further items will be dispatched"
                );
                self.halted.store(true, Ordering::SeqCst);
                return false;
            }
            tracing::info!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            if !self.pause(wait).await {
                return false;
            }
        }
    }

    /// Blocks every worker for the configured backoff after the provider
    /// reported a rate limit.
    async fn back_off(&self) -> bool {
        let _limiter = self.limiter.lock().await;
        self.pause(self.config.rate_limit_backoff).await
    }

    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }

    fn stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.halted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassifyError;
    use crate::config::OnFailure;
    use crate::ledger::{CsvLedger, LedgerError};
    use crate::rate_limiter::RateLimits;
    use crate::types::{ImagePayload, StyleClassification};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use tempfile::{TempDir, tempdir};

    type Scripted = Result<StyleClassification, ClassifyError>;

    /// Classifier keyed by image contents. Each test image holds its own
    /// file name, so calls are attributable to items.
    #[derive(Default)]
    struct FakeClassifier {
        script: StdMutex<HashMap<String, VecDeque<Scripted>>>,
        calls: StdMutex<Vec<(String, Instant)>>,
    }

    impl FakeClassifier {
        fn respond(self, name: &str, response: Scripted) -> Self {
            self.script
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .push_back(response);
            self
        }

        fn called(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(name, _)| name.clone())
                .collect()
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
        }
    }

    #[async_trait]
    impl Classifier for FakeClassifier {
        async fn classify(&self, image: &ImagePayload) -> Result<StyleClassification, ClassifyError> {
            let name = String::from_utf8_lossy(&image.bytes).into_owned();
            self.calls.lock().unwrap().push((name.clone(), Instant::now()));
            let scripted = self
                .script
                .lock()
                .unwrap()
                .get_mut(&name)
                .and_then(|queue| queue.pop_front());
            scripted.unwrap_or_else(|| Ok(style(&name)))
        }
    }

    fn style(name: &str) -> StyleClassification {
        StyleClassification {
            primary_style: "Traditional".to_string(),
            secondary_style: "Neo-Traditional".to_string(),
            description: format!("flash sheet {name}"),
        }
    }

    struct Fixture {
        dir: TempDir,
        ledger_path: std::path::PathBuf,
    }

    impl Fixture {
        fn new(names: &[&str]) -> Self {
            let dir = tempdir().unwrap();
            let images = dir.path().join("images");
            std::fs::create_dir(&images).unwrap();
            for name in names {
                std::fs::write(images.join(name), name.as_bytes()).unwrap();
            }
            let ledger_path = dir.path().join("ledger.csv");
            Self { dir, ledger_path }
        }

        fn items(&self) -> Vec<WorkItem> {
            source::discover(&self.dir.path().join("images")).unwrap()
        }

        fn runner(
            &self,
            config: RunnerConfig,
            limits: RateLimits,
            classifier: FakeClassifier,
        ) -> BatchRunner<FakeClassifier, CsvLedger> {
            let ledger = CsvLedger::open(&self.ledger_path).unwrap();
            BatchRunner::new(config, classifier, ledger, RateLimiter::new(limits))
        }
    }

    fn config() -> RunnerConfig {
        RunnerConfig {
            on_failure: OnFailure::RetryNextRun,
            max_wait: Duration::from_secs(600),
            workers: 1,
            limit: None,
            rate_limit_backoff: Duration::from_secs(60),
            rate_limit_retries: 3,
        }
    }

    fn limits() -> RateLimits {
        RateLimits {
            per_minute: 15,
            per_day: 1500,
            safety_margin: 0.1,
        }
    }

    fn file_name(identity: &str) -> String {
        Path::new(identity)
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }

    #[tokio::test(start_paused = true)]
    async fn processes_in_sorted_order_and_records_results() {
        let fixture = Fixture::new(&["c.png", "a.jpg", "b.webp"]);
        let runner = fixture.runner(config(), limits(), FakeClassifier::default());

        let mut items = fixture.items();
        items.reverse();
        let report = runner.run(items).await.unwrap();

        assert_eq!(report.succeeded, 3);
        assert_eq!(runner.classifier.called(), vec!["a.jpg", "b.webp", "c.png"]);
        let recorded: Vec<_> = runner
            .ledger()
            .load()
            .unwrap()
            .iter()
            .map(|entry| file_name(&entry.identity))
            .collect();
        assert_eq!(recorded, vec!["a.jpg", "b.webp", "c.png"]);
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_run_makes_no_calls_for_recorded_items() {
        let fixture = Fixture::new(&["a.jpg", "b.jpg", "c.jpg"]);
        let first = fixture.runner(config(), limits(), FakeClassifier::default());
        first.run(fixture.items()).await.unwrap();
        drop(first);

        let second = fixture.runner(config(), limits(), FakeClassifier::default());
        let report = second.run(fixture.items()).await.unwrap();
        assert_eq!(report.skipped, 3);
        assert_eq!(report.total(), 3);
        assert!(second.classifier.called().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn network_failure_is_retried_on_next_run() {
        let fixture = Fixture::new(&["1.jpg", "2.jpg", "3.jpg"]);
        let classifier = FakeClassifier::default()
            .respond("2.jpg", Err(ClassifyError::Network("connection reset".into())));
        let first = fixture.runner(config(), limits(), classifier);
        let report = first.run(fixture.items()).await.unwrap();

        assert_eq!((report.succeeded, report.failed), (2, 1));
        let failure = &report.failures[0];
        assert_eq!(file_name(&failure.identity), "2.jpg");
        assert_eq!(failure.kind, FailureKind::Network);
        assert!(!failure.recorded);
        drop(first);

        let second = fixture.runner(config(), limits(), FakeClassifier::default());
        let report = second.run(fixture.items()).await.unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(second.classifier.called(), vec!["2.jpg"]);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_terminal_records_transient_failures() {
        let fixture = Fixture::new(&["1.jpg", "2.jpg"]);
        let classifier = FakeClassifier::default().respond(
            "1.jpg",
            Err(ClassifyError::MalformedResponse("no candidates".into())),
        );
        let config = RunnerConfig {
            on_failure: OnFailure::MarkTerminal,
            ..config()
        };
        let first = fixture.runner(config.clone(), limits(), classifier);
        let report = first.run(fixture.items()).await.unwrap();
        assert!(report.failures[0].recorded);
        drop(first);

        let second = fixture.runner(config, limits(), FakeClassifier::default());
        let report = second.run(fixture.items()).await.unwrap();
        assert_eq!(report.skipped, 2);
        assert!(second.classifier.called().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_input_is_always_terminal() {
        let fixture = Fixture::new(&["good.jpg", "bad.jpg"]);
        std::fs::write(fixture.dir.path().join("images/empty.png"), b"").unwrap();
        let classifier = FakeClassifier::default()
            .respond("bad.jpg", Err(ClassifyError::InvalidInput("not a tattoo".into())));
        let runner = fixture.runner(config(), limits(), classifier);

        let report = runner.run(fixture.items()).await.unwrap();
        assert_eq!((report.succeeded, report.failed), (1, 2));
        assert!(report.failures.iter().all(|f| f.recorded));
        assert!(report.failures.iter().all(|f| f.kind == FailureKind::InvalidInput));
        // The empty file never reaches the classifier.
        assert_eq!(runner.classifier.called(), vec!["bad.jpg", "good.jpg"]);
        assert_eq!(runner.ledger().load().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_out_the_minute_window() {
        let names: Vec<String> = (0..15).map(|i| format!("{i:02}.jpg")).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let fixture = Fixture::new(&names);
        let runner = fixture.runner(config(), limits(), FakeClassifier::default());

        let report = runner.run(fixture.items()).await.unwrap();
        assert_eq!(report.succeeded, 15);

        let times = runner.classifier.call_times();
        let first = times[0];
        assert!(times[12].duration_since(first) < Duration::from_secs(1));
        assert!(times[13].duration_since(first) >= MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_workers_respect_the_ceiling() {
        let names: Vec<String> = (0..40).map(|i| format!("{i:02}.jpg")).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let fixture = Fixture::new(&names);
        let config = RunnerConfig {
            workers: 4,
            ..config()
        };
        let runner = fixture.runner(config, limits(), FakeClassifier::default());

        let report = runner.run(fixture.items()).await.unwrap();
        assert_eq!(report.succeeded, 40);

        let times = runner.classifier.call_times();
        let ceiling = limits().effective_per_minute();
        for (i, start) in times.iter().enumerate() {
            let in_window = times[i..]
                .iter()
                .filter(|t| t.duration_since(*start) < MINUTE)
                .count();
            assert!(in_window <= ceiling);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_dispatch_when_wait_exceeds_patience() {
        let fixture = Fixture::new(&["a.jpg", "b.jpg", "c.jpg", "d.jpg", "e.jpg"]);
        let limits = RateLimits {
            per_minute: 15,
            per_day: 3,
            safety_margin: 0.0,
        };
        let runner = fixture.runner(config(), limits, FakeClassifier::default());

        let report = runner.run(fixture.items()).await.unwrap();
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.deferred, 2);
        assert_eq!(runner.classifier.called().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_rate_limit_backs_off_and_retries() {
        let fixture = Fixture::new(&["a.jpg", "b.jpg"]);
        let classifier = FakeClassifier::default()
            .respond("a.jpg", Err(ClassifyError::RateLimited("429".into())))
            .respond("b.jpg", Err(ClassifyError::RateLimited("429".into())))
            .respond("b.jpg", Err(ClassifyError::RateLimited("429".into())));
        let config = RunnerConfig {
            rate_limit_retries: 1,
            ..config()
        };
        let runner = fixture.runner(config, limits(), classifier);

        let report = runner.run(fixture.items()).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::RateLimited);
        assert!(!report.failures[0].recorded);
        assert_eq!(runner.classifier.called(), vec!["a.jpg", "a.jpg", "b.jpg", "b.jpg"]);

        let times = runner.classifier.call_times();
        assert!(times[1].duration_since(times[0]) >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_credentials_abort_the_run() {
        let fixture = Fixture::new(&["a.jpg", "b.jpg"]);
        let classifier = FakeClassifier::default()
            .respond("a.jpg", Err(ClassifyError::Unauthorized("HTTP 403".into())));
        let runner = fixture.runner(config(), limits(), classifier);

        assert!(runner.run(fixture.items()).await.is_err());
        assert_eq!(runner.classifier.called(), vec!["a.jpg"]);
        assert!(runner.ledger().load().unwrap().is_empty());
    }

    /// Accepts reads but refuses every write, like a full disk.
    struct FullDiskLedger;

    impl Ledger for FullDiskLedger {
        fn has(&self, _identity: &str) -> bool {
            false
        }

        fn record(&self, _entry: LedgerEntry) -> Result<(), LedgerError> {
            Err(LedgerError::Io {
                path: "ledger.csv".into(),
                source: std::io::Error::other("no space left on device"),
            })
        }

        fn load(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_write_failure_aborts_the_run() {
        let fixture = Fixture::new(&["a.jpg", "b.jpg", "c.jpg"]);
        let runner = BatchRunner::new(
            config(),
            FakeClassifier::default(),
            FullDiskLedger,
            RateLimiter::new(limits()),
        );

        let err = runner.run(fixture.items()).await.unwrap_err();
        assert!(format!("{err:#}").contains("no space left on device"), "{err:#}");
        assert_eq!(runner.classifier.called(), vec!["a.jpg"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_marker_write_error_aborts_the_run() {
        let fixture = Fixture::new(&["a.jpg", "b.jpg"]);
        let classifier = FakeClassifier::default()
            .respond("a.jpg", Err(ClassifyError::InvalidInput("not a tattoo".into())));
        let runner = BatchRunner::new(
            config(),
            classifier,
            FullDiskLedger,
            RateLimiter::new(limits()),
        );

        assert!(runner.run(fixture.items()).await.is_err());
        assert_eq!(runner.classifier.called(), vec!["a.jpg"]);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_defers_the_remainder() {
        let fixture = Fixture::new(&["a.jpg", "b.jpg", "c.jpg"]);
        let config = RunnerConfig {
            limit: Some(1),
            ..config()
        };
        let runner = fixture.runner(config, limits(), FakeClassifier::default());

        let report = runner.run(fixture.items()).await.unwrap();
        assert_eq!((report.succeeded, report.deferred), (1, 2));
        assert_eq!(runner.classifier.called(), vec!["a.jpg"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_defers_undispatched_items() {
        let fixture = Fixture::new(&["a.jpg", "b.jpg"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = fixture
            .runner(config(), limits(), FakeClassifier::default())
            .with_cancellation(cancel);

        let report = runner.run(fixture.items()).await.unwrap();
        assert_eq!(report.deferred, 2);
        assert!(runner.classifier.called().is_empty());
        assert!(runner.ledger().load().unwrap().is_empty());
    }
}
