//! The polling cycle: session, extraction, diff, alerts, commit.
//!
//! [`Monitor::run_cycle`] is the single entry point for every trigger. It
//! never returns an error; failures are contained in the returned
//! [`CycleOutcome`] and the catalog is only replaced after every alert of the
//! cycle went out, so a failed cycle re-detects the same changes next time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use coursewatch_browser::{AutomationDriver, DriverFactory};
use coursewatch_extractor::extract;
use coursewatch_shared::{Catalog, CourseWatchError, MonitorConfig};
use coursewatch_storage::{CycleRecord, Storage};

use crate::detector::{derive_snapshot, diff};
use crate::dispatch::{DispatchReport, NotificationSink, dispatch_all};
use crate::session::ensure_session;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Where in the cycle a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Acquiring the automation context.
    Browser,
    Session,
    Extract,
    Dispatch,
    Commit,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Session => "session",
            Self::Extract => "extract",
            Self::Dispatch => "dispatch",
            Self::Commit => "commit",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts for a cycle that compared against an existing catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub items: usize,
    pub events: usize,
    pub dispatch: DispatchReport,
}

/// How a triggered cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Changes (possibly none) were announced and the catalog committed.
    Completed(CycleReport),
    /// The catalog was empty; it was seeded without any alerts.
    Bootstrap { items: usize },
    /// Another cycle was still running.
    Skipped,
    Failed {
        stage: Stage,
        error: CourseWatchError,
    },
}

impl CycleOutcome {
    /// Label stored in the cycle history.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Bootstrap { .. } => "bootstrap",
            Self::Skipped => "skipped",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// The catalog as read at cycle start.
#[derive(Debug)]
pub enum CatalogLoad {
    Loaded(Catalog),
    /// The stored catalog could not be read; the cycle proceeds as if empty.
    Degraded { reason: String },
}

type StageResult<T> = std::result::Result<T, (Stage, CourseWatchError)>;

fn at(stage: Stage) -> impl FnOnce(CourseWatchError) -> (Stage, CourseWatchError) {
    move |e| (stage, e)
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Clears the in-flight flag when the cycle ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type ActiveSlot = Mutex<Option<Arc<dyn AutomationDriver>>>;

/// Registers the cycle's driver so [`Monitor::shutdown`] can reach it, and
/// closes it if the cycle unwinds before [`ActiveSession::release`].
struct ActiveSession<'a> {
    slot: &'a ActiveSlot,
    released: bool,
}

impl<'a> ActiveSession<'a> {
    async fn register(slot: &'a ActiveSlot, driver: Arc<dyn AutomationDriver>) -> Self {
        let previous = slot.lock().await.replace(driver);
        if let Some(stale) = previous {
            warn!("closing browser session left over from an earlier cycle");
            close_driver(stale).await;
        }
        Self {
            slot,
            released: false,
        }
    }

    async fn release(mut self) {
        self.released = true;
        let driver = self.slot.lock().await.take();
        if let Some(driver) = driver {
            close_driver(driver).await;
        }
    }
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(driver) = self.slot.try_lock().ok().and_then(|mut slot| slot.take()) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_driver(driver));
            }
            Err(_) => warn!("no runtime left to close the browser session"),
        }
    }
}

async fn close_driver(driver: Arc<dyn AutomationDriver>) {
    if let Err(e) = driver.close().await {
        warn!(error = %e, "failed to close browser session");
    }
}

/// Runs polling cycles against one content source.
pub struct Monitor {
    config: Arc<MonitorConfig>,
    factory: Arc<dyn DriverFactory>,
    storage: Arc<Storage>,
    sink: Arc<dyn NotificationSink>,
    in_flight: AtomicBool,
    active: ActiveSlot,
}

impl Monitor {
    pub fn new(
        config: Arc<MonitorConfig>,
        factory: Arc<dyn DriverFactory>,
        storage: Arc<Storage>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            factory,
            storage,
            sink,
            in_flight: AtomicBool::new(false),
            active: Mutex::new(None),
        }
    }

    /// Whether a cycle is currently running.
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one cycle unless another is in flight.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            warn!("previous cycle still running, trigger skipped");
            return CycleOutcome::Skipped;
        };

        let cycle_id = Uuid::now_v7();
        let started_at = Utc::now();
        let outcome = self.cycle(cycle_id).await;
        self.record(cycle_id, started_at, &outcome).await;
        outcome
    }

    /// Close the automation context of a running cycle, if any.
    pub async fn shutdown(&self) {
        let driver = self.active.lock().await.take();
        if let Some(driver) = driver {
            info!("closing active browser session");
            close_driver(driver).await;
        }
    }

    #[instrument(name = "cycle", skip_all, fields(cycle_id = %cycle_id))]
    async fn cycle(&self, cycle_id: Uuid) -> CycleOutcome {
        info!("cycle started");

        let driver = match self.factory.open().await {
            Ok(driver) => driver,
            Err(error) => return self.failed(Stage::Browser, error),
        };
        let session = ActiveSession::register(&self.active, driver.clone()).await;

        let result = self.pipeline(driver.as_ref()).await;
        session.release().await;

        match result {
            Ok(outcome) => outcome,
            Err((stage, error)) => self.failed(stage, error),
        }
    }

    async fn pipeline(&self, driver: &dyn AutomationDriver) -> StageResult<CycleOutcome> {
        let config = self.config.as_ref();
        let catalog = match self.load_catalog().await {
            CatalogLoad::Loaded(catalog) => catalog,
            CatalogLoad::Degraded { reason } => {
                warn!(%reason, "catalog unreadable, cycle runs as first run");
                Catalog::new()
            }
        };

        ensure_session(driver, &self.storage, config)
            .await
            .map_err(at(Stage::Session))?;

        let items = extract(driver, config).await.map_err(at(Stage::Extract))?;
        let snapshot = derive_snapshot(&items);

        if catalog.is_empty() {
            self.commit(&snapshot).await?;
            info!(items = items.len(), "catalog seeded, no alerts on first run");
            return Ok(CycleOutcome::Bootstrap { items: items.len() });
        }

        let events = diff(&items, &catalog);
        info!(items = items.len(), events = events.len(), "changes detected");

        let dispatch = dispatch_all(&events, driver, self.sink.as_ref(), config)
            .await
            .map_err(at(Stage::Dispatch))?;

        self.commit(&snapshot).await?;
        info!(sent = dispatch.sent, "cycle completed");

        Ok(CycleOutcome::Completed(CycleReport {
            items: items.len(),
            events: events.len(),
            dispatch,
        }))
    }

    async fn load_catalog(&self) -> CatalogLoad {
        match self.storage.load_catalog().await {
            Ok(catalog) => CatalogLoad::Loaded(catalog),
            Err(e) => CatalogLoad::Degraded {
                reason: e.to_string(),
            },
        }
    }

    async fn commit(&self, snapshot: &Catalog) -> StageResult<()> {
        self.storage
            .replace_catalog(snapshot)
            .await
            .map_err(at(Stage::Commit))
    }

    fn failed(&self, stage: Stage, error: CourseWatchError) -> CycleOutcome {
        error!(%stage, category = error.category(), error = %error, "cycle failed");
        CycleOutcome::Failed { stage, error }
    }

    async fn record(&self, cycle_id: Uuid, started_at: chrono::DateTime<Utc>, outcome: &CycleOutcome) {
        let (items, events, error) = match outcome {
            CycleOutcome::Completed(report) => (Some(report.items), Some(report.events), None),
            CycleOutcome::Bootstrap { items } => (Some(*items), Some(0), None),
            CycleOutcome::Skipped => (None, None, None),
            CycleOutcome::Failed { stage, error } => (None, None, Some(format!("{stage}: {error}"))),
        };
        let record = CycleRecord {
            id: cycle_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            outcome: outcome.label().to_string(),
            items,
            events,
            error,
        };
        if let Err(e) = self.storage.record_cycle(&record).await {
            warn!(error = %e, "could not record cycle history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use coursewatch_browser::InMemoryDriver;
    use coursewatch_shared::{CatalogRecord, ContentKind, Result};
    use tokio::sync::Notify;

    use crate::dispatch::WebhookPayload;
    use crate::test_support::{
        RecordingSink, fixture_driver, listing_html, monitor_config, temp_db_path, temp_storage,
    };

    struct Harness {
        monitor: Arc<Monitor>,
        driver: Arc<InMemoryDriver>,
        storage: Arc<Storage>,
        sink: Arc<RecordingSink>,
    }

    async fn harness(listing: &str, sink: RecordingSink) -> Harness {
        let config = monitor_config();
        let driver = fixture_driver(&config, listing);
        let storage = Arc::new(temp_storage().await);
        let sink = Arc::new(sink);
        let monitor = Arc::new(Monitor::new(
            Arc::new(config),
            Arc::new(driver.clone()),
            storage.clone(),
            sink.clone(),
        ));
        Harness {
            monitor,
            driver,
            storage,
            sink,
        }
    }

    async fn seed(storage: &Storage, entries: &[(&str, &str, ContentKind)]) {
        let catalog: Catalog = entries
            .iter()
            .map(|(id, title, kind)| {
                (
                    id.to_string(),
                    CatalogRecord {
                        title: title.to_string(),
                        content_kind: *kind,
                    },
                )
            })
            .collect();
        storage.replace_catalog(&catalog).await.unwrap();
    }

    #[tokio::test]
    async fn first_cycle_seeds_catalog_without_alerts() {
        let listing = listing_html(&[
            ("/lesson/1", "Welcome"),
            ("/page/2", "Syllabus"),
            ("/quiz/3", "Warm-up quiz"),
        ]);
        let h = harness(&listing, RecordingSink::default()).await;

        let outcome = h.monitor.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Bootstrap { items: 3 }));
        assert_eq!(h.sink.attempts(), 0);

        let catalog = h.storage.load_catalog().await.unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.get("2").unwrap().content_kind, ContentKind::Text);
        assert!(h.driver.is_closed().await);

        let history = h.storage.recent_cycles(5).await.unwrap();
        assert_eq!(history[0].outcome, "bootstrap");
    }

    #[tokio::test]
    async fn text_to_video_upgrade_is_announced_and_committed() {
        let listing = listing_html(&[("/lesson/5", "Week 5")]);
        let h = harness(&listing, RecordingSink::default()).await;
        seed(&h.storage, &[("5", "Week 5", ContentKind::Text)]).await;

        let CycleOutcome::Completed(report) = h.monitor.run_cycle().await else {
            panic!("expected completed cycle");
        };
        assert_eq!(report.events, 1);
        assert_eq!(report.dispatch.upgraded, 1);

        let sent = h.sink.sent();
        assert_eq!(sent[0].embeds[0].title, "Video now available");
        let catalog = h.storage.load_catalog().await.unwrap();
        assert_eq!(catalog.get("5").unwrap().content_kind, ContentKind::Video);
    }

    #[tokio::test]
    async fn failed_send_leaves_catalog_for_redetection() {
        let listing = listing_html(&[
            ("/page/100", "Old reading"),
            ("/quiz/1", "Quiz one"),
            ("/quiz/2", "Quiz two"),
            ("/quiz/3", "Quiz three"),
        ]);
        let h = harness(&listing, RecordingSink::failing_on(2)).await;
        seed(&h.storage, &[("100", "Old reading", ContentKind::Text)]).await;

        let CycleOutcome::Failed { stage, error } = h.monitor.run_cycle().await else {
            panic!("expected failure");
        };
        assert_eq!(stage, Stage::Dispatch);
        assert_eq!(error.category(), "notification");
        // the third alert was never attempted
        assert_eq!(h.sink.attempts(), 2);
        assert_eq!(h.sink.sent_ids(), ["1"]);
        assert_eq!(h.storage.load_catalog().await.unwrap().len(), 1);
        assert!(h.driver.is_closed().await);

        h.sink.heal();
        let outcome = h.monitor.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Completed(CycleReport { events: 3, .. })));
        assert_eq!(h.sink.sent_ids(), ["1", "1", "2", "3"]);
        assert_eq!(h.storage.load_catalog().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn quiet_cycle_still_commits_snapshot() {
        let listing = listing_html(&[("/page/7", "Renamed reading")]);
        let h = harness(&listing, RecordingSink::default()).await;
        seed(
            &h.storage,
            &[
                ("7", "Reading", ContentKind::Text),
                ("8", "Removed item", ContentKind::Quiz),
            ],
        )
        .await;

        let outcome = h.monitor.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Completed(CycleReport { events: 0, .. })));

        let catalog = h.storage.load_catalog().await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("7").unwrap().title, "Renamed reading");
    }

    #[tokio::test]
    async fn rejected_login_fails_session_stage() {
        let listing = listing_html(&[("/page/1", "Reading")]);
        let config = {
            let mut c = monitor_config();
            c.credentials.password = "wrong".into();
            c
        };
        let driver = fixture_driver(&config, &listing);
        let storage = Arc::new(temp_storage().await);
        let sink = Arc::new(RecordingSink::default());
        let monitor = Monitor::new(Arc::new(config), Arc::new(driver.clone()), storage.clone(), sink);

        let CycleOutcome::Failed { stage, error } = monitor.run_cycle().await else {
            panic!("expected failure");
        };
        assert_eq!(stage, Stage::Session);
        assert_eq!(error.category(), "authentication");
        assert!(driver.is_closed().await);
        assert!(storage.load_catalog().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_catalog_runs_as_first_run() {
        let path = temp_db_path();
        let storage = Arc::new(Storage::open(&path).await.unwrap());
        // a title stored as a blob can't be read back as text
        let raw = libsql::Builder::new_local(&path).build().await.unwrap();
        raw.connect()
            .unwrap()
            .execute(
                "INSERT INTO catalog (id, title, content_kind, committed_at)
                 VALUES ('9', X'00FF', 'text', '2026-01-01T00:00:00Z')",
                libsql::params![],
            )
            .await
            .unwrap();
        assert!(storage.load_catalog().await.is_err());

        let config = monitor_config();
        let driver = fixture_driver(&config, &listing_html(&[("/lesson/1", "Welcome")]));
        let sink = Arc::new(RecordingSink::default());
        let monitor = Monitor::new(Arc::new(config), Arc::new(driver), storage.clone(), sink.clone());

        let outcome = monitor.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Bootstrap { items: 1 }));
        assert_eq!(sink.attempts(), 0);

        let catalog = storage.load_catalog().await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("1").unwrap().content_kind, ContentKind::Video);
    }

    #[tokio::test]
    async fn catalog_write_failure_fails_commit_stage() {
        let path = temp_db_path();
        let writable = Storage::open(&path).await.unwrap();
        seed(&writable, &[("1", "Existing", ContentKind::Text)]).await;
        let readonly = Arc::new(Storage::open_readonly(&path).await.unwrap());

        let config = monitor_config();
        let listing = listing_html(&[("/page/1", "Existing"), ("/quiz/9", "New quiz")]);
        let driver = fixture_driver(&config, &listing);
        let sink = Arc::new(RecordingSink::default());
        let monitor = Monitor::new(Arc::new(config), Arc::new(driver.clone()), readonly, sink.clone());

        let CycleOutcome::Failed { stage, error } = monitor.run_cycle().await else {
            panic!("expected failure");
        };
        assert_eq!(stage, Stage::Commit);
        assert_eq!(error.category(), "storage");
        assert_eq!(sink.sent_ids(), ["9"]);
        assert!(driver.is_closed().await);

        let catalog = writable.load_catalog().await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("9").is_none());
    }

    #[tokio::test]
    async fn missing_listing_fails_extract_stage() {
        let h = harness("<html><body>Down for maintenance</body></html>", RecordingSink::default()).await;
        let outcome = h.monitor.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Failed { stage: Stage::Extract, .. }));
    }

    /// Holds `open` until released.
    struct GatedFactory {
        inner: Arc<InMemoryDriver>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl DriverFactory for GatedFactory {
        async fn open(&self) -> Result<Arc<dyn AutomationDriver>> {
            self.gate.notified().await;
            self.inner.open().await
        }
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let config = monitor_config();
        let driver = fixture_driver(&config, &listing_html(&[("/page/1", "Reading")]));
        let gate = Arc::new(Notify::new());
        let factory = GatedFactory {
            inner: driver.clone(),
            gate: gate.clone(),
        };
        let monitor = Arc::new(Monitor::new(
            Arc::new(config),
            Arc::new(factory),
            Arc::new(temp_storage().await),
            Arc::new(RecordingSink::default()),
        ));

        let first = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run_cycle().await }
        });
        while !monitor.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(matches!(monitor.run_cycle().await, CycleOutcome::Skipped));

        gate.notify_one();
        let outcome = first.await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Bootstrap { items: 1 }));
        assert!(!monitor.is_running());
    }

    /// Blocks every send until released.
    struct GatedSink {
        gate: Arc<Notify>,
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl NotificationSink for GatedSink {
        async fn send(&self, _payload: &WebhookPayload) -> Result<()> {
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_closes_active_session() {
        let config = monitor_config();
        let driver = fixture_driver(&config, &listing_html(&[("/quiz/9", "New quiz")]));
        let storage = Arc::new(temp_storage().await);
        seed(&storage, &[("1", "Existing", ContentKind::Text)]).await;
        let gate = Arc::new(Notify::new());
        let entered = Arc::new(Notify::new());
        let monitor = Arc::new(Monitor::new(
            Arc::new(config),
            Arc::new(driver.clone()),
            storage,
            Arc::new(GatedSink {
                gate: gate.clone(),
                entered: entered.clone(),
            }),
        ));

        let cycle = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run_cycle().await }
        });
        entered.notified().await;

        monitor.shutdown().await;
        assert!(driver.is_closed().await);

        gate.notify_one();
        let outcome = cycle.await.unwrap();
        assert!(!outcome.is_failed());
    }

    struct PanickingSink;

    #[async_trait]
    impl NotificationSink for PanickingSink {
        async fn send(&self, _payload: &WebhookPayload) -> Result<()> {
            panic!("sink blew up");
        }
    }

    #[tokio::test]
    async fn panicking_cycle_still_closes_browser_session() {
        let config = monitor_config();
        let driver = fixture_driver(&config, &listing_html(&[("/quiz/9", "New quiz")]));
        let storage = Arc::new(temp_storage().await);
        seed(&storage, &[("1", "Existing", ContentKind::Text)]).await;
        let monitor = Arc::new(Monitor::new(
            Arc::new(config),
            Arc::new(driver.clone()),
            storage,
            Arc::new(PanickingSink),
        ));

        let cycle = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run_cycle().await }
        });
        assert!(cycle.await.unwrap_err().is_panic());

        for _ in 0..50 {
            if driver.is_closed().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(driver.is_closed().await);
        assert!(!monitor.is_running());
    }
}
