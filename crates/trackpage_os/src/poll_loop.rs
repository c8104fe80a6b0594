#![forbid(unsafe_code)]

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Days, Local, NaiveDate, NaiveDateTime};
use tracing::{error, info, warn};
use trackpage_contracts::activity::SyncRange;

use crate::index_builder::rebuild_index;
use crate::sync_engine::{SyncEngine, SyncError, SyncRangeMetrics};

const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Cooperative stop flag shared between the poll thread and whoever handles Ctrl-C.
#[derive(Debug, Clone, Default)]
pub struct PollShutdown(Arc<AtomicBool>);

impl PollShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub trait Clock {
    fn today(&self) -> NaiveDate;

    fn now(&self) -> NaiveDateTime;

    /// Blocks for `duration` or until shutdown is requested. Returns `false` when the
    /// sleep was cut short by shutdown.
    fn sleep(&self, duration: Duration, shutdown: &PollShutdown) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }

    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn sleep(&self, duration: Duration, shutdown: &PollShutdown) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if shutdown.is_requested() {
                return false;
            }
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        !shutdown.is_requested()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollLoopConfig {
    pub interval: Duration,
    pub backfill_days: u32,
}

impl PollLoopConfig {
    pub fn mvp_v1() -> Self {
        Self {
            interval: Duration::from_secs(1_200),
            backfill_days: 30,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::mvp_v1();
        let interval_secs = env::var("TRACKPAGE_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| (10..=86_400).contains(v))
            .unwrap_or(defaults.interval.as_secs());
        let backfill_days = env::var("TRACKPAGE_BACKFILL_DAYS")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|v| *v <= 3_650)
            .unwrap_or(defaults.backfill_days);
        Self {
            interval: Duration::from_secs(interval_secs),
            backfill_days,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPhase {
    #[default]
    Starting,
    Backfill,
    Steady,
    Stopped,
    Disabled,
    /// The poll thread unwound from a panic; nothing syncs until a restart.
    Failed,
}

/// Progress snapshot published to the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub struct PollStatus {
    pub phase: PollPhase,
    pub steady_passes: u64,
    pub ranges_synced: u64,
    pub ranges_failed: u64,
    pub artifacts_written_total: u64,
    pub item_failures_total: u64,
    pub index_entries: usize,
    pub last_synced_day: Option<NaiveDate>,
    pub last_pass_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
}

pub type SharedPollStatus = Arc<Mutex<PollStatus>>;

pub fn shared_poll_status() -> SharedPollStatus {
    Arc::new(Mutex::new(PollStatus::default()))
}

/// Days to backfill before steady state, oldest first. `today` itself is left to the
/// first steady pass.
pub fn backfill_days(today: NaiveDate, window_days: u32) -> Vec<NaiveDate> {
    (1..=u64::from(window_days))
        .rev()
        .filter_map(|offset| today.checked_sub_days(Days::new(offset)))
        .collect()
}

/// Flips the published status to `Failed` when the poll thread unwinds, so health
/// stops reporting a loop that no longer runs.
struct FailOnUnwind(SharedPollStatus);

impl Drop for FailOnUnwind {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        error!("poll loop panicked, no further passes will run");
        // A panic inside `update_status` poisons the lock; the data is still usable.
        let mut status = self
            .0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        status.phase = PollPhase::Failed;
        status.last_error = Some("poll loop panicked".to_string());
    }
}

pub struct PollLoop<C: Clock> {
    engine: SyncEngine,
    clock: C,
    config: PollLoopConfig,
    status: SharedPollStatus,
}

impl<C: Clock> PollLoop<C> {
    pub fn new(engine: SyncEngine, clock: C, config: PollLoopConfig, status: SharedPollStatus) -> Self {
        Self {
            engine,
            clock,
            config,
            status,
        }
    }

    pub fn status(&self) -> SharedPollStatus {
        self.status.clone()
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Backfill, one index rebuild, then steady passes until shutdown. Errors are logged
    /// and recorded in the status; none of them ends the loop.
    pub fn run(mut self, shutdown: &PollShutdown) {
        let _unwind = FailOnUnwind(self.status.clone());
        info!(
            interval_secs = self.config.interval.as_secs(),
            backfill_days = self.config.backfill_days,
            output = %self.engine.output().root().display(),
            "poll loop starting"
        );
        if self.run_backfill(shutdown) {
            self.rebuild_index();
            self.set_phase(PollPhase::Steady);
            while !shutdown.is_requested() {
                self.run_steady_pass();
                if !self.clock.sleep(self.config.interval, shutdown) {
                    break;
                }
            }
        }
        self.set_phase(PollPhase::Stopped);
        info!("poll loop stopped");
    }

    /// Returns `false` if shutdown interrupted the backfill.
    pub fn run_backfill(&mut self, shutdown: &PollShutdown) -> bool {
        self.set_phase(PollPhase::Backfill);
        let days = backfill_days(self.clock.today(), self.config.backfill_days);
        for day in days {
            if shutdown.is_requested() {
                return false;
            }
            self.run_pass_for_day(day);
        }
        !shutdown.is_requested()
    }

    pub fn run_steady_pass(&mut self) {
        let today = self.clock.today();
        self.run_pass_for_day(today);
        self.rebuild_index();
        let now = self.clock.now();
        self.update_status(|status| {
            status.steady_passes = status.steady_passes.saturating_add(1);
            status.last_pass_at = Some(now);
        });
    }

    pub fn run_pass_for_day(&mut self, day: NaiveDate) -> Option<SyncRangeMetrics> {
        let range = SyncRange::single_day(day);
        match self.engine.sync_range(&range) {
            Ok(metrics) => {
                if metrics.rendered_count > 0 || metrics.failed_count() > 0 {
                    info!(
                        day = %day,
                        listed = metrics.listed_count,
                        rendered = metrics.rendered_count,
                        skipped = metrics.skipped_known_count,
                        failed = metrics.failed_count(),
                        "sync range complete"
                    );
                }
                self.update_status(|status| {
                    status.ranges_synced = status.ranges_synced.saturating_add(1);
                    status.artifacts_written_total = status
                        .artifacts_written_total
                        .saturating_add(u64::from(metrics.rendered_count));
                    status.item_failures_total = status
                        .item_failures_total
                        .saturating_add(u64::from(metrics.failed_count()));
                    status.last_synced_day = Some(day);
                });
                Some(metrics)
            }
            Err(err) => {
                if matches!(&err, SyncError::Source(source) if source.is_auth()) {
                    error!(day = %day, "session rejected by activity source, restart to log in again: {err}");
                } else {
                    warn!(day = %day, "sync range failed: {err}");
                }
                let reason = format!("{day}: {err}");
                self.update_status(|status| {
                    status.ranges_failed = status.ranges_failed.saturating_add(1);
                    status.last_error = Some(reason);
                });
                None
            }
        }
    }

    pub fn rebuild_index(&mut self) {
        match rebuild_index(self.engine.output(), self.engine.artifact_extension()) {
            Ok(document) => {
                let entries = document.len();
                self.update_status(|status| status.index_entries = entries);
            }
            Err(err) => {
                warn!("{err}");
                let reason = err.to_string();
                self.update_status(|status| status.last_error = Some(reason));
            }
        }
    }

    fn set_phase(&self, phase: PollPhase) {
        self.update_status(|status| status.phase = phase);
    }

    fn update_status(&self, apply: impl FnOnce(&mut PollStatus)) {
        match self.status.lock() {
            Ok(mut status) => apply(&mut status),
            Err(_) => warn!("poll status lock poisoned; status update dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;
    use trackpage_contracts::activity::{
        display_label_for, parse_source_start_time, ActivityId, ActivitySummary,
    };
    use trackpage_engines::activity_source::{ActivitySource, SourceError};
    use trackpage_engines::track_render::{RenderError, RenderedTrack, TrackRenderer};
    use trackpage_storage::{InMemoryLedger, OutputLocation};

    /// Serves a fixed activity calendar and logs every listed day.
    struct CalendarSource {
        by_day: BTreeMap<NaiveDate, Vec<ActivitySummary>>,
        failing_days: Vec<NaiveDate>,
        listed: Arc<Mutex<Vec<NaiveDate>>>,
    }

    impl ActivitySource for CalendarSource {
        fn list_activities(&self, range: &SyncRange) -> Result<Vec<ActivitySummary>, SourceError> {
            self.listed.lock().unwrap().push(range.start);
            if self.failing_days.contains(&range.start) {
                return Err(SourceError::Status { http_status: 503 });
            }
            Ok(self.by_day.get(&range.start).cloned().unwrap_or_default())
        }

        fn download_track(&self, activity_id: &ActivityId) -> Result<Vec<u8>, SourceError> {
            Ok(activity_id.as_str().as_bytes().to_vec())
        }
    }

    struct StubRenderer;

    impl TrackRenderer for StubRenderer {
        fn extension(&self) -> &'static str {
            "png"
        }

        fn render(&self, raw: &[u8], start: NaiveDateTime) -> Result<RenderedTrack, RenderError> {
            Ok(RenderedTrack {
                bytes: raw.to_vec(),
                display_label: display_label_for(start),
            })
        }
    }

    /// Advances one day per sleep and reports shutdown after `sleeps_allowed` sleeps.
    struct ManualClock {
        today: Cell<NaiveDate>,
        sleeps_allowed: usize,
        slept: RefCell<Vec<Duration>>,
    }

    impl ManualClock {
        fn starting(today: NaiveDate, sleeps_allowed: usize) -> Self {
            Self {
                today: Cell::new(today),
                sleeps_allowed,
                slept: RefCell::new(Vec::new()),
            }
        }
    }

    impl Clock for ManualClock {
        fn today(&self) -> NaiveDate {
            self.today.get()
        }

        fn now(&self) -> NaiveDateTime {
            self.today.get().and_hms_opt(12, 0, 0).unwrap()
        }

        fn sleep(&self, duration: Duration, shutdown: &PollShutdown) -> bool {
            self.slept.borrow_mut().push(duration);
            if self.slept.borrow().len() >= self.sleeps_allowed {
                shutdown.request();
                return false;
            }
            self.today.set(self.today.get().succ_opt().unwrap());
            true
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn activity(id: &str, start: &str) -> ActivitySummary {
        ActivitySummary::v1(
            ActivityId::new(id).unwrap(),
            "ride".to_string(),
            parse_source_start_time(start).unwrap(),
        )
        .unwrap()
    }

    fn poll_loop(
        source: CalendarSource,
        output: OutputLocation,
        clock: ManualClock,
        backfill_days: u32,
    ) -> PollLoop<ManualClock> {
        let engine = SyncEngine::new(
            Box::new(source),
            Box::new(StubRenderer),
            Box::new(InMemoryLedger::new()),
            output,
        );
        let config = PollLoopConfig {
            interval: Duration::from_secs(1_200),
            backfill_days,
        };
        PollLoop::new(engine, clock, config, shared_poll_status())
    }

    #[test]
    fn at_poll_01_backfill_days_run_oldest_first_and_exclude_today() {
        assert_eq!(
            backfill_days(day(2024, 3, 2), 3),
            vec![day(2024, 2, 28), day(2024, 2, 29), day(2024, 3, 1)]
        );
        assert!(backfill_days(day(2024, 3, 2), 0).is_empty());
        assert_eq!(backfill_days(day(2024, 3, 2), 30).len(), 30);
    }

    #[test]
    fn at_poll_02_run_backfills_then_polls_today_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputLocation::new(dir.path());
        let listed = Arc::new(Mutex::new(Vec::new()));
        let mut by_day = BTreeMap::new();
        by_day.insert(day(2024, 1, 1), vec![activity("1", "2024-01-01 08:00:00")]);
        by_day.insert(day(2024, 1, 3), vec![activity("2", "2024-01-03 18:45:00")]);
        let source = CalendarSource {
            by_day,
            failing_days: Vec::new(),
            listed: listed.clone(),
        };
        let clock = ManualClock::starting(day(2024, 1, 3), 2);
        let lp = poll_loop(source, output.clone(), clock, 2);
        let status = lp.status();

        lp.run(&PollShutdown::new());

        assert_eq!(
            *listed.lock().unwrap(),
            vec![day(2024, 1, 1), day(2024, 1, 2), day(2024, 1, 3), day(2024, 1, 4)]
        );
        let html = std::fs::read_to_string(output.index_path()).unwrap();
        let newer = html.find("2024-01-03-18-45.png").unwrap();
        let older = html.find("2024-01-01-08-00.png").unwrap();
        assert!(newer < older);

        let status = status.lock().unwrap();
        assert_eq!(status.phase, PollPhase::Stopped);
        assert_eq!(status.steady_passes, 2);
        assert_eq!(status.ranges_synced, 4);
        assert_eq!(status.artifacts_written_total, 2);
        assert_eq!(status.index_entries, 2);
    }

    #[test]
    fn at_poll_03_failed_backfill_day_does_not_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputLocation::new(dir.path());
        let listed = Arc::new(Mutex::new(Vec::new()));
        let mut by_day = BTreeMap::new();
        by_day.insert(day(2024, 5, 9), vec![activity("9", "2024-05-09 06:00:00")]);
        let source = CalendarSource {
            by_day,
            failing_days: vec![day(2024, 5, 8)],
            listed: listed.clone(),
        };
        let clock = ManualClock::starting(day(2024, 5, 10), 1);
        let lp = poll_loop(source, output.clone(), clock, 3);
        let status = lp.status();

        lp.run(&PollShutdown::new());

        assert_eq!(listed.lock().unwrap().len(), 4);
        assert!(output.index_path().is_file());
        let status = status.lock().unwrap();
        assert_eq!(status.ranges_failed, 1);
        assert_eq!(status.artifacts_written_total, 1);
        assert!(status.last_error.as_deref().unwrap().starts_with("2024-05-08"));
    }

    #[test]
    fn at_poll_04_shutdown_before_start_skips_every_pass() {
        let dir = tempfile::tempdir().unwrap();
        let listed = Arc::new(Mutex::new(Vec::new()));
        let source = CalendarSource {
            by_day: BTreeMap::new(),
            failing_days: Vec::new(),
            listed: listed.clone(),
        };
        let clock = ManualClock::starting(day(2024, 1, 3), 5);
        let lp = poll_loop(source, OutputLocation::new(dir.path()), clock, 30);
        let status = lp.status();
        let shutdown = PollShutdown::new();
        shutdown.request();

        lp.run(&shutdown);

        assert!(listed.lock().unwrap().is_empty());
        assert_eq!(status.lock().unwrap().phase, PollPhase::Stopped);
    }

    #[test]
    fn at_poll_05_system_clock_sleep_returns_early_on_shutdown() {
        let shutdown = PollShutdown::new();
        shutdown.request();
        let started = std::time::Instant::now();
        assert!(!SystemClock.sleep(Duration::from_secs(60), &shutdown));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    struct PanickingRenderer;

    impl TrackRenderer for PanickingRenderer {
        fn extension(&self) -> &'static str {
            "png"
        }

        fn render(&self, _raw: &[u8], _start: NaiveDateTime) -> Result<RenderedTrack, RenderError> {
            panic!("renderer bug");
        }
    }

    #[test]
    fn at_poll_06_panic_in_a_pass_marks_status_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut by_day = BTreeMap::new();
        by_day.insert(day(2024, 2, 1), vec![activity("7", "2024-02-01 07:00:00")]);
        let source = CalendarSource {
            by_day,
            failing_days: Vec::new(),
            listed: Arc::new(Mutex::new(Vec::new())),
        };
        let engine = SyncEngine::new(
            Box::new(source),
            Box::new(PanickingRenderer),
            Box::new(InMemoryLedger::new()),
            OutputLocation::new(dir.path()),
        );
        let config = PollLoopConfig {
            interval: Duration::from_secs(1_200),
            backfill_days: 1,
        };
        let status = shared_poll_status();
        let lp = PollLoop::new(
            engine,
            ManualClock::starting(day(2024, 2, 2), 5),
            config,
            status.clone(),
        );

        let shutdown = PollShutdown::new();
        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || lp.run(&shutdown)));

        assert!(outcome.is_err());
        let status = status.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        assert_eq!(status.phase, PollPhase::Failed);
        assert_eq!(status.last_error.as_deref(), Some("poll loop panicked"));
        assert_eq!(status.artifacts_written_total, 0);
    }
}
