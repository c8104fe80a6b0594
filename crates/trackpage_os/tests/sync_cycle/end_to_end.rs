#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use trackpage_contracts::activity::{
    parse_source_start_time, ActivityId, ActivitySummary, SyncRange,
};
use trackpage_engines::activity_source::{ActivitySource, SourceError};
use trackpage_engines::track_render::{GpxPngRenderer, RenderConfig};
use trackpage_os::{
    rebuild_index, shared_poll_status, Clock, PollLoop, PollLoopConfig, PollShutdown, SyncEngine,
};
use trackpage_storage::{DedupLedger, FileLedger, OutputLocation};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

fn gpx(lat: f64) -> Vec<u8> {
    format!(
        r#"<?xml version="1.0"?><gpx version="1.1"><trk><trkseg>
<trkpt lat="{lat}" lon="-122.33"/><trkpt lat="{}" lon="-122.32"/><trkpt lat="{}" lon="-122.30"/>
</trkseg></trk></gpx>"#,
        lat + 0.004,
        lat + 0.001
    )
    .into_bytes()
}

#[derive(Clone, Default)]
struct FakeConnect {
    activities: Vec<ActivitySummary>,
    tracks: BTreeMap<String, Vec<u8>>,
    downloads: Arc<Mutex<Vec<String>>>,
}

impl FakeConnect {
    fn with_activity(mut self, id: &str, start: &str, track: Vec<u8>) -> Self {
        self.activities.push(
            ActivitySummary::v1(
                ActivityId::new(id).unwrap(),
                format!("activity {id}"),
                parse_source_start_time(start).unwrap(),
            )
            .unwrap(),
        );
        self.tracks.insert(id.to_string(), track);
        self
    }
}

impl ActivitySource for FakeConnect {
    fn list_activities(&self, range: &SyncRange) -> Result<Vec<ActivitySummary>, SourceError> {
        Ok(self
            .activities
            .iter()
            .filter(|a| {
                let day = a.start_time_local.date();
                day >= range.start && day <= range.end
            })
            .cloned()
            .collect())
    }

    fn download_track(&self, activity_id: &ActivityId) -> Result<Vec<u8>, SourceError> {
        self.downloads
            .lock()
            .unwrap()
            .push(activity_id.as_str().to_string());
        self.tracks
            .get(activity_id.as_str())
            .cloned()
            .ok_or(SourceError::Status { http_status: 404 })
    }
}

fn renderer() -> GpxPngRenderer {
    GpxPngRenderer::new(RenderConfig {
        size_px: 96,
        line_width_px: 3,
        margin_px: 6,
    })
}

fn engine(source: FakeConnect, output: &OutputLocation) -> SyncEngine {
    let ledger = FileLedger::open(output.default_ledger_path()).unwrap();
    SyncEngine::new(
        Box::new(source),
        Box::new(renderer()),
        Box::new(ledger),
        output.clone(),
    )
}

fn jan_1() -> SyncRange {
    SyncRange::single_day(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
}

#[test]
fn at_sync_cycle_01_two_activities_materialize_and_second_pass_is_idle() {
    let dir = tempfile::tempdir().unwrap();
    let output = OutputLocation::new(dir.path());
    let source = FakeConnect::default()
        .with_activity("1", "2024-01-01 08:00:00", gpx(47.60))
        .with_activity("2", "2024-01-01 09:00:00", gpx(47.61));
    let downloads = source.downloads.clone();
    let mut engine = engine(source, &output);

    let first = engine.sync_range(&jan_1()).unwrap();
    assert_eq!(first.rendered_count, 2);
    for name in ["2024-01-01-08-00.png", "2024-01-01-09-00.png"] {
        let bytes = std::fs::read(dir.path().join(name)).unwrap();
        assert_eq!(bytes[..8], PNG_SIGNATURE);
    }
    let ledger_text = std::fs::read_to_string(output.default_ledger_path()).unwrap();
    assert_eq!(ledger_text, "1\n2\n");

    let second = engine.sync_range(&jan_1()).unwrap();
    assert_eq!(second.rendered_count, 0);
    assert!(second.written.is_empty());
    assert_eq!(downloads.lock().unwrap().len(), 2);
}

#[test]
fn at_sync_cycle_02_ledger_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let output = OutputLocation::new(dir.path());
    let source =
        FakeConnect::default().with_activity("77", "2024-01-01 07:15:00", gpx(40.0));
    let downloads = source.downloads.clone();

    engine(source.clone(), &output).sync_range(&jan_1()).unwrap();
    let restarted = engine(source, &output).sync_range(&jan_1()).unwrap();

    assert_eq!(restarted.skipped_known_count, 1);
    assert_eq!(downloads.lock().unwrap().as_slice(), ["77"]);
    let ledger = FileLedger::open(output.default_ledger_path()).unwrap();
    assert!(ledger.contains(&ActivityId::new("77").unwrap()));
}

#[test]
fn at_sync_cycle_03_unrenderable_track_is_retried_once_fixed() {
    let dir = tempfile::tempdir().unwrap();
    let output = OutputLocation::new(dir.path());
    let broken = FakeConnect::default()
        .with_activity("5", "2024-01-01 10:00:00", b"<gpx><trk></trk></gpx>".to_vec());

    let metrics = engine(broken, &output).sync_range(&jan_1()).unwrap();
    assert_eq!(metrics.render_failed_count, 1);
    assert!(output.list_artifact_names("png").unwrap().is_empty());

    let fixed = FakeConnect::default().with_activity("5", "2024-01-01 10:00:00", gpx(51.5));
    let retried = engine(fixed, &output).sync_range(&jan_1()).unwrap();
    assert_eq!(retried.rendered_count, 1);

    let doc = rebuild_index(&output, "png").unwrap();
    assert_eq!(doc.entries()[0].artifact_name.as_str(), "2024-01-01-10-00.png");
}

/// Starts on a fixed date and allows a single steady pass.
struct OneShotClock {
    today: NaiveDate,
}

impl Clock for OneShotClock {
    fn today(&self) -> NaiveDate {
        self.today
    }

    fn now(&self) -> NaiveDateTime {
        self.today.and_hms_opt(9, 30, 0).unwrap()
    }

    fn sleep(&self, _duration: Duration, shutdown: &PollShutdown) -> bool {
        shutdown.request();
        false
    }
}

#[test]
fn at_sync_cycle_04_poll_loop_backfills_window_and_publishes_index() {
    let dir = tempfile::tempdir().unwrap();
    let output = OutputLocation::new(dir.path());
    let source = FakeConnect::default()
        .with_activity("old", "2023-12-01 07:00:00", gpx(10.0))
        .with_activity("a", "2024-01-02 07:00:00", gpx(11.0))
        .with_activity("b", "2024-01-04 17:30:00", gpx(12.0))
        .with_activity("today", "2024-01-05 06:00:00", gpx(13.0));
    let status = shared_poll_status();
    let poll = PollLoop::new(
        engine(source, &output),
        OneShotClock {
            today: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
        },
        PollLoopConfig {
            interval: Duration::from_secs(1_200),
            backfill_days: 30,
        },
        status.clone(),
    );

    poll.run(&PollShutdown::new());

    let html = std::fs::read_to_string(output.index_path()).unwrap();
    let order: Vec<usize> = [
        "2024-01-05-06-00.png",
        "2024-01-04-17-30.png",
        "2024-01-02-07-00.png",
    ]
    .iter()
    .map(|name| html.find(name).unwrap())
    .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]));
    assert!(!html.contains("2023-12-01"));

    let status = status.lock().unwrap();
    assert_eq!(status.artifacts_written_total, 3);
    assert_eq!(status.ranges_synced, 31);
    assert_eq!(status.index_entries, 3);
}
