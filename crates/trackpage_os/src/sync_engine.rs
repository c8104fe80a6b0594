#![forbid(unsafe_code)]

use tracing::{debug, error, info, warn};
use trackpage_contracts::activity::{ActivitySummary, ArtifactName, ArtifactRecord, SyncRange};
use trackpage_contracts::ContractViolation;
use trackpage_engines::activity_source::{ActivitySource, SourceError};
use trackpage_engines::track_render::{RenderError, TrackRenderer};
use trackpage_storage::{DedupLedger, OutputLocation, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub struct SyncRangeMetrics {
    pub listed_count: u32,
    pub skipped_known_count: u32,
    pub rendered_count: u32,
    pub download_failed_count: u32,
    pub render_failed_count: u32,
    pub write_failed_count: u32,
    pub ledger_failed_count: u32,
    pub written: Vec<ArtifactRecord>,
}

impl SyncRangeMetrics {
    pub fn failed_count(&self) -> u32 {
        self.download_failed_count
            .saturating_add(self.render_failed_count)
            .saturating_add(self.write_failed_count)
            .saturating_add(self.ledger_failed_count)
    }
}

/// Range-level failure. Nothing in the range was processed.
#[derive(Debug)]
pub enum SyncError {
    Source(SourceError),
    Storage(StorageError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source(err) => write!(f, "activity listing failed: {err}"),
            Self::Storage(err) => write!(f, "ledger unavailable: {err}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<SourceError> for SyncError {
    fn from(value: SourceError) -> Self {
        Self::Source(value)
    }
}

impl From<StorageError> for SyncError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

enum ItemFailure {
    Naming(ContractViolation),
    Download(SourceError),
    Render(RenderError),
    Write(StorageError),
}

/// Materializes every activity in `range` that the ledger does not know yet.
///
/// Membership is checked before every candidate, so an id listed twice is rendered
/// once. An id is recorded only after its artifact write returned success; any
/// per-activity failure leaves it unrecorded for a later range to retry.
pub fn run_sync_range(
    source: &dyn ActivitySource,
    renderer: &dyn TrackRenderer,
    ledger: &mut dyn DedupLedger,
    output: &OutputLocation,
    range: &SyncRange,
) -> Result<SyncRangeMetrics, SyncError> {
    ledger.refresh()?;
    let candidates = source.list_activities(range)?;
    let mut metrics = SyncRangeMetrics {
        listed_count: u32::try_from(candidates.len()).unwrap_or(u32::MAX),
        ..SyncRangeMetrics::default()
    };
    if candidates.is_empty() {
        debug!(range = %range, "no activities listed");
        return Ok(metrics);
    }

    for activity in candidates {
        let activity_id = activity.activity_id.clone();
        if ledger.contains(&activity_id) {
            metrics.skipped_known_count = metrics.skipped_known_count.saturating_add(1);
            continue;
        }
        match materialize_activity(source, renderer, output, &activity) {
            Ok(record) => match ledger.record(&activity_id) {
                Ok(()) => {
                    info!(
                        activity_id = %activity_id,
                        artifact = %record.artifact_name,
                        label = %record.display_label,
                        "materialized activity {:?}",
                        activity.activity_name
                    );
                    metrics.rendered_count = metrics.rendered_count.saturating_add(1);
                    metrics.written.push(record);
                }
                Err(err) => {
                    error!(
                        activity_id = %activity_id,
                        artifact = %record.artifact_name,
                        "artifact written but ledger append failed: {err}"
                    );
                    metrics.ledger_failed_count = metrics.ledger_failed_count.saturating_add(1);
                }
            },
            Err(ItemFailure::Naming(err)) => {
                warn!(activity_id = %activity_id, "cannot name artifact: {err}");
                metrics.render_failed_count = metrics.render_failed_count.saturating_add(1);
            }
            Err(ItemFailure::Download(err)) => {
                warn!(activity_id = %activity_id, "track download failed: {err}");
                metrics.download_failed_count = metrics.download_failed_count.saturating_add(1);
            }
            Err(ItemFailure::Render(err)) => {
                warn!(activity_id = %activity_id, "track render failed: {err}");
                metrics.render_failed_count = metrics.render_failed_count.saturating_add(1);
            }
            Err(ItemFailure::Write(err)) => {
                warn!(activity_id = %activity_id, "artifact write failed: {err}");
                metrics.write_failed_count = metrics.write_failed_count.saturating_add(1);
            }
        }
    }
    Ok(metrics)
}

fn materialize_activity(
    source: &dyn ActivitySource,
    renderer: &dyn TrackRenderer,
    output: &OutputLocation,
    activity: &ActivitySummary,
) -> Result<ArtifactRecord, ItemFailure> {
    let artifact_name = ArtifactName::for_start_time(activity.start_time_local, renderer.extension())
        .map_err(ItemFailure::Naming)?;
    let raw_track = source
        .download_track(&activity.activity_id)
        .map_err(ItemFailure::Download)?;
    let rendered = renderer
        .render(&raw_track, activity.start_time_local)
        .map_err(ItemFailure::Render)?;
    output
        .write_artifact(&artifact_name, &rendered.bytes)
        .map_err(ItemFailure::Write)?;
    Ok(ArtifactRecord {
        activity_id: activity.activity_id.clone(),
        artifact_name,
        created_at: activity.start_time_local,
        display_label: rendered.display_label,
    })
}

/// Owns the collaborators of one sync pipeline so a poll loop can drive it from a
/// dedicated thread.
pub struct SyncEngine {
    source: Box<dyn ActivitySource + Send>,
    renderer: Box<dyn TrackRenderer + Send>,
    ledger: Box<dyn DedupLedger + Send>,
    output: OutputLocation,
}

impl SyncEngine {
    pub fn new(
        source: Box<dyn ActivitySource + Send>,
        renderer: Box<dyn TrackRenderer + Send>,
        ledger: Box<dyn DedupLedger + Send>,
        output: OutputLocation,
    ) -> Self {
        Self {
            source,
            renderer,
            ledger,
            output,
        }
    }

    pub fn sync_range(&mut self, range: &SyncRange) -> Result<SyncRangeMetrics, SyncError> {
        run_sync_range(
            self.source.as_ref(),
            self.renderer.as_ref(),
            self.ledger.as_mut(),
            &self.output,
            range,
        )
    }

    pub fn output(&self) -> &OutputLocation {
        &self.output
    }

    pub fn artifact_extension(&self) -> &'static str {
        self.renderer.extension()
    }

    pub fn ledger(&self) -> &dyn DedupLedger {
        self.ledger.as_ref()
    }
}
