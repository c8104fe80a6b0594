#![forbid(unsafe_code)]

pub mod index_builder;
pub mod poll_loop;
pub mod sync_engine;

pub use index_builder::{rebuild_index, IndexDocument, IndexEntry, IndexError};
pub use poll_loop::{
    backfill_days, shared_poll_status, Clock, PollLoop, PollLoopConfig, PollPhase, PollShutdown,
    PollStatus, SharedPollStatus, SystemClock,
};
pub use sync_engine::{run_sync_range, SyncEngine, SyncError, SyncRangeMetrics};
