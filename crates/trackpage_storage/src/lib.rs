#![forbid(unsafe_code)]

pub mod error;
pub mod ledger;
pub mod output;

pub use error::StorageError;
pub use ledger::{DedupLedger, FileLedger, InMemoryLedger};
pub use output::OutputLocation;
