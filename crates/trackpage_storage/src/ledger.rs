#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use trackpage_contracts::activity::ActivityId;
use tracing::warn;

use crate::StorageError;

pub const DEFAULT_LEDGER_FILE_NAME: &str = "downloaded_activities.txt";

/// Durable set of activity ids whose artifact has been written.
///
/// Append-only: ids are never removed. Callers must only `record` an id after the
/// corresponding artifact write returned success.
pub trait DedupLedger {
    /// Reloads membership from the backing store.
    fn refresh(&mut self) -> Result<(), StorageError>;

    fn contains(&self, activity_id: &ActivityId) -> bool;

    /// Durably appends `activity_id`. Recording an id that is already present is a no-op.
    fn record(&mut self, activity_id: &ActivityId) -> Result<(), StorageError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Newline-delimited id log. Membership is rebuilt from the whole file on open and
/// on every `refresh`; the file is never compacted.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    members: BTreeSet<ActivityId>,
}

impl FileLedger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::io("create ledger dir", parent, e))?;
        }
        let members = load_members(&path)?;
        Ok(Self { path, members })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn members(&self) -> impl Iterator<Item = &ActivityId> {
        self.members.iter()
    }
}

impl DedupLedger for FileLedger {
    fn refresh(&mut self) -> Result<(), StorageError> {
        self.members = load_members(&self.path)?;
        Ok(())
    }

    fn contains(&self, activity_id: &ActivityId) -> bool {
        self.members.contains(activity_id)
    }

    fn record(&mut self, activity_id: &ActivityId) -> Result<(), StorageError> {
        if self.members.contains(activity_id) {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StorageError::io("open ledger for append", &self.path, e))?;
        let mut entry = String::with_capacity(activity_id.as_str().len() + 2);
        // A log whose last line lacks its newline would otherwise fuse with this id.
        if !ends_with_newline(&mut file)
            .map_err(|e| StorageError::io("read ledger tail", &self.path, e))?
        {
            entry.push('\n');
        }
        entry.push_str(activity_id.as_str());
        entry.push('\n');
        file.write_all(entry.as_bytes())
            .map_err(|e| StorageError::io("append ledger entry", &self.path, e))?;
        file.sync_data()
            .map_err(|e| StorageError::io("sync ledger", &self.path, e))?;
        self.members.insert(activity_id.clone());
        Ok(())
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

/// True for an empty file, since there is no unterminated line to close.
fn ends_with_newline(file: &mut fs::File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn load_members(path: &Path) -> Result<BTreeSet<ActivityId>, StorageError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => return Err(StorageError::io("read ledger", path, err)),
    };
    let mut members = BTreeSet::new();
    for (line_no, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match ActivityId::new(trimmed) {
            Ok(id) => {
                members.insert(id);
            }
            Err(err) => {
                warn!(
                    ledger = %path.display(),
                    line = line_no + 1,
                    "skipping unreadable ledger entry: {err}"
                );
            }
        }
    }
    Ok(members)
}

/// Non-durable ledger. `failing_records` makes every new `record` fail, which is how
/// tests exercise an unwritable ledger.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLedger {
    members: BTreeSet<ActivityId>,
    fail_records: bool,
    record_calls: usize,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = ActivityId>,
    {
        Self {
            members: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn failing_records() -> Self {
        Self {
            fail_records: true,
            ..Self::default()
        }
    }

    pub fn set_fail_records(&mut self, fail: bool) {
        self.fail_records = fail;
    }

    pub fn record_calls(&self) -> usize {
        self.record_calls
    }

    pub fn members(&self) -> impl Iterator<Item = &ActivityId> {
        self.members.iter()
    }
}

impl DedupLedger for InMemoryLedger {
    fn refresh(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn contains(&self, activity_id: &ActivityId) -> bool {
        self.members.contains(activity_id)
    }

    fn record(&mut self, activity_id: &ActivityId) -> Result<(), StorageError> {
        self.record_calls += 1;
        if self.members.contains(activity_id) {
            return Ok(());
        }
        if self.fail_records {
            return Err(StorageError::io(
                "append ledger entry",
                "memory://ledger",
                std::io::Error::new(ErrorKind::PermissionDenied, "ledger is read-only"),
            ));
        }
        self.members.insert(activity_id.clone());
        Ok(())
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}
