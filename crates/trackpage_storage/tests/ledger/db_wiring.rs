#![forbid(unsafe_code)]

use std::fs::{self, OpenOptions};
use std::io::Write;

use trackpage_contracts::activity::ActivityId;
use trackpage_storage::{DedupLedger, FileLedger, StorageError};

fn id(raw: &str) -> ActivityId {
    ActivityId::new(raw).unwrap()
}

#[test]
fn at_ledger_db_01_membership_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("downloaded_activities.txt");
    {
        let mut ledger = FileLedger::open(&path).unwrap();
        ledger.record(&id("14000000001")).unwrap();
        ledger.record(&id("14000000002")).unwrap();
    }

    let reopened = FileLedger::open(&path).unwrap();
    assert_eq!(reopened.len(), 2);
    assert!(reopened.contains(&id("14000000001")));
    assert!(reopened.contains(&id("14000000002")));
    assert!(!reopened.contains(&id("14000000003")));
}

#[test]
fn at_ledger_db_02_log_is_append_only_newline_delimited() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("downloaded_activities.txt");
    fs::write(&path, "legacy_1\n").unwrap();

    let mut ledger = FileLedger::open(&path).unwrap();
    ledger.record(&id("2")).unwrap();
    ledger.record(&id("3")).unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), "legacy_1\n2\n3\n");
}

#[test]
fn at_ledger_db_03_refresh_sees_entries_appended_by_another_writer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("downloaded_activities.txt");
    let mut ledger = FileLedger::open(&path).unwrap();
    assert!(!ledger.contains(&id("42")));

    let mut other = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .unwrap();
    writeln!(other, "42").unwrap();

    ledger.refresh().unwrap();
    assert!(ledger.contains(&id("42")));
}

#[test]
fn at_ledger_db_04_unwritable_log_fails_loudly_and_does_not_mark() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("downloaded_activities.txt");
    let mut ledger = FileLedger::open(&path).unwrap();
    // A directory where the log file should be makes every append fail.
    fs::create_dir(&path).unwrap();

    let err = ledger.record(&id("5")).unwrap_err();
    assert!(matches!(err, StorageError::Io { .. }));
    assert!(!ledger.contains(&id("5")));
}

#[test]
fn at_ledger_db_05_append_after_unterminated_last_line_keeps_both_ids() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("downloaded_activities.txt");
    fs::write(&path, "101").unwrap();

    let mut ledger = FileLedger::open(&path).unwrap();
    assert!(ledger.contains(&id("101")));
    ledger.record(&id("102")).unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), "101\n102\n");
    let reopened = FileLedger::open(&path).unwrap();
    assert!(reopened.contains(&id("101")));
    assert!(reopened.contains(&id("102")));
    assert_eq!(reopened.len(), 2);
}
