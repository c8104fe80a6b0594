#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use trackpage_contracts::activity::ArtifactName;

use crate::ledger::DEFAULT_LEDGER_FILE_NAME;
use crate::StorageError;

pub const INDEX_FILE_NAME: &str = "index.html";

/// Directory holding rendered artifacts, the index document and (by default) the
/// ledger log.
///
/// Every whole-file write goes through a dot-prefixed temp file followed by a rename,
/// so a concurrent reader sees either the previous or the new content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLocation {
    root: PathBuf,
}

impl OutputLocation {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn ensure_exists(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)
            .map_err(|e| StorageError::io("create output dir", &self.root, e))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn default_ledger_path(&self) -> PathBuf {
        self.root.join(DEFAULT_LEDGER_FILE_NAME)
    }

    pub fn artifact_path(&self, name: &ArtifactName) -> PathBuf {
        self.root.join(name.as_str())
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE_NAME)
    }

    pub fn artifact_exists(&self, name: &ArtifactName) -> bool {
        self.artifact_path(name).is_file()
    }

    /// Creates or replaces the artifact as a unit. Returns the final path.
    pub fn write_artifact(&self, name: &ArtifactName, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        self.ensure_exists()?;
        let path = self.artifact_path(name);
        atomic_write(&path, bytes)?;
        Ok(path)
    }

    pub fn write_index(&self, html: &str) -> Result<PathBuf, StorageError> {
        self.ensure_exists()?;
        let path = self.index_path();
        atomic_write(&path, html.as_bytes())?;
        Ok(path)
    }

    /// Artifact names present on disk with the given extension, in no particular order.
    /// A missing directory lists as empty.
    pub fn list_artifact_names(&self, extension: &str) -> Result<Vec<ArtifactName>, StorageError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::io("list output dir", &self.root, err)),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io("list output dir", &self.root, e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| StorageError::io("stat output entry", entry.path(), e))?;
            if !file_type.is_file() {
                continue;
            }
            let Some(raw) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(name) = ArtifactName::parse(&raw).filter(|n| n.extension() == extension) {
                out.push(name);
            }
        }
        Ok(out)
    }
}

/// Temp file, `sync_all`, rename, then a sync of the parent directory. Once this
/// returns the new content survives a power loss, so a ledger entry recorded after it
/// never points at a missing artifact.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let tmp = temp_path_for(path);
    let written = File::create(&tmp).and_then(|mut file| {
        file.write_all(data)?;
        file.sync_all()
    });
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp);
        return Err(StorageError::io("write temp file", &tmp, err));
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(StorageError::io("rename temp file", path, err));
    }
    sync_parent_dir(path)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<(), StorageError> {
    let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StorageError::io("sync output dir", dir, e))
}

// Directory handles cannot be synced this way off unix; the rename is still atomic.
#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.tmp"))
}
