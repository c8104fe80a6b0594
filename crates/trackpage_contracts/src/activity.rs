#![forbid(unsafe_code)]

use chrono::{NaiveDate, NaiveDateTime};

use crate::{ContractViolation, SchemaVersion, Validate};

pub const ACTIVITY_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const ARTIFACT_EXTENSION: &str = "png";
pub const ARTIFACT_NAME_TIME_FORMAT: &str = "%Y-%m-%d-%H-%M";
pub const DISPLAY_LABEL_FORMAT: &str = "%Y-%m-%d @ %H:%M";
pub const SOURCE_START_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const ACTIVITY_ID_MAX_LEN: usize = 64;
const ACTIVITY_NAME_MAX_LEN: usize = 256;
const ARTIFACT_EXTENSION_MAX_LEN: usize = 8;

/// Opaque identifier assigned by the remote service. Stable across fetches.
///
/// Ids are persisted one per line in the dedup ledger, so whitespace and path
/// separators are rejected at construction.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ActivityId(String);

impl ActivityId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = Self(raw.into());
        id.validate()?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActivityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Validate for ActivityId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "activity_id",
                reason: "must not be empty",
            });
        }
        if self.0.len() > ACTIVITY_ID_MAX_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "activity_id",
                reason: "exceeds max length",
            });
        }
        if self
            .0
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '/' || c == '\\')
        {
            return Err(ContractViolation::InvalidValue {
                field: "activity_id",
                reason: "must not contain whitespace, control characters or path separators",
            });
        }
        Ok(())
    }
}

/// Inclusive day range handed to the activity source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SyncRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ContractViolation> {
        let r = Self { start, end };
        r.validate()?;
        Ok(r)
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }
}

impl std::fmt::Display for SyncRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..={}", self.start, self.end)
        }
    }
}

impl Validate for SyncRange {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.start > self.end {
            return Err(ContractViolation::InvalidValue {
                field: "sync_range",
                reason: "start must not be after end",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivitySummary {
    pub schema_version: SchemaVersion,
    pub activity_id: ActivityId,
    pub activity_name: String,
    pub start_time_local: NaiveDateTime,
}

impl ActivitySummary {
    pub fn v1(
        activity_id: ActivityId,
        activity_name: String,
        start_time_local: NaiveDateTime,
    ) -> Result<Self, ContractViolation> {
        let s = Self {
            schema_version: ACTIVITY_CONTRACT_VERSION,
            activity_id,
            activity_name,
            start_time_local,
        };
        s.validate()?;
        Ok(s)
    }
}

impl Validate for ActivitySummary {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != ACTIVITY_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "activity_summary.schema_version",
                reason: "must match ACTIVITY_CONTRACT_VERSION",
            });
        }
        self.activity_id.validate()?;
        if self.activity_name.len() > ACTIVITY_NAME_MAX_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "activity_summary.activity_name",
                reason: "exceeds max length",
            });
        }
        Ok(())
    }
}

/// File name of a rendered artifact: `YYYY-MM-DD-HH-MM.<ext>`.
///
/// The name is a pure function of the activity start time, so rendering the same
/// activity twice lands on the same file. Lexicographic order on names equals
/// chronological order on start times.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactName(String);

impl ArtifactName {
    pub fn for_start_time(
        start_time_local: NaiveDateTime,
        extension: &str,
    ) -> Result<Self, ContractViolation> {
        validate_extension(extension)?;
        Ok(Self(format!(
            "{}.{}",
            start_time_local.format(ARTIFACT_NAME_TIME_FORMAT),
            extension
        )))
    }

    /// Returns `None` for anything that is not exactly a canonical artifact name.
    pub fn parse(raw: &str) -> Option<Self> {
        let (stem, extension) = raw.rsplit_once('.')?;
        validate_extension(extension).ok()?;
        let parsed = parse_stem(stem)?;
        if parsed.format(ARTIFACT_NAME_TIME_FORMAT).to_string() != stem {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn extension(&self) -> &str {
        self.0.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
    }

    pub fn start_time(&self) -> Option<NaiveDateTime> {
        let (stem, _) = self.0.rsplit_once('.')?;
        parse_stem(stem)
    }

    pub fn display_label(&self) -> String {
        self.start_time()
            .map(display_label_for)
            .unwrap_or_else(|| self.0.clone())
    }
}

impl std::fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn display_label_for(start_time_local: NaiveDateTime) -> String {
    start_time_local.format(DISPLAY_LABEL_FORMAT).to_string()
}

pub fn parse_source_start_time(raw: &str) -> Result<NaiveDateTime, ContractViolation> {
    NaiveDateTime::parse_from_str(raw.trim(), SOURCE_START_TIME_FORMAT).map_err(|_| {
        ContractViolation::InvalidValue {
            field: "activity_summary.start_time_local",
            reason: "must be formatted as YYYY-MM-DD HH:MM:SS",
        }
    })
}

fn parse_stem(stem: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(stem, ARTIFACT_NAME_TIME_FORMAT).ok()
}

fn validate_extension(extension: &str) -> Result<(), ContractViolation> {
    if extension.is_empty()
        || extension.len() > ARTIFACT_EXTENSION_MAX_LEN
        || !extension.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(ContractViolation::InvalidValue {
            field: "artifact_name.extension",
            reason: "must be 1-8 ascii alphanumeric characters",
        });
    }
    Ok(())
}

/// One materialized activity, as reported by a sync pass.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ArtifactRecord {
    pub activity_id: ActivityId,
    #[serde(serialize_with = "serialize_artifact_name")]
    pub artifact_name: ArtifactName,
    pub created_at: NaiveDateTime,
    pub display_label: String,
}

fn serialize_artifact_name<S>(name: &ArtifactName, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(name.as_str())
}
