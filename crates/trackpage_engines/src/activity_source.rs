#![forbid(unsafe_code)]

use trackpage_contracts::activity::{ActivityId, ActivitySummary, SyncRange};

/// Remote activity catalogue. Both calls may fail; callers decide the retry policy.
pub trait ActivitySource {
    /// Activities whose local start day falls in `range`, in the source's own order.
    fn list_activities(&self, range: &SyncRange) -> Result<Vec<ActivitySummary>, SourceError>;

    /// Raw GPX bytes for one activity.
    fn download_track(&self, activity_id: &ActivityId) -> Result<Vec<u8>, SourceError>;
}

impl<T: ActivitySource + ?Sized> ActivitySource for Box<T> {
    fn list_activities(&self, range: &SyncRange) -> Result<Vec<ActivitySummary>, SourceError> {
        (**self).list_activities(range)
    }

    fn download_track(&self, activity_id: &ActivityId) -> Result<Vec<u8>, SourceError> {
        (**self).download_track(activity_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Credentials rejected. No further call can succeed without a new session.
    Auth { http_status: u16 },
    RateLimited { retry_after_secs: u32 },
    Status { http_status: u16 },
    Transport { kind: &'static str, message: String },
    Decode { message: String },
}

impl SourceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    pub fn from_status(http_status: u16, retry_after_secs: u32) -> Self {
        match http_status {
            401 | 403 => Self::Auth { http_status },
            429 => Self::RateLimited { retry_after_secs },
            _ => Self::Status { http_status },
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: bounded(message.into()),
        }
    }

    pub fn transport(kind: &'static str, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: bounded(message.into()),
        }
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth { http_status } => {
                write!(f, "authentication rejected (http status {http_status})")
            }
            Self::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {retry_after_secs}s")
            }
            Self::Status { http_status } => write!(f, "unexpected http status {http_status}"),
            Self::Transport { kind, message } => write!(f, "transport error ({kind}): {message}"),
            Self::Decode { message } => write!(f, "malformed response: {message}"),
        }
    }
}

impl std::error::Error for SourceError {}

fn bounded(msg: String) -> String {
    if msg.len() > 256 {
        msg.chars().take(256).collect()
    } else {
        msg
    }
}
