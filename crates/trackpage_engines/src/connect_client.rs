#![forbid(unsafe_code)]

use std::env;
use std::io::Read;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};
use trackpage_contracts::activity::{
    parse_source_start_time, ActivityId, ActivitySummary, SyncRange,
};
use url::Url;

use crate::activity_source::{ActivitySource, SourceError};

pub const CONNECT_API_BASE_DEFAULT: &str = "https://connectapi.garmin.com";
pub const CONNECT_RETRY_AFTER_SECS_DEFAULT: u32 = 60;
const ACTIVITY_LIST_PATH: &str = "activitylist-service/activities/search/activities";
const GPX_DOWNLOAD_PATH: &str = "download-service/export/gpx/activity/";
const SESSION_CHECK_PATH: &str = "userprofile-service/socialProfile";
const JSON_ACCEPT: &str = "application/json";
const GPX_ACCEPT: &str = "application/gpx+xml, application/xml;q=0.9, */*;q=0.8";
const MAX_TRACK_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectHttpConfig {
    pub api_base: Url,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub user_agent: String,
}

impl ConnectHttpConfig {
    pub fn new(api_base: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            api_base: normalize_base(Url::parse(api_base.trim())?),
            connect_timeout_ms: 3_000,
            request_timeout_ms: 30_000,
            user_agent: format!("trackpage/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    pub fn from_env() -> Result<Self, url::ParseError> {
        let api_base = env::var("TRACKPAGE_CONNECT_API_BASE")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| CONNECT_API_BASE_DEFAULT.to_string());
        let mut config = Self::new(&api_base)?;
        config.connect_timeout_ms = env::var("TRACKPAGE_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| (100..=120_000).contains(v))
            .unwrap_or(3_000);
        config.request_timeout_ms = env::var("TRACKPAGE_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| (100..=120_000).contains(v))
            .unwrap_or(30_000);
        Ok(config)
    }

    pub fn build_agent(&self) -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(self.connect_timeout_ms))
            .timeout_read(Duration::from_millis(self.request_timeout_ms))
            .timeout_write(Duration::from_millis(self.request_timeout_ms))
            .user_agent(&self.user_agent)
            .build()
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, SourceError> {
        self.api_base
            .join(path)
            .map_err(|e| SourceError::decode(format!("invalid endpoint {path}: {e}")))
    }
}

/// Join semantics drop the last path segment unless it ends in `/`.
fn normalize_base(mut base: Url) -> Url {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

/// Authenticated Connect API client.
#[derive(Clone)]
pub struct ConnectClient {
    agent: ureq::Agent,
    config: ConnectHttpConfig,
    access_token: String,
}

impl std::fmt::Debug for ConnectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectClient")
            .field("api_base", &self.config.api_base.as_str())
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl ConnectClient {
    pub fn new(config: ConnectHttpConfig, access_token: String) -> Self {
        Self {
            agent: config.build_agent(),
            config,
            access_token,
        }
    }

    pub fn config(&self) -> &ConnectHttpConfig {
        &self.config
    }

    /// Cheap authenticated call used to check that a stored token is still accepted.
    pub fn verify_session(&self) -> Result<(), SourceError> {
        let url = self.config.endpoint(SESSION_CHECK_PATH)?;
        self.get(&url, JSON_ACCEPT).map(|_| ())
    }

    fn get(&self, url: &Url, accept: &str) -> Result<ureq::Response, SourceError> {
        self.agent
            .get(url.as_str())
            .set("authorization", &format!("Bearer {}", self.access_token))
            .set("accept", accept)
            .call()
            .map_err(source_error_from_ureq)
    }
}

impl ActivitySource for ConnectClient {
    fn list_activities(&self, range: &SyncRange) -> Result<Vec<ActivitySummary>, SourceError> {
        let mut url = self.config.endpoint(ACTIVITY_LIST_PATH)?;
        url.query_pairs_mut()
            .append_pair("startDate", &range.start.format("%Y-%m-%d").to_string())
            .append_pair("endDate", &range.end.format("%Y-%m-%d").to_string());
        let body = self
            .get(&url, JSON_ACCEPT)?
            .into_string()
            .map_err(|e| SourceError::transport("read_body", e.to_string()))?;
        let activities = parse_activity_list(&body)?;
        debug!(range = %range, count = activities.len(), "listed activities");
        Ok(activities)
    }

    fn download_track(&self, activity_id: &ActivityId) -> Result<Vec<u8>, SourceError> {
        let url = self
            .config
            .endpoint(&format!("{GPX_DOWNLOAD_PATH}{}", activity_id.as_str()))?;
        let resp = self.get(&url, GPX_ACCEPT)?;
        let mut bytes = Vec::new();
        resp.into_reader()
            .take(MAX_TRACK_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|e| SourceError::transport("read_body", e.to_string()))?;
        Ok(bytes)
    }
}

/// Parses the activity search response. Entries that do not form a valid summary are
/// skipped; a body that is not a JSON array is an error.
pub fn parse_activity_list(body: &str) -> Result<Vec<ActivitySummary>, SourceError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| SourceError::decode(format!("activity list is not json: {e}")))?;
    let Value::Array(entries) = value else {
        return Err(SourceError::decode("activity list must be a json array"));
    };
    let mut out = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        match parse_activity_entry(entry) {
            Ok(summary) => out.push(summary),
            Err(reason) => warn!(index = idx, "skipping activity list entry: {reason}"),
        }
    }
    Ok(out)
}

fn parse_activity_entry(entry: &Value) -> Result<ActivitySummary, String> {
    let raw_id = match entry.get("activityId") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        _ => return Err("missing activityId".to_string()),
    };
    let activity_id = ActivityId::new(raw_id).map_err(|e| e.to_string())?;
    let activity_name = entry
        .get("activityName")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let start_raw = entry
        .get("startTimeLocal")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("activity {activity_id} is missing startTimeLocal"))?;
    let start_time_local = parse_source_start_time(start_raw).map_err(|e| e.to_string())?;
    ActivitySummary::v1(activity_id, activity_name, start_time_local).map_err(|e| e.to_string())
}

pub(crate) fn source_error_from_ureq(err: ureq::Error) -> SourceError {
    match err {
        ureq::Error::Status(code, resp) => {
            SourceError::from_status(code, parse_retry_after_secs(resp.header("retry-after")))
        }
        ureq::Error::Transport(transport) => {
            let combined = format!("{:?} {}", transport.kind(), transport);
            SourceError::transport(classify_transport_error_kind(&combined), transport.to_string())
        }
    }
}

fn classify_transport_error_kind(raw: &str) -> &'static str {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        "timeout"
    } else if lower.contains("tls") || lower.contains("ssl") {
        "tls"
    } else if lower.contains("dns") {
        "dns"
    } else if lower.contains("connect") {
        "connect"
    } else {
        "transport"
    }
}

fn parse_retry_after_secs(header: Option<&str>) -> u32 {
    header
        .and_then(|h| h.trim().parse::<u32>().ok())
        .filter(|s| (1..=3_600).contains(s))
        .unwrap_or(CONNECT_RETRY_AFTER_SECS_DEFAULT)
}
