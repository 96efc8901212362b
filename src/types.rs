//! Core domain types for backhaul
//!
//! Two kinds of types live here:
//!
//! - In-memory records owned by the backlog ([`OfflineSession`],
//!   [`QueuedRequest`]) and the notifications it emits ([`BacklogEvent`]).
//! - The persisted document shapes ([`SessionsDocument`],
//!   [`RequestsDocument`]). Their field names and integer enum codes are the
//!   on-disk wire format; backlogs written by older clients must keep
//!   decoding, so they are not free to change.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Seconds since the UNIX epoch, UTC, with sub-second precision.
pub(crate) fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

// ============================================
// API methods
// ============================================

/// Collector API calls, with their persisted integer codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum ApiMethod {
    RegisterUser,
    RegisterDevice,
    StartSession,
    RegisterEvent,
    PurchaseItem,
    GetItems,
    EndSession,
    AlivePing,
    /// Replay of an offline session recorded while disconnected
    RegisterOldSession,
}

impl ApiMethod {
    /// Persisted wire code for this method
    pub fn code(&self) -> i32 {
        match self {
            ApiMethod::RegisterUser => 0,
            ApiMethod::RegisterDevice => 1,
            ApiMethod::StartSession => 2,
            ApiMethod::RegisterEvent => 3,
            ApiMethod::PurchaseItem => 4,
            ApiMethod::GetItems => 5,
            ApiMethod::EndSession => 7,
            ApiMethod::AlivePing => 8,
            ApiMethod::RegisterOldSession => 666,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiMethod::RegisterUser => "register_user",
            ApiMethod::RegisterDevice => "register_device",
            ApiMethod::StartSession => "start_session",
            ApiMethod::RegisterEvent => "register_event",
            ApiMethod::PurchaseItem => "purchase_item",
            ApiMethod::GetItems => "get_items",
            ApiMethod::EndSession => "end_session",
            ApiMethod::AlivePing => "alive_ping",
            ApiMethod::RegisterOldSession => "register_old_session",
        }
    }
}

impl std::fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ApiMethod> for i32 {
    fn from(method: ApiMethod) -> i32 {
        method.code()
    }
}

impl TryFrom<i32> for ApiMethod {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ApiMethod::RegisterUser),
            1 => Ok(ApiMethod::RegisterDevice),
            2 => Ok(ApiMethod::StartSession),
            3 => Ok(ApiMethod::RegisterEvent),
            4 => Ok(ApiMethod::PurchaseItem),
            5 => Ok(ApiMethod::GetItems),
            7 => Ok(ApiMethod::EndSession),
            8 => Ok(ApiMethod::AlivePing),
            666 => Ok(ApiMethod::RegisterOldSession),
            _ => Err(format!("unknown api method code: {}", code)),
        }
    }
}

/// HTTP verb, with its persisted integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum HttpMethod {
    Get,
    Put,
    Post,
    Delete,
}

impl HttpMethod {
    pub fn code(&self) -> i32 {
        match self {
            HttpMethod::Get => 0,
            HttpMethod::Put => 1,
            HttpMethod::Post => 2,
            HttpMethod::Delete => -1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
            HttpMethod::Post => "POST",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<HttpMethod> for i32 {
    fn from(method: HttpMethod) -> i32 {
        method.code()
    }
}

impl TryFrom<i32> for HttpMethod {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(HttpMethod::Get),
            1 => Ok(HttpMethod::Put),
            2 => Ok(HttpMethod::Post),
            -1 => Ok(HttpMethod::Delete),
            _ => Err(format!("unknown http method code: {}", code)),
        }
    }
}

// ============================================
// Offline sessions
// ============================================

/// A session recorded while the device had no connectivity.
///
/// The placeholder ID is a random negative integer that stands in for the
/// server-assigned session ID until the session is replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineSession {
    /// Negative, unique among currently pending offline sessions
    pub placeholder_id: i64,
    /// When the session began, seconds since epoch (UTC)
    pub start_timestamp: f64,
    /// Running total of elapsed seconds, grown by the ticker while open
    pub duration_estimate: f64,
    /// Endpoint to call when the session is registered with the server
    pub replay_url: String,
}

/// Persisted form of an [`OfflineSession`].
///
/// The on-disk record stores an end timestamp rather than a duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub fake_id: i64,
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    pub url: String,
}

impl From<OfflineSession> for SessionRecord {
    fn from(session: OfflineSession) -> Self {
        SessionRecord {
            fake_id: session.placeholder_id,
            end_timestamp: session.start_timestamp + session.duration_estimate,
            start_timestamp: session.start_timestamp,
            url: session.replay_url,
        }
    }
}

impl From<SessionRecord> for OfflineSession {
    fn from(record: SessionRecord) -> Self {
        OfflineSession {
            placeholder_id: record.fake_id,
            duration_estimate: record.end_timestamp - record.start_timestamp,
            start_timestamp: record.start_timestamp,
            replay_url: record.url,
        }
    }
}

// ============================================
// Queued requests
// ============================================

/// A request that could not be delivered and waits in the backlog.
///
/// Field names match the persisted document; `post_data` may contain a
/// `session` entry holding either a real session ID or a placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub url: String,
    pub dataspin_method: ApiMethod,
    pub http_method: HttpMethod,
    pub post_data: Map<String, Value>,
    /// Unique ordinal from the monotonically decreasing pid counter
    pub task_pid: i64,
}

// ============================================
// Persisted documents
// ============================================

/// Persisted sessions document: `{"sessions": [...], "lastPid": n}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionsDocument {
    pub sessions: Vec<SessionRecord>,
    #[serde(rename = "lastPid")]
    pub last_pid: i64,
}

impl SessionsDocument {
    /// Document written on first run, before anything is queued
    pub fn empty() -> Self {
        SessionsDocument {
            sessions: Vec::new(),
            last_pid: 1,
        }
    }
}

/// Persisted requests document: `{"requests": [...]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestsDocument {
    pub requests: Vec<QueuedRequest>,
}

impl RequestsDocument {
    pub fn empty() -> Self {
        RequestsDocument {
            requests: Vec::new(),
        }
    }
}

// ============================================
// Notifications
// ============================================

/// Typed notifications emitted by the backlog subsystem.
///
/// Failures never escape the subsystem as panics or bare errors; callers
/// consume these from the event channel and decide whether to log or surface
/// them.
#[derive(Debug, Clone, PartialEq)]
pub enum BacklogEvent {
    /// A persisted document failed to decode on load; the collection was
    /// reset to empty and the process keeps running
    BacklogCorrupted { key: String, reason: String },
    /// Encode/encrypt/write failed during a flush; the write cycle was
    /// skipped and will be retried on the next mutation
    BacklogFlushError { reason: String },
    /// An offline session was registered with the server
    SessionReplayed {
        placeholder_id: i64,
        session_id: i64,
    },
    /// A queued request was delivered and removed from the backlog
    RequestReplayed { task_pid: i64 },
    /// A replay task failed; the record stays queued for the next replay
    TaskFailed { task_pid: i64, reason: String },
}
