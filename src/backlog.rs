//! The offline backlog: pending sessions, pending requests, debounced flush
//!
//! [`BacklogStore`] is the single authoritative in-memory copy of everything
//! that has not yet reached the server. It owns placeholder-ID allocation,
//! the decreasing task-pid counter, and the flush-debounce bookkeeping; it
//! never spawns tasks or performs network IO itself. There is exactly one
//! instance per pipeline, constructed at startup and owned by the service
//! loop; there is no ambient global.
//!
//! Mutations only mark state dirty; writing through the codec to the
//! persistent store happens once the store has been quiescent for the
//! debounce window (or explicitly via [`BacklogStore::flush_now`]).

use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Duration, Instant};

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::reconcile::session_ref_matches;
use crate::store::{PersistentStore, REQUESTS_KEY, SESSIONS_KEY};
use crate::types::{
    ApiMethod, BacklogEvent, HttpMethod, OfflineSession, QueuedRequest, RequestsDocument,
    SessionsDocument,
};

/// Placeholder IDs are drawn from this range, matching legacy clients.
const PLACEHOLDER_RANGE: std::ops::RangeInclusive<i64> = -10_000_000..=-1;

/// Only these event kinds are worth queueing when delivery fails; session
/// lifecycle and identity calls are simply retried live by the caller.
const BACKLOG_METHODS: [ApiMethod; 2] = [ApiMethod::PurchaseItem, ApiMethod::RegisterEvent];

/// The server-confirmed session the device is currently in, if any.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveSession {
    pub id: i64,
    /// Seconds since epoch when the session started
    pub started_at: f64,
}

/// A request handed to the backlog for later delivery.
///
/// The backlog stamps `session` and `dt` itself; callers supply only the
/// event payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub method: ApiMethod,
    pub http_method: HttpMethod,
    pub url: String,
    pub post_data: Map<String, Value>,
}

/// Authoritative store of pending offline sessions and requests.
pub struct BacklogStore<S> {
    store: S,
    codec: Codec,
    sessions: Vec<OfflineSession>,
    requests: Vec<QueuedRequest>,
    /// Next task pid to hand out; decreases forever and is persisted so it
    /// never collides across restarts
    last_pid: i64,
    /// Placeholder ID of the offline session currently being ticked
    active_session: Option<i64>,
    live_session: Option<LiveSession>,
    debounce: Duration,
    flush_deadline: Option<Instant>,
    events: UnboundedSender<BacklogEvent>,
}

impl<S: PersistentStore> BacklogStore<S> {
    pub fn new(
        store: S,
        codec: Codec,
        debounce: Duration,
        events: UnboundedSender<BacklogEvent>,
    ) -> Self {
        BacklogStore {
            store,
            codec,
            sessions: Vec::new(),
            requests: Vec::new(),
            last_pid: 1,
            active_session: None,
            live_session: None,
            debounce,
            flush_deadline: None,
            events,
        }
    }

    // ============================================
    // Startup
    // ============================================

    /// Load both persisted documents.
    ///
    /// A missing document initializes an empty collection. A document that
    /// fails to decrypt or parse emits [`BacklogEvent::BacklogCorrupted`]
    /// and also initializes empty: data loss is the accepted recovery, the
    /// process must keep running. Store read errors propagate.
    pub fn load(&mut self) -> Result<()> {
        match self.load_document::<SessionsDocument>(SESSIONS_KEY)? {
            Some(doc) => {
                self.last_pid = doc.last_pid;
                self.sessions = doc.sessions.into_iter().map(Into::into).collect();
                tracing::debug!(
                    sessions = self.sessions.len(),
                    last_pid = self.last_pid,
                    "sessions backlog loaded"
                );
            }
            None => {
                self.sessions = Vec::new();
            }
        }

        match self.load_document::<RequestsDocument>(REQUESTS_KEY)? {
            Some(doc) => {
                self.requests = doc.requests;
                tracing::debug!(requests = self.requests.len(), "requests backlog loaded");
            }
            None => {
                self.requests = Vec::new();
            }
        }

        // the counter lives in the sessions document; if that document was
        // reset while requests survived, it must still stay below every pid
        // already in use
        if let Some(min_pid) = self.requests.iter().map(|r| r.task_pid).min() {
            self.last_pid = self.last_pid.min(min_pid - 1);
        }

        Ok(())
    }

    fn load_document<T: serde::de::DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>> {
        let Some(blob) = self.store.get(key)? else {
            tracing::debug!(key, "no persisted backlog yet");
            return Ok(None);
        };
        // legacy clients sometimes persisted an empty placeholder value
        if blob.len() < 2 {
            return Ok(None);
        }
        match self.codec.decode::<T>(&blob) {
            Ok(doc) => Ok(Some(doc)),
            Err(err) => {
                tracing::warn!(key, error = %err, "persisted backlog is corrupted, resetting");
                self.notify(BacklogEvent::BacklogCorrupted {
                    key: key.to_string(),
                    reason: err.to_string(),
                });
                Ok(None)
            }
        }
    }

    // ============================================
    // Enqueue / dequeue
    // ============================================

    /// Whether a failed call of this kind belongs in the backlog.
    pub fn should_backlog(&self, method: ApiMethod) -> bool {
        BACKLOG_METHODS.contains(&method)
    }

    /// Queue a request for later delivery.
    ///
    /// Stamps `session` (active placeholder or live session ID) and `dt`
    /// (seconds since that session started), assigns the next task pid, and
    /// schedules a flush. Returns the assigned pid.
    pub fn enqueue_request(&mut self, request: PendingRequest, now: f64) -> i64 {
        let mut post_data = request.post_data;

        if let Some(placeholder_id) = self.active_session {
            let started_at = self
                .sessions
                .iter()
                .find(|s| s.placeholder_id == placeholder_id)
                .map(|s| s.start_timestamp)
                .unwrap_or(now);
            post_data.insert("dt".to_string(), Value::from((now - started_at) as i64));
            post_data.insert("session".to_string(), Value::from(placeholder_id));
        } else if let Some(live) = self.live_session {
            post_data.insert("dt".to_string(), Value::from((now - live.started_at) as i64));
            post_data.insert("session".to_string(), Value::from(live.id));
        }

        let task_pid = self.last_pid;
        self.last_pid -= 1;

        tracing::debug!(
            task_pid,
            method = %request.method,
            url = %request.url,
            "queueing request on backlog"
        );

        self.requests.push(QueuedRequest {
            url: request.url,
            dataspin_method: request.method,
            http_method: request.http_method,
            post_data,
            task_pid,
        });
        self.schedule_flush();
        task_pid
    }

    /// Open a new offline session with a fresh negative placeholder ID.
    ///
    /// Returns [`Error::SessionAlreadyOpen`] if one is already active;
    /// callers must close or replay it first.
    pub fn open_offline_session(&mut self, replay_url: String, now: f64) -> Result<i64> {
        if let Some(placeholder_id) = self.active_session {
            return Err(Error::SessionAlreadyOpen(placeholder_id));
        }

        let mut rng = rand::thread_rng();
        let placeholder_id = loop {
            let candidate = rand::Rng::gen_range(&mut rng, PLACEHOLDER_RANGE);
            if !self.sessions.iter().any(|s| s.placeholder_id == candidate) {
                break candidate;
            }
        };

        tracing::info!(placeholder_id, "opening offline session");

        self.sessions.push(OfflineSession {
            placeholder_id,
            start_timestamp: now,
            duration_estimate: 0.0,
            replay_url,
        });
        self.active_session = Some(placeholder_id);
        self.schedule_flush();
        Ok(placeholder_id)
    }

    /// Stop treating the active offline session as open (ticks no longer
    /// apply to it). Called once its replay succeeded, or on session end.
    pub fn close_offline_session(&mut self) {
        if let Some(placeholder_id) = self.active_session.take() {
            tracing::debug!(placeholder_id, "offline session closed");
        }
    }

    /// Extend the active offline session's recorded duration.
    pub fn tick_active_session(&mut self, seconds: f64) {
        let Some(placeholder_id) = self.active_session else {
            return;
        };
        if let Some(session) = self
            .sessions
            .iter_mut()
            .find(|s| s.placeholder_id == placeholder_id)
        {
            session.duration_estimate += seconds;
            tracing::trace!(
                placeholder_id,
                duration = session.duration_estimate,
                "ticking offline session"
            );
            self.schedule_flush();
        }
    }

    /// Remove a pending offline session after its successful replay.
    pub fn remove_session(&mut self, placeholder_id: i64) {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.placeholder_id != placeholder_id);
        if self.sessions.len() != before {
            tracing::debug!(placeholder_id, "removed replayed session from backlog");
            self.schedule_flush();
        }
    }

    /// Remove a pending request after its successful replay.
    pub fn remove_request(&mut self, task_pid: i64) {
        let before = self.requests.len();
        self.requests.retain(|r| r.task_pid != task_pid);
        if self.requests.len() != before {
            tracing::debug!(task_pid, "removed replayed request from backlog");
            self.schedule_flush();
        }
    }

    /// Rewrite every pending request whose `session` field references
    /// `placeholder_id` to carry `session_id` instead. Returns the number of
    /// requests rewritten.
    pub fn rewrite_session_refs(&mut self, placeholder_id: i64, session_id: i64) -> usize {
        let mut rewritten = 0;
        for request in &mut self.requests {
            let matches = request
                .post_data
                .get("session")
                .map(|v| session_ref_matches(v, placeholder_id))
                .unwrap_or(false);
            if matches {
                request
                    .post_data
                    .insert("session".to_string(), Value::from(session_id));
                rewritten += 1;
            }
        }
        if rewritten > 0 {
            tracing::debug!(placeholder_id, session_id, rewritten, "rewrote session refs");
            self.schedule_flush();
        }
        rewritten
    }

    // ============================================
    // Live session tracking
    // ============================================

    pub fn set_live_session(&mut self, id: i64, started_at: f64) {
        self.live_session = Some(LiveSession { id, started_at });
    }

    pub fn clear_live_session(&mut self) {
        self.live_session = None;
    }

    // ============================================
    // Flush
    // ============================================

    /// Reset the debounce countdown; the flush fires once no further
    /// mutation arrives within the window.
    fn schedule_flush(&mut self) {
        self.flush_deadline = Some(Instant::now() + self.debounce);
    }

    /// When the next debounced flush is due, if one is pending.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.flush_deadline
    }

    /// Flush if the debounce window has elapsed. Returns whether a flush ran.
    pub fn flush_if_due(&mut self, now: Instant) -> bool {
        match self.flush_deadline {
            Some(deadline) if deadline <= now => {
                self.flush_now();
                true
            }
            _ => false,
        }
    }

    /// Serialize both collections and write them through the codec.
    ///
    /// On failure the write cycle is skipped and
    /// [`BacklogEvent::BacklogFlushError`] is emitted; in-memory state stays
    /// authoritative and the next mutation re-arms the flush.
    pub fn flush_now(&mut self) {
        self.flush_deadline = None;
        if let Err(err) = self.write_documents() {
            tracing::warn!(error = %err, "backlog flush failed, skipping this cycle");
            self.notify(BacklogEvent::BacklogFlushError {
                reason: err.to_string(),
            });
        }
    }

    fn write_documents(&mut self) -> Result<()> {
        let sessions = SessionsDocument {
            sessions: self.sessions.iter().cloned().map(Into::into).collect(),
            last_pid: self.last_pid,
        };
        let blob = self.codec.encode(&sessions)?;
        self.store.set(SESSIONS_KEY, &blob)?;

        let requests = RequestsDocument {
            requests: self.requests.clone(),
        };
        let blob = self.codec.encode(&requests)?;
        self.store.set(REQUESTS_KEY, &blob)?;

        tracing::debug!(
            sessions = self.sessions.len(),
            requests = self.requests.len(),
            "backlog flushed"
        );
        Ok(())
    }

    // ============================================
    // Accessors
    // ============================================

    pub fn sessions(&self) -> &[OfflineSession] {
        &self.sessions
    }

    pub fn requests(&self) -> &[QueuedRequest] {
        &self.requests
    }

    pub fn last_pid(&self) -> i64 {
        self.last_pid
    }

    pub fn active_session(&self) -> Option<i64> {
        self.active_session
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.requests.is_empty()
    }

    fn notify(&self, event: BacklogEvent) {
        // nobody listening is fine; notifications are best-effort
        let _ = self.events.send(event);
    }
}
