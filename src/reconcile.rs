//! Placeholder-to-real session ID reconciliation
//!
//! Runs exclusively after a "register old session" replay task succeeds.
//! Every dependent record, replay tasks still waiting in the queue and
//! requests still pending in the backlog alike, has its `session` reference
//! rewritten from the negative placeholder to the server-assigned ID, and
//! the replayed session itself is dropped from the pending collection.
//! Requests that reference the placeholder must never reach the wire after
//! this point, so reconciliation completes before the next task fires.

use serde_json::Value;

use crate::backlog::BacklogStore;
use crate::error::{Error, Result};
use crate::queue::ReplayTask;
use crate::store::PersistentStore;

/// What a reconciliation pass touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Tasks later in the current replay plan that were rewritten
    pub rewritten_in_flight: usize,
    /// Pending backlog requests that were rewritten
    pub rewritten_pending: usize,
}

/// Extract the server-assigned session ID from a registration response body.
pub fn real_id_from_response(body: &str) -> Result<i64> {
    let value: Value = serde_json::from_str(body)?;
    value
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Response(format!("missing integer `id` in session response: {}", body)))
}

/// Matching is textual: the placeholder may have been persisted as a number
/// or a string, and a record with no `session` key is left untouched.
pub(crate) fn session_ref_matches(value: &Value, placeholder_id: i64) -> bool {
    match value {
        Value::Number(n) => n.to_string() == placeholder_id.to_string(),
        Value::String(s) => *s == placeholder_id.to_string(),
        _ => false,
    }
}

/// Rewrite all dependents of a just-replayed session and remove it.
pub fn apply<S: PersistentStore>(
    in_flight: &mut [ReplayTask],
    backlog: &mut BacklogStore<S>,
    placeholder_id: i64,
    session_id: i64,
) -> ReconcileOutcome {
    let mut rewritten_in_flight = 0;
    for task in in_flight.iter_mut() {
        let matches = task
            .post_data
            .get("session")
            .map(|v| session_ref_matches(v, placeholder_id))
            .unwrap_or(false);
        if matches {
            task.post_data
                .insert("session".to_string(), Value::from(session_id));
            rewritten_in_flight += 1;
        }
    }

    let rewritten_pending = backlog.rewrite_session_refs(placeholder_id, session_id);
    backlog.remove_session(placeholder_id);

    if rewritten_in_flight == 0 && rewritten_pending == 0 {
        // not an error: the session simply had no dependent requests
        tracing::debug!(placeholder_id, "no queued records referenced the replayed session");
    } else {
        tracing::info!(
            placeholder_id,
            session_id,
            rewritten_in_flight,
            rewritten_pending,
            "reconciled placeholder session"
        );
    }

    ReconcileOutcome {
        rewritten_in_flight,
        rewritten_pending,
    }
}
