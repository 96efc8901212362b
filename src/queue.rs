//! Ordered, sequential replay of the backlog
//!
//! The replay plan is fixed at build time: every pending offline session
//! first (each becomes a "register old session" task), then every pending
//! request, both in persisted order. The ordering is load-bearing: a
//! request referencing a placeholder session must not fire before the
//! session task that produces the real ID.
//!
//! Execution is strictly one task in flight at a time. A cursor walks the
//! plan; each completion (reconciliation included, for session tasks)
//! happens before the next task fires. Failed tasks are reported and skipped
//! without retry; their records stay in the persisted backlog for the next
//! replay opportunity.

use serde_json::{Map, Value};
use tokio::time::Duration;

use crate::backlog::BacklogStore;
use crate::config::ClientInfo;
use crate::error::Error;
use crate::reconcile;
use crate::store::PersistentStore;
use crate::transport::{Transport, TransportRequest};
use crate::types::{unix_now, ApiMethod, HttpMethod};

/// What a replay task stands for.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// Register a session recorded offline; on success its placeholder is
    /// reconciled against the server-assigned ID
    OldSession {
        placeholder_id: i64,
        start_timestamp: f64,
    },
    /// Re-send a queued request
    Request,
}

/// One entry in the replay plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayTask {
    pub kind: TaskKind,
    /// For session tasks this is the placeholder ID, the session's
    /// temporary identity on the wire
    pub task_pid: i64,
    pub url: String,
    pub method: ApiMethod,
    pub http_method: HttpMethod,
    pub post_data: Map<String, Value>,
}

/// Result of a single replay step.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    SessionReplayed {
        placeholder_id: i64,
        session_id: i64,
    },
    RequestReplayed {
        task_pid: i64,
    },
    Failed {
        task_pid: i64,
        reason: String,
    },
}

/// An ordered replay plan with a cursor.
pub struct TaskQueue {
    tasks: Vec<ReplayTask>,
    cursor: usize,
}

impl TaskQueue {
    /// Build the plan from the backlog's current contents.
    pub fn build<S: PersistentStore>(
        backlog: &BacklogStore<S>,
        client: &ClientInfo,
        now: f64,
    ) -> Self {
        let mut tasks = Vec::with_capacity(backlog.sessions().len() + backlog.requests().len());

        for session in backlog.sessions() {
            let mut post_data = Map::new();
            post_data.insert(
                "end_user_device".to_string(),
                Value::from(client.device_uuid.clone()),
            );
            post_data.insert(
                "app_version".to_string(),
                Value::from(client.app_version.clone()),
            );
            post_data.insert("carrier_name".to_string(), Value::from(""));
            post_data.insert(
                "dt".to_string(),
                Value::from((now - session.start_timestamp) as i64),
            );
            post_data.insert(
                "length".to_string(),
                Value::from(session.duration_estimate as i64),
            );
            tasks.push(ReplayTask {
                kind: TaskKind::OldSession {
                    placeholder_id: session.placeholder_id,
                    start_timestamp: session.start_timestamp,
                },
                task_pid: session.placeholder_id,
                url: session.replay_url.clone(),
                method: ApiMethod::RegisterOldSession,
                http_method: HttpMethod::Post,
                post_data,
            });
        }

        for request in backlog.requests() {
            tasks.push(ReplayTask {
                kind: TaskKind::Request,
                task_pid: request.task_pid,
                url: request.url.clone(),
                method: request.dataspin_method,
                http_method: request.http_method,
                post_data: request.post_data.clone(),
            });
        }

        tracing::debug!(tasks = tasks.len(), "built replay plan");
        TaskQueue { tasks, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks not yet executed (including the one at the cursor).
    pub fn remaining(&self) -> usize {
        self.tasks.len() - self.cursor
    }

    /// Fire the task at the cursor, wait for completion, reconcile if it was
    /// a session task, and advance. Returns `None` once the plan is drained.
    ///
    /// Exactly one task is in flight at a time; reconciliation completes
    /// before this returns, so the next call never transmits a stale
    /// placeholder.
    pub async fn execute_next<S, T>(
        &mut self,
        backlog: &mut BacklogStore<S>,
        transport: &T,
        task_timeout: Duration,
    ) -> Option<TaskOutcome>
    where
        S: PersistentStore,
        T: Transport,
    {
        if self.cursor >= self.tasks.len() {
            return None;
        }

        // state may have moved while earlier tasks were awaited; re-stamp
        // the session's elapsed time from the clock, not the build snapshot
        if let TaskKind::OldSession { start_timestamp, .. } = self.tasks[self.cursor].kind {
            let dt = (unix_now() - start_timestamp) as i64;
            self.tasks[self.cursor]
                .post_data
                .insert("dt".to_string(), Value::from(dt));
        }

        let task = self.tasks[self.cursor].clone();
        tracing::debug!(
            task_pid = task.task_pid,
            method = %task.method,
            remaining = self.remaining(),
            "executing replay task"
        );

        let request = TransportRequest {
            url: task.url.clone(),
            http_method: task.http_method,
            payload: Value::Object(task.post_data.clone()),
        };

        let result = match tokio::time::timeout(task_timeout, transport.send(&request)).await {
            Ok(inner) => inner,
            Err(_) => Err(Error::Transport(format!(
                "task {} timed out after {:?}",
                task.task_pid, task_timeout
            ))),
        };

        let outcome = match result {
            Ok(body) => match task.kind {
                TaskKind::OldSession { placeholder_id, .. } => {
                    match reconcile::real_id_from_response(&body) {
                        Ok(session_id) => {
                            let in_flight = &mut self.tasks[self.cursor + 1..];
                            reconcile::apply(in_flight, backlog, placeholder_id, session_id);
                            TaskOutcome::SessionReplayed {
                                placeholder_id,
                                session_id,
                            }
                        }
                        Err(err) => TaskOutcome::Failed {
                            task_pid: task.task_pid,
                            reason: err.to_string(),
                        },
                    }
                }
                TaskKind::Request => {
                    backlog.remove_request(task.task_pid);
                    TaskOutcome::RequestReplayed {
                        task_pid: task.task_pid,
                    }
                }
            },
            Err(err) => {
                // no retry here; the record stays queued for the next replay
                tracing::warn!(task_pid = task.task_pid, error = %err, "replay task failed");
                TaskOutcome::Failed {
                    task_pid: task.task_pid,
                    reason: err.to_string(),
                }
            }
        };

        self.cursor += 1;
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::PendingRequest;
    use crate::codec::Codec;
    use crate::store::MemoryStore;
    use crate::types::BacklogEvent;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    /// Transport that replays canned responses and records what was sent.
    struct MockTransport {
        responses: Mutex<VecDeque<crate::error::Result<String>>>,
        sent: Mutex<Vec<TransportRequest>>,
    }

    impl MockTransport {
        fn new(responses: Vec<crate::error::Result<String>>) -> Self {
            MockTransport {
                responses: Mutex::new(responses.into()),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<TransportRequest> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn send(&self, request: &TransportRequest) -> crate::error::Result<String> {
            self.sent.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Transport("no canned response".to_string())))
        }
    }

    /// Transport whose calls never complete; exercises the task timeout.
    struct StalledTransport;

    #[async_trait::async_trait]
    impl Transport for StalledTransport {
        async fn send(&self, _request: &TransportRequest) -> crate::error::Result<String> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn test_backlog() -> (
        BacklogStore<MemoryStore>,
        UnboundedReceiver<BacklogEvent>,
    ) {
        let (tx, rx) = unbounded_channel();
        (
            BacklogStore::new(
                MemoryStore::new(),
                Codec::legacy(),
                Duration::from_secs(1),
                tx,
            ),
            rx,
        )
    }

    fn client() -> ClientInfo {
        ClientInfo {
            device_uuid: "dev-1".to_string(),
            app_version: "1.0.0".to_string(),
        }
    }

    fn purchase(item: &str, amount: i64) -> PendingRequest {
        let mut post_data = Map::new();
        post_data.insert("item".to_string(), json!(item));
        post_data.insert("amount".to_string(), json!(amount));
        PendingRequest {
            method: ApiMethod::PurchaseItem,
            http_method: HttpMethod::Post,
            url: "https://example.test/api/v1/purchase/".to_string(),
            post_data,
        }
    }

    #[tokio::test]
    async fn test_sessions_replay_before_requests_in_order() {
        let (mut backlog, _rx) = test_backlog();
        backlog
            .open_offline_session("https://example.test/api/v1/register_old_session/".to_string(), 100.0)
            .unwrap();
        backlog.enqueue_request(purchase("first", 1), 110.0);
        backlog.enqueue_request(purchase("second", 1), 120.0);

        let transport = MockTransport::new(vec![
            Ok(r#"{"id": 991}"#.to_string()),
            Ok("{}".to_string()),
            Ok("{}".to_string()),
        ]);
        let mut queue = TaskQueue::build(&backlog, &client(), 200.0);
        assert_eq!(queue.len(), 3);

        while queue
            .execute_next(&mut backlog, &transport, Duration::from_secs(5))
            .await
            .is_some()
        {}

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].url.contains("register_old_session"));
        assert_eq!(sent[1].payload["item"], "first");
        assert_eq!(sent[2].payload["item"], "second");
        assert!(backlog.is_empty());
    }

    #[tokio::test]
    async fn test_session_replay_reconciles_placeholder_before_requests_fire() {
        let (mut backlog, _rx) = test_backlog();
        let placeholder = backlog
            .open_offline_session("https://example.test/api/v1/register_old_session/".to_string(), 100.0)
            .unwrap();
        backlog.enqueue_request(purchase("coin_pack_10", 3), 130.0);

        let transport = MockTransport::new(vec![
            Ok(r#"{"id": 991}"#.to_string()),
            Ok("{}".to_string()),
        ]);
        let mut queue = TaskQueue::build(&backlog, &client(), 200.0);

        let first = queue
            .execute_next(&mut backlog, &transport, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            first,
            TaskOutcome::SessionReplayed {
                placeholder_id: placeholder,
                session_id: 991
            }
        );
        // session gone, request rewritten, before the next task fires
        assert!(backlog.sessions().is_empty());
        assert_eq!(backlog.requests()[0].post_data["session"], json!(991));

        let second = queue
            .execute_next(&mut backlog, &transport, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(second, TaskOutcome::RequestReplayed { .. }));

        let sent = transport.sent();
        assert_eq!(sent[1].payload["session"], json!(991));
        assert_eq!(sent[1].payload["item"], "coin_pack_10");
        assert_eq!(sent[1].payload["amount"], json!(3));
        assert!(backlog.requests().is_empty());
    }

    #[tokio::test]
    async fn test_failed_task_stays_queued_and_cursor_advances() {
        let (mut backlog, _rx) = test_backlog();
        backlog.set_live_session(5, 0.0);
        backlog.enqueue_request(purchase("a", 1), 1.0);
        backlog.enqueue_request(purchase("b", 1), 2.0);

        let transport = MockTransport::new(vec![
            Err(Error::Transport("API error (500): boom".to_string())),
            Ok("{}".to_string()),
        ]);
        let mut queue = TaskQueue::build(&backlog, &client(), 10.0);

        let first = queue
            .execute_next(&mut backlog, &transport, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(first, TaskOutcome::Failed { task_pid: 1, .. }));
        // the failed record is still queued for the next replay
        assert_eq!(backlog.requests().len(), 2);

        let second = queue
            .execute_next(&mut backlog, &transport, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(second, TaskOutcome::RequestReplayed { task_pid: 0 }));
        assert_eq!(backlog.requests().len(), 1);
        assert_eq!(backlog.requests()[0].task_pid, 1);
    }

    #[tokio::test]
    async fn test_stalled_task_times_out_as_failure() {
        let (mut backlog, _rx) = test_backlog();
        backlog.set_live_session(5, 0.0);
        backlog.enqueue_request(purchase("a", 1), 1.0);

        let mut queue = TaskQueue::build(&backlog, &client(), 10.0);
        let outcome = queue
            .execute_next(&mut backlog, &StalledTransport, Duration::from_millis(10))
            .await
            .unwrap();

        match outcome {
            TaskOutcome::Failed { task_pid, reason } => {
                assert_eq!(task_pid, 1);
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(backlog.requests().len(), 1);
        assert!(
            queue
                .execute_next(&mut backlog, &StalledTransport, Duration::from_millis(10))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_session_task_carries_duration_and_client_identity() {
        let (mut backlog, _rx) = test_backlog();
        backlog
            .open_offline_session("https://example.test/api/v1/register_old_session/".to_string(), 100.0)
            .unwrap();
        for _ in 0..3 {
            backlog.tick_active_session(10.0);
        }

        let transport = MockTransport::new(vec![Ok(r#"{"id": 7}"#.to_string())]);
        let mut queue = TaskQueue::build(&backlog, &client(), 160.0);
        queue
            .execute_next(&mut backlog, &transport, Duration::from_secs(5))
            .await
            .unwrap();

        let sent = transport.sent();
        assert_eq!(sent[0].payload["length"], json!(30));
        assert_eq!(sent[0].payload["end_user_device"], "dev-1");
        assert_eq!(sent[0].payload["app_version"], "1.0.0");
        assert!(sent[0].payload.get("dt").is_some());
    }

    #[tokio::test]
    async fn test_malformed_session_response_is_a_failure() {
        let (mut backlog, _rx) = test_backlog();
        let placeholder = backlog
            .open_offline_session("https://example.test/api/v1/register_old_session/".to_string(), 100.0)
            .unwrap();

        let transport = MockTransport::new(vec![Ok(r#"{"status": "ok"}"#.to_string())]);
        let mut queue = TaskQueue::build(&backlog, &client(), 160.0);
        let outcome = queue
            .execute_next(&mut backlog, &transport, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(matches!(outcome, TaskOutcome::Failed { .. }));
        // session not reconciled, still pending
        assert_eq!(backlog.sessions()[0].placeholder_id, placeholder);
    }
}
