//! Backlog service loop and its handle
//!
//! All backlog state lives on a single task that owns the [`BacklogStore`];
//! everything else talks to it through a [`BacklogHandle`] over a command
//! channel. There is no shared mutable state and no global instance: drop
//! every handle (or send [`BacklogHandle::shutdown`]) and the loop performs
//! a final flush and exits.
//!
//! The loop multiplexes three sources:
//! - commands from handles
//! - a ticker that extends the active offline session's duration estimate
//! - the debounced-flush deadline maintained by the store

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::backlog::{BacklogStore, PendingRequest};
use crate::codec::Codec;
use crate::config::{BacklogConfig, ClientInfo};
use crate::error::{Error, Result};
use crate::queue::{TaskOutcome, TaskQueue};
use crate::store::PersistentStore;
use crate::transport::Transport;
use crate::types::{unix_now, BacklogEvent};

/// Commands a [`BacklogHandle`] can send to the service loop.
#[derive(Debug)]
pub enum Command {
    /// Queue a failed call for later delivery
    Track(PendingRequest),
    /// Start an offline session; replies with its placeholder ID
    OpenOfflineSession {
        replay_url: String,
        reply: oneshot::Sender<Result<i64>>,
    },
    /// Stop ticking the active offline session
    CloseOfflineSession,
    /// Record the server-confirmed session new requests belong to
    SetLiveSession { id: i64, started_at: f64 },
    ClearLiveSession,
    /// Connectivity is back; replay everything pending, in order
    Replay,
    /// Persist immediately instead of waiting out the debounce
    Flush,
    Shutdown,
}

/// Cloneable client side of the service's command channel.
#[derive(Debug, Clone)]
pub struct BacklogHandle {
    tx: UnboundedSender<Command>,
}

impl BacklogHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| Error::ServiceStopped)
    }

    /// Hand a failed call to the backlog. Calls whose kind is not queueable
    /// are dropped by the service.
    pub fn track(&self, request: PendingRequest) -> Result<()> {
        self.send(Command::Track(request))
    }

    /// Open an offline session and wait for its placeholder ID.
    pub async fn open_offline_session(&self, replay_url: String) -> Result<i64> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::OpenOfflineSession { replay_url, reply })?;
        rx.await.map_err(|_| Error::ServiceStopped)?
    }

    pub fn close_offline_session(&self) -> Result<()> {
        self.send(Command::CloseOfflineSession)
    }

    pub fn set_live_session(&self, id: i64, started_at: f64) -> Result<()> {
        self.send(Command::SetLiveSession { id, started_at })
    }

    pub fn clear_live_session(&self) -> Result<()> {
        self.send(Command::ClearLiveSession)
    }

    /// Trigger a full replay of the pending backlog.
    pub fn replay(&self) -> Result<()> {
        self.send(Command::Replay)
    }

    pub fn flush(&self) -> Result<()> {
        self.send(Command::Flush)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }
}

/// The service loop. Construct with [`BacklogService::new`], then drive it
/// with [`BacklogService::run`] on its own task.
pub struct BacklogService<S, T> {
    backlog: BacklogStore<S>,
    transport: T,
    client: ClientInfo,
    tick_interval: Duration,
    task_timeout: Duration,
    rx: UnboundedReceiver<Command>,
    events: UnboundedSender<BacklogEvent>,
}

impl<S: PersistentStore, T: Transport> BacklogService<S, T> {
    /// Wire up a service over the given store and transport.
    ///
    /// Returns the service itself, a handle for callers, and the receiving
    /// end of the notification stream.
    pub fn new(
        store: S,
        codec: Codec,
        transport: T,
        client: ClientInfo,
        config: &BacklogConfig,
    ) -> (Self, BacklogHandle, UnboundedReceiver<BacklogEvent>) {
        let (event_tx, event_rx) = unbounded_channel();
        let (cmd_tx, cmd_rx) = unbounded_channel();
        let backlog = BacklogStore::new(store, codec, config.flush_debounce(), event_tx.clone());
        let service = BacklogService {
            backlog,
            transport,
            client,
            tick_interval: config.tick_interval(),
            task_timeout: config.task_timeout(),
            rx: cmd_rx,
            events: event_tx,
        };
        (service, BacklogHandle { tx: cmd_tx }, event_rx)
    }

    /// Load persisted state and run until shutdown. Always flushes once more
    /// before returning.
    pub async fn run(mut self) -> Result<()> {
        self.backlog.load()?;
        tracing::info!(
            sessions = self.backlog.sessions().len(),
            requests = self.backlog.requests().len(),
            "backlog service started"
        );

        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flush_at = self.backlog.flush_deadline();
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        None | Some(Command::Shutdown) => break,
                        Some(command) => {
                            let had_session = self.backlog.active_session().is_some();
                            self.handle_command(command).await;
                            // the first tick lands one full interval after the
                            // session opens, not at the interval's old phase
                            if !had_session && self.backlog.active_session().is_some() {
                                ticker.reset();
                            }
                        }
                    }
                }
                _ = ticker.tick(), if self.backlog.active_session().is_some() => {
                    self.backlog.tick_active_session(self.tick_interval.as_secs_f64());
                }
                _ = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)),
                    if flush_at.is_some() =>
                {
                    self.backlog.flush_if_due(Instant::now());
                }
            }
        }

        self.backlog.flush_now();
        tracing::info!("backlog service stopped");
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Track(request) => {
                if self.backlog.should_backlog(request.method) {
                    self.backlog.enqueue_request(request, unix_now());
                } else {
                    tracing::debug!(method = %request.method, "call kind is not queueable, dropping");
                }
            }
            Command::OpenOfflineSession { replay_url, reply } => {
                let result = self.backlog.open_offline_session(replay_url, unix_now());
                let _ = reply.send(result);
            }
            Command::CloseOfflineSession => self.backlog.close_offline_session(),
            Command::SetLiveSession { id, started_at } => {
                self.backlog.set_live_session(id, started_at)
            }
            Command::ClearLiveSession => self.backlog.clear_live_session(),
            Command::Replay => self.run_replay().await,
            Command::Flush => self.backlog.flush_now(),
            Command::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    /// Drain the pending backlog, one task at a time.
    ///
    /// Commands arriving while a replay runs queue up and are handled after
    /// it completes; the store is only mutated from this task.
    async fn run_replay(&mut self) {
        if self.backlog.is_empty() {
            tracing::debug!("nothing to replay");
            return;
        }

        let mut queue = TaskQueue::build(&self.backlog, &self.client, unix_now());
        tracing::info!(tasks = queue.len(), "replaying backlog");

        while let Some(outcome) = queue
            .execute_next(&mut self.backlog, &self.transport, self.task_timeout)
            .await
        {
            match outcome {
                TaskOutcome::SessionReplayed {
                    placeholder_id,
                    session_id,
                } => {
                    // the replayed session may still be the open one
                    if self.backlog.active_session() == Some(placeholder_id) {
                        self.backlog.close_offline_session();
                    }
                    self.notify(BacklogEvent::SessionReplayed {
                        placeholder_id,
                        session_id,
                    });
                }
                TaskOutcome::RequestReplayed { task_pid } => {
                    self.notify(BacklogEvent::RequestReplayed { task_pid });
                }
                TaskOutcome::Failed { task_pid, reason } => {
                    self.notify(BacklogEvent::TaskFailed { task_pid, reason });
                }
            }
        }

        self.backlog.flush_now();
    }

    fn notify(&self, event: BacklogEvent) {
        let _ = self.events.send(event);
    }
}
