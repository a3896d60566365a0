//! The replicator state machine.
//!
//! A replicator owns one run of a push or pull pipeline on a worker
//! thread. State transitions:
//!
//! ```text
//! Pending --start()--> Started --done--> Complete
//!    |                    |  \--fatal--> Error
//!    |                    \--stop()--> Stopping --drained--> Stopped
//!    \--stop()--> Stopped
//! ```
//!
//! Terminal states reject `start()`; `stop()` is idempotent. Listeners on
//! the store's event bus receive `ReplicationStarted` and then exactly one
//! of `ReplicationCompleted` (which covers both completed and stopped
//! runs) or `ReplicationErrored` per run.

use crate::config::ReplicatorConfig;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteDatabase;
use crate::{pull, push};
use ferrydb_core::{DocumentStore, Event};
use ferrydb_sync_protocol::replication_id;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info};

/// The state of a replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Created, not yet started.
    Pending,
    /// Pipeline running.
    Started,
    /// Stop requested, pipeline draining.
    Stopping,
    /// Stopped before completion.
    Stopped,
    /// Pipeline ran to completion.
    Complete,
    /// Aborted on a fatal error.
    Error,
}

impl ReplicatorState {
    /// Returns true for states no run can leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Complete | Self::Error)
    }
}

impl fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which way documents flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local changes are written to the remote.
    Push,
    /// Remote changes are written to the local store.
    Pull,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

/// Progress counters, readable while the run is in flight.
#[derive(Debug, Default)]
pub(crate) struct Progress {
    pub documents: AtomicU64,
    pub batches: AtomicU64,
}

struct Inner {
    config: ReplicatorConfig,
    direction: Direction,
    store: Arc<DocumentStore>,
    remote: Arc<dyn RemoteDatabase>,
    replication_id: String,
    state: Mutex<ReplicatorState>,
    cancel: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    error: Mutex<Option<String>>,
    progress: Progress,
}

/// A one-shot push or pull replication run.
pub struct Replicator {
    inner: Arc<Inner>,
}

impl Replicator {
    /// Creates a push replicator from `store` to `remote`.
    pub fn push(
        store: Arc<DocumentStore>,
        remote: Arc<dyn RemoteDatabase>,
        config: ReplicatorConfig,
    ) -> Self {
        Self::new(store, remote, config, Direction::Push)
    }

    /// Creates a pull replicator from `remote` into `store`.
    pub fn pull(
        store: Arc<DocumentStore>,
        remote: Arc<dyn RemoteDatabase>,
        config: ReplicatorConfig,
    ) -> Self {
        Self::new(store, remote, config, Direction::Pull)
    }

    fn new(
        store: Arc<DocumentStore>,
        remote: Arc<dyn RemoteDatabase>,
        config: ReplicatorConfig,
        direction: Direction,
    ) -> Self {
        let local_uri = store.path().display().to_string();
        let remote_uri = remote.uri();
        let (source, target) = match direction {
            Direction::Push => (local_uri, remote_uri),
            Direction::Pull => (remote_uri, local_uri),
        };
        let replication_id = replication_id(
            &source,
            &target,
            config.filter.as_ref(),
            direction.as_str(),
        );
        Self {
            inner: Arc::new(Inner {
                config,
                direction,
                store,
                remote,
                replication_id,
                state: Mutex::new(ReplicatorState::Pending),
                cancel: AtomicBool::new(false),
                handle: Mutex::new(None),
                error: Mutex::new(None),
                progress: Progress::default(),
            }),
        }
    }

    /// The stable replication id shared by equally-configured runs.
    pub fn replication_id(&self) -> &str {
        &self.inner.replication_id
    }

    /// The current state.
    pub fn state(&self) -> ReplicatorState {
        *self.inner.state.lock()
    }

    /// The first fatal error, after the run entered [`ReplicatorState::Error`].
    pub fn error(&self) -> Option<String> {
        self.inner.error.lock().clone()
    }

    /// Documents moved so far.
    pub fn documents_replicated(&self) -> u64 {
        self.inner.progress.documents.load(Ordering::SeqCst)
    }

    /// Batches checkpointed so far.
    pub fn batches_replicated(&self) -> u64 {
        self.inner.progress.batches.load(Ordering::SeqCst)
    }

    /// Starts the run on a worker thread.
    ///
    /// Fails with [`SyncError::IllegalState`] unless the replicator is
    /// [`ReplicatorState::Pending`].
    pub fn start(&self) -> SyncResult<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ReplicatorState::Pending => *state = ReplicatorState::Started,
                other => {
                    return Err(SyncError::IllegalState {
                        action: "start",
                        state: other.to_string(),
                    })
                }
            }
        }

        let inner = Arc::clone(&self.inner);
        info!(
            replication_id = %inner.replication_id,
            direction = inner.direction.as_str(),
            "replication started"
        );
        inner.store.events().post(Event::ReplicationStarted {
            replication_id: inner.replication_id.clone(),
        });

        let worker = Arc::clone(&self.inner);
        let handle = std::thread::spawn(move || {
            let ctx = PipelineContext {
                store: &worker.store,
                remote: worker.remote.as_ref(),
                config: &worker.config,
                cancel: &worker.cancel,
                progress: &worker.progress,
                replication_id: worker.replication_id.clone(),
            };
            let outcome = match worker.direction {
                Direction::Pull => pull::run(&ctx),
                Direction::Push => push::run(&ctx),
            };
            finish(&worker, outcome);
        });
        *inner.handle.lock() = Some(handle);
        Ok(())
    }

    /// Requests a stop.
    ///
    /// From [`ReplicatorState::Pending`] the replicator stops immediately;
    /// from [`ReplicatorState::Started`] the pipeline drains and the state
    /// settles at [`ReplicatorState::Stopped`]. Calling `stop` again, or
    /// from a terminal state, is a no-op.
    pub fn stop(&self) {
        let notify = {
            let mut state = self.inner.state.lock();
            match *state {
                ReplicatorState::Pending => {
                    *state = ReplicatorState::Stopped;
                    true
                }
                ReplicatorState::Started => {
                    *state = ReplicatorState::Stopping;
                    self.inner.cancel.store(true, Ordering::SeqCst);
                    false
                }
                _ => false,
            }
        };
        if notify {
            // Never started: the worker will not report, so notify here.
            self.inner.store.events().post(Event::ReplicationCompleted {
                replication_id: self.inner.replication_id.clone(),
                documents_replicated: 0,
                batches_replicated: 0,
            });
        }
    }

    /// Blocks until the worker thread exits and returns the final state.
    pub fn wait(&self) -> ReplicatorState {
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.state()
    }
}

fn finish(inner: &Inner, outcome: SyncResult<()>) {
    let final_state = {
        let mut state = inner.state.lock();
        let next = match (&outcome, *state) {
            (Ok(()), ReplicatorState::Stopping) => ReplicatorState::Stopped,
            (Ok(()), _) => ReplicatorState::Complete,
            (Err(SyncError::Cancelled), _) => ReplicatorState::Stopped,
            (Err(_), _) => ReplicatorState::Error,
        };
        *state = next;
        next
    };

    let documents = inner.progress.documents.load(Ordering::SeqCst);
    let batches = inner.progress.batches.load(Ordering::SeqCst);
    match outcome {
        Err(err) if final_state == ReplicatorState::Error => {
            error!(replication_id = %inner.replication_id, %err, "replication failed");
            *inner.error.lock() = Some(err.to_string());
            inner.store.events().post(Event::ReplicationErrored {
                replication_id: inner.replication_id.clone(),
                message: err.to_string(),
            });
        }
        _ => {
            info!(
                replication_id = %inner.replication_id,
                ?final_state,
                documents,
                batches,
                "replication finished"
            );
            inner.store.events().post(Event::ReplicationCompleted {
                replication_id: inner.replication_id.clone(),
                documents_replicated: documents,
                batches_replicated: batches,
            });
        }
    }
}

/// Everything a pipeline stage needs, borrowed from the replicator.
pub(crate) struct PipelineContext<'a> {
    pub store: &'a DocumentStore,
    pub remote: &'a dyn RemoteDatabase,
    pub config: &'a ReplicatorConfig,
    pub cancel: &'a AtomicBool,
    pub progress: &'a Progress,
    pub replication_id: String,
}

impl PipelineContext<'_> {
    /// Observes cooperative cancellation.
    pub fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Non-erroring cancellation probe for worker loops.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Sends into a bounded stage queue, backing off periodically to observe
/// `should_abort`. Returns false when the send was abandoned (abort
/// requested or the receiving stage is gone).
pub(crate) fn send_bounded<T>(
    tx: &crossbeam::channel::Sender<T>,
    mut value: T,
    should_abort: impl Fn() -> bool,
) -> bool {
    use crossbeam::channel::SendTimeoutError;
    use std::time::Duration;
    loop {
        if should_abort() {
            return false;
        }
        match tx.send_timeout(value, Duration::from_millis(50)) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(v)) => value = v,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}
