//! Master-side monitor that reacts to backup failures.
//!
//! A master cannot react to a lost replica from inside its replica
//! manager: that code services writes while holding the manager's data
//! mutex, and rolling the log head needs the log lock. The monitor is the
//! external driver that runs the response at a safe point. It watches
//! cluster membership through a [`MembershipTracker`], and for every
//! crashed server asks the replica manager to re-replicate; when the
//! crashed backup held a replica of the current log head, it rolls the
//! head so queued writes can make progress.
//!
//! The monitor never touches a backup's own segment registry.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use crate::cluster::{ChangeKind, ServerChange, ServerId, ServerStatus};
use crate::error::Result;

/// Master-side replica bookkeeping, driven by the monitor on failures.
pub trait ReplicaManager: Send + Sync {
    /// React to the failure of `server_id`. Returns the id of the log
    /// head segment when one of its replicas was lost on that backup.
    fn handle_backup_failure(&self, server_id: ServerId) -> Option<u64>;

    /// Let queued re-replications advance.
    fn proceed(&self);

    /// Whether there is no queued re-replication work.
    fn is_idle(&self) -> bool;
}

/// The master's log head machinery.
pub trait HeadLog: Send + Sync {
    /// Roll over the log head if `segment_id` is still the head.
    fn allocate_head_if_still_on(&self, segment_id: u64);
}

/// Queue of membership changes feeding the monitor.
///
/// The server list enqueues changes from any thread; the monitor drains
/// them. The tracker also keeps the last known status per server for
/// non-blocking liveness probes.
pub struct MembershipTracker {
    changes: Mutex<VecDeque<ServerChange>>,
    statuses: Mutex<HashMap<ServerId, ServerStatus>>,
    notify: Notify,
}

impl MembershipTracker {
    pub fn new() -> Self {
        Self {
            changes: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Record a membership change and wake the monitor if it is asleep.
    pub fn enqueue(&self, change: ServerChange) -> Result<()> {
        {
            let mut statuses = self.statuses.lock()?;
            match change.kind {
                ChangeKind::Added => {
                    statuses.insert(change.server_id, ServerStatus::Up);
                }
                ChangeKind::Crashed => {
                    statuses.insert(change.server_id, ServerStatus::Crashed);
                }
                ChangeKind::Removed => {
                    statuses.remove(&change.server_id);
                }
            }
        }
        self.changes.lock()?.push_back(change);
        self.notify.notify_one();
        Ok(())
    }

    fn take_change(&self) -> Option<ServerChange> {
        self.changes.lock().ok()?.pop_front()
    }

    fn has_changes(&self) -> bool {
        self.changes.lock().map_or(false, |changes| !changes.is_empty())
    }

    fn status(&self, server_id: ServerId) -> Option<ServerStatus> {
        // Non-blocking: a contended lock reads as unknown.
        self.statuses
            .try_lock()
            .ok()
            .and_then(|statuses| statuses.get(&server_id).copied())
    }

    async fn notified(&self) {
        self.notify.notified().await
    }
}

impl Default for MembershipTracker {
    fn default() -> Self {
        Self::new()
    }
}

struct MonitorState {
    running: bool,
    handle: Option<JoinHandle<()>>,
}

/// Background task reacting to backup crashes on behalf of one master.
pub struct BackupFailureMonitor {
    replica_manager: Arc<dyn ReplicaManager>,
    tracker: Arc<MembershipTracker>,
    shutdown_tx: broadcast::Sender<()>,
    state: Mutex<MonitorState>,
}

impl BackupFailureMonitor {
    /// Changes enqueued on `tracker` are ignored until `start`.
    pub fn new(replica_manager: Arc<dyn ReplicaManager>, tracker: Arc<MembershipTracker>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            replica_manager,
            tracker,
            shutdown_tx,
            state: Mutex::new(MonitorState {
                running: false,
                handle: None,
            }),
        }
    }

    /// Start monitoring. Starting an already-started monitor has no
    /// effect.
    pub fn start(&self, log: Arc<dyn HeadLog>) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.running {
            return Ok(());
        }
        state.running = true;

        let replica_manager = Arc::clone(&self.replica_manager);
        let tracker = Arc::clone(&self.tracker);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        state.handle = Some(tokio::spawn(async move {
            tracing::info!("backup failure monitor started");
            loop {
                // Sleep only while the manager is idle and no membership
                // changes are pending.
                while replica_manager.is_idle() && !tracker.has_changes() {
                    tokio::select! {
                        _ = tracker.notified() => {}
                        _ = shutdown_rx.recv() => {
                            tracing::info!("backup failure monitor shutting down");
                            return;
                        }
                    }
                }

                while let Some(change) = tracker.take_change() {
                    if change.kind != ChangeKind::Crashed {
                        continue;
                    }
                    tracing::debug!(server_id = %change.server_id, "notifying log of backup failure");
                    if let Some(head_segment) =
                        replica_manager.handle_backup_failure(change.server_id)
                    {
                        tracing::debug!(head_segment, "allocating a new log head");
                        log.allocate_head_if_still_on(head_segment);
                    }
                }

                replica_manager.proceed();
                tokio::task::yield_now().await;
            }
        }));
        Ok(())
    }

    /// Stop monitoring and join the task. Halting a monitor that is not
    /// running has no effect.
    pub async fn halt(&self) -> Result<()> {
        let handle = {
            let mut state = self.state.lock()?;
            if !state.running {
                return Ok(());
            }
            state.running = false;
            state.handle.take()
        };
        self.shutdown_tx.send(()).ok();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }

    /// Whether `server_id` is up as far as the membership updates seen so
    /// far say. May spuriously return false rather than block.
    pub fn server_is_up(&self, server_id: ServerId) -> bool {
        self.tracker.status(server_id) == Some(ServerStatus::Up)
    }
}
