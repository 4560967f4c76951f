//! The backup server: dispatch surface and lifecycle.
//!
//! Requests arrive as typed envelopes on a channel (the transport in
//! front of it handles framing and delivery) and are serviced by a
//! bounded pool of blocking workers, since `close` and `getRecoveryData`
//! both wait on storage. Handler errors become response statuses; nothing
//! a master sends can take the server down.
//!
//! The server is the single per-process instance and owns the backup
//! failure monitor's lifecycle: attach the master-side collaborators
//! before `run`, which starts the monitor and feeds it the coordinator's
//! membership stream; `shutdown` halts it again.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::cluster::{CoordinatorClient, ServerId};
use crate::config::{BackupConfig, StorageBackend};
use crate::error::{Error, Result};
use crate::log::Partitioning;
use crate::monitor::{BackupFailureMonitor, HeadLog, MembershipTracker, ReplicaManager};
use crate::pool::AlignedPool;
use crate::recovery::{RecoveryData, RecoveryReader};
use crate::registry::SegmentRegistry;
use crate::rpc::{BackupRequest, BackupResponse, Status, WriteFlags};
use crate::segment::{Segment, SegmentState};
use crate::storage::{DiskStorage, MemStorage, Storage};

/// One request envelope: the typed request plus the responder the
/// transport is waiting on.
pub struct Rpc {
    pub request: BackupRequest,
    pub responder: oneshot::Sender<BackupResponse>,
}

/// The attached failure monitor plus the log it rolls on start.
struct MonitorSlot {
    monitor: Arc<BackupFailureMonitor>,
    log: Arc<dyn HeadLog>,
}

pub struct BackupServer {
    config: BackupConfig,
    pool: AlignedPool,
    storage: Arc<dyn Storage>,
    registry: Arc<SegmentRegistry>,
    reader: RecoveryReader,
    tracker: Arc<MembershipTracker>,
    monitor: Mutex<Option<MonitorSlot>>,
    server_id: Mutex<Option<ServerId>>,
}

impl BackupServer {
    /// Build the server from its config. Pool or backend construction
    /// failures are fatal and propagate to the caller.
    pub fn new(config: BackupConfig) -> Result<Self> {
        let storage: Arc<dyn Storage> = match &config.backend {
            StorageBackend::Memory => {
                Arc::new(MemStorage::new(config.segment_size, config.extent_count))
            }
            StorageBackend::Disk { path } => Arc::new(DiskStorage::open(
                path,
                config.segment_size,
                config.extent_count,
                config.direct_io,
            )?),
        };
        Self::with_storage(config, storage)
    }

    /// Build the server over an existing backend.
    pub fn with_storage(config: BackupConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        let pool = AlignedPool::new(config.segment_size, config.pool_capacity)?;
        let registry = Arc::new(SegmentRegistry::new());

        Ok(Self {
            config,
            pool,
            storage,
            registry: Arc::clone(&registry),
            reader: RecoveryReader::new(registry),
            tracker: Arc::new(MembershipTracker::new()),
            monitor: Mutex::new(None),
            server_id: Mutex::new(None),
        })
    }

    /// Wire in the master-side failure response. The monitor starts
    /// watching membership once `run` registers with the coordinator and
    /// is halted again by `shutdown`.
    pub fn attach_monitor(
        &self,
        replica_manager: Arc<dyn ReplicaManager>,
        log: Arc<dyn HeadLog>,
    ) -> Result<()> {
        let monitor = Arc::new(BackupFailureMonitor::new(
            replica_manager,
            Arc::clone(&self.tracker),
        ));
        *self.monitor.lock()? = Some(MonitorSlot { monitor, log });
        Ok(())
    }

    /// The coordinator-assigned id, once `run` has registered.
    pub fn server_id(&self) -> Option<ServerId> {
        self.server_id.lock().ok().and_then(|id| *id)
    }

    pub fn registry(&self) -> &SegmentRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &AlignedPool {
        &self.pool
    }

    /// Register with the coordinator, start the attached failure
    /// monitor over the coordinator's membership stream, then service
    /// request envelopes until the channel closes. Registration failure
    /// is fatal.
    pub async fn run(
        self: Arc<Self>,
        coordinator: Arc<dyn CoordinatorClient>,
        mut requests: mpsc::Receiver<Rpc>,
    ) -> Result<()> {
        let server_id = coordinator
            .register(&self.config.local_locator)
            .await?;
        *self.server_id.lock()? = Some(server_id);
        tracing::info!(
            %server_id,
            locator = %self.config.local_locator,
            segment_size = self.config.segment_size,
            pool_capacity = self.config.pool_capacity,
            "backup registered with coordinator"
        );

        if let Some(slot) = self.monitor.lock()?.as_ref() {
            slot.monitor.start(Arc::clone(&slot.log))?;
        }

        // Forward the coordinator's server list changes into the
        // monitor's tracker for as long as the subscription lasts.
        let mut membership = coordinator.subscribe_membership().await?;
        let tracker = Arc::clone(&self.tracker);
        let feeder = tokio::spawn(async move {
            while let Some(change) = membership.recv().await {
                if let Err(e) = tracker.enqueue(change) {
                    tracing::error!(error = %e, "dropping membership change");
                    break;
                }
            }
        });

        let workers = Arc::new(Semaphore::new(self.config.workers.max(1)));
        while let Some(rpc) = requests.recv().await {
            let permit = Arc::clone(&workers)
                .acquire_owned()
                .await
                .map_err(|e| Error::BadRequest(e.to_string()))?;
            let server = Arc::clone(&self);
            tokio::task::spawn_blocking(move || {
                let response = server.dispatch(rpc.request);
                // The transport may have given up on the response.
                let _ = rpc.responder.send(response);
                drop(permit);
            });
        }

        // Channel closed: the transport is gone, tear down.
        feeder.abort();
        let _ = workers.acquire_many(self.config.workers.max(1) as u32).await;
        self.shutdown().await
    }

    /// Route one request to its handler and fold the outcome into a
    /// response.
    pub fn dispatch(&self, request: BackupRequest) -> BackupResponse {
        match request {
            BackupRequest::OpenSegment {
                master_id,
                segment_id,
            } => empty(self.open_segment(master_id, segment_id)),
            BackupRequest::WriteSegment {
                master_id,
                segment_id,
                offset,
                flags,
                data,
            } => empty(self.write_segment(master_id, segment_id, offset as usize, &data, flags)),
            BackupRequest::CloseSegment {
                master_id,
                segment_id,
            } => empty(self.close_segment(master_id, segment_id)),
            BackupRequest::FreeSegment {
                master_id,
                segment_id,
            } => empty(self.free_segment(master_id, segment_id)),
            BackupRequest::StartReadingData {
                master_id,
                partitioning,
            } => match self.start_reading_data(master_id, &partitioning) {
                Ok(segment_ids) => BackupResponse::SegmentIds {
                    status: Status::Ok,
                    segment_ids,
                },
                Err(e) => BackupResponse::SegmentIds {
                    status: Status::from(&e),
                    segment_ids: Vec::new(),
                },
            },
            BackupRequest::GetRecoveryData {
                master_id,
                segment_id,
                partition_index,
            } => match self.get_recovery_data(master_id, segment_id, partition_index as usize) {
                Ok(data) => BackupResponse::RecoveryData {
                    status: Status::Ok,
                    more_entries: data.more_entries,
                    entries: data.entries,
                },
                Err(e) => BackupResponse::RecoveryData {
                    status: Status::from(&e),
                    more_entries: false,
                    entries: Vec::new(),
                },
            },
        }
    }

    /// Create (or find) the replica and enter `OPEN`.
    pub fn open_segment(&self, master_id: u64, segment_id: u64) -> Result<()> {
        let segment = self.registry.insert_if_absent(master_id, segment_id, || {
            Ok(Segment::new(
                master_id,
                segment_id,
                self.pool.clone(),
                Arc::clone(&self.storage),
            ))
        })?;

        match segment.open() {
            Ok(()) => Ok(()),
            Err(e) => {
                // A failed open must not strand a resourceless entry.
                if segment.state() == SegmentState::Uninit {
                    self.registry.remove(master_id, segment_id)?;
                }
                Err(e)
            }
        }
    }

    /// Stage bytes into the replica, honoring the OPEN and CLOSE
    /// convenience flags.
    pub fn write_segment(
        &self,
        master_id: u64,
        segment_id: u64,
        offset: usize,
        data: &[u8],
        flags: WriteFlags,
    ) -> Result<()> {
        if flags.has_open() {
            self.open_segment(master_id, segment_id)?;
        }

        let segment = self
            .registry
            .find(master_id, segment_id)
            .ok_or(Error::SegmentUnavailable)?;
        segment.write(offset, data)?;

        if flags.has_close() {
            segment.close()?;
        }
        Ok(())
    }

    pub fn close_segment(&self, master_id: u64, segment_id: u64) -> Result<()> {
        let segment = self
            .registry
            .find(master_id, segment_id)
            .ok_or(Error::SegmentUnavailable)?;
        segment.close()
    }

    /// Release the replica's resources and drop it from the registry.
    /// Freeing an unknown key is a no-op, like freeing twice.
    pub fn free_segment(&self, master_id: u64, segment_id: u64) -> Result<()> {
        if let Some(segment) = self.registry.find(master_id, segment_id) {
            segment.free()?;
            self.registry.remove(master_id, segment_id)?;
        }
        Ok(())
    }

    pub fn start_reading_data(
        &self,
        master_id: u64,
        partitioning: &[u8],
    ) -> Result<Vec<u64>> {
        let partitioning = Partitioning::decode(partitioning)
            .map_err(|e| Error::BadRequest(format!("undecodable tablet partitioning: {e}")))?;
        self.reader.start_reading_data(master_id, partitioning)
    }

    pub fn get_recovery_data(
        &self,
        master_id: u64,
        segment_id: u64,
        partition_index: usize,
    ) -> Result<RecoveryData> {
        self.reader
            .get_recovery_data(master_id, segment_id, partition_index)
    }

    /// Halt the failure monitor, then free every replica, releasing its
    /// buffer and storage extent; called once the request stream is
    /// closed.
    pub async fn shutdown(&self) -> Result<()> {
        // Clone the handle out so no lock is held across the halt.
        let monitor = self
            .monitor
            .lock()?
            .as_ref()
            .map(|slot| Arc::clone(&slot.monitor));
        if let Some(monitor) = monitor {
            monitor.halt().await?;
        }

        for segment in self.registry.all() {
            segment.free()?;
            self.registry
                .remove(segment.master_id(), segment.segment_id())?;
        }
        tracing::info!("backup server shut down");
        Ok(())
    }
}

fn empty(result: Result<()>) -> BackupResponse {
    BackupResponse::Empty {
        status: match &result {
            Ok(()) => Status::Ok,
            Err(e) => Status::from(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ChangeKind, ServerChange};
    use crate::log::{EntryAppender, EntryIterator, Partition, Tablet};
    use std::time::Duration;

    const SEG: usize = 4096;

    fn test_server(pool_capacity: usize) -> BackupServer {
        let config = BackupConfig::new("coord:0", "backup:0")
            .segment_size(SEG)
            .pool_capacity(pool_capacity)
            .extent_count(8);
        BackupServer::new(config).unwrap()
    }

    struct StaticCoordinator(ServerId);

    #[async_trait::async_trait]
    impl CoordinatorClient for StaticCoordinator {
        async fn register(&self, _locator: &str) -> Result<ServerId> {
            Ok(self.0)
        }

        async fn subscribe_membership(&self) -> Result<mpsc::Receiver<ServerChange>> {
            // An immediately-ended stream; membership never changes.
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    /// Coordinator double whose membership stream is driven by the test.
    struct FeedCoordinator {
        id: ServerId,
        membership: Mutex<Option<mpsc::Receiver<ServerChange>>>,
    }

    #[async_trait::async_trait]
    impl CoordinatorClient for FeedCoordinator {
        async fn register(&self, _locator: &str) -> Result<ServerId> {
            Ok(self.id)
        }

        async fn subscribe_membership(&self) -> Result<mpsc::Receiver<ServerChange>> {
            self.membership
                .lock()?
                .take()
                .ok_or_else(|| Error::BadRequest("already subscribed".to_string()))
        }
    }

    fn split_partitioning_bytes() -> Vec<u8> {
        Partitioning::new(vec![
            Partition::new(vec![Tablet::new(1, 0, 500)]),
            Partition::new(vec![Tablet::new(1, 501, 1000)]),
        ])
        .encode()
        .unwrap()
    }

    #[test]
    fn test_single_segment_lifecycle() -> Result<()> {
        let server = test_server(4);

        server.open_segment(7, 3)?;
        server.write_segment(7, 3, 0, b"HELLO", WriteFlags::none())?;
        server.close_segment(7, 3)?;
        server.free_segment(7, 3)?;

        assert!(!server.registry().contains(7, 3));
        assert_eq!(server.pool().in_use(), 0);
        Ok(())
    }

    #[test]
    fn test_pool_exhaustion_and_recovery() -> Result<()> {
        let server = test_server(2);

        server.open_segment(1, 1)?;
        server.open_segment(1, 2)?;
        assert_eq!(server.open_segment(1, 3).err(), Some(Error::PoolExhausted));
        // The failed open left no registry entry behind.
        assert!(!server.registry().contains(1, 3));

        server.free_segment(1, 1)?;
        server.open_segment(1, 3)?;
        Ok(())
    }

    #[test]
    fn test_close_is_idempotent() -> Result<()> {
        let server = test_server(2);

        server.open_segment(1, 1)?;
        server.write_segment(1, 1, 0, b"x", WriteFlags::none())?;
        server.close_segment(1, 1)?;
        server.close_segment(1, 1)?;
        Ok(())
    }

    #[test]
    fn test_write_flags_open_and_close() -> Result<()> {
        let server = test_server(2);

        // One round trip: create, stage, persist.
        server.write_segment(9, 1, 0, b"oneshot", WriteFlags::none().open().close())?;

        let segment = server.registry().find(9, 1).unwrap();
        assert_eq!(segment.state(), SegmentState::Closed);
        assert!(segment.in_storage());
        Ok(())
    }

    #[test]
    fn test_write_to_unknown_segment() {
        let server = test_server(2);
        assert_eq!(
            server
                .write_segment(1, 1, 0, b"x", WriteFlags::none())
                .err(),
            Some(Error::SegmentUnavailable)
        );
    }

    #[test]
    fn test_free_unknown_segment_is_noop() -> Result<()> {
        let server = test_server(2);
        server.free_segment(1, 99)
    }

    #[test]
    fn test_dispatch_maps_errors_to_statuses() {
        let server = test_server(2);

        let response = server.dispatch(BackupRequest::CloseSegment {
            master_id: 1,
            segment_id: 1,
        });
        assert_eq!(response.status(), Status::SegmentUnavailable);

        let response = server.dispatch(BackupRequest::GetRecoveryData {
            master_id: 1,
            segment_id: 1,
            partition_index: 0,
        });
        assert_eq!(response.status(), Status::BadRequest);

        let response = server.dispatch(BackupRequest::StartReadingData {
            master_id: 1,
            partitioning: b"not bincode".to_vec(),
        });
        assert_eq!(response.status(), Status::BadRequest);
    }

    #[test]
    fn test_write_offset_bounds_via_dispatch() -> Result<()> {
        let server = test_server(2);
        server.open_segment(1, 1)?;

        let response = server.dispatch(BackupRequest::WriteSegment {
            master_id: 1,
            segment_id: 1,
            offset: (SEG - 4) as u32,
            flags: WriteFlags::none(),
            data: b"LAST".to_vec(),
        });
        assert_eq!(response.status(), Status::Ok);

        let response = server.dispatch(BackupRequest::WriteSegment {
            master_id: 1,
            segment_id: 1,
            offset: (SEG - 3) as u32,
            flags: WriteFlags::none(),
            data: b"LAST".to_vec(),
        });
        assert_eq!(response.status(), Status::BadRequest);
        Ok(())
    }

    #[test]
    fn test_recovery_over_dispatch_surface() -> Result<()> {
        let server = test_server(4);

        // A master replicates one segment with two objects and a header.
        let mut image = vec![0u8; SEG];
        let mut appender = EntryAppender::new(&mut image);
        appender.append_object(1, 100, b"low")?;
        appender.append_object(1, 900, b"high")?;
        appender.finish()?;

        server.open_segment(7, 3)?;
        server.write_segment(7, 3, 0, &image, WriteFlags::none().close())?;

        // The coordinator starts recovery for master 7.
        let response = server.dispatch(BackupRequest::StartReadingData {
            master_id: 7,
            partitioning: split_partitioning_bytes(),
        });
        let BackupResponse::SegmentIds {
            status,
            segment_ids,
        } = response
        else {
            panic!("wrong response kind");
        };
        assert!(status.is_ok());
        assert_eq!(segment_ids, vec![3]);

        // Each recovery master pulls its partition.
        for (partition_index, expected_hash) in [(0u32, 100u64), (1, 900)] {
            let response = server.dispatch(BackupRequest::GetRecoveryData {
                master_id: 7,
                segment_id: 3,
                partition_index,
            });
            let BackupResponse::RecoveryData {
                status, entries, ..
            } = response
            else {
                panic!("wrong response kind");
            };
            assert!(status.is_ok());

            let decoded: Vec<_> = EntryIterator::new(&entries)
                .collect::<Result<Vec<_>>>()?;
            let hashes: Vec<_> = decoded
                .iter()
                .filter_map(|entry| entry.ownership().ok())
                .collect();
            assert_eq!(hashes, vec![(1, expected_hash)]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_run_services_requests_until_channel_closes() -> Result<()> {
        let server = Arc::new(test_server(4));
        let coordinator = Arc::new(StaticCoordinator(ServerId(12)));
        let (tx, rx) = mpsc::channel(16);

        let run = tokio::spawn(Arc::clone(&server).run(coordinator, rx));

        let send = |request| {
            let tx = tx.clone();
            async move {
                let (responder, response) = oneshot::channel();
                tx.send(Rpc { request, responder }).await.unwrap();
                response.await.unwrap()
            }
        };

        let response = send(BackupRequest::OpenSegment {
            master_id: 7,
            segment_id: 3,
        })
        .await;
        assert_eq!(response.status(), Status::Ok);

        let response = send(BackupRequest::WriteSegment {
            master_id: 7,
            segment_id: 3,
            offset: 0,
            flags: WriteFlags::none().close(),
            data: b"HELLO".to_vec(),
        })
        .await;
        assert_eq!(response.status(), Status::Ok);

        assert_eq!(server.server_id(), Some(ServerId(12)));

        // Closing the channel shuts the server down and frees replicas.
        drop(tx);
        run.await??;
        assert!(server.registry().is_empty());
        assert_eq!(server.pool().in_use(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_fails_fast_on_registration_failure() {
        struct FailingCoordinator;

        #[async_trait::async_trait]
        impl CoordinatorClient for FailingCoordinator {
            async fn register(&self, _locator: &str) -> Result<ServerId> {
                Err(Error::BadRequest("coordinator unreachable".to_string()))
            }

            async fn subscribe_membership(&self) -> Result<mpsc::Receiver<ServerChange>> {
                let (_tx, rx) = mpsc::channel(1);
                Ok(rx)
            }
        }

        let server = Arc::new(test_server(2));
        let (_tx, rx) = mpsc::channel(1);
        let result = Arc::clone(&server)
            .run(Arc::new(FailingCoordinator), rx)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_feeds_membership_to_monitor() -> Result<()> {
        use crate::monitor::{HeadLog, ReplicaManager};

        #[derive(Default)]
        struct RecordingReplicaManager {
            failures: Mutex<Vec<ServerId>>,
        }

        impl ReplicaManager for RecordingReplicaManager {
            fn handle_backup_failure(&self, server_id: ServerId) -> Option<u64> {
                self.failures.lock().unwrap().push(server_id);
                Some(17)
            }

            fn proceed(&self) {}

            fn is_idle(&self) -> bool {
                true
            }
        }

        #[derive(Default)]
        struct RecordingLog {
            rollovers: Mutex<Vec<u64>>,
        }

        impl HeadLog for RecordingLog {
            fn allocate_head_if_still_on(&self, segment_id: u64) {
                self.rollovers.lock().unwrap().push(segment_id);
            }
        }

        let server = Arc::new(test_server(2));
        let manager = Arc::new(RecordingReplicaManager::default());
        let log = Arc::new(RecordingLog::default());
        server.attach_monitor(manager.clone(), log.clone())?;

        let (member_tx, member_rx) = mpsc::channel(4);
        let coordinator = Arc::new(FeedCoordinator {
            id: ServerId(3),
            membership: Mutex::new(Some(member_rx)),
        });
        let (tx, rx) = mpsc::channel(4);
        let run = tokio::spawn(Arc::clone(&server).run(coordinator, rx));

        // The coordinator reports a backup crash; the monitor reacts and
        // rolls the head whose replica was lost.
        member_tx
            .send(ServerChange::new(ServerId(42), ChangeKind::Crashed))
            .await
            .unwrap();

        for _ in 0..500 {
            if !log.rollovers.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        drop(tx);
        drop(member_tx);
        run.await??;

        assert_eq!(*manager.failures.lock().unwrap(), vec![ServerId(42)]);
        assert_eq!(*log.rollovers.lock().unwrap(), vec![17]);
        Ok(())
    }
}
