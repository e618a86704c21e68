// Copyright 2024 Oxide Computer Company
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::command::Command;
use crate::store::VolumeStore;

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum VolumeState {
    Init = 0,
    Online = 1,
    /// Permanent shutdown marker; a volume never leaves this state.
    Offline = 2,
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum RebuildStatus {
    Init = 0,
    InProgress = 1,
    Done = 2,
    Errored = 3,
    Failed = 4,
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum HealthStatus {
    Degraded = 0,
    Healthy = 1,
}

/// Ack-path state shared by workers, the ack-sender and connection
/// teardown.  Everything in here is touched only under the one mutex.
#[derive(Debug, Default)]
pub(crate) struct AckState {
    /// Completed commands waiting for the ack-sender, FIFO.
    pub queue: VecDeque<Command>,
    /// The ack-sender is parked on the queue condvar.
    pub io_ack_waiting: bool,
    /// True only while an ack-sender is alive for this volume.
    pub sender_created: bool,
    /// Connection id of the command the ack-sender is writing right now.
    pub cmd_in_ack: Option<u64>,
}

/// Rebuild bookkeeping, guarded by the rebuild mutex.  Never acquire the
/// ack mutex while holding this.
#[derive(Debug, Default)]
pub struct RebuildInfo {
    pub rebuild_cnt: u64,
    pub rebuild_done_cnt: u64,
    pub rebuild_failed_cnt: u64,
}

#[derive(Debug, Default)]
pub struct IoCounters {
    pub read_req: AtomicU64,
    pub write_req: AtomicU64,
    pub sync_req: AtomicU64,
}

/// One replicated volume on this replica.
#[derive(Debug)]
pub struct VolumeInfo {
    pub name: String,
    pub store: Arc<dyn VolumeStore>,

    state: AtomicU8,
    rebuild_status: AtomicU8,
    health: AtomicU8,

    /// Highest io number seen in any applied write.
    pub running_ionum: AtomicU64,
    /// Io number last durably recorded; advanced only by the checkpoint
    /// timer.
    pub checkpointed_ionum: AtomicU64,
    pub(crate) checkpointed_time: Mutex<Instant>,
    /// Seconds between checkpoints; 0 tells the timer to skip this volume.
    pub update_ionum_interval: AtomicU64,

    pub(crate) ack: Mutex<AckState>,
    pub(crate) io_ack_cond: Notify,
    /// Signalled by the ack-sender whenever it finishes writing a command,
    /// so teardown can wait for the in-flight ack instead of spinning.
    pub(crate) ack_idle: Notify,

    pub counters: IoCounters,
    refcount: AtomicU64,

    pub(crate) rebuild_mtx: Mutex<RebuildInfo>,
    pub(crate) cancel: CancellationToken,
}

impl VolumeInfo {
    pub fn new(
        name: &str,
        store: Arc<dyn VolumeStore>,
        update_ionum_interval: u64,
    ) -> Arc<VolumeInfo> {
        let checkpointed = store.last_committed_io().unwrap_or(0);
        Arc::new(VolumeInfo {
            name: name.to_string(),
            store,
            state: AtomicU8::new(VolumeState::Init.into()),
            rebuild_status: AtomicU8::new(RebuildStatus::Init.into()),
            health: AtomicU8::new(HealthStatus::Degraded.into()),
            running_ionum: AtomicU64::new(checkpointed),
            checkpointed_ionum: AtomicU64::new(checkpointed),
            checkpointed_time: Mutex::new(Instant::now()),
            update_ionum_interval: AtomicU64::new(update_ionum_interval),
            ack: Mutex::new(AckState::default()),
            io_ack_cond: Notify::new(),
            ack_idle: Notify::new(),
            counters: IoCounters::default(),
            refcount: AtomicU64::new(0),
            rebuild_mtx: Mutex::new(RebuildInfo::default()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> VolumeState {
        VolumeState::try_from(self.state.load(Ordering::SeqCst)).unwrap()
    }

    pub fn set_online(&self) {
        self.state.store(VolumeState::Online.into(), Ordering::SeqCst);
    }

    /// Marks the volume permanently offline and fires its cancellation
    /// token; in-flight work fails out, new work is refused.
    pub fn set_offline(&self) {
        self.state.store(VolumeState::Offline.into(), Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn rebuild_status(&self) -> RebuildStatus {
        RebuildStatus::try_from(self.rebuild_status.load(Ordering::SeqCst))
            .unwrap()
    }

    pub(crate) fn set_rebuild_status(&self, status: RebuildStatus) {
        self.rebuild_status.store(status.into(), Ordering::SeqCst);
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus::try_from(self.health.load(Ordering::SeqCst)).unwrap()
    }

    pub(crate) fn set_health(&self, health: HealthStatus) {
        self.health.store(health.into(), Ordering::SeqCst);
    }

    /// A volume past its rebuild phase serves reads without metadata
    /// unless the caller asks for it.
    pub fn is_rebuilt(&self) -> bool {
        self.rebuild_status() == RebuildStatus::Done
    }

    /// Shortcut for volumes that start out with authoritative data and
    /// never need a rebuild: online, rebuilt, healthy.
    pub fn mark_healthy_rebuilt(&self) {
        self.set_online();
        self.set_rebuild_status(RebuildStatus::Done);
        self.set_health(HealthStatus::Healthy);
    }

    pub fn rebuild_info(&self) -> RebuildInfo {
        let info = self.rebuild_mtx.lock().unwrap();
        RebuildInfo {
            rebuild_cnt: info.rebuild_cnt,
            rebuild_done_cnt: info.rebuild_done_cnt,
            rebuild_failed_cnt: info.rebuild_failed_cnt,
        }
    }

    pub fn take_refcnt(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    pub fn drop_refcnt(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "volume refcount underflow");
    }

    /// Current refcount; the volume may only be destroyed at zero.
    pub fn refcnt(&self) -> u64 {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
