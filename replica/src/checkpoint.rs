// Copyright 2024 Oxide Computer Company

//! The checkpoint timer: periodically records, per healthy volume, the io
//! number below which everything is durably applied.  One task per
//! process, owned by the daemon and started/stopped explicitly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use slog::{debug, error, Logger};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::registry::VolumeRegistry;
use crate::volume::{HealthStatus, VolumeInfo};

/// Upper bound on how long the timer sleeps between walks, whatever the
/// per-volume intervals say.
const MAX_WAIT: Duration = Duration::from_secs(600);

/// Explicit-lifecycle checkpoint timer.  Interval updates go through
/// [`CheckpointService::update_ionum_interval`], which wakes the timer so
/// it can re-derive its next deadline.
#[derive(Debug, Default)]
pub struct CheckpointService {
    /// Serializes interval updates against each other; the walk itself
    /// reads the intervals atomically.
    mtx: Mutex<()>,
    cv: Notify,
    stop: AtomicBool,
}

impl CheckpointService {
    pub fn new() -> Arc<CheckpointService> {
        Arc::new(CheckpointService::default())
    }

    pub fn start(
        self: Arc<Self>,
        registry: Arc<VolumeRegistry>,
        log: Logger,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(registry, log).await })
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.cv.notify_one();
    }

    /// Sets a volume's checkpoint interval and wakes the timer.  A zero
    /// `secs` leaves the interval alone and just wakes the timer (used
    /// when a volume's status changed under it).  No-op if the value is
    /// unchanged.
    pub fn update_ionum_interval(&self, volume: &VolumeInfo, secs: u64) {
        let _guard = self.mtx.lock().unwrap();
        if volume.update_ionum_interval.load(Ordering::SeqCst) == secs {
            return;
        }
        if secs != 0 {
            volume.update_ionum_interval.store(secs, Ordering::SeqCst);
        }
        self.cv.notify_one();
    }

    async fn run(&self, registry: Arc<VolumeRegistry>, log: Logger) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            let mut min_wait = MAX_WAIT;
            let now = Instant::now();
            // Walk a snapshot; the durable store call must not happen
            // under the registry lock.
            for volume in registry.list() {
                if volume.health() != HealthStatus::Healthy {
                    continue;
                }
                let secs =
                    volume.update_ionum_interval.load(Ordering::SeqCst);
                if secs == 0 {
                    continue;
                }
                let interval = Duration::from_secs(secs);

                let mut checkpointed_time =
                    volume.checkpointed_time.lock().unwrap();
                let mut next_check = *checkpointed_time + interval;
                if next_check <= now {
                    let previous =
                        volume.checkpointed_ionum.load(Ordering::SeqCst);
                    debug!(
                        log,
                        "checkpointing ionum {} on {}",
                        previous,
                        volume.name
                    );
                    if let Err(e) =
                        volume.store.store_last_committed_io(previous)
                    {
                        error!(
                            log,
                            "checkpoint store failed on {}: {}",
                            volume.name,
                            e
                        );
                    }
                    volume.checkpointed_ionum.store(
                        volume.running_ionum.load(Ordering::SeqCst),
                        Ordering::SeqCst,
                    );
                    *checkpointed_time = now;
                    next_check = now + interval;
                }
                min_wait = min_wait.min(next_check - now);
            }

            let _ = tokio::time::timeout(min_wait, self.cv.notified()).await;
        }
    }
}
