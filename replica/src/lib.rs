// Copyright 2024 Oxide Computer Company

//! Replica data-plane core for a distributed block-volume replication
//! system.
//!
//! Each replica embeds this library to serve client I/O (read, write,
//! sync) over its data port and to participate in rebuilds over its
//! rebuild port, as either the donor or the recipient of the transfer.
//! The block store backing each volume is an external collaborator
//! driven through [`store::VolumeStore`]; volume creation, teardown and
//! rebuild orchestration policy belong to the management plane, which
//! calls in through [`DataPlane`].

use std::sync::Arc;

use slog::Logger;

use replicore_common::ReplicaError;

pub mod acceptor;
pub mod checkpoint;
pub mod command;
pub mod connection;
pub mod rebuild;
pub mod registry;
pub mod store;
pub mod volume;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_util;

use crate::checkpoint::CheckpointService;
use crate::connection::ConnRegistry;
use crate::registry::VolumeRegistry;
use crate::store::VolumeStore;
use crate::volume::VolumeInfo;

/// Everything a running replica's data plane shares across its tasks:
/// the volume registry, the live-connection table the ack-senders route
/// through, and the checkpoint timer.
pub struct DataPlane {
    pub log: Logger,
    pub registry: Arc<VolumeRegistry>,
    pub(crate) conns: ConnRegistry,
    pub checkpoint: Arc<CheckpointService>,
    /// Granularity at which rebuild recipients ask donors for diffs.
    pub rebuild_step_size: u64,
}

impl DataPlane {
    pub fn new(log: Logger, rebuild_step_size: u64) -> Arc<DataPlane> {
        Arc::new(DataPlane {
            log,
            registry: Arc::new(VolumeRegistry::new()),
            conns: ConnRegistry::default(),
            checkpoint: CheckpointService::new(),
            rebuild_step_size,
        })
    }

    /// Registers a volume and brings it online.  The caller decides its
    /// rebuild/health standing separately (a fresh replica stays degraded
    /// until rebuilt; one with authoritative data is marked healthy via
    /// [`VolumeInfo::mark_healthy_rebuilt`]).
    pub fn add_volume(
        &self,
        name: &str,
        store: Arc<dyn VolumeStore>,
        update_ionum_interval: u64,
    ) -> Result<Arc<VolumeInfo>, ReplicaError> {
        let volume = VolumeInfo::new(name, store, update_ionum_interval);
        volume.set_online();
        self.registry.insert(volume.clone())?;
        Ok(volume)
    }
}
