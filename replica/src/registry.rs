// Copyright 2024 Oxide Computer Company
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use replicore_common::ReplicaError;

use crate::volume::VolumeInfo;

/// Name-keyed map of the volumes this replica serves.
///
/// The map has its own lock; callers that need to do real work against
/// the volumes (the checkpoint timer in particular) take a snapshot and
/// release it first.
#[derive(Debug, Default)]
pub struct VolumeRegistry {
    inner: Mutex<HashMap<String, Arc<VolumeInfo>>>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, volume: Arc<VolumeInfo>) -> Result<(), ReplicaError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(&volume.name) {
            return Err(ReplicaError::GenericError(format!(
                "volume {} already registered",
                volume.name
            )));
        }
        inner.insert(volume.name.clone(), volume);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<VolumeInfo>> {
        self.inner.lock().unwrap().get(name).cloned()
    }

    /// Snapshot of every registered volume, for walks that must not hold
    /// the registry lock across blocking calls.
    pub fn list(&self) -> Vec<Arc<VolumeInfo>> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    /// Removes the volume if nothing holds a refcount on it.  Returns
    /// whether it was removed.
    pub fn remove_if_idle(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(name) {
            Some(volume) if volume.refcnt() == 0 => {
                inner.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemBlockStore;

    fn vol(name: &str) -> Arc<VolumeInfo> {
        VolumeInfo::new(name, Arc::new(MemBlockStore::new(64)), 0)
    }

    #[test]
    fn insert_and_lookup() {
        let reg = VolumeRegistry::new();
        reg.insert(vol("v1")).unwrap();
        assert!(reg.lookup("v1").is_some());
        assert!(reg.lookup("v2").is_none());
        assert!(reg.insert(vol("v1")).is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn busy_volume_not_removed() {
        let reg = VolumeRegistry::new();
        let v = vol("v1");
        reg.insert(v.clone()).unwrap();

        v.take_refcnt();
        assert!(!reg.remove_if_idle("v1"));
        v.drop_refcnt();
        assert!(reg.remove_if_idle("v1"));
        assert!(reg.is_empty());
    }
}
