// Copyright 2024 Oxide Computer Company
use std::collections::BTreeMap;
use std::sync::Mutex;

use replicore_common::ReplicaError;
use replicore_protocol::BlockMeta;

pub type StoreResult<T> = Result<T, ReplicaError>;

/// Callback handed to [`VolumeStore::get_io_diff`]: one invocation per
/// byte range modified since the given io number, as
/// `(offset, len, io_num)`.
pub type DiffCallback<'a> =
    dyn FnMut(u64, u64, u64) -> StoreResult<()> + 'a;

/// Interface to the block-store engine backing one volume.
///
/// The engine itself (on-disk layout, its own consistency, snapshots) is
/// not our concern; the data plane only drives it through these calls.
pub trait VolumeStore: Send + Sync + std::fmt::Debug {
    /// Reads `buf.len()` bytes at `offset`.  When `metadata` is given,
    /// appends one triple per stored extent intersecting the range.
    fn read(
        &self,
        buf: &mut [u8],
        offset: u64,
        metadata: Option<&mut Vec<BlockMeta>>,
    ) -> StoreResult<()>;

    /// Writes `data` at `offset`, tagged with the write's io number.
    /// Rebuild writes are flagged so the engine can arbitrate against
    /// newer live data.
    fn write(
        &self,
        data: &[u8],
        offset: u64,
        io_num: u64,
        is_rebuild: bool,
    ) -> StoreResult<()>;

    /// Makes everything written so far durable.
    fn flush(&self) -> StoreResult<()>;

    /// Enumerates the ranges inside `[offset, offset + len)` modified by
    /// an io number greater than `since`, in ascending offset order.
    fn get_io_diff(
        &self,
        since: u64,
        offset: u64,
        len: u64,
        cb: &mut DiffCallback,
    ) -> StoreResult<()>;

    /// Durably records that every write up to `io_num` is persisted.
    fn store_last_committed_io(&self, io_num: u64) -> StoreResult<()>;

    /// Returns the io number last recorded by
    /// [`VolumeStore::store_last_committed_io`].
    fn last_committed_io(&self) -> StoreResult<u64>;

    /// Volume size in bytes.
    fn volume_size(&self) -> u64;
}

#[derive(Copy, Clone, Debug)]
struct Seg {
    len: u64,
    io_num: u64,
}

#[derive(Debug)]
struct Inner {
    data: Vec<u8>,
    /// Disjoint written extents, keyed by start offset.
    segs: BTreeMap<u64, Seg>,
    last_committed: u64,
    committed_calls: Vec<u64>,
}

/// In-memory [`VolumeStore`], backing the daemon's `--volume` option and
/// the test suites.  Last write wins; each written extent remembers the
/// io number that produced it.
#[derive(Debug)]
pub struct MemBlockStore {
    size: u64,
    inner: Mutex<Inner>,
}

impl MemBlockStore {
    pub fn new(size: u64) -> Self {
        MemBlockStore {
            size,
            inner: Mutex::new(Inner {
                data: vec![0; size as usize],
                segs: BTreeMap::new(),
                last_committed: 0,
                committed_calls: Vec::new(),
            }),
        }
    }

    /// Every io number ever passed to `store_last_committed_io`, oldest
    /// first.
    pub fn committed_calls(&self) -> Vec<u64> {
        self.inner.lock().unwrap().committed_calls.clone()
    }

    fn check_range(&self, offset: u64, len: u64) -> StoreResult<()> {
        let end = offset
            .checked_add(len)
            .ok_or(ReplicaError::OffsetInvalid(offset))?;
        if end > self.size {
            return Err(ReplicaError::OffsetInvalid(offset));
        }
        Ok(())
    }
}

impl Inner {
    /// Records a written extent, splitting whatever it overlaps.
    fn insert_seg(&mut self, offset: u64, len: u64, io_num: u64) {
        let end = offset + len;
        let mut hit = Vec::new();
        if let Some((&s, seg)) = self.segs.range(..offset).next_back() {
            if s + seg.len > offset {
                hit.push(s);
            }
        }
        hit.extend(self.segs.range(offset..end).map(|(&s, _)| s));
        for s in hit {
            let seg = self.segs.remove(&s).unwrap();
            let e = s + seg.len;
            if s < offset {
                self.segs.insert(
                    s,
                    Seg {
                        len: offset - s,
                        io_num: seg.io_num,
                    },
                );
            }
            if e > end {
                self.segs.insert(
                    end,
                    Seg {
                        len: e - end,
                        io_num: seg.io_num,
                    },
                );
            }
        }
        self.segs.insert(offset, Seg { len, io_num });
    }

    /// Visits extents intersecting `[offset, offset + len)` clipped to the
    /// range, ascending.
    fn visit_range(
        &self,
        offset: u64,
        len: u64,
        mut f: impl FnMut(u64, u64, u64) -> StoreResult<()>,
    ) -> StoreResult<()> {
        if len == 0 {
            return Ok(());
        }
        let end = offset + len;
        if let Some((&s, seg)) = self.segs.range(..offset).next_back() {
            let e = s + seg.len;
            if e > offset {
                f(offset, e.min(end) - offset, seg.io_num)?;
            }
        }
        for (&s, seg) in self.segs.range(offset..end) {
            let e = s + seg.len;
            f(s, e.min(end) - s, seg.io_num)?;
        }
        Ok(())
    }
}

impl VolumeStore for MemBlockStore {
    fn read(
        &self,
        buf: &mut [u8],
        offset: u64,
        metadata: Option<&mut Vec<BlockMeta>>,
    ) -> StoreResult<()> {
        self.check_range(offset, buf.len() as u64)?;
        let inner = self.inner.lock().unwrap();
        let start = offset as usize;
        buf.copy_from_slice(&inner.data[start..start + buf.len()]);
        if let Some(metadata) = metadata {
            inner.visit_range(
                offset,
                buf.len() as u64,
                |off, len, io_num| {
                    metadata.push(BlockMeta {
                        offset: off,
                        len,
                        io_num,
                    });
                    Ok(())
                },
            )?;
        }
        Ok(())
    }

    fn write(
        &self,
        data: &[u8],
        offset: u64,
        io_num: u64,
        _is_rebuild: bool,
    ) -> StoreResult<()> {
        self.check_range(offset, data.len() as u64)?;
        let mut inner = self.inner.lock().unwrap();
        let start = offset as usize;
        inner.data[start..start + data.len()].copy_from_slice(data);
        inner.insert_seg(offset, data.len() as u64, io_num);
        Ok(())
    }

    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    fn get_io_diff(
        &self,
        since: u64,
        offset: u64,
        len: u64,
        cb: &mut DiffCallback,
    ) -> StoreResult<()> {
        let end = (offset + len).min(self.size);
        if offset >= end {
            return Ok(());
        }
        let inner = self.inner.lock().unwrap();
        inner.visit_range(offset, end - offset, |off, len, io_num| {
            if io_num > since {
                cb(off, len, io_num)?;
            }
            Ok(())
        })
    }

    fn store_last_committed_io(&self, io_num: u64) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.last_committed = io_num;
        inner.committed_calls.push(io_num);
        Ok(())
    }

    fn last_committed_io(&self) -> StoreResult<u64> {
        Ok(self.inner.lock().unwrap().last_committed)
    }

    fn volume_size(&self) -> u64 {
        self.size
    }
}
