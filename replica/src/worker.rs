// Copyright 2024 Oxide Computer Company
use std::sync::atomic::Ordering;
use std::sync::Arc;

use slog::{error, Logger};

use replicore_common::ReplicaError;
use replicore_protocol::{Opcode, OpStatus, WriteRecords};

use crate::command::Command;
use crate::volume::{VolumeInfo, VolumeState};

/// Applies the records of a WRITE payload in order, stopping at the first
/// failure, and advances the volume's running io number past every record
/// applied.
pub(crate) fn submit_writes(
    volume: &VolumeInfo,
    cmd: &Command,
) -> Result<(), ReplicaError> {
    let is_rebuild = cmd.header.is_rebuild();
    let mut data_offset = cmd.header.offset;
    for record in WriteRecords::new(&cmd.payload) {
        let (rw, data) = record?;
        volume.store.write(data, data_offset, rw.io_num, is_rebuild)?;
        volume
            .running_ionum
            .fetch_max(rw.io_num, Ordering::SeqCst);
        data_offset += rw.len;
    }
    Ok(())
}

fn execute(cmd: &mut Command, log: &Logger) {
    let volume = Arc::clone(&cmd.volume);

    // A volume past its rebuild phase serves plain requests without
    // metadata unless the caller asked for it; everything else collects.
    let collect_metadata = cmd.header.is_rebuild()
        || !volume.is_rebuilt()
        || cmd.header.wants_metadata();

    let result = match cmd.header.opcode {
        Opcode::Read => {
            let len = cmd.header.len as usize;
            let mut metadata = collect_metadata.then(Vec::new);
            let rc = volume.store.read(
                &mut cmd.payload[..len],
                cmd.header.offset,
                metadata.as_mut(),
            );
            if let Some(metadata) = metadata {
                cmd.metadata = metadata;
            }
            volume.counters.read_req.fetch_add(1, Ordering::Relaxed);
            rc
        }
        Opcode::Write => {
            let rc = submit_writes(&volume, cmd);
            volume.counters.write_req.fetch_add(1, Ordering::Relaxed);
            rc
        }
        Opcode::Sync => {
            let rc = volume.store.flush();
            volume.counters.sync_req.fetch_add(1, Ordering::Relaxed);
            rc
        }
        // Sentinel reply fabricated by the rebuild scanner; nothing to do.
        Opcode::RebuildStepDone => Ok(()),
        op => Err(ReplicaError::Protocol(format!(
            "opcode {:?} is not executable",
            op
        ))),
    };

    match result {
        Ok(()) => cmd.header.status = OpStatus::Ok,
        Err(e) => {
            error!(
                log,
                "opcode {:?} failed on volume {}: {}",
                cmd.header.opcode,
                volume.name,
                e
            );
            cmd.header.status = OpStatus::Failed;
            cmd.header.len = 0;
        }
    }
}

/// Executes one command against the volume store, then applies the ack
/// policy.
///
/// Rebuild-flagged writes are never acknowledged; the command comes back
/// to the caller, which owns it and inspects the status.  Every other
/// command is consumed here: appended to the volume's completion queue
/// for the ack-sender, or dropped when no ack-sender is alive.  The
/// caller's volume refcount is dropped in all cases.
pub fn run(log: &Logger, mut cmd: Command) -> Option<Command> {
    let volume = Arc::clone(&cmd.volume);
    let rebuild_write =
        cmd.header.is_rebuild() && cmd.header.opcode == Opcode::Write;

    if volume.state() == VolumeState::Offline {
        cmd.header.status = OpStatus::Failed;
        cmd.header.len = 0;
    } else {
        execute(&mut cmd, log);
    }

    if rebuild_write {
        volume.drop_refcnt();
        return Some(cmd);
    }

    {
        let mut ack = volume.ack.lock().unwrap();
        if ack.sender_created {
            ack.queue.push_back(cmd);
            if ack.io_ack_waiting {
                volume.io_ack_cond.notify_one();
            }
        }
        // No ack-sender: the connection is gone, the reply is dropped.
    }

    volume.drop_refcnt();
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemBlockStore;
    use bytes::BytesMut;
    use replicore_common::build_plain_logger;
    use replicore_protocol::{
        encode_write_record, BlockMeta, Header, FLAG_READ_METADATA,
        FLAG_REBUILD,
    };

    fn healthy_vol() -> Arc<VolumeInfo> {
        let v = VolumeInfo::new("v1", Arc::new(MemBlockStore::new(1024)), 0);
        v.mark_healthy_rebuilt();
        v
    }

    /// Lets workers enqueue without a live connection.
    fn attach_sender(volume: &VolumeInfo) {
        volume.ack.lock().unwrap().sender_created = true;
    }

    fn pop_completed(volume: &VolumeInfo) -> Option<Command> {
        volume.ack.lock().unwrap().queue.pop_front()
    }

    fn write_cmd(
        volume: &Arc<VolumeInfo>,
        offset: u64,
        io_num: u64,
        data: &[u8],
    ) -> Command {
        let mut payload = BytesMut::new();
        encode_write_record(&mut payload, io_num, data);
        let mut hdr = Header::new(Opcode::Write);
        hdr.offset = offset;
        hdr.len = payload.len() as u64;
        Command::with_payload(hdr, volume.clone(), 1, payload)
    }

    #[test]
    fn write_then_read_with_metadata() {
        let log = build_plain_logger();
        let v = healthy_vol();
        attach_sender(&v);

        v.take_refcnt();
        assert!(run(&log, write_cmd(&v, 0, 7, b"ABCDEFGH")).is_none());
        let done = pop_completed(&v).unwrap();
        assert_eq!(done.header.status, OpStatus::Ok);
        assert_eq!(v.running_ionum.load(Ordering::SeqCst), 7);

        let mut hdr = Header::new(Opcode::Read);
        hdr.len = 8;
        hdr.flags = FLAG_READ_METADATA;
        v.take_refcnt();
        run(&log, Command::new(hdr, v.clone(), 1));
        let done = pop_completed(&v).unwrap();
        assert_eq!(done.header.status, OpStatus::Ok);
        assert_eq!(&done.payload[..8], b"ABCDEFGH");
        assert_eq!(
            done.metadata,
            vec![BlockMeta {
                offset: 0,
                len: 8,
                io_num: 7
            }]
        );
        assert_eq!(v.refcnt(), 0);
        assert_eq!(v.counters.write_req.load(Ordering::Relaxed), 1);
        assert_eq!(v.counters.read_req.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn read_on_rebuilt_volume_skips_metadata() {
        let log = build_plain_logger();
        let v = healthy_vol();
        attach_sender(&v);

        v.take_refcnt();
        run(&log, write_cmd(&v, 0, 3, b"data"));
        pop_completed(&v).unwrap();

        let mut hdr = Header::new(Opcode::Read);
        hdr.len = 4;
        v.take_refcnt();
        run(&log, Command::new(hdr, v.clone(), 1));
        let done = pop_completed(&v).unwrap();
        assert_eq!(done.header.status, OpStatus::Ok);
        assert!(done.metadata.is_empty());
    }

    #[test]
    fn read_on_degraded_volume_collects_metadata() {
        let log = build_plain_logger();
        let v = VolumeInfo::new("v1", Arc::new(MemBlockStore::new(1024)), 0);
        v.set_online();
        attach_sender(&v);

        v.take_refcnt();
        run(&log, write_cmd(&v, 0, 3, b"data"));
        pop_completed(&v).unwrap();

        let mut hdr = Header::new(Opcode::Read);
        hdr.len = 4;
        v.take_refcnt();
        run(&log, Command::new(hdr, v.clone(), 1));
        let done = pop_completed(&v).unwrap();
        assert_eq!(done.metadata.len(), 1);
    }

    #[test]
    fn multi_record_write_advances_running_ionum() {
        let log = build_plain_logger();
        let v = healthy_vol();
        attach_sender(&v);

        let mut payload = BytesMut::new();
        encode_write_record(&mut payload, 11, b"first");
        encode_write_record(&mut payload, 9, b"second!!");
        let mut hdr = Header::new(Opcode::Write);
        hdr.len = payload.len() as u64;
        v.take_refcnt();
        run(&log, Command::with_payload(hdr, v.clone(), 1, payload));

        let done = pop_completed(&v).unwrap();
        assert_eq!(done.header.status, OpStatus::Ok);
        // Monotonic max, not last-written.
        assert_eq!(v.running_ionum.load(Ordering::SeqCst), 11);

        let mut buf = [0u8; 13];
        v.store.read(&mut buf, 0, None).unwrap();
        assert_eq!(&buf, b"firstsecond!!");
    }

    #[test]
    fn malformed_write_payload_fails() {
        let log = build_plain_logger();
        let v = healthy_vol();
        attach_sender(&v);

        let mut hdr = Header::new(Opcode::Write);
        hdr.len = 5;
        let payload = BytesMut::from(&b"short"[..]);
        v.take_refcnt();
        run(&log, Command::with_payload(hdr, v.clone(), 1, payload));

        let done = pop_completed(&v).unwrap();
        assert_eq!(done.header.status, OpStatus::Failed);
        assert_eq!(done.header.len, 0);
    }

    #[test]
    fn write_stops_at_first_failed_record() {
        let log = build_plain_logger();
        let v = healthy_vol();
        attach_sender(&v);

        let mut payload = BytesMut::new();
        encode_write_record(&mut payload, 5, b"good");
        encode_write_record(&mut payload, 6, &[0u8; 4096]); // past volume end
        let mut hdr = Header::new(Opcode::Write);
        hdr.offset = 1020;
        hdr.len = payload.len() as u64;
        v.take_refcnt();
        run(&log, Command::with_payload(hdr, v.clone(), 1, payload));

        let done = pop_completed(&v).unwrap();
        assert_eq!(done.header.status, OpStatus::Failed);
        // The first record was applied before the failure.
        assert_eq!(v.running_ionum.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn offline_volume_fails_command() {
        let log = build_plain_logger();
        let v = healthy_vol();
        attach_sender(&v);
        v.set_offline();

        v.take_refcnt();
        run(&log, write_cmd(&v, 0, 7, b"ABCDEFGH"));
        let done = pop_completed(&v).unwrap();
        assert_eq!(done.header.status, OpStatus::Failed);
        assert_eq!(done.header.len, 0);
        // Nothing was executed.
        assert_eq!(v.counters.write_req.load(Ordering::Relaxed), 0);
        assert_eq!(v.refcnt(), 0);
    }

    #[test]
    fn no_sender_drops_completion() {
        let log = build_plain_logger();
        let v = healthy_vol();

        v.take_refcnt();
        assert!(run(&log, write_cmd(&v, 0, 7, b"ABCDEFGH")).is_none());
        assert!(pop_completed(&v).is_none());
        assert_eq!(v.refcnt(), 0);
        // The write itself still happened.
        assert_eq!(v.running_ionum.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn rebuild_write_returns_to_caller_without_ack() {
        let log = build_plain_logger();
        let v = healthy_vol();
        attach_sender(&v);

        let mut payload = BytesMut::new();
        encode_write_record(&mut payload, 21, b"rebuilt!");
        let mut hdr = Header::new(Opcode::Write);
        hdr.flags = FLAG_REBUILD;
        hdr.len = payload.len() as u64;
        v.take_refcnt();
        let cmd = run(&log, Command::with_payload(hdr, v.clone(), 1, payload))
            .unwrap();
        assert_eq!(cmd.header.status, OpStatus::Ok);
        assert!(pop_completed(&v).is_none());
        assert_eq!(v.running_ionum.load(Ordering::SeqCst), 21);
        assert_eq!(v.refcnt(), 0);
    }

    #[test]
    fn rebuild_write_on_offline_volume_reports_failure() {
        let log = build_plain_logger();
        let v = healthy_vol();
        v.set_offline();

        let mut payload = BytesMut::new();
        encode_write_record(&mut payload, 21, b"rebuilt!");
        let mut hdr = Header::new(Opcode::Write);
        hdr.flags = FLAG_REBUILD;
        hdr.len = payload.len() as u64;
        v.take_refcnt();
        let cmd = run(&log, Command::with_payload(hdr, v.clone(), 1, payload))
            .unwrap();
        assert_eq!(cmd.header.status, OpStatus::Failed);
        assert_eq!(v.refcnt(), 0);
    }

    #[test]
    fn rebuild_read_collects_metadata() {
        let log = build_plain_logger();
        let v = healthy_vol();
        attach_sender(&v);

        v.take_refcnt();
        run(&log, write_cmd(&v, 16, 4, b"chunk"));
        pop_completed(&v).unwrap();

        // Donor-fabricated read: REBUILD flag, enqueued like any reply.
        let mut hdr = Header::new(Opcode::Read);
        hdr.flags = FLAG_REBUILD;
        hdr.offset = 16;
        hdr.len = 5;
        hdr.io_seq = 4;
        v.take_refcnt();
        assert!(run(&log, Command::new(hdr, v.clone(), 2)).is_none());
        let done = pop_completed(&v).unwrap();
        assert_eq!(done.header.status, OpStatus::Ok);
        assert_eq!(done.metadata.len(), 1);
        assert_eq!(done.conn, 2);
    }
}
