// Copyright 2024 Oxide Computer Company
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use bytes::BytesMut;
use futures::StreamExt;
use slog::{error, info, o, Logger};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

use replicore_protocol::{
    encode_write_record, Frame, FrameDecoder, FrameWriter, Opcode, OpStatus,
    BLOCK_META_LEN,
};

use crate::command::Command;
use crate::volume::VolumeInfo;
use crate::worker;
use crate::DataPlane;

/// Connection id used for commands that are never acknowledged (the
/// rebuild recipient's locally fabricated writes).
pub(crate) const NO_CONN: u64 = 0;

pub(crate) type SharedWriter =
    Arc<tokio::sync::Mutex<FrameWriter<OwnedWriteHalf>>>;

/// Maps live connection ids to their write halves so the per-volume
/// ack-sender can route each completion back to the socket its command
/// arrived on.
#[derive(Default)]
pub struct ConnRegistry {
    next_id: AtomicU64,
    conns: Mutex<HashMap<u64, SharedWriter>>,
}

impl ConnRegistry {
    pub(crate) fn register(&self, writer: OwnedWriteHalf) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let writer = Arc::new(tokio::sync::Mutex::new(FrameWriter::new(
            writer,
        )));
        self.conns.lock().unwrap().insert(id, writer);
        id
    }

    pub(crate) fn get(&self, id: u64) -> Option<SharedWriter> {
        self.conns.lock().unwrap().get(&id).cloned()
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.conns.lock().unwrap().remove(&id);
    }
}

pub(crate) type FrameStream = FramedRead<OwnedReadHalf, FrameDecoder>;

/// Serves one accepted data connection: binds it to a volume via the
/// handshake, starts the volume's ack-sender, then feeds every further
/// frame to the worker pool until the socket or the volume dies.
pub(crate) async fn io_receiver(
    plane: Arc<DataPlane>,
    sock: TcpStream,
    peer: SocketAddr,
) {
    let log = plane
        .log
        .new(o!("task" => "io_receiver", "peer" => peer.to_string()));

    let (read_half, write_half) = sock.into_split();
    let conn_id = plane.conns.register(write_half);
    let mut frames = FramedRead::new(read_half, FrameDecoder::new());

    match bind_volume(&plane, &mut frames, &log).await {
        Ok(volume) => {
            // One refcount for this connection, one for the ack-sender.
            volume.take_refcnt();
            volume.take_refcnt();
            let sender = tokio::spawn(ack_sender(
                plane.clone(),
                volume.clone(),
                log.new(o!("task" => "io_ack_sender")),
            ));

            if let Err(e) =
                recv_loop(&volume, &mut frames, conn_id, &log).await
            {
                info!(log, "data connection closing: {:#}", e);
            }

            teardown_data_conn(&volume, conn_id).await;
            let _ = sender.await;
            volume.drop_refcnt();
        }
        Err(e) => {
            info!(log, "data connection rejected: {:#}", e);
        }
    }

    plane.conns.unregister(conn_id);
}

/// Reads the handshake frame and binds the connection to the named
/// volume.  A volume serves one data connection at a time; a second
/// binding attempt is refused.
async fn bind_volume(
    plane: &DataPlane,
    frames: &mut FrameStream,
    log: &Logger,
) -> Result<Arc<VolumeInfo>> {
    let frame = frames
        .next()
        .await
        .transpose()?
        .ok_or_else(|| anyhow!("peer closed before handshake"))?;
    if frame.header.opcode != Opcode::Handshake {
        bail!(
            "expected handshake, got {:?}",
            frame.header.opcode
        );
    }
    let name = std::str::from_utf8(&frame.payload)?
        .trim_end_matches('\0')
        .to_string();
    let volume = plane
        .registry
        .lookup(&name)
        .ok_or_else(|| anyhow!("volume {} not found", name))?;

    {
        let mut ack = volume.ack.lock().unwrap();
        if ack.sender_created {
            bail!("volume {} already has a data connection", name);
        }
        ack.sender_created = true;
    }

    info!(log, "data connection bound to volume {}", name);
    Ok(volume)
}

async fn recv_loop(
    volume: &Arc<VolumeInfo>,
    frames: &mut FrameStream,
    conn_id: u64,
    log: &Logger,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = volume.cancel.cancelled() => {
                bail!("volume {} went offline", volume.name);
            }
            frame = frames.next() => match frame.transpose()? {
                Some(frame) => frame,
                None => return Ok(()), // peer closed
            },
        };

        match frame.header.opcode {
            Opcode::Read | Opcode::Write | Opcode::Sync => {
                dispatch(volume, frame, conn_id, log);
            }
            // OPEN belongs to the management channel; seeing it (or any
            // rebuild opcode) here is a protocol violation.
            op => bail!("unexpected opcode {:?} on data connection", op),
        }
    }
}

/// Hands one received frame to the worker pool as a command.
fn dispatch(
    volume: &Arc<VolumeInfo>,
    frame: Frame,
    conn_id: u64,
    log: &Logger,
) {
    let cmd = if frame.header.wire_payload_len() > 0 {
        Command::with_payload(
            frame.header,
            volume.clone(),
            conn_id,
            frame.payload,
        )
    } else {
        Command::new(frame.header, volume.clone(), conn_id)
    };
    volume.take_refcnt();
    let wlog = log.clone();
    tokio::task::spawn_blocking(move || {
        worker::run(&wlog, cmd);
    });
}

/// Drains the volume's completion queue, writing each reply to the socket
/// its command came in on.  Runs until torn down or until a reply write
/// fails.
pub(crate) async fn ack_sender(
    plane: Arc<DataPlane>,
    volume: Arc<VolumeInfo>,
    log: Logger,
) {
    loop {
        let notified = volume.io_ack_cond.notified();
        let next = {
            let mut ack = volume.ack.lock().unwrap();
            if !ack.sender_created {
                break;
            }
            match ack.queue.pop_front() {
                Some(cmd) => {
                    ack.io_ack_waiting = false;
                    ack.cmd_in_ack = Some(cmd.conn);
                    Some(cmd)
                }
                None => {
                    ack.io_ack_waiting = true;
                    None
                }
            }
        };

        let Some(cmd) = next else {
            notified.await;
            continue;
        };

        let result = send_reply(&plane, &cmd).await;

        volume.ack.lock().unwrap().cmd_in_ack = None;
        volume.ack_idle.notify_waiters();

        if let Err(e) = result {
            error!(log, "reply write failed on conn {}: {}", cmd.conn, e);
            break;
        }
    }

    // Whatever is still queued is freed, never sent.
    {
        let mut ack = volume.ack.lock().unwrap();
        ack.sender_created = false;
        ack.queue.clear();
        ack.cmd_in_ack = None;
        ack.io_ack_waiting = false;
    }
    volume.ack_idle.notify_waiters();
    volume.drop_refcnt();
}

/// Writes one completed command back to its connection.  A vanished
/// connection is not an error; the reply is simply dropped.
async fn send_reply(
    plane: &DataPlane,
    cmd: &Command,
) -> Result<(), replicore_common::ReplicaError> {
    let Some(writer) = plane.conns.get(cmd.conn) else {
        return Ok(());
    };
    let mut writer = writer.lock().await;
    let mut hdr = cmd.header;

    if hdr.opcode == Opcode::Read && hdr.status == OpStatus::Ok {
        if hdr.is_rebuild() {
            // Rebuild data goes out in write-record format so the
            // recipient can replay the payload as a WRITE unmodified.
            let mut buf = BytesMut::new();
            for m in &cmd.metadata {
                let start = (m.offset - cmd.header.offset) as usize;
                encode_write_record(
                    &mut buf,
                    m.io_num,
                    &cmd.payload[start..start + m.len as usize],
                );
            }
            hdr.len = buf.len() as u64;
            writer.send(&hdr, &buf).await
        } else {
            hdr.meta_len = (cmd.metadata.len() * BLOCK_META_LEN) as u64;
            writer
                .send_reply(
                    &hdr,
                    &cmd.payload[..hdr.len as usize],
                    &cmd.metadata,
                )
                .await
        }
    } else {
        hdr.len = 0;
        writer.send_header(&hdr).await
    }
}

/// Data-connection teardown: stop the ack-sender, drop this connection's
/// pending completions, and wait out any ack still in flight.
async fn teardown_data_conn(volume: &VolumeInfo, conn_id: u64) {
    volume.ack.lock().unwrap().sender_created = false;
    volume.io_ack_cond.notify_one();
    remove_pending_cmds_to_ack(conn_id, volume).await;
}

/// Discards every queued completion belonging to `conn`, then waits until
/// the ack-sender is not mid-write on that connection.
pub(crate) async fn remove_pending_cmds_to_ack(
    conn: u64,
    volume: &VolumeInfo,
) {
    volume
        .ack
        .lock()
        .unwrap()
        .queue
        .retain(|cmd| cmd.conn != conn);

    loop {
        let idle = volume.ack_idle.notified();
        tokio::pin!(idle);
        // Register before checking, so a wakeup between the check and the
        // await is not lost.
        idle.as_mut().enable();
        {
            let ack = volume.ack.lock().unwrap();
            if ack.cmd_in_ack != Some(conn) {
                break;
            }
        }
        idle.await;
    }
}
