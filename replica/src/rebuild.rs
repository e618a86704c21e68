// Copyright 2024 Oxide Computer Company

//! The rebuild engine: a degraded volume catches up to one or more
//! healthy peers while staying in scope for live writes.
//!
//! Two halves cooperate over the rebuild port.  The *recipient* runs on
//! the degraded replica: it connects out to each donor, walks the volume
//! in steps, and applies the donor's data frames as local rebuild writes.
//! The *donor scanner* runs on the healthy replica: for each step it asks
//! the store for everything modified since the recipient's checkpoint and
//! ships it through the volume's ack-sender, STEP_DONE last.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use futures::StreamExt;
use slog::{error, info, o, warn, Logger};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

use replicore_common::ReplicaError;
use replicore_protocol::{
    FrameDecoder, FrameWriter, Header, Opcode, OpStatus, FLAG_REBUILD,
};

use crate::command::Command;
use crate::connection::{self, FrameStream, NO_CONN};
use crate::volume::{HealthStatus, RebuildStatus, VolumeInfo, VolumeState};
use crate::worker;
use crate::DataPlane;

/// One donor to rebuild from: where to connect, and the volume's name on
/// that peer.
#[derive(Debug, Clone)]
pub struct RebuildSource {
    pub addr: SocketAddr,
    pub volume: String,
}

/// Management-plane entry point: rebuild `volume` from the given donors.
///
/// Initializes the rebuild counters before any recipient task runs, so
/// the terminal done/failed transition is well defined, then spawns one
/// recipient per donor.
pub fn start_rebuild(
    plane: &Arc<DataPlane>,
    volume: &Arc<VolumeInfo>,
    donors: Vec<RebuildSource>,
) {
    {
        let mut info = volume.rebuild_mtx.lock().unwrap();
        info.rebuild_cnt = donors.len() as u64;
        info.rebuild_done_cnt = 0;
        info.rebuild_failed_cnt = 0;
        volume.set_rebuild_status(RebuildStatus::InProgress);
    }
    for donor in donors {
        volume.take_refcnt();
        tokio::spawn(rebuild_recipient(
            plane.clone(),
            volume.clone(),
            donor,
        ));
    }
}

async fn rebuild_recipient(
    plane: Arc<DataPlane>,
    volume: Arc<VolumeInfo>,
    donor: RebuildSource,
) {
    let log = plane.log.new(o!(
        "task" => "rebuild_recipient",
        "volume" => volume.name.clone(),
        "donor" => donor.addr.to_string(),
    ));

    let result = run_recipient(&plane, &volume, &donor, &log).await;
    if let Err(e) = &result {
        error!(log, "rebuild from donor failed: {:#}", e);
    }
    finish_recipient(&plane, &volume, result.is_err(), &log);
    volume.drop_refcnt();
}

/// Terminal bookkeeping for one recipient, under the rebuild mutex.  The
/// last recipient to finish decides the volume's fate: FAILED if anything
/// went wrong, otherwise DONE and HEALTHY.
fn finish_recipient(
    plane: &Arc<DataPlane>,
    volume: &Arc<VolumeInfo>,
    failed: bool,
    log: &Logger,
) {
    let mut info = volume.rebuild_mtx.lock().unwrap();
    if failed {
        volume.set_rebuild_status(RebuildStatus::Errored);
        info.rebuild_failed_cnt += 1;
    }
    info.rebuild_done_cnt += 1;
    if info.rebuild_done_cnt == info.rebuild_cnt {
        if info.rebuild_failed_cnt != 0 {
            volume.set_rebuild_status(RebuildStatus::Failed);
            error!(log, "rebuild failed for volume {}", volume.name);
        } else {
            volume.set_rebuild_status(RebuildStatus::Done);
            volume.set_health(HealthStatus::Healthy);
            info!(log, "volume {} rebuilt, now healthy", volume.name);
            // Interval 0: no change, just wake the timer so it notices
            // the volume is healthy.
            plane.checkpoint.update_ionum_interval(volume, 0);
        }
    }
}

async fn run_recipient(
    plane: &Arc<DataPlane>,
    volume: &Arc<VolumeInfo>,
    donor: &RebuildSource,
    log: &Logger,
) -> Result<()> {
    let sock = TcpStream::connect(donor.addr).await?;
    // Close is a reset, not a drain; rebuild connections are short-lived
    // and must not linger in TIME_WAIT.
    sock.set_linger(Some(Duration::ZERO))?;
    let (read_half, write_half) = sock.into_split();
    let mut frames = FramedRead::new(read_half, FrameDecoder::new());
    let mut writer = FrameWriter::new(write_half);

    // Everything at or below this io number is already durable here; the
    // donor only needs to send what came after.
    let checkpointed =
        volume.checkpointed_ionum.load(std::sync::atomic::Ordering::SeqCst);

    let mut hdr = Header::new(Opcode::Handshake);
    hdr.len = donor.volume.len() as u64;
    writer.send(&hdr, donor.volume.as_bytes()).await?;

    let volume_size = volume.store.volume_size();
    let step = plane.rebuild_step_size;
    let mut offset = 0u64;

    loop {
        if volume.rebuild_status() == RebuildStatus::Errored {
            bail!("rebuild errored on another connection");
        }

        if offset >= volume_size {
            let done = Header::new(Opcode::RebuildComplete);
            if let Err(e) = writer.send_header(&done).await {
                warn!(
                    log,
                    "rebuild_complete write failed, counting as success \
                     with this donor: {}",
                    e
                );
            }
            info!(log, "rebuilding volume {} completed", volume.name);
            return Ok(());
        }

        let mut step_hdr = Header::new(Opcode::RebuildStep);
        step_hdr.checkpointed_io_seq = checkpointed;
        step_hdr.offset = offset;
        step_hdr.len = step.min(volume_size - offset);
        writer.send_header(&step_hdr).await?;

        // Apply this step's data frames until the donor says STEP_DONE.
        loop {
            if volume.rebuild_status() == RebuildStatus::Errored {
                bail!("rebuild errored on another connection");
            }

            let frame = frames
                .next()
                .await
                .transpose()?
                .ok_or_else(|| anyhow!("donor closed connection"))?;

            if frame.header.status != OpStatus::Ok {
                bail!("donor reported failure");
            }

            match frame.header.opcode {
                Opcode::RebuildStepDone => {
                    offset += step;
                    break;
                }
                Opcode::Read if frame.header.is_rebuild() => {
                    let mut whdr = frame.header;
                    whdr.opcode = Opcode::Write;
                    let cmd = Command::with_payload(
                        whdr,
                        volume.clone(),
                        NO_CONN,
                        frame.payload,
                    );
                    volume.take_refcnt();
                    // Rebuild writes run synchronously on this task and
                    // come back unacknowledged; we own the command.
                    let Some(cmd) = worker::run(log, cmd) else {
                        bail!("rebuild write did not return");
                    };
                    if cmd.header.status != OpStatus::Ok {
                        bail!("rebuild write failed");
                    }
                }
                op => bail!("unexpected opcode {:?} from donor", op),
            }
        }
    }
}

/// Serves one accepted rebuild connection on the donor side.
pub(crate) async fn rebuild_scanner(
    plane: Arc<DataPlane>,
    sock: TcpStream,
    peer: SocketAddr,
) {
    let log = plane
        .log
        .new(o!("task" => "rebuild_scanner", "peer" => peer.to_string()));
    if let Err(e) = serve_scanner(&plane, sock, &log).await {
        info!(log, "rebuild connection closing: {:#}", e);
    }
}

async fn serve_scanner(
    plane: &Arc<DataPlane>,
    sock: TcpStream,
    log: &Logger,
) -> Result<()> {
    sock.set_linger(Some(Duration::ZERO))?;
    let (read_half, write_half) = sock.into_split();
    let conn_id = plane.conns.register(write_half);
    let mut frames = FramedRead::new(read_half, FrameDecoder::new());
    let mut volume: Option<Arc<VolumeInfo>> = None;

    let result =
        scanner_loop(plane, &mut frames, conn_id, &mut volume, log).await;

    if let Some(volume) = &volume {
        info!(log, "closing rebuild connection for {}", volume.name);
        connection::remove_pending_cmds_to_ack(conn_id, volume).await;
        volume.drop_refcnt();
    }
    plane.conns.unregister(conn_id);
    result
}

async fn scanner_loop(
    plane: &Arc<DataPlane>,
    frames: &mut FrameStream,
    conn_id: u64,
    volume: &mut Option<Arc<VolumeInfo>>,
    log: &Logger,
) -> Result<()> {
    loop {
        let frame = match frames.next().await.transpose()? {
            Some(frame) => frame,
            None => return Ok(()),
        };
        if let Some(volume) = volume.as_ref() {
            if volume.state() == VolumeState::Offline {
                bail!("volume {} went offline", volume.name);
            }
        }

        match frame.header.opcode {
            Opcode::Handshake => {
                if let Some(bound) = volume.as_ref() {
                    error!(
                        log,
                        "second handshake on connection serving volume {}",
                        bound.name
                    );
                    bail!("second handshake on rebuild connection");
                }
                let name = std::str::from_utf8(&frame.payload)?
                    .trim_end_matches('\0')
                    .to_string();
                let found = plane
                    .registry
                    .lookup(&name)
                    .ok_or_else(|| anyhow!("volume {} not found", name))?;
                found.take_refcnt();
                info!(log, "rebuild scanner started on volume {}", name);
                *volume = Some(found);
            }
            Opcode::RebuildStep => {
                let volume = volume
                    .as_ref()
                    .ok_or_else(|| anyhow!("rebuild step before handshake"))?
                    .clone();
                serve_step(volume, conn_id, frame.header, log).await?;
            }
            Opcode::RebuildComplete => {
                let volume = volume.as_ref().ok_or_else(|| {
                    anyhow!("rebuild complete before handshake")
                })?;
                info!(
                    log,
                    "rebuild process is over on volume {}", volume.name
                );
                return Ok(());
            }
            op => bail!("unexpected opcode {:?} on rebuild connection", op),
        }
    }
}

/// Answers one REBUILD_STEP: every range the store reports as modified
/// since the recipient's checkpoint becomes a rebuild READ pushed through
/// the worker (and so through the volume's ack-sender, in enumeration
/// order), with STEP_DONE fabricated last on the same path.
async fn serve_step(
    volume: Arc<VolumeInfo>,
    conn_id: u64,
    step: Header,
    log: &Logger,
) -> Result<()> {
    info!(
        log,
        "rebuild step on {}: checkpointed io_seq {}, offset {}, len {}",
        volume.name,
        step.checkpointed_io_seq,
        step.offset,
        step.len
    );

    let log = log.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let store = volume.store.clone();
        store.get_io_diff(
            step.checkpointed_io_seq,
            step.offset,
            step.len,
            &mut |offset, len, io_num| {
                if volume.state() == VolumeState::Offline {
                    return Err(ReplicaError::Offline);
                }
                let mut hdr = Header::new(Opcode::Read);
                hdr.flags = FLAG_REBUILD;
                hdr.io_seq = io_num;
                hdr.offset = offset;
                hdr.len = len;
                let cmd = Command::new(hdr, volume.clone(), conn_id);
                volume.take_refcnt();
                worker::run(&log, cmd);
                Ok(())
            },
        )?;

        let done = Header::new(Opcode::RebuildStepDone);
        let cmd = Command::new(done, volume.clone(), conn_id);
        volume.take_refcnt();
        worker::run(&log, cmd);
        Ok(())
    })
    .await??;
    Ok(())
}
