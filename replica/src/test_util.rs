// Copyright 2024 Oxide Computer Company

//! Shared helpers for the data-plane test suites: planes backed by the
//! in-memory store, and a minimal client speaking the wire protocol the
//! way a target would.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use slog::Logger;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use replicore_common::build_plain_logger;
use replicore_protocol::{
    BlockMeta, FrameWriter, Header, Opcode, BLOCK_META_LEN, HEADER_LEN,
};

use crate::store::MemBlockStore;
use crate::volume::VolumeInfo;
use crate::DataPlane;

pub(crate) fn csl() -> Logger {
    build_plain_logger()
}

pub(crate) fn test_plane() -> Arc<DataPlane> {
    test_plane_with_step(64 * 1024)
}

pub(crate) fn test_plane_with_step(step: u64) -> Arc<DataPlane> {
    DataPlane::new(csl(), step)
}

pub(crate) fn add_healthy_volume(
    plane: &DataPlane,
    name: &str,
    size: u64,
) -> Arc<VolumeInfo> {
    let store = Arc::new(MemBlockStore::new(size));
    let volume = plane.add_volume(name, store, 0).unwrap();
    volume.mark_healthy_rebuilt();
    volume
}

pub(crate) fn add_degraded_volume(
    plane: &DataPlane,
    name: &str,
    size: u64,
) -> Arc<VolumeInfo> {
    let store = Arc::new(MemBlockStore::new(size));
    plane.add_volume(name, store, 0).unwrap()
}

/// Connects to a data port and performs the handshake that binds the
/// connection to `volume`.
pub(crate) async fn connect_data(
    addr: SocketAddr,
    volume: &str,
) -> (OwnedReadHalf, FrameWriter<OwnedWriteHalf>) {
    let sock = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = sock.into_split();
    let mut writer = FrameWriter::new(write_half);
    let mut hdr = Header::new(Opcode::Handshake);
    hdr.len = volume.len() as u64;
    writer.send(&hdr, volume.as_bytes()).await.unwrap();
    (read_half, writer)
}

/// Reads one reply off a data connection the way a target does: header,
/// then `len` data bytes, then `meta_len` worth of metadata triples.
pub(crate) async fn read_reply(
    read_half: &mut OwnedReadHalf,
) -> (Header, BytesMut, Vec<BlockMeta>) {
    let mut hbuf = [0u8; HEADER_LEN];
    read_half.read_exact(&mut hbuf).await.unwrap();
    let header = Header::decode(&hbuf).unwrap();

    let mut data = BytesMut::zeroed(header.len as usize);
    read_half.read_exact(&mut data[..]).await.unwrap();

    let mut mbuf = BytesMut::zeroed(header.meta_len as usize);
    read_half.read_exact(&mut mbuf[..]).await.unwrap();
    let mut metadata = Vec::new();
    let mut rest = &mbuf[..];
    while rest.remaining() >= BLOCK_META_LEN {
        metadata.push(BlockMeta::decode(&mut rest));
    }

    (header, data, metadata)
}

/// Polls `cond` until it holds or the timeout passes.
pub(crate) async fn wait_for(
    what: &str,
    timeout: Duration,
    mut cond: impl FnMut() -> bool,
) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
