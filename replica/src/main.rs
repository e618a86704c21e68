// Copyright 2024 Oxide Computer Company
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use slog::{info, o};

use replicore_common::{
    build_logger, DEFAULT_IO_PORT, DEFAULT_REBUILD_PORT,
    DEFAULT_REBUILD_STEP_SIZE,
};
use replicore_replica::store::MemBlockStore;
use replicore_replica::{acceptor, DataPlane};

#[derive(Debug, Parser)]
#[clap(name = "replicore-replica")]
#[clap(about = "replica data-plane daemon", long_about = None)]
struct Opt {
    #[clap(short, long, default_value = "0.0.0.0")]
    address: IpAddr,

    /// Port serving client I/O.
    #[clap(long, default_value_t = DEFAULT_IO_PORT)]
    io_port: u16,

    /// Port serving rebuild traffic to recipient replicas.
    #[clap(long, default_value_t = DEFAULT_REBUILD_PORT)]
    rebuild_port: u16,

    /// Bytes per rebuild step when this replica is a recipient.
    #[clap(long, default_value_t = DEFAULT_REBUILD_STEP_SIZE)]
    rebuild_step_size: u64,

    /// Volume to serve from memory, as name:size-in-bytes.  Repeatable.
    #[clap(long = "volume", value_parser = parse_volume)]
    volumes: Vec<(String, u64)>,

    /// Seconds between io-number checkpoints for served volumes.
    #[clap(long, default_value_t = 30)]
    checkpoint_interval: u64,
}

fn parse_volume(s: &str) -> Result<(String, u64), String> {
    let (name, size) = s
        .split_once(':')
        .ok_or_else(|| format!("expected name:size, got {:?}", s))?;
    if name.is_empty() {
        return Err("volume name is empty".to_string());
    }
    let size: u64 = size
        .parse()
        .map_err(|e| format!("bad volume size {:?}: {}", size, e))?;
    Ok((name.to_string(), size))
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
    let log = build_logger();

    let plane = DataPlane::new(log.clone(), opt.rebuild_step_size);
    for (name, size) in &opt.volumes {
        let store = Arc::new(MemBlockStore::new(*size));
        let volume =
            plane.add_volume(name, store, opt.checkpoint_interval)?;
        volume.mark_healthy_rebuilt();
        info!(log, "serving volume {} ({} bytes)", name, size);
    }

    plane.checkpoint.clone().start(
        plane.registry.clone(),
        log.new(o!("task" => "checkpoint_timer")),
    );

    let handle = acceptor::start(
        plane.clone(),
        SocketAddr::new(opt.address, opt.io_port),
        SocketAddr::new(opt.address, opt.rebuild_port),
    )
    .await?;

    // The acceptor runs until a listen socket fails; that is fatal.
    handle
        .task
        .await
        .map_err(|e| anyhow!("acceptor task died: {}", e))?
}
