// Copyright 2024 Oxide Computer Company
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use slog::info;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::connection;
use crate::rebuild;
use crate::DataPlane;

/// A running acceptor: the addresses it actually bound (useful when the
/// caller asked for port 0) and the accept-loop task.
pub struct AcceptorHandle {
    pub io_addr: SocketAddr,
    pub rebuild_addr: SocketAddr,
    pub task: JoinHandle<Result<()>>,
}

/// Binds the I/O and rebuild listen sockets and starts the accept loop.
///
/// Each accepted socket gets its own detached task: a receiver for the
/// I/O port, a rebuild scanner for the rebuild port.  An error on either
/// listener is fatal to the loop; the daemon exits on it.
pub async fn start(
    plane: Arc<DataPlane>,
    io_addr: SocketAddr,
    rebuild_addr: SocketAddr,
) -> Result<AcceptorHandle> {
    let io_listener = TcpListener::bind(io_addr).await?;
    let rebuild_listener = TcpListener::bind(rebuild_addr).await?;
    let io_addr = io_listener.local_addr()?;
    let rebuild_addr = rebuild_listener.local_addr()?;
    info!(
        plane.log,
        "listening on {} for IO, {} for rebuild", io_addr, rebuild_addr
    );

    let task =
        tokio::spawn(accept_loop(plane, io_listener, rebuild_listener));
    Ok(AcceptorHandle {
        io_addr,
        rebuild_addr,
        task,
    })
}

async fn accept_loop(
    plane: Arc<DataPlane>,
    io_listener: TcpListener,
    rebuild_listener: TcpListener,
) -> Result<()> {
    loop {
        tokio::select! {
            accepted = io_listener.accept() => {
                let (sock, peer) = accepted?;
                info!(plane.log, "new data connection from {}", peer);
                tokio::spawn(connection::io_receiver(
                    plane.clone(),
                    sock,
                    peer,
                ));
            }
            accepted = rebuild_listener.accept() => {
                let (sock, peer) = accepted?;
                info!(plane.log, "new rebuild connection from {}", peer);
                tokio::spawn(rebuild::rebuild_scanner(
                    plane.clone(),
                    sock,
                    peer,
                ));
            }
        }
    }
}
