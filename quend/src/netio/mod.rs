//! Network I/O layer: per-worker UDP sockets and endpoint tasks.
//!
//! Each worker owns a SO_REUSEPORT socket bound to the same address and a
//! private [`quend_transport::Endpoint`]; the kernel distributes datagrams
//! across the sockets, so workers share nothing and packets for one
//! connection keep landing on the same endpoint.

pub mod socket;
pub mod worker;


use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::info;

use crate::config::ServerConfig;

/// Handle over the set of running workers.
pub struct NetIoHandle {
    workers: Vec<tokio::task::JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl NetIoHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("network layer stopped");
    }
}

/// Bind the worker sockets and spawn one endpoint task per worker.
pub fn spawn(bind_addr: SocketAddr, config: &ServerConfig) -> Result<NetIoHandle> {
    let worker_count = config.netio.effective_workers();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let udp = socket::create_udp_socket(bind_addr, &config.netio)
            .with_context(|| format!("binding worker {} socket", id))?;
        let socket = tokio::net::UdpSocket::from_std(udp)
            .with_context(|| format!("registering worker {} socket", id))?;

        let worker = worker::Worker::new(id, socket, config, shutdown_rx.clone());
        workers.push(tokio::spawn(worker.run()));
    }

    Ok(NetIoHandle {
        workers,
        shutdown: shutdown_tx,
    })
}
