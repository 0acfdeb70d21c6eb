//! UDP socket creation with SO_REUSEPORT for multi-worker binding.

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket as Socket2, Type};
use std::net::{SocketAddr, UdpSocket};

use crate::config::NetIoConfig;

/// Create and configure a non-blocking UDP socket.
///
/// SO_REUSEPORT lets every worker bind the same address and gives
/// kernel-level load distribution of incoming datagrams with no user-space
/// synchronization; kernel buffer sizes are raised for bursty UDP.
pub fn create_udp_socket(bind_addr: SocketAddr, config: &NetIoConfig) -> Result<UdpSocket> {
    let domain = match bind_addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket =
        Socket2::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("creating UDP socket")?;

    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;

    if config.reuse_port {
        configure_reuse_port(&socket).context("setting SO_REUSEPORT")?;
    }

    if let Some(size) = config.socket_recv_buffer_size {
        socket
            .set_recv_buffer_size(size)
            .with_context(|| format!("setting SO_RCVBUF to {}", size))?;
    }
    if let Some(size) = config.socket_send_buffer_size {
        socket
            .set_send_buffer_size(size)
            .with_context(|| format!("setting SO_SNDBUF to {}", size))?;
    }

    if let SocketAddr::V6(addr) = bind_addr {
        socket
            .set_only_v6(!addr.ip().is_unspecified())
            .context("setting IPV6_V6ONLY")?;
    }

    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("binding UDP socket to {}", bind_addr))?;

    socket
        .set_nonblocking(true)
        .context("setting non-blocking mode")?;

    Ok(socket.into())
}

/// Configure SO_REUSEPORT on platforms that support it; gracefully ignored
/// elsewhere.
#[cfg(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "linux",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
))]
fn configure_reuse_port(socket: &Socket2) -> std::io::Result<()> {
    use std::mem::size_of_val;
    use std::os::fd::AsRawFd;

    let value: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &value as *const _ as *const libc::c_void,
            size_of_val(&value) as libc::socklen_t,
        )
    };

    if ret == -1 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOPROTOOPT) | Some(libc::EINVAL) => {
                tracing::warn!("SO_REUSEPORT not supported on this platform");
                Ok(())
            }
            _ => Err(err),
        }
    } else {
        Ok(())
    }
}

#[cfg(not(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "linux",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
)))]
fn configure_reuse_port(_socket: &Socket2) -> std::io::Result<()> {
    tracing::warn!("SO_REUSEPORT not available on this platform");
    Ok(())
}
