use std::net::{IpAddr, Ipv4Addr, TcpListener};

use anyhow::Context;

/// Ask the kernel for a port that is free on `listen_address` right now. The
/// socket is released before returning, so the port is a strong hint rather
/// than a reservation.
pub fn free_port(listen_address: &str) -> anyhow::Result<u16> {
    let addr: IpAddr = if listen_address.is_empty() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        listen_address
            .parse()
            .with_context(|| format!("invalid listen address {listen_address:?}"))?
    };
    let listener = TcpListener::bind((addr, 0))
        .with_context(|| format!("failed to find a free port on {addr}"))?;
    Ok(listener.local_addr()?.port())
}

/// `port` unless it is 0, in which case a free one.
pub fn port_or_free(port: u16, listen_address: &str) -> anyhow::Result<u16> {
    match port {
        0 => free_port(listen_address),
        p => Ok(p),
    }
}
