// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! UDP transport: one socket per query, bound to the configured source (or
//! the unspecified address of the destination's family) and connected to
//! the destination so the kernel filters off-path senders for us.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::debug;

/// Whether a destination can be reached from the configured source address.
/// With no source configured every family is acceptable.
pub(crate) fn compatible_family(dst: &SocketAddr, source: Option<&IpAddr>) -> bool {
    match source {
        Some(src) => src.is_ipv4() == dst.is_ipv4(),
        None => true,
    }
}

/// The unspecified bind address matching the destination's family.
pub(crate) fn any_of_family(dst: &SocketAddr) -> SocketAddr {
    if dst.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    }
}

/// Creates a UDP socket for one query: bind, then connect to the server.
pub(crate) async fn udp_socket(dst: SocketAddr, source: Option<IpAddr>) -> io::Result<UdpSocket> {
    let bind = match source {
        Some(ip) => SocketAddr::new(ip, 0),
        None => any_of_family(&dst),
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(dst).await?;
    debug!("UDP socket bound to {} for {}", socket.local_addr()?, dst);
    Ok(socket)
}
