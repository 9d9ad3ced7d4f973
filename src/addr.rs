// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Server-name to address resolution.
//!
//! Server names come from configuration and may themselves be hostnames;
//! those are resolved through the operating system, not through DNS, since
//! the host may use a non-DNS source for them. The OS call is synchronous,
//! so it runs on the blocking pool with a flag raised for the duration; a
//! shutdown that fires mid-call aborts the process rather than deadlock
//! waiting for it.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::error::{Error, Result};

/// Turns a server name into an address. Presentation-form addresses are
/// parsed directly; anything else goes through the system resolver on the
/// blocking pool, with `is_blocking` raised around the call.
pub(crate) async fn resolve_server(
    host: &str,
    port: u16,
    is_blocking: &AtomicBool,
) -> Result<SocketAddr> {
    // server names lifted out of NS records arrive fully qualified
    let host = host.strip_suffix('.').unwrap_or(host);
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    debug!("resolving server name {host} via the system resolver");
    let owned = host.to_string();
    is_blocking.store(true, Ordering::SeqCst);
    let resolved = tokio::task::spawn_blocking(move || {
        (owned.as_str(), port)
            .to_socket_addrs()
            .map(|mut addrs| addrs.next())
    })
    .await;
    is_blocking.store(false, Ordering::SeqCst);

    match resolved {
        Ok(Ok(Some(addr))) => Ok(addr),
        Ok(Ok(None)) => Err(Error::server_not_found(host, "no addresses returned")),
        Ok(Err(e)) => Err(Error::server_not_found(host, e.to_string())),
        Err(join) => Err(Error::server_not_found(host, join.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_literal_address_skips_the_resolver() {
        let blocking = AtomicBool::new(false);
        let addr = resolve_server("192.0.2.7", 53, &blocking).await.unwrap();
        assert_eq!(addr, "192.0.2.7:53".parse().unwrap());
        assert!(!blocking.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn an_ipv6_literal_address_skips_the_resolver() {
        let blocking = AtomicBool::new(false);
        let addr = resolve_server("2001:db8::53", 53, &blocking).await.unwrap();
        assert_eq!(addr.port(), 53);
        assert!(addr.is_ipv6());
    }

    #[tokio::test]
    async fn an_unresolvable_name_is_an_error() {
        let blocking = AtomicBool::new(false);
        let err = resolve_server("no-such-host.invalid.", 53, &blocking)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no-such-host.invalid"));
        assert!(!blocking.load(Ordering::SeqCst));
    }
}
