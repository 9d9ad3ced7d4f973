// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Engine configuration.
//!
//! The engine consumes the *outputs* of `resolv.conf` and command-line
//! parsing; the parsing itself is the driver's business. [`EngineConfig`]
//! is the plain-data hand-off between the two, with
//! [`EngineConfig::normalize`] applying the documented defaulting rules.

use std::net::IpAddr;
use std::time::Duration;

use hickory_proto::rr::dnssec::tsig::TSigner;

/// Default timeout for a UDP attempt when no override is configured.
pub const UDP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a TCP dialog when no override is configured.
pub const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Short timeout used while the current query still has a successor, so the
/// engine can rotate through the server list quickly.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(1);

/// Ceiling for receive buffers and for the TCP length prefix. A TCP message
/// announcing a length above this is a fatal error.
pub const COMM_SIZE: usize = 0xFFFF;

/// Maximum depth of the follow-up chain before the engine declares a loop.
pub const LOOKUP_LIMIT: u32 = 10;

/// Cap on the number of servers collected from NS records while probing the
/// roots in trace mode.
pub const MXSERV: usize = 20;

/// EDNS0 payload size advertised when EDNS is requested without an explicit
/// buffer size.
pub const DEFAULT_EDNS_PAYLOAD: u16 = 2048;

/// The DNS port.
pub const DEFAULT_PORT: u16 = 53;

/// Default number of attempts per lookup.
pub const DEFAULT_TRIES: u32 = 2;

/// A name server to query, identified the way the user spelled it: either a
/// presentation-form address or a hostname to be resolved through the OS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Server {
    name: String,
}

impl Server {
    /// Creates a server handle from its textual identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The textual identifier as configured.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One origin of the search list, appended to relative query names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchEntry {
    origin: String,
}

impl SearchEntry {
    /// Creates a search entry from an origin label.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
        }
    }

    /// The origin label.
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

/// Process-wide configuration of the engine.
///
/// Built from `resolv.conf` output plus command-line overrides, then
/// [`normalize`](Self::normalize)d before the engine starts.
#[derive(Clone, Default)]
pub struct EngineConfig {
    /// Default server list, cloned into every lookup that has none of its own.
    pub servers: Vec<Server>,
    /// Search list origins, in order.
    pub search: Vec<SearchEntry>,
    /// A `domain` directive, if one was configured. Wins over `search` and is
    /// prepended to it during normalization.
    pub domain: Option<String>,
    /// A fixed domain override from the command line; when set it replaces
    /// the first search-list pick and has no successor.
    pub fixed_domain: Option<String>,
    /// `options ndots:N`; `None` defaults to 1.
    pub ndots: Option<u32>,
    /// Whether search-list expansion is enabled.
    pub usesearch: bool,
    /// Destination port, default 53.
    pub port: u16,
    /// User timeout override; `None` or zero means the per-transport default.
    pub timeout: Option<Duration>,
    /// Attempts per lookup before giving up on the first server.
    pub tries: u32,
    /// Abort a zone transfer after this many resource records.
    pub rr_limit: u64,
    /// Source address to bind sockets to; servers of the other address
    /// family are skipped.
    pub source: Option<IpAddr>,
    /// Receive buffer ceiling, also the largest acceptable TCP length prefix.
    pub buffer_size: usize,
    /// TSIG key to sign queries with and to verify responses against.
    pub tsig: Option<TSigner>,
    /// Echo the rendered query through the output handler before sending.
    pub print_query: bool,
}

impl EngineConfig {
    /// Creates a configuration with all defaults applied.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.normalize();
        config
    }

    /// Applies the documented defaulting rules:
    ///
    /// * `ndots` unset defaults to 1;
    /// * an empty server list defaults to `127.0.0.1`;
    /// * a `domain` directive wins over `search` and is prepended to it;
    /// * zero `tries` means one attempt, zero timeout means the default.
    pub fn normalize(&mut self) {
        if self.ndots.is_none() {
            self.ndots = Some(1);
        }
        if self.servers.is_empty() {
            self.servers.push(Server::new("127.0.0.1"));
        }
        if let Some(domain) = self.domain.as_deref() {
            if self.search.first().map(SearchEntry::origin) != Some(domain) {
                self.search.insert(0, SearchEntry::new(domain));
            }
        }
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        if self.tries == 0 {
            self.tries = DEFAULT_TRIES;
        }
        if self.rr_limit == 0 {
            self.rr_limit = u64::MAX;
        }
        if self.buffer_size == 0 {
            self.buffer_size = COMM_SIZE;
        }
        if self.timeout == Some(Duration::ZERO) {
            self.timeout = None;
        }
    }

    /// Whether a `domain` directive was present.
    pub fn have_domain(&self) -> bool {
        self.domain.is_some()
    }

    /// The effective ndots value.
    pub fn ndots(&self) -> u32 {
        self.ndots.unwrap_or(1)
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("servers", &self.servers)
            .field("search", &self.search)
            .field("domain", &self.domain)
            .field("fixed_domain", &self.fixed_domain)
            .field("ndots", &self.ndots)
            .field("usesearch", &self.usesearch)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("tries", &self.tries)
            .field("rr_limit", &self.rr_limit)
            .field("source", &self.source)
            .field("buffer_size", &self.buffer_size)
            .field("tsig", &self.tsig.as_ref().map(|_| "TSigner { .. }"))
            .field("print_query", &self.print_query)
            .finish()
    }
}
