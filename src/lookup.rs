// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The lookup and query entities.
//!
//! A [`Lookup`] is one user-level question being resolved, with all of its
//! policy; a [`Query`] is one in-flight dialog with one server for that
//! lookup. The lookup owns its queries; queries refer back to the lookup
//! positionally, never by pointer, so there are no reference cycles.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use hickory_proto::op::MessageVerifier;
use hickory_proto::rr::{DNSClass, Name, RecordType};
use tokio::net::UdpSocket;

use crate::config::Server;

/// Where a relative query name takes its origin from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Origin {
    /// An index into the configured search list.
    Search(usize),
    /// The fixed domain override; it has no successor.
    Fixed,
}

/// One user-level question being resolved.
///
/// Created by the driver (or cloned internally as a follow-up), seeded into
/// the engine, and reclaimed once every query on it has been cleared.
pub struct Lookup {
    pub(crate) textname: String,
    pub(crate) rdtype: RecordType,
    pub(crate) rdclass: DNSClass,
    pub(crate) servers: Vec<Server>,
    pub(crate) queries: Vec<Query>,
    pub(crate) current_query: usize,
    pub(crate) xfr_q: Option<usize>,
    pub(crate) origin: Option<Origin>,

    // policy flags
    pub(crate) recurse: bool,
    pub(crate) aa_only: bool,
    pub(crate) ad: bool,
    pub(crate) cd: bool,
    pub(crate) dnssec: bool,
    pub(crate) tcp_mode: bool,
    pub(crate) ignore_tc: bool,
    pub(crate) trace: bool,
    pub(crate) trace_root: bool,
    pub(crate) ns_search_only: bool,
    pub(crate) servfail_stops: bool,
    pub(crate) best_effort: bool,
    pub(crate) nibble: bool,
    pub(crate) identify: bool,
    pub(crate) defname: bool,
    pub(crate) new_search: bool,
    pub(crate) doing_xfr: bool,

    // display flags, passed through to the output handler untouched
    pub(crate) comments: bool,
    pub(crate) stats: bool,
    pub(crate) section_question: bool,
    pub(crate) section_answer: bool,
    pub(crate) section_authority: bool,
    pub(crate) section_additional: bool,

    pub(crate) retries: u32,
    pub(crate) udpsize: u16,
    pub(crate) ixfr_serial: u32,
    pub(crate) nsfound: usize,

    // runtime state, materialized by the engine during setup
    pub(crate) pending: bool,
    pub(crate) qname: Option<Name>,
    pub(crate) rendered: Option<Arc<[u8]>>,
    pub(crate) verifier: Option<MessageVerifier>,
}

impl Lookup {
    /// Creates an empty lookup for the given query name, with the defaults
    /// of an interactive client: an IN/A recursive query, best-effort
    /// parsing, a fresh search, everything else off.
    pub fn new(textname: impl Into<String>) -> Self {
        Self {
            textname: textname.into(),
            rdtype: RecordType::A,
            rdclass: DNSClass::IN,
            servers: Vec::new(),
            queries: Vec::new(),
            current_query: 0,
            xfr_q: None,
            origin: None,
            recurse: true,
            aa_only: false,
            ad: false,
            cd: false,
            dnssec: false,
            tcp_mode: false,
            ignore_tc: false,
            trace: false,
            trace_root: false,
            ns_search_only: false,
            servfail_stops: false,
            best_effort: true,
            nibble: false,
            identify: false,
            defname: false,
            new_search: true,
            doing_xfr: false,
            comments: true,
            stats: true,
            section_question: true,
            section_answer: true,
            section_authority: true,
            section_additional: true,
            retries: 0,
            udpsize: 0,
            ixfr_serial: 0,
            nsfound: 0,
            pending: false,
            qname: None,
            rendered: None,
            verifier: None,
        }
    }

    /// The query name as typed, relative or absolute.
    pub fn textname(&self) -> &str {
        &self.textname
    }

    /// The query type.
    pub fn rdtype(&self) -> RecordType {
        self.rdtype
    }

    /// The query class.
    pub fn rdclass(&self) -> DNSClass {
        self.rdclass
    }

    /// The fully qualified name this lookup queried for, once set up.
    pub fn qname(&self) -> Option<&Name> {
        self.qname.as_ref()
    }

    /// The servers this lookup will iterate over.
    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    /// Remaining attempts before the lookup reports that no server could be
    /// reached.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Whether the lookup is between send and completion.
    pub fn pending(&self) -> bool {
        self.pending
    }

    /// Whether this lookup drives a zone transfer.
    pub fn doing_xfr(&self) -> bool {
        self.doing_xfr
    }

    /// Whether comment lines should accompany the printed message.
    pub fn comments(&self) -> bool {
        self.comments
    }

    /// Whether query statistics should accompany the printed message.
    pub fn stats(&self) -> bool {
        self.stats
    }

    /// Whether the answering server should be identified in the output.
    pub fn identify(&self) -> bool {
        self.identify
    }

    /// Which message sections the printer should show, in question, answer,
    /// authority, additional order.
    pub fn sections(&self) -> [bool; 4] {
        [
            self.section_question,
            self.section_answer,
            self.section_authority,
            self.section_additional,
        ]
    }

    /// Sets the query type. AXFR and IXFR imply TCP.
    pub fn set_rdtype(&mut self, rdtype: RecordType) -> &mut Self {
        self.rdtype = rdtype;
        self
    }

    /// Sets the query class.
    pub fn set_rdclass(&mut self, rdclass: DNSClass) -> &mut Self {
        self.rdclass = rdclass;
        self
    }

    /// Replaces the lookup's server list. An empty list means the engine
    /// clones its configured default.
    pub fn set_servers(&mut self, servers: Vec<Server>) -> &mut Self {
        self.servers = servers;
        self
    }

    /// Appends a server to the lookup's own list.
    pub fn add_server(&mut self, server: Server) -> &mut Self {
        self.servers.push(server);
        self
    }

    /// Request recursion (the RD bit). Ignored in trace and NS-search modes.
    pub fn set_recurse(&mut self, recurse: bool) -> &mut Self {
        self.recurse = recurse;
        self
    }

    /// Sets the AA bit on the query.
    pub fn set_aa_only(&mut self, aa_only: bool) -> &mut Self {
        self.aa_only = aa_only;
        self
    }

    /// Sets the AD bit on the query.
    pub fn set_ad(&mut self, ad: bool) -> &mut Self {
        self.ad = ad;
        self
    }

    /// Sets the CD bit on the query.
    pub fn set_cd(&mut self, cd: bool) -> &mut Self {
        self.cd = cd;
        self
    }

    /// Requests DNSSEC records (EDNS0 with the DO bit).
    pub fn set_dnssec(&mut self, dnssec: bool) -> &mut Self {
        self.dnssec = dnssec;
        self
    }

    /// Uses TCP from the start instead of escalating from UDP.
    pub fn set_tcp_mode(&mut self, tcp_mode: bool) -> &mut Self {
        self.tcp_mode = tcp_mode;
        self
    }

    /// Ignores the TC bit instead of retrying over TCP.
    pub fn set_ignore_tc(&mut self, ignore_tc: bool) -> &mut Self {
        self.ignore_tc = ignore_tc;
        self
    }

    /// Traces the delegation chain from the root.
    pub fn set_trace(&mut self, trace: bool) -> &mut Self {
        self.trace = trace;
        if trace {
            self.trace_root = true;
            self.recurse = false;
        }
        self
    }

    /// Queries every name server found, reporting once a terminal answer
    /// appears.
    pub fn set_ns_search_only(&mut self, ns_search_only: bool) -> &mut Self {
        self.ns_search_only = ns_search_only;
        self
    }

    /// Stop at a SERVFAIL instead of rotating to the next server.
    pub fn set_servfail_stops(&mut self, servfail_stops: bool) -> &mut Self {
        self.servfail_stops = servfail_stops;
        self
    }

    /// Tolerate recoverable parse errors in responses.
    pub fn set_best_effort(&mut self, best_effort: bool) -> &mut Self {
        self.best_effort = best_effort;
        self
    }

    /// Use nibble form when building IPv6 reverse names.
    pub fn set_nibble(&mut self, nibble: bool) -> &mut Self {
        self.nibble = nibble;
        self
    }

    /// Identify the answering server in the output.
    pub fn set_identify(&mut self, identify: bool) -> &mut Self {
        self.identify = identify;
        self
    }

    /// Treat the name as absolute regardless of its dot count.
    pub fn set_defname(&mut self, defname: bool) -> &mut Self {
        self.defname = defname;
        self
    }

    /// Marks this lookup as the start of a new user question, resetting the
    /// follow-up recursion counter and enabling search-list selection.
    pub fn set_new_search(&mut self, new_search: bool) -> &mut Self {
        self.new_search = new_search;
        self
    }

    /// Overrides the number of attempts for this lookup.
    pub fn set_retries(&mut self, retries: u32) -> &mut Self {
        self.retries = retries;
        self
    }

    /// EDNS0 sender buffer size; zero disables EDNS unless DNSSEC is on.
    pub fn set_udpsize(&mut self, udpsize: u16) -> &mut Self {
        self.udpsize = udpsize;
        self
    }

    /// SOA serial to send in the authority section of an IXFR query.
    pub fn set_ixfr_serial(&mut self, serial: u32) -> &mut Self {
        self.ixfr_serial = serial;
        self
    }

    /// Sets the display flags passed through to the output handler:
    /// comments, statistics, and the four sections.
    pub fn set_display(&mut self, comments: bool, stats: bool, sections: [bool; 4]) -> &mut Self {
        self.comments = comments;
        self.stats = stats;
        self.section_question = sections[0];
        self.section_answer = sections[1];
        self.section_authority = sections[2];
        self.section_additional = sections[3];
        self
    }

    /// Clones the policy of this lookup into a fresh one, optionally
    /// carrying the server list along. Queries, the rendered message, and
    /// the TSIG chain are never cloned; the engine regenerates them during
    /// setup. `new_search` is deliberately not carried either: a clone is a
    /// continuation, not a new user question.
    pub(crate) fn clone_policy(&self, servers: bool) -> Self {
        let mut looknew = Self::new(self.textname.clone());
        looknew.new_search = false;
        looknew.rdtype = self.rdtype;
        looknew.rdclass = self.rdclass;
        looknew.origin = self.origin;
        looknew.doing_xfr = self.doing_xfr;
        looknew.ixfr_serial = self.ixfr_serial;
        looknew.defname = self.defname;
        looknew.trace = self.trace;
        looknew.trace_root = self.trace_root;
        looknew.identify = self.identify;
        looknew.ignore_tc = self.ignore_tc;
        looknew.servfail_stops = self.servfail_stops;
        looknew.best_effort = self.best_effort;
        looknew.dnssec = self.dnssec;
        looknew.udpsize = self.udpsize;
        looknew.recurse = self.recurse;
        looknew.aa_only = self.aa_only;
        looknew.ad = self.ad;
        looknew.cd = self.cd;
        looknew.ns_search_only = self.ns_search_only;
        looknew.tcp_mode = self.tcp_mode;
        looknew.nibble = self.nibble;
        looknew.comments = self.comments;
        looknew.stats = self.stats;
        looknew.section_question = self.section_question;
        looknew.section_answer = self.section_answer;
        looknew.section_authority = self.section_authority;
        looknew.section_additional = self.section_additional;
        looknew.retries = self.retries;
        if servers {
            looknew.servers = self.servers.clone();
        }
        looknew
    }

    /// Index of the next query after `idx` that has not been cleared yet.
    pub(crate) fn next_live_query(&self, idx: usize) -> Option<usize> {
        (idx + 1..self.queries.len()).find(|i| !self.queries[*i].cleared)
    }

    /// Index of the first query that has not been cleared yet.
    pub(crate) fn first_live_query(&self) -> Option<usize> {
        (0..self.queries.len()).find(|i| !self.queries[*i].cleared)
    }

    /// True once every query has been cleared and the lookup can be
    /// reclaimed.
    pub(crate) fn all_queries_cleared(&self) -> bool {
        self.queries.iter().all(|q| q.cleared)
    }
}

impl fmt::Debug for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lookup")
            .field("textname", &self.textname)
            .field("rdtype", &self.rdtype)
            .field("rdclass", &self.rdclass)
            .field("servers", &self.servers)
            .field("origin", &self.origin)
            .field("tcp_mode", &self.tcp_mode)
            .field("trace", &self.trace)
            .field("trace_root", &self.trace_root)
            .field("ns_search_only", &self.ns_search_only)
            .field("doing_xfr", &self.doing_xfr)
            .field("retries", &self.retries)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

/// Transfer-progress bookkeeping, evaluated per resource record of every
/// inbound message of a zone transfer.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct XfrState {
    pub(crate) first_soa_rcvd: bool,
    pub(crate) first_rr_serial: u32,
    pub(crate) second_rr_rcvd: bool,
    pub(crate) second_rr_serial: u32,
    pub(crate) first_repeat_rcvd: bool,
    pub(crate) rr_count: u64,
}

/// One outstanding dialog with one server for one lookup.
pub struct Query {
    pub(crate) server_name: String,
    pub(crate) sockaddr: Option<SocketAddr>,
    pub(crate) udp_sock: Option<Arc<UdpSocket>>,
    pub(crate) recv_made: bool,
    pub(crate) recv_pending: bool,
    pub(crate) waiting_connect: bool,
    pub(crate) tcp_open: bool,
    pub(crate) started: bool,
    pub(crate) cleared: bool,
    pub(crate) xfr: XfrState,
    pub(crate) time_sent: Option<Instant>,
}

impl Query {
    pub(crate) fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            sockaddr: None,
            udp_sock: None,
            recv_made: false,
            recv_pending: false,
            waiting_connect: false,
            tcp_open: false,
            started: false,
            cleared: false,
            xfr: XfrState::default(),
            time_sent: None,
        }
    }

    /// The server this query talks to, as configured.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The resolved destination address, once known.
    pub fn sockaddr(&self) -> Option<SocketAddr> {
        self.sockaddr
    }

    /// When the query was last sent, for RTT reporting.
    pub fn time_sent(&self) -> Option<Instant> {
        self.time_sent
    }

    /// Cumulative count of resource records seen on this query's stream.
    pub fn rr_count(&self) -> u64 {
        self.xfr.rr_count
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("server_name", &self.server_name)
            .field("sockaddr", &self.sockaddr)
            .field("started", &self.started)
            .field("cleared", &self.cleared)
            .field("rr_count", &self.xfr.rr_count)
            .finish_non_exhaustive()
    }
}

/// Counts the dots in a textual name, for the ndots rule.
pub(crate) fn count_dots(name: &str) -> usize {
    name.bytes().filter(|b| *b == b'.').count()
}

/// Builds the reverse-lookup name for an address literal: dotted quads map
/// under `in-addr.arpa.`, IPv6 addresses map nibble by nibble under
/// `ip6.arpa.` (or the legacy `ip6.int.` when `nibble` is off). Partial
/// dotted quads are reversed as far as they go, the way interactive clients
/// accept `dig -x 192.0.2`.
pub fn get_reverse(value: &str, nibble: bool) -> Option<String> {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        let mut octets = Vec::new();
        for part in value.split('.') {
            if part.is_empty() {
                return None;
            }
            let octet: u8 = part.parse().ok()?;
            octets.push(octet);
        }
        if octets.is_empty() || octets.len() > 4 {
            return None;
        }
        let mut reverse = String::new();
        for octet in octets.iter().rev() {
            reverse.push_str(&octet.to_string());
            reverse.push('.');
        }
        reverse.push_str("in-addr.arpa.");
        return Some(reverse);
    }

    let addr: Ipv6Addr = value.parse().ok()?;
    let suffix = if nibble { "ip6.arpa." } else { "ip6.int." };
    let mut reverse = String::new();
    for byte in addr.octets().iter().rev() {
        reverse.push(char::from_digit(u32::from(byte & 0x0F), 16)?);
        reverse.push('.');
        reverse.push(char::from_digit(u32::from(byte >> 4), 16)?);
        reverse.push('.');
    }
    reverse.push_str(suffix);
    Some(reverse)
}

/// Builds a PTR lookup for an address literal, honoring the lookup
/// defaults.
pub fn reverse_lookup(value: &str, nibble: bool) -> Option<Lookup> {
    let name = get_reverse(value, nibble)?;
    let mut lookup = Lookup::new(name);
    lookup.set_rdtype(RecordType::PTR).set_nibble(nibble);
    Some(lookup)
}
