// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The lookup scheduler and its drive loops.
//!
//! One [`Engine`] owns everything the original kept in globals: the lookup
//! queue, the socket/send/receive counters, the exit-code ratchet, and the
//! cancellation state. Lookups run strictly one at a time; within a lookup
//! the engine iterates servers with a short rotation timer, retries the
//! first server when the list is exhausted, and feeds responses through a
//! fixed sequence of gates (cancellation, parse, truncation, SERVFAIL,
//! TSIG) before deciding whether the response answers the question, spawns
//! a follow-up, or continues a transfer stream.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use hickory_proto::op::{Edns, Header, Message, MessageType, OpCode, Query as WireQuery, ResponseCode};
use hickory_proto::rr::rdata::SOA;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder};
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::addr;
use crate::config::{EngineConfig, DEFAULT_EDNS_PAYLOAD, LOOKUP_LIMIT, SERVER_TIMEOUT, TCP_TIMEOUT, UDP_TIMEOUT};
use crate::error::{Error, ErrorKind, ExitCode, Result};
use crate::followup::{self, ChaseSection};
use crate::lookup::{Lookup, Origin, Query};
use crate::output::{hex_dump, OutputHandler};
use crate::tcp::{TcpConn, TcpReadError};
use crate::udp;
use crate::xfr::{self, XfrEnd, XfrPoll};

/// What became of one response after it went through the gates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Disposition {
    /// Stale or canceled; the response was dropped.
    Discarded,
    /// A SERVFAIL was skipped; the driver should start the next server.
    TryNextServer,
    /// A transfer stream wants the next message on the same socket.
    XfrContinue,
    /// The lookup reached a terminal state: answered, failed, or replaced
    /// by a follow-up.
    Completed,
}

/// Outcome of the timer policy for a TCP lookup.
#[derive(Clone, Copy, Debug)]
enum TcpTimeout {
    /// Rotate to this server next.
    NextServer(usize),
    /// The lookup ended; it was requeued or declared unreachable.
    LookupEnded,
}

/// Failure of one fan-out TCP dialog.
#[derive(Debug)]
enum DialogError {
    Connect(io::Error),
    Read(TcpReadError),
    TimedOut,
}

type UdpRecvEvent = (usize, io::Result<usize>, Vec<u8>);
type UdpReceives = FuturesUnordered<BoxFuture<'static, UdpRecvEvent>>;
type TcpDialogEvent = (usize, std::result::Result<(Vec<u8>, SocketAddr), DialogError>);
type TcpDialogs = FuturesUnordered<BoxFuture<'static, TcpDialogEvent>>;

/// Cancellation state shared with [`EngineHandle`]s.
#[derive(Debug, Default)]
struct Shared {
    cancel_now: AtomicBool,
    notify: Notify,
    is_blocking: AtomicBool,
}

/// A cloneable handle for canceling a running engine from the outside,
/// typically a signal handler.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    /// Cancels the current lookup and drains the queue. If the engine is
    /// blocked in the system resolver there is no way to shut down cleanly
    /// without waiting behind it, so the process aborts instead.
    pub fn cancel_all(&self) {
        debug!("cancel_all()");
        if self.shared.is_blocking.load(Ordering::SeqCst) {
            eprintln!("dnsdig: shutdown while resolving a server name; aborting");
            std::process::abort();
        }
        self.shared.cancel_now.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }

    /// Whether cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.shared.cancel_now.load(Ordering::SeqCst)
    }
}

/// The serial lookup dispatcher.
///
/// Seed it with lookups, then [`run`](Self::run) it to completion on the
/// event loop. Responses may enqueue follow-up lookups; the engine drains
/// everything before handing control back with the final exit code.
pub struct Engine<H: OutputHandler> {
    config: EngineConfig,
    handler: H,
    queue: VecDeque<Lookup>,
    lookup_counter: u32,
    sockcount: i64,
    sendcount: i64,
    recvcount: i64,
    exit_code: ExitCode,
    validated: bool,
    shared: Arc<Shared>,
}

impl<H: OutputHandler> Engine<H> {
    /// Creates an engine over a configuration and a driver-provided output
    /// handler. The configuration is normalized here.
    pub fn new(mut config: EngineConfig, handler: H) -> Self {
        config.normalize();
        Self {
            config,
            handler,
            queue: VecDeque::new(),
            lookup_counter: 0,
            sockcount: 0,
            sendcount: 0,
            recvcount: 0,
            exit_code: ExitCode::Success,
            validated: true,
            shared: Arc::new(Shared::default()),
        }
    }

    /// A handle for canceling the engine from another task.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Appends a user lookup to the queue. Follow-ups generated by
    /// responses are prepended instead, so delegation chases run
    /// depth-first ahead of whatever the user queued next.
    pub fn seed(&mut self, lookup: Lookup) {
        self.queue.push_back(lookup);
    }

    /// The exit code accumulated so far.
    pub fn exit_code(&self) -> ExitCode {
        self.exit_code
    }

    /// False once any TSIG-signed response failed verification.
    pub fn validated(&self) -> bool {
        self.validated
    }

    /// Runs every queued lookup (and the follow-ups they spawn) to
    /// completion, then invokes the handler's shutdown callback and returns
    /// the final exit code together with the handler.
    ///
    /// Recoverable conditions are handled internally; an `Err` here is
    /// fatal and maps to an exit code of its own via
    /// [`Error::exit_code`].
    pub async fn run(mut self) -> Result<(ExitCode, H)> {
        debug!("start_lookup()");
        loop {
            if self.shared.cancel_now.load(Ordering::SeqCst) {
                self.queue.clear();
                break;
            }
            let Some(mut lookup) = self.queue.pop_front() else {
                break;
            };
            self.setup_lookup(&mut lookup)?;
            let followups = self.drive_lookup(lookup).await?;
            for followup in followups {
                self.queue.push_front(followup);
            }
        }

        debug_assert_eq!(self.sockcount, 0, "sockets leaked");
        debug_assert_eq!(self.sendcount, 0, "sends leaked");
        debug_assert_eq!(self.recvcount, 0, "receives leaked");
        debug!("shutting down");
        self.handler.shutdown();
        Ok((self.exit_code, self.handler))
    }

    fn comment(&mut self, text: impl AsRef<str>) {
        self.handler.comment(text.as_ref());
    }

    fn ratchet(&mut self, code: ExitCode) {
        if code > self.exit_code {
            self.exit_code = code;
        }
    }

    /// Loop protection: every lookup the scheduler accepts counts against
    /// the limit until a fresh user question resets it.
    fn register_lookup(&mut self, lookup: &Lookup) -> Result<()> {
        if lookup.new_search {
            debug!("resetting lookup counter");
            self.lookup_counter = 0;
        }
        self.lookup_counter += 1;
        if self.lookup_counter > LOOKUP_LIMIT {
            return Err(ErrorKind::TooManyLookups.into());
        }
        Ok(())
    }

    /// Materializes the outbound message and one query per server, making
    /// the lookup ready to fire.
    fn setup_lookup(&mut self, l: &mut Lookup) -> Result<()> {
        debug!("setup_lookup({})", l.textname);
        self.register_lookup(l)?;

        if l.servers.is_empty() {
            debug!("cloning server list");
            l.servers = self.config.servers.clone();
        }
        if l.retries == 0 {
            l.retries = self.config.tries.max(1);
        }

        // If the name has enough dots, force an absolute lookup. Otherwise
        // keep whatever origin is already there; a fresh search picks the
        // fixed override or the head of the search list.
        if crate::lookup::count_dots(&l.textname) >= self.config.ndots() as usize || l.defname {
            l.origin = None;
        } else if l.origin.is_none()
            && l.new_search
            && (self.config.usesearch || self.config.have_domain())
        {
            l.origin = if self.config.fixed_domain.is_some() {
                debug!("using fixed domain");
                Some(Origin::Fixed)
            } else if !self.config.search.is_empty() {
                Some(Origin::Search(0))
            } else {
                None
            };
        }

        let origin_name = match l.origin {
            Some(Origin::Fixed) => {
                let text = self.config.fixed_domain.clone().unwrap_or_default();
                parse_origin(&text)?
            }
            Some(Origin::Search(index)) => match self.config.search.get(index) {
                Some(entry) => {
                    debug!("trying origin {}", entry.origin());
                    parse_origin(entry.origin())?
                }
                None => Name::root(),
            },
            None => {
                debug!("using root origin");
                Name::root()
            }
        };

        let qname = if l.trace_root {
            Name::root()
        } else {
            let name = Name::from_ascii(&l.textname)
                .map_err(|e| Error::bad_name(&l.textname, e))?;
            if name.is_fqdn() {
                name
            } else {
                name.append_domain(&origin_name)
                    .map_err(|e| Error::bad_name(&l.textname, e))?
            }
        };
        self.handler.trying(&qname, l);

        // A trace starts by asking the root for its SOA; the follow-ups
        // down the delegation chain re-ask the user's own type.
        let effective_rdtype = if l.trace_root {
            RecordType::SOA
        } else {
            l.rdtype
        };
        if l.rdtype == RecordType::AXFR || l.rdtype == RecordType::IXFR {
            l.doing_xfr = true;
            l.tcp_mode = true;
        }

        let mut msg = Message::new();
        msg.set_id(rand::random::<u16>());
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);

        // Recursion is meaningless while walking delegations ourselves.
        if l.recurse && !l.trace && !l.ns_search_only {
            debug!("recursive query");
            msg.set_recursion_desired(true);
        }
        if l.aa_only {
            msg.set_authoritative(true);
        }
        if l.ad {
            msg.set_authentic_data(true);
        }
        if l.cd {
            msg.set_checking_disabled(true);
        }

        let mut question = WireQuery::query(qname.clone(), effective_rdtype);
        question.set_query_class(l.rdclass);
        msg.add_query(question);

        // An IXFR carries the client's serial in a minimal authority SOA.
        if l.rdtype == RecordType::IXFR {
            let soa = SOA::new(qname.clone(), qname.clone(), l.ixfr_serial, 1, 1, 1, 1);
            let mut record = Record::from_rdata(qname.clone(), 1, RData::SOA(soa));
            record.set_dns_class(l.rdclass);
            msg.add_name_server(record);
        }

        if l.udpsize > 0 || l.dnssec {
            if l.udpsize == 0 {
                l.udpsize = DEFAULT_EDNS_PAYLOAD;
            }
            debug!("setting udp size of {}", l.udpsize);
            let mut edns = Edns::new();
            edns.set_max_payload(l.udpsize);
            edns.set_version(0);
            edns.set_dnssec_ok(l.dnssec);
            msg.set_edns(edns);
        }

        l.verifier = None;
        if let Some(signer) = &self.config.tsig {
            debug!("initializing keys");
            let now = tsig_epoch()?;
            l.verifier = msg.finalize(signer, now)?;
        }

        debug!("starting to render the message");
        let rendered = msg.to_vec()?;
        l.qname = Some(qname);
        l.rendered = Some(Arc::from(rendered.into_boxed_slice()));

        l.queries = l.servers.iter().map(|s| Query::new(s.name())).collect();
        l.current_query = 0;
        l.xfr_q = None;
        l.pending = false;

        if self.config.print_query {
            if let Some(first) = l.queries.first() {
                self.handler.message(first, &msg, true);
            }
        }
        Ok(())
    }

    /// Fires the transport for a set-up lookup and drives it until every
    /// query has been cleared, returning the follow-ups its responses
    /// spawned.
    async fn drive_lookup(&mut self, mut l: Lookup) -> Result<Vec<Lookup>> {
        debug!("do_lookup()");
        l.pending = true;
        if l.queries.is_empty() {
            return Ok(Vec::new());
        }
        if l.tcp_mode {
            self.drive_tcp(l).await
        } else {
            self.drive_udp(l).await
        }
    }

    /// The one-shot timer value for the lookup's current query: short while
    /// servers remain to rotate to, the transport default (or the user
    /// override) otherwise, and four times that once a transfer stream is
    /// underway so transient stalls don't abort it.
    fn timer_interval(&self, l: &Lookup) -> Duration {
        let has_successor = l.next_live_query(l.current_query).is_some();
        let base = if has_successor {
            SERVER_TIMEOUT
        } else {
            match self.config.timeout {
                Some(timeout) if !timeout.is_zero() => timeout,
                _ => {
                    if l.tcp_mode {
                        TCP_TIMEOUT
                    } else {
                        UDP_TIMEOUT
                    }
                }
            }
        };
        if l.doing_xfr && l.xfr_q.is_some() {
            base.saturating_mul(4)
        } else {
            base
        }
    }

    /// Releases a query's transport and drops it from the live set. Safe to
    /// call twice; the second call is a no-op.
    fn clear_query(&mut self, l: &mut Lookup, idx: usize) {
        let q = &mut l.queries[idx];
        if q.cleared {
            return;
        }
        debug!("clear_query({})", q.server_name);
        q.cleared = true;
        q.waiting_connect = false;
        if q.recv_pending {
            q.recv_pending = false;
            self.recvcount -= 1;
            debug!("recvcount={}", self.recvcount);
        }
        if q.udp_sock.take().is_some() {
            self.sockcount -= 1;
            debug!("sockcount={}", self.sockcount);
        }
        if q.tcp_open {
            q.tcp_open = false;
            self.sockcount -= 1;
            debug!("sockcount={}", self.sockcount);
        }
        debug_assert!(self.recvcount >= 0 && self.sockcount >= 0);
    }

    /// Cancels every query on the lookup and zeroes its retry budget.
    /// Canceled lookups never deliver results upward.
    fn cancel_lookup(&mut self, l: &mut Lookup) {
        debug!("cancel_lookup()");
        for idx in 0..l.queries.len() {
            self.clear_query(l, idx);
        }
        l.pending = false;
        l.retries = 0;
    }

    fn received_event(&mut self, l: &Lookup, idx: usize, bytes: usize, from: SocketAddr) {
        let q = &l.queries[idx];
        let elapsed = q.time_sent.map(|t| t.elapsed()).unwrap_or_default();
        self.handler.received(bytes, from, elapsed, q);
    }

    fn bad_packet(&mut self, l: &mut Lookup, idx: usize, bytes: &[u8], error: &str) -> Disposition {
        self.comment(format!(";; Got bad packet: {error}"));
        for line in hex_dump(bytes) {
            self.comment(line);
        }
        self.clear_query(l, idx);
        self.cancel_lookup(l);
        Disposition::Completed
    }

    /// Drives one response through the gates, in order: cancellation,
    /// parse, truncation, SERVFAIL, TSIG; then the mode dispatch (transfer
    /// consumer, trace/search follow-up, or plain print-and-clear).
    fn process_response(
        &mut self,
        l: &mut Lookup,
        idx: usize,
        bytes: &[u8],
        from: SocketAddr,
        followups: &mut Vec<Lookup>,
    ) -> Result<Disposition> {
        // 1. Cancellation gate
        if (!l.pending && !l.ns_search_only) || self.shared.cancel_now.load(Ordering::SeqCst) {
            debug!("no longer pending, discarding response from {from}");
            self.clear_query(l, idx);
            return Ok(Disposition::Discarded);
        }

        // 2. Parse gate
        let msg = match Message::from_vec(bytes) {
            Ok(msg) => msg,
            Err(error) => {
                if l.best_effort {
                    match header_only(bytes) {
                        Some(msg) => {
                            self.comment(
                                ";; Warning: Message parser reports malformed message packet.",
                            );
                            msg
                        }
                        None => return Ok(self.bad_packet(l, idx, bytes, &error.to_string())),
                    }
                } else {
                    return Ok(self.bad_packet(l, idx, bytes, &error.to_string()));
                }
            }
        };

        // 3. Truncation gate
        if msg.truncated() && !l.ignore_tc && !l.tcp_mode {
            self.comment(";; Truncated, retrying in TCP mode.");
            let mut retry = l.clone_policy(true);
            retry.tcp_mode = true;
            followups.push(retry);
            self.clear_query(l, idx);
            self.cancel_lookup(l);
            return Ok(Disposition::Completed);
        }

        // 4. SERVFAIL gate: rotate unless told to stop, but surface the
        // response when this was the only server left to hear from.
        if msg.response_code() == ResponseCode::ServFail && !l.servfail_stops {
            let sole =
                l.first_live_query() == Some(idx) && l.next_live_query(idx).is_none();
            if !sole {
                self.comment(format!(
                    ";; Got SERVFAIL reply from {}, trying next server",
                    l.queries[idx].server_name
                ));
                self.clear_query(l, idx);
                return Ok(Disposition::TryNextServer);
            }
        }

        // 5. TSIG gate: a failed verify marks the session invalid but the
        // response is still presented. The verifier chains its own state
        // across the messages of a TCP stream.
        if let Some(verifier) = l.verifier.as_mut() {
            if let Err(error) = verifier(bytes) {
                self.comment(format!(";; Couldn't verify signature: {error}"));
                self.validated = false;
            }
        }

        // The first responder becomes the stream we follow; siblings only
        // matter in the NS-search fan-out.
        if l.xfr_q.is_none() {
            l.xfr_q = Some(idx);
        }
        let primary = l.xfr_q == Some(idx);

        let rcode_ok = msg.response_code() == ResponseCode::NoError;
        let mut printed_received = false;

        if primary {
            if l.trace || l.ns_search_only {
                self.handler.message(&l.queries[idx], &msg, true);
                if !rcode_ok && l.origin.is_some() {
                    match followup::next_origin(&self.config, l) {
                        Some(child) => {
                            self.cancel_lookup(l);
                            followups.push(child);
                        }
                        None => {
                            self.received_event(l, idx, bytes.len(), from);
                            printed_received = true;
                        }
                    }
                } else if msg.answers().is_empty() || l.trace_root {
                    if let Some(child) = followup::ns_chase(l, &msg, ChaseSection::Authority) {
                        self.cancel_lookup(l);
                        followups.push(child);
                    }
                } else if followup::has_ns(msg.answers()) {
                    // NS records in the answer terminate the chase; the
                    // follow-up queries them directly, trace cleared.
                    if let Some(child) = followup::ns_chase(l, &msg, ChaseSection::Answer) {
                        self.cancel_lookup(l);
                        followups.push(child);
                    }
                }
            } else if !rcode_ok && l.origin.is_some() {
                match followup::next_origin(&self.config, l) {
                    Some(child) => {
                        self.cancel_lookup(l);
                        followups.push(child);
                    }
                    None => {
                        self.handler.message(&l.queries[idx], &msg, true);
                        self.received_event(l, idx, bytes.len(), from);
                        printed_received = true;
                    }
                }
            } else {
                self.handler.message(&l.queries[idx], &msg, true);
            }
        } else if l.ns_search_only && !l.trace_root && !msg.answers().is_empty() {
            // fan-out sibling with a real answer
            self.handler.message(&l.queries[idx], &msg, true);
        }

        if l.doing_xfr {
            if !primary {
                // responses on sibling queries are discarded for the
                // lifetime of the transfer
                self.clear_query(l, idx);
                return Ok(Disposition::Discarded);
            }
            let poll = xfr::consume_message(
                &mut l.queries[idx].xfr,
                l.rdtype,
                l.ixfr_serial,
                self.config.rr_limit,
                &msg,
            );
            match poll {
                XfrPoll::NeedMore => return Ok(Disposition::XfrContinue),
                XfrPoll::Done(end) => {
                    match end {
                        XfrEnd::EmptyMessage => self.comment("; Transfer failed."),
                        XfrEnd::NotStartedWithSoa => {
                            self.comment("; Transfer failed.  Didn't start with SOA answer.");
                        }
                        XfrEnd::RecordLimit => self.ratchet(ExitCode::TooManyRecords),
                        XfrEnd::Complete | XfrEnd::NothingToTransfer | XfrEnd::EmptyZone => {}
                    }
                    if !matches!(end, XfrEnd::EmptyMessage | XfrEnd::NotStartedWithSoa) {
                        self.received_event(l, idx, bytes.len(), from);
                    }
                    self.clear_query(l, idx);
                    self.cancel_lookup(l);
                    return Ok(Disposition::Completed);
                }
            }
        }

        if !printed_received && (rcode_ok || l.origin.is_none()) {
            self.received_event(l, idx, bytes.len(), from);
        }
        l.pending = false;
        if !l.ns_search_only || l.trace_root {
            self.cancel_lookup(l);
        }
        self.clear_query(l, idx);
        Ok(Disposition::Completed)
    }

    /// Starts (or re-sends) the UDP query at `idx`: resolve the server
    /// once, skip it on an address-family mismatch, create the socket and
    /// post the receive on first use, then send the rendered message. In
    /// NS-search mode every remaining server is brought up immediately.
    async fn start_udp_query(
        &mut self,
        l: &mut Lookup,
        mut idx: usize,
        receives: &mut UdpReceives,
    ) -> Result<()> {
        let rendered = l
            .rendered
            .clone()
            .ok_or_else(|| Error::from("lookup was not set up"))?;

        loop {
            if idx >= l.queries.len() {
                if !l.queries.iter().any(|q| q.started) {
                    self.comment(";; No acceptable nameservers");
                    self.cancel_lookup(l);
                }
                return Ok(());
            }
            if l.queries[idx].cleared {
                idx += 1;
                continue;
            }

            if l.queries[idx].sockaddr.is_none() {
                let server = l.queries[idx].server_name.clone();
                let dst = addr::resolve_server(
                    &server,
                    self.config.port,
                    &self.shared.is_blocking,
                )
                .await?;
                l.queries[idx].sockaddr = Some(dst);
            }
            let Some(dst) = l.queries[idx].sockaddr else {
                idx += 1;
                continue;
            };

            if !udp::compatible_family(&dst, self.config.source.as_ref()) {
                self.comment(format!(
                    ";; Skipping server {}, incompatible address family",
                    l.queries[idx].server_name
                ));
                self.clear_query(l, idx);
                idx += 1;
                continue;
            }

            if !l.queries[idx].recv_made {
                let socket = udp::udp_socket(dst, self.config.source).await?;
                self.sockcount += 1;
                debug!("sockcount={}", self.sockcount);
                let socket = Arc::new(socket);
                l.queries[idx].udp_sock = Some(Arc::clone(&socket));
                l.queries[idx].recv_made = true;

                let cap = self.config.buffer_size;
                receives.push(Box::pin(async move {
                    let mut buf = vec![0u8; cap];
                    let result = socket.recv(&mut buf).await;
                    (idx, result, buf)
                }));
                l.queries[idx].recv_pending = true;
                self.recvcount += 1;
                debug!("recvcount={}", self.recvcount);
            }

            debug!("sending a request to {}", dst);
            let sock = l.queries[idx]
                .udp_sock
                .clone()
                .ok_or_else(|| Error::from("query has no socket"))?;
            self.sendcount += 1;
            let sent = sock.send(&rendered).await;
            self.sendcount -= 1;
            debug!("sendcount={}", self.sendcount);
            if let Err(error) = sent {
                warn!("send to {dst} failed: {error}");
            }
            l.queries[idx].time_sent = Some(Instant::now());
            l.queries[idx].started = true;
            l.current_query = idx;

            if l.ns_search_only {
                // a nameserver search brings up all the queries at once
                match l.next_live_query(idx) {
                    Some(next) if !l.queries[next].started => {
                        debug!("sending next, since searching");
                        idx = next;
                        continue;
                    }
                    _ => return Ok(()),
                }
            }
            return Ok(());
        }
    }

    /// Timer policy for UDP: rotate to the successor without consuming a
    /// retry; with no successor left, spend a retry re-sending to the first
    /// server; with no retries left, give up on the lookup.
    async fn on_udp_timeout(&mut self, l: &mut Lookup, receives: &mut UdpReceives) -> Result<()> {
        debug!("connect_timeout()");
        if let Some(next) = l.next_live_query(l.current_query) {
            debug!("trying next server...");
            self.start_udp_query(l, next, receives).await?;
            return Ok(());
        }
        if l.retries > 1 {
            l.retries -= 1;
            debug!("resending UDP request to first server");
            if let Some(first) = l.first_live_query() {
                self.start_udp_query(l, first, receives).await?;
            }
            return Ok(());
        }
        self.comment(";; connection timed out; no servers could be reached");
        if l.pending {
            self.ratchet(ExitCode::NoServers);
        }
        self.cancel_lookup(l);
        Ok(())
    }

    async fn drive_udp(&mut self, mut l: Lookup) -> Result<Vec<Lookup>> {
        let shared = Arc::clone(&self.shared);
        let mut receives: UdpReceives = FuturesUnordered::new();
        let mut followups = Vec::new();

        self.start_udp_query(&mut l, 0, &mut receives).await?;

        loop {
            if shared.cancel_now.load(Ordering::SeqCst) {
                self.cancel_lookup(&mut l);
            }
            if l.all_queries_cleared() {
                break;
            }
            let interval = self.timer_interval(&l);

            tokio::select! {
                _ = shared.notify.notified() => {
                    self.cancel_lookup(&mut l);
                }
                event = receives.next(), if !receives.is_empty() => {
                    let Some((idx, result, mut buf)) = event else { continue };
                    if l.queries[idx].cleared {
                        // canceled while in flight; accounting was settled
                        // when the query was cleared
                        continue;
                    }
                    self.recvcount -= 1;
                    debug!("recvcount={}", self.recvcount);
                    l.queries[idx].recv_pending = false;
                    match result {
                        Ok(len) => {
                            buf.truncate(len);
                            let Some(from) = l.queries[idx].sockaddr else { continue };
                            let disposition =
                                self.process_response(&mut l, idx, &buf, from, &mut followups)?;
                            if disposition == Disposition::TryNextServer {
                                if let Some(next) = l.next_live_query(idx) {
                                    self.start_udp_query(&mut l, next, &mut receives).await?;
                                }
                            }
                        }
                        Err(error) => {
                            self.comment(format!(";; communications error: {error}"));
                            self.clear_query(&mut l, idx);
                        }
                    }
                }
                _ = sleep(interval) => {
                    self.on_udp_timeout(&mut l, &mut receives).await?;
                }
            }
        }
        Ok(followups)
    }

    /// Timer policy for TCP: rotate to the successor; with none left, spend
    /// a retry by re-queuing the whole lookup (a TCP dialog cannot be
    /// restarted in place); with no retries left, give up.
    fn on_tcp_timeout(
        &mut self,
        l: &mut Lookup,
        idx: usize,
        followups: &mut Vec<Lookup>,
    ) -> Result<TcpTimeout> {
        debug!("connect_timeout()");
        if let Some(next) = l.next_live_query(idx) {
            debug!("trying next server...");
            return Ok(TcpTimeout::NextServer(next));
        }
        if l.retries > 1 {
            l.retries -= 1;
            debug!("making new TCP request, {} tries left", l.retries);
            let requeued = l.clone_policy(true);
            self.cancel_lookup(l);
            followups.push(requeued);
            return Ok(TcpTimeout::LookupEnded);
        }
        self.comment(";; connection timed out; no servers could be reached");
        if l.pending {
            self.ratchet(ExitCode::NoServers);
        }
        self.cancel_lookup(l);
        Ok(TcpTimeout::LookupEnded)
    }

    fn close_tcp(&mut self, l: &mut Lookup, idx: usize) {
        let q = &mut l.queries[idx];
        if q.tcp_open {
            q.tcp_open = false;
            self.sockcount -= 1;
            debug!("sockcount={}", self.sockcount);
        }
    }

    async fn drive_tcp(&mut self, mut l: Lookup) -> Result<Vec<Lookup>> {
        if l.ns_search_only && !l.doing_xfr {
            return self.drive_tcp_fanout(l).await;
        }

        let shared = Arc::clone(&self.shared);
        let mut followups = Vec::new();
        let mut idx = 0usize;

        'servers: loop {
            if shared.cancel_now.load(Ordering::SeqCst) {
                self.cancel_lookup(&mut l);
            }
            if l.all_queries_cleared() || idx >= l.queries.len() {
                break;
            }
            if l.queries[idx].cleared {
                idx += 1;
                continue;
            }

            if l.queries[idx].sockaddr.is_none() {
                let server = l.queries[idx].server_name.clone();
                let dst = addr::resolve_server(
                    &server,
                    self.config.port,
                    &self.shared.is_blocking,
                )
                .await?;
                l.queries[idx].sockaddr = Some(dst);
            }
            let Some(dst) = l.queries[idx].sockaddr else {
                idx += 1;
                continue;
            };

            if !udp::compatible_family(&dst, self.config.source.as_ref()) {
                self.comment(format!(
                    ";; Skipping server {}, incompatible address family",
                    l.queries[idx].server_name
                ));
                self.clear_query(&mut l, idx);
                if l.next_live_query(idx).is_none() {
                    self.comment(";; No acceptable nameservers");
                    self.cancel_lookup(&mut l);
                    break;
                }
                idx += 1;
                continue;
            }

            debug!("send_tcp_connect({})", l.queries[idx].server_name);
            l.current_query = idx;
            l.queries[idx].waiting_connect = true;
            l.queries[idx].started = true;
            let interval = self.timer_interval(&l);

            let connected = tokio::select! {
                _ = shared.notify.notified() => {
                    self.cancel_lookup(&mut l);
                    break 'servers;
                }
                _ = sleep(interval) => {
                    l.queries[idx].waiting_connect = false;
                    match self.on_tcp_timeout(&mut l, idx, &mut followups)? {
                        TcpTimeout::NextServer(next) => { idx = next; continue 'servers; }
                        TcpTimeout::LookupEnded => break 'servers,
                    }
                }
                connected = TcpConn::connect(dst, self.config.source) => connected,
            };
            l.queries[idx].waiting_connect = false;

            let mut conn = match connected {
                Ok(conn) => conn,
                Err(error) => {
                    self.comment(format!(
                        ";; Connection to {}({}) for {} failed: {}.",
                        dst, l.queries[idx].server_name, l.textname, error
                    ));
                    self.ratchet(ExitCode::NoServers);
                    self.clear_query(&mut l, idx);
                    match l.next_live_query(idx) {
                        Some(next) => {
                            idx = next;
                            continue 'servers;
                        }
                        None => break 'servers,
                    }
                }
            };
            self.sockcount += 1;
            debug!("sockcount={}", self.sockcount);
            l.queries[idx].tcp_open = true;

            let rendered = l
                .rendered
                .clone()
                .ok_or_else(|| Error::from("lookup was not set up"))?;
            self.sendcount += 1;
            let sent = conn.send_message(&rendered).await;
            self.sendcount -= 1;
            debug!("sendcount={}", self.sendcount);
            l.queries[idx].time_sent = Some(Instant::now());
            if let Err(error) = sent {
                self.comment(format!(";; communications error to {dst}: {error}"));
                self.close_tcp(&mut l, idx);
                self.clear_query(&mut l, idx);
                match l.next_live_query(idx) {
                    Some(next) => {
                        idx = next;
                        continue 'servers;
                    }
                    None => break 'servers,
                }
            }

            // read length-framed messages until the lookup is terminal;
            // a transfer keeps the length/body cycle going
            'messages: loop {
                let interval = self.timer_interval(&l);
                self.recvcount += 1;
                debug!("recvcount={}", self.recvcount);
                l.queries[idx].recv_pending = true;

                let read = tokio::select! {
                    _ = shared.notify.notified() => {
                        l.queries[idx].recv_pending = false;
                        self.recvcount -= 1;
                        self.close_tcp(&mut l, idx);
                        self.cancel_lookup(&mut l);
                        break 'servers;
                    }
                    _ = sleep(interval) => {
                        l.queries[idx].recv_pending = false;
                        self.recvcount -= 1;
                        self.close_tcp(&mut l, idx);
                        match self.on_tcp_timeout(&mut l, idx, &mut followups)? {
                            TcpTimeout::NextServer(next) => { idx = next; continue 'servers; }
                            TcpTimeout::LookupEnded => break 'servers,
                        }
                    }
                    read = conn.read_message(self.config.buffer_size) => read,
                };
                l.queries[idx].recv_pending = false;
                self.recvcount -= 1;
                debug!("recvcount={}", self.recvcount);

                let bytes = match read {
                    Ok(bytes) => bytes,
                    Err(TcpReadError::TooLong { length, limit }) => {
                        self.close_tcp(&mut l, idx);
                        self.cancel_lookup(&mut l);
                        return Err(ErrorKind::LengthPrefix { length, limit }.into());
                    }
                    Err(TcpReadError::Io(error)) => {
                        self.comment(format!(";; communications error to {dst}: {error}"));
                        self.close_tcp(&mut l, idx);
                        self.clear_query(&mut l, idx);
                        match l.next_live_query(idx) {
                            Some(next) => {
                                idx = next;
                                continue 'servers;
                            }
                            None => break 'servers,
                        }
                    }
                };

                match self.process_response(&mut l, idx, &bytes, dst, &mut followups)? {
                    Disposition::XfrContinue => continue 'messages,
                    Disposition::TryNextServer => {
                        self.close_tcp(&mut l, idx);
                        match l.next_live_query(idx) {
                            Some(next) => {
                                idx = next;
                                continue 'servers;
                            }
                            None => break 'servers,
                        }
                    }
                    Disposition::Discarded | Disposition::Completed => {
                        self.close_tcp(&mut l, idx);
                        if l.all_queries_cleared() {
                            break 'servers;
                        }
                        match l.next_live_query(idx) {
                            Some(next) => {
                                idx = next;
                                continue 'servers;
                            }
                            None => break 'servers,
                        }
                    }
                }
            }
        }

        // settle any queries abandoned by rotation
        self.cancel_lookup(&mut l);
        Ok(followups)
    }

    /// The NS-search fan-out over TCP: every server's dialog (connect, send,
    /// one response) runs concurrently, each under its own timeout.
    async fn drive_tcp_fanout(&mut self, mut l: Lookup) -> Result<Vec<Lookup>> {
        let shared = Arc::clone(&self.shared);
        let mut followups = Vec::new();
        let mut dialogs: TcpDialogs = FuturesUnordered::new();

        let dialog_timeout = match self.config.timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => TCP_TIMEOUT,
        };

        for idx in 0..l.queries.len() {
            if l.queries[idx].sockaddr.is_none() {
                let server = l.queries[idx].server_name.clone();
                let dst = addr::resolve_server(
                    &server,
                    self.config.port,
                    &self.shared.is_blocking,
                )
                .await?;
                l.queries[idx].sockaddr = Some(dst);
            }
            let Some(dst) = l.queries[idx].sockaddr else { continue };
            if !udp::compatible_family(&dst, self.config.source.as_ref()) {
                self.comment(format!(
                    ";; Skipping server {}, incompatible address family",
                    l.queries[idx].server_name
                ));
                self.clear_query(&mut l, idx);
                continue;
            }

            let rendered = l
                .rendered
                .clone()
                .ok_or_else(|| Error::from("lookup was not set up"))?;
            let source = self.config.source;
            let limit = self.config.buffer_size;

            self.sockcount += 1;
            debug!("sockcount={}", self.sockcount);
            l.queries[idx].tcp_open = true;
            l.queries[idx].started = true;
            l.queries[idx].time_sent = Some(Instant::now());

            dialogs.push(Box::pin(async move {
                let dialog = async move {
                    let mut conn = TcpConn::connect(dst, source)
                        .await
                        .map_err(DialogError::Connect)?;
                    conn.send_message(&rendered)
                        .await
                        .map_err(DialogError::Connect)?;
                    let bytes = conn.read_message(limit).await.map_err(DialogError::Read)?;
                    Ok((bytes, dst))
                };
                match tokio::time::timeout(dialog_timeout, dialog).await {
                    Ok(result) => (idx, result),
                    Err(_) => (idx, Err(DialogError::TimedOut)),
                }
            }));
        }

        if !l.queries.iter().any(|q| q.started) {
            self.comment(";; No acceptable nameservers");
            self.cancel_lookup(&mut l);
            return Ok(followups);
        }

        loop {
            if l.all_queries_cleared() {
                break;
            }
            let event = tokio::select! {
                _ = shared.notify.notified() => None,
                event = dialogs.next() => event,
            };
            let Some((idx, result)) = event else {
                self.cancel_lookup(&mut l);
                break;
            };
            if l.queries[idx].cleared {
                continue;
            }
            self.close_tcp(&mut l, idx);

            match result {
                Ok((bytes, from)) => {
                    self.process_response(&mut l, idx, &bytes, from, &mut followups)?;
                    self.clear_query(&mut l, idx);
                }
                Err(DialogError::Read(TcpReadError::TooLong { length, limit })) => {
                    self.cancel_lookup(&mut l);
                    return Err(ErrorKind::LengthPrefix { length, limit }.into());
                }
                Err(DialogError::Connect(error)) | Err(DialogError::Read(TcpReadError::Io(error))) => {
                    self.comment(format!(
                        ";; Connection to {}({}) for {} failed: {}.",
                        l.queries[idx].sockaddr.map(|a| a.to_string()).unwrap_or_default(),
                        l.queries[idx].server_name,
                        l.textname,
                        error
                    ));
                    self.ratchet(ExitCode::NoServers);
                    self.clear_query(&mut l, idx);
                }
                Err(DialogError::TimedOut) => {
                    self.comment(format!(
                        ";; connection to {} timed out",
                        l.queries[idx].server_name
                    ));
                    self.clear_query(&mut l, idx);
                }
            }
        }

        self.cancel_lookup(&mut l);
        Ok(followups)
    }
}

/// Parses an origin label into an absolute name.
fn parse_origin(text: &str) -> Result<Name> {
    let name = Name::from_ascii(text).map_err(|e| Error::bad_name(text, e))?;
    if name.is_fqdn() {
        Ok(name)
    } else {
        name.append_domain(&Name::root())
            .map_err(|e| Error::bad_name(text, e))
    }
}

/// Decodes just the header of a response that failed a full parse, for
/// best-effort presentation.
fn header_only(bytes: &[u8]) -> Option<Message> {
    let mut decoder = BinDecoder::new(bytes);
    let header = Header::read(&mut decoder).ok()?;
    let mut msg = Message::new();
    msg.set_header(header);
    Some(msg)
}

/// The current time as TSIG wants it.
fn tsig_epoch() -> Result<u32> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::from("current time is before the unix epoch"))?;
    Ok(now.as_secs() as u32)
}
