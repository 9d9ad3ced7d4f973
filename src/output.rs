// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The callback surface the driver provides.
//!
//! Formatting a parsed message for humans is the driver's business; the
//! engine only reports the moments a driver cares about. Every method has a
//! no-op default so drivers implement only what they print.

use std::net::SocketAddr;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::rr::Name;

use crate::lookup::{Lookup, Query};

/// Driver-provided callbacks, invoked from the engine task as lookups make
/// progress.
pub trait OutputHandler: Send + 'static {
    /// A lookup is about to go on the wire for `name`.
    fn trying(&mut self, name: &Name, lookup: &Lookup) {
        let _ = (name, lookup);
    }

    /// A parsed response to present, with or without header commentary.
    /// During a zone transfer this fires once per inbound message.
    fn message(&mut self, query: &Query, message: &Message, include_headers: bool) {
        let _ = (query, message, include_headers);
    }

    /// Summary statistics for a finished exchange: the size of the final
    /// response, who sent it, and how long the dialog took.
    fn received(&mut self, bytes: usize, from: SocketAddr, elapsed: Duration, query: &Query) {
        let _ = (bytes, from, elapsed, query);
    }

    /// A diagnostic comment line, in the `;; ...` idiom of the tool family.
    fn comment(&mut self, text: &str) {
        let _ = text;
    }

    /// The queue has drained and the engine is handing control back.
    fn shutdown(&mut self) {}
}

/// An output handler that swallows everything; useful for tests and for
/// drivers that only care about the exit code.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullHandler;

impl OutputHandler for NullHandler {}

/// Renders a received buffer the way the diagnostic tools dump a packet
/// they could not parse: a byte count, then rows of sixteen hex octets.
pub(crate) fn hex_dump(bytes: &[u8]) -> Vec<String> {
    let mut lines = Vec::with_capacity(1 + bytes.len() / 16);
    lines.push(format!("{} bytes", bytes.len()));
    for chunk in bytes.chunks(16) {
        let mut line = String::with_capacity(chunk.len() * 3);
        for byte in chunk {
            line.push_str(&format!("{byte:02x} "));
        }
        lines.push(line.trim_end().to_string());
    }
    lines
}
