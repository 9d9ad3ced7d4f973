// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![warn(missing_docs, clippy::dbg_macro, clippy::print_stdout)]

//! The asynchronous query engine behind interactive DNS diagnostic clients
//! of the `dig`/`host`/`nslookup` family.
//!
//! Given a queue of user-specified lookups, the engine resolves each one by
//! composing DNS queries on the wire, dispatching them to the configured
//! name servers over UDP or TCP, collecting and parsing responses, and
//! driving follow-up lookups (search-list expansion, delegation traces,
//! zone transfers, truncation retries) until the queue is drained.
//!
//! The engine is deliberately *not* a resolver: it operates at the request
//! level, one lookup at a time, because diagnostic tools want fine control
//! over exactly what goes on the wire and exactly what came back. Wire
//! encoding and decoding of messages is delegated to [`hickory_proto`],
//! re-exported here as [`proto`].
//!
//! ```no_run
//! use dnsdig::{Engine, EngineConfig, Lookup, NullHandler, Server};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), dnsdig::Error> {
//! let mut config = EngineConfig::default();
//! config.servers.push(Server::new("192.0.2.1"));
//!
//! let mut engine = Engine::new(config, NullHandler);
//! engine.seed(Lookup::new("www.example.com"));
//! let (exit_code, _handler) = engine.run().await?;
//! std::process::exit(exit_code.code());
//! # }
//! ```

pub use hickory_proto as proto;

mod addr;
pub mod config;
mod engine;
mod error;
mod followup;
pub mod lookup;
mod output;
mod tcp;
mod udp;
mod xfr;

pub use config::{EngineConfig, SearchEntry, Server};
pub use engine::{Engine, EngineHandle};
pub use error::{Error, ErrorKind, ExitCode, Result};
pub use lookup::{get_reverse, reverse_lookup, Lookup, Query};
pub use output::{NullHandler, OutputHandler};
