// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The follow-up generator.
//!
//! A response can spawn a new lookup three ways: the search list advances
//! after a non-zero rcode, the trace/NS-search modes chase NS records out
//! of a reply, and a truncated UDP answer escalates to TCP (that last one
//! lives with the response gates). The functions here only build the
//! follow-up lookup; queueing it, counting it against the loop limit, and
//! canceling the originating lookup are the engine's business.

use hickory_proto::op::Message;
use hickory_proto::rr::{RData, Record};
use tracing::debug;

use crate::config::{EngineConfig, Server, MXSERV};
use crate::lookup::{Lookup, Origin};

/// Which section of the reply the NS chase walks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChaseSection {
    /// The ANSWER section; NS records here mean the chain is complete.
    Answer,
    /// The AUTHORITY section; NS records here are a referral to follow.
    Authority,
}

fn ns_target(record: &Record) -> Option<String> {
    match record.data() {
        Some(RData::NS(ns)) => Some(ns.0.to_utf8()),
        _ => None,
    }
}

/// True if the section holds at least one NS record.
pub(crate) fn has_ns(records: &[Record]) -> bool {
    records.iter().any(|r| ns_target(r).is_some())
}

/// Builds a follow-up lookup from the NS records of a reply, used in trace
/// and name-server-search modes. Walks the requested section; when the
/// ANSWER section yields nothing the chase falls through to AUTHORITY.
///
/// The follow-up re-asks the same question against the servers named by
/// the NS records. It is no longer the root probe, so `trace_root` clears;
/// an ANSWER-section hit means the delegation chain is complete, so
/// `trace` and `ns_search_only` clear as well.
pub(crate) fn ns_chase(
    lookup: &mut Lookup,
    msg: &Message,
    section: ChaseSection,
) -> Option<Lookup> {
    let records = match section {
        ChaseSection::Answer => msg.answers(),
        ChaseSection::Authority => msg.name_servers(),
    };

    debug!("following up {}", lookup.textname);

    let mut child: Option<Lookup> = None;
    for record in records {
        let Some(target) = ns_target(record) else {
            continue;
        };
        if lookup.trace_root && lookup.nsfound >= MXSERV {
            continue;
        }
        lookup.nsfound += 1;
        debug!("found NS {target}");

        let child = child.get_or_insert_with(|| {
            let mut looknew = lookup.clone_policy(false);
            looknew.doing_xfr = false;
            looknew.defname = false;
            if section == ChaseSection::Answer {
                looknew.trace = false;
                looknew.ns_search_only = false;
            }
            looknew.trace_root = false;
            looknew
        });
        child.servers.push(Server::new(target));
    }

    match child {
        Some(child) => Some(child),
        None if section == ChaseSection::Answer && (lookup.trace || lookup.ns_search_only) => {
            ns_chase(lookup, msg, ChaseSection::Authority)
        }
        None => None,
    }
}

/// Builds the follow-up that retries the question under the next origin of
/// the search list. Returns `None` when there is nowhere left to go: the
/// fixed domain override has no successor, searching is disabled, or the
/// lookup was already absolute. A follow-up whose origin comes back `None`
/// is the final, absolute attempt.
pub(crate) fn next_origin(config: &EngineConfig, lookup: &Lookup) -> Option<Lookup> {
    debug!("next_origin()");
    match lookup.origin {
        // a fixed domain search has no next entry
        Some(Origin::Fixed) => None,
        None => None,
        Some(Origin::Search(index)) => {
            if !config.usesearch {
                return None;
            }
            let mut looknew = lookup.clone_policy(true);
            looknew.defname = false;
            looknew.origin = if index + 1 < config.search.len() {
                Some(Origin::Search(index + 1))
            } else {
                None
            };
            Some(looknew)
        }
    }
}

#[cfg(test)]
mod tests {
    use hickory_proto::rr::rdata::{A, NS};
    use hickory_proto::rr::Name;

    use crate::config::SearchEntry;

    use super::*;

    fn ns_record(target: &str) -> Record {
        let name = Name::from_ascii("example.com.").unwrap();
        let target = Name::from_ascii(target).unwrap();
        Record::from_rdata(name, 0, RData::NS(NS(target)))
    }

    fn a_record() -> Record {
        let name = Name::from_ascii("www.example.com.").unwrap();
        Record::from_rdata(name, 0, RData::A(A::new(192, 0, 2, 1)))
    }

    fn trace_lookup() -> Lookup {
        let mut lookup = Lookup::new("www.example.com");
        lookup.set_trace(true);
        lookup
    }

    #[test]
    fn authority_referrals_keep_the_trace_going() {
        let mut lookup = trace_lookup();
        let mut msg = Message::new();
        msg.add_name_server(ns_record("a.gtld-servers.net."));
        msg.add_name_server(ns_record("b.gtld-servers.net."));

        let child = ns_chase(&mut lookup, &msg, ChaseSection::Authority).unwrap();
        assert!(child.servers().len() == 2);
        assert!(child.trace);
        assert!(!child.trace_root);
        assert!(!child.doing_xfr);
    }

    #[test]
    fn an_answer_hit_completes_the_chain() {
        let mut lookup = trace_lookup();
        lookup.trace_root = false;
        let mut msg = Message::new();
        msg.add_answer(ns_record("ns1.example.com."));

        let child = ns_chase(&mut lookup, &msg, ChaseSection::Answer).unwrap();
        assert!(!child.trace);
        assert!(!child.ns_search_only);
        assert_eq!(child.servers().len(), 1);
    }

    #[test]
    fn an_empty_answer_falls_through_to_authority() {
        let mut lookup = trace_lookup();
        let mut msg = Message::new();
        msg.add_name_server(ns_record("ns1.example.com."));

        let child = ns_chase(&mut lookup, &msg, ChaseSection::Answer).unwrap();
        // the servers came from the authority section, so the trace goes on
        assert!(child.trace);
        assert_eq!(child.servers().len(), 1);
    }

    #[test]
    fn the_root_probe_caps_collected_servers() {
        let mut lookup = trace_lookup();
        let mut msg = Message::new();
        for i in 0..MXSERV + 5 {
            msg.add_name_server(ns_record(&format!("ns{i}.example.net.")));
        }

        let child = ns_chase(&mut lookup, &msg, ChaseSection::Authority).unwrap();
        assert_eq!(child.servers().len(), MXSERV);
    }

    #[test]
    fn non_ns_records_spawn_nothing() {
        let mut lookup = trace_lookup();
        lookup.trace = false;
        lookup.ns_search_only = false;
        let mut msg = Message::new();
        msg.add_answer(a_record());

        assert!(ns_chase(&mut lookup, &msg, ChaseSection::Answer).is_none());
    }

    fn search_config() -> EngineConfig {
        let mut config = EngineConfig {
            usesearch: true,
            search: vec![
                SearchEntry::new("first.example"),
                SearchEntry::new("second.example"),
            ],
            ..EngineConfig::default()
        };
        config.normalize();
        config
    }

    #[test]
    fn the_search_list_advances_in_order() {
        let config = search_config();
        let mut lookup = Lookup::new("www");
        lookup.origin = Some(Origin::Search(0));

        let child = next_origin(&config, &lookup).unwrap();
        assert_eq!(child.origin, Some(Origin::Search(1)));
        assert!(!child.defname);
    }

    #[test]
    fn past_the_last_entry_the_lookup_goes_absolute() {
        let config = search_config();
        let mut lookup = Lookup::new("www");
        lookup.origin = Some(Origin::Search(1));

        let child = next_origin(&config, &lookup).unwrap();
        assert_eq!(child.origin, None);
    }

    #[test]
    fn a_fixed_domain_has_no_successor() {
        let config = search_config();
        let mut lookup = Lookup::new("www");
        lookup.origin = Some(Origin::Fixed);

        assert!(next_origin(&config, &lookup).is_none());
    }

    #[test]
    fn no_search_means_no_advance() {
        let mut config = search_config();
        config.usesearch = false;
        let mut lookup = Lookup::new("www");
        lookup.origin = Some(Origin::Search(0));

        assert!(next_origin(&config, &lookup).is_none());
    }

    #[test]
    fn an_absolute_lookup_never_advances() {
        let config = search_config();
        let lookup = Lookup::new("www.example.com.");
        assert!(next_origin(&config, &lookup).is_none());
    }
}
