// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The zone-transfer consumer.
//!
//! Transfers arrive as a multi-message TCP stream delimited by SOA records.
//! This module decides, per inbound message, whether the stream needs more
//! data or is finished, using the IXFR and AXFR framing rules. Most of the
//! subtlety is knowing when an IXFR is complete: the first SOA names the
//! target serial, and the stream ends the *second* time that serial comes
//! around.

use hickory_proto::op::Message;
use hickory_proto::rr::{RData, RecordType};
use tracing::debug;

use crate::lookup::XfrState;

/// Verdict for one inbound message of a transfer stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum XfrPoll {
    /// More data is on the way; issue the next read on the same stream.
    NeedMore,
    /// The stream is finished, for the given reason.
    Done(XfrEnd),
}

/// Why a transfer stream ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum XfrEnd {
    /// The delimiting SOA came around; the transfer is complete.
    Complete,
    /// The client's serial is current; the server has nothing to send.
    NothingToTransfer,
    /// An IXFR whose first and second records carry the same serial: the
    /// zone is empty of changes.
    EmptyZone,
    /// The first record of the stream was not an SOA.
    NotStartedWithSoa,
    /// A message with no answer records; the transfer failed.
    EmptyMessage,
    /// The record cap was reached; the transfer is cut short.
    RecordLimit,
}

/// Walks the ANSWER section of one inbound message, advancing the per-query
/// transfer state. `rr_limit` caps the cumulative record count; hitting it
/// ends the stream after the current message.
pub(crate) fn consume_message(
    state: &mut XfrState,
    rdtype: RecordType,
    ixfr_serial: u32,
    rr_limit: u64,
    msg: &Message,
) -> XfrPoll {
    if msg.answers().is_empty() {
        return XfrPoll::Done(XfrEnd::EmptyMessage);
    }

    let mut at_limit = false;
    for record in msg.answers() {
        state.rr_count += 1;
        if state.rr_count >= rr_limit {
            at_limit = true;
        }

        let serial = match record.data() {
            Some(RData::SOA(soa)) => Some(soa.serial()),
            _ => None,
        };

        let Some(serial) = serial else {
            if !state.first_soa_rcvd {
                return XfrPoll::Done(XfrEnd::NotStartedWithSoa);
            }
            if !state.second_rr_rcvd {
                // a non-SOA in second position means this is an AXFR
                debug!("got the second rr as nonsoa");
                state.second_rr_rcvd = true;
                state.second_rr_serial = 0;
            }
            continue;
        };

        debug!("got an SOA with serial {serial}");
        if !state.first_soa_rcvd {
            state.first_soa_rcvd = true;
            state.first_rr_serial = serial;
            if ixfr_serial >= serial {
                return XfrPoll::Done(XfrEnd::NothingToTransfer);
            }
            continue;
        }

        if rdtype == RecordType::AXFR {
            // first SOA begins, second SOA ends
            debug!("doing axfr, got second SOA");
            return XfrPoll::Done(XfrEnd::Complete);
        }

        if !state.second_rr_rcvd {
            if serial == state.first_rr_serial {
                debug!("doing ixfr, got empty zone");
                return XfrPoll::Done(XfrEnd::EmptyZone);
            }
            state.second_rr_rcvd = true;
            state.second_rr_serial = serial;
            continue;
        }

        if state.second_rr_serial == 0 {
            // the second record was a non-SOA, so any further SOA means an
            // AXFR-style answer and the stream is done
            debug!("done, since axfr");
            return XfrPoll::Done(XfrEnd::Complete);
        }

        // a real IXFR: the target serial ends the stream the second time
        // it appears
        if serial == state.first_rr_serial {
            if state.first_repeat_rcvd {
                debug!("done with ixfr");
                return XfrPoll::Done(XfrEnd::Complete);
            }
            state.first_repeat_rcvd = true;
            continue;
        }

        debug!("meaningless soa {serial}");
    }

    if at_limit {
        XfrPoll::Done(XfrEnd::RecordLimit)
    } else {
        XfrPoll::NeedMore
    }
}

#[cfg(test)]
mod tests {
    use hickory_proto::rr::rdata::{A, NS, SOA};
    use hickory_proto::rr::{Name, Record};

    use super::*;

    fn soa(serial: u32) -> Record {
        let name = Name::from_ascii("example.com.").unwrap();
        let rdata = SOA::new(name.clone(), name.clone(), serial, 1, 1, 1, 1);
        Record::from_rdata(name, 0, RData::SOA(rdata))
    }

    fn a_record() -> Record {
        let name = Name::from_ascii("host.example.com.").unwrap();
        Record::from_rdata(name, 0, RData::A(A::new(192, 0, 2, 1)))
    }

    fn ns_record() -> Record {
        let name = Name::from_ascii("example.com.").unwrap();
        let target = Name::from_ascii("ns1.example.com.").unwrap();
        Record::from_rdata(name, 0, RData::NS(NS(target)))
    }

    fn message(records: Vec<Record>) -> Message {
        let mut msg = Message::new();
        for record in records {
            msg.add_answer(record);
        }
        msg
    }

    #[test]
    fn axfr_ends_at_the_second_soa() {
        let mut state = XfrState::default();
        let msg = message(vec![soa(100), a_record(), a_record(), ns_record(), soa(100)]);
        let poll = consume_message(&mut state, RecordType::AXFR, 0, u64::MAX, &msg);
        assert_eq!(poll, XfrPoll::Done(XfrEnd::Complete));
        assert_eq!(state.rr_count, 5);
    }

    #[test]
    fn axfr_split_across_messages_requests_more_data() {
        let mut state = XfrState::default();
        let first = message(vec![soa(100), a_record()]);
        assert_eq!(
            consume_message(&mut state, RecordType::AXFR, 0, u64::MAX, &first),
            XfrPoll::NeedMore
        );
        let second = message(vec![a_record(), soa(100)]);
        assert_eq!(
            consume_message(&mut state, RecordType::AXFR, 0, u64::MAX, &second),
            XfrPoll::Done(XfrEnd::Complete)
        );
        assert_eq!(state.rr_count, 4);
    }

    #[test]
    fn ixfr_with_a_current_serial_has_nothing_to_transfer() {
        let mut state = XfrState::default();
        let msg = message(vec![soa(42)]);
        let poll = consume_message(&mut state, RecordType::IXFR, 42, u64::MAX, &msg);
        assert_eq!(poll, XfrPoll::Done(XfrEnd::NothingToTransfer));
        assert_eq!(state.rr_count, 1);
    }

    #[test]
    fn ixfr_repeated_first_serial_is_an_empty_zone() {
        let mut state = XfrState::default();
        let msg = message(vec![soa(7), soa(7)]);
        assert_eq!(
            consume_message(&mut state, RecordType::IXFR, 1, u64::MAX, &msg),
            XfrPoll::Done(XfrEnd::EmptyZone)
        );
    }

    #[test]
    fn ixfr_diff_stream_ends_at_the_second_repeat_of_the_target_serial() {
        let mut state = XfrState::default();
        // target serial 3; one diff sequence from 1 to 3
        let msg = message(vec![
            soa(3),
            soa(1),
            a_record(),
            soa(3),
            a_record(),
            a_record(),
            soa(3),
        ]);
        assert_eq!(
            consume_message(&mut state, RecordType::IXFR, 1, u64::MAX, &msg),
            XfrPoll::Done(XfrEnd::Complete)
        );
    }

    #[test]
    fn ixfr_answered_with_a_full_zone_ends_like_an_axfr() {
        let mut state = XfrState::default();
        let msg = message(vec![soa(3), a_record(), ns_record(), soa(3)]);
        assert_eq!(
            consume_message(&mut state, RecordType::IXFR, 1, u64::MAX, &msg),
            XfrPoll::Done(XfrEnd::Complete)
        );
    }

    #[test]
    fn intermediate_soas_with_other_serials_are_skipped() {
        let mut state = XfrState::default();
        let msg = message(vec![soa(3), soa(1), soa(2), a_record()]);
        assert_eq!(
            consume_message(&mut state, RecordType::IXFR, 1, u64::MAX, &msg),
            XfrPoll::NeedMore
        );
        // diff continues in the next message and finishes at the repeats
        let rest = message(vec![soa(3), soa(3)]);
        assert_eq!(
            consume_message(&mut state, RecordType::IXFR, 1, u64::MAX, &rest),
            XfrPoll::Done(XfrEnd::Complete)
        );
    }

    #[test]
    fn a_stream_not_starting_with_soa_fails() {
        let mut state = XfrState::default();
        let msg = message(vec![a_record()]);
        assert_eq!(
            consume_message(&mut state, RecordType::AXFR, 0, u64::MAX, &msg),
            XfrPoll::Done(XfrEnd::NotStartedWithSoa)
        );
    }

    #[test]
    fn an_empty_message_fails_the_transfer() {
        let mut state = XfrState::default();
        let msg = message(Vec::new());
        assert_eq!(
            consume_message(&mut state, RecordType::AXFR, 0, u64::MAX, &msg),
            XfrPoll::Done(XfrEnd::EmptyMessage)
        );
    }

    #[test]
    fn the_record_limit_cuts_the_stream_after_the_current_message() {
        let mut state = XfrState::default();
        let msg = message(vec![soa(100), a_record(), a_record(), a_record()]);
        assert_eq!(
            consume_message(&mut state, RecordType::AXFR, 0, 3, &msg),
            XfrPoll::Done(XfrEnd::RecordLimit)
        );
        assert_eq!(state.rr_count, 4);
    }

    #[test]
    fn a_terminal_soa_wins_over_the_record_limit() {
        let mut state = XfrState::default();
        let msg = message(vec![soa(100), a_record(), soa(100)]);
        assert_eq!(
            consume_message(&mut state, RecordType::AXFR, 0, 2, &msg),
            XfrPoll::Done(XfrEnd::Complete)
        );
    }

    #[test]
    fn a_transfer_terminates_within_the_limit_plus_one_record() {
        // quantified invariant: with a finite rr_limit the consumer stops
        // in at most rr_limit + 1 records even on an endless stream
        let mut state = XfrState::default();
        let rr_limit = 5;
        let mut consumed = 0u64;
        loop {
            let msg = message(vec![a_record(), a_record()]);
            let msg = if consumed == 0 {
                message(vec![soa(9), a_record()])
            } else {
                msg
            };
            match consume_message(&mut state, RecordType::AXFR, 0, rr_limit, &msg) {
                XfrPoll::NeedMore => {
                    consumed = state.rr_count;
                    continue;
                }
                XfrPoll::Done(end) => {
                    assert_eq!(end, XfrEnd::RecordLimit);
                    assert!(state.rr_count <= rr_limit + 1);
                    break;
                }
            }
        }
    }
}
