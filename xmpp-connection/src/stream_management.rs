// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream management (XEP-0198) bookkeeping.

use core::fmt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use minidom::Element;

use crate::element::{DefinedCondition, StreamError};
use crate::ns;

/// Information needed to resume a stream management session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeInfo {
    /// XEP-0198 stream ID
    pub id: String,

    /// Preferred IP and port for resumption as indicated by the peer.
    pub location: Option<String>,

    /// Maximum resumption time in seconds, as indicated by the peer.
    pub max: Option<u32>,

    /// Number of stanzas received from the peer, to be sent as `h`.
    pub inbound_counter: u32,
}

#[derive(Debug)]
enum Resumption {
    NotResumable,
    Resumable {
        id: String,
        location: Option<String>,
        max: Option<u32>,
    },
}

/// Violations of the acknowledgement protocol by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmError {
    /// The peer acknowledged stanzas we never sent.
    RemoteAckedMoreStanzas {
        /// Sequence number of the last stanza acknowledged before
        local_base: u32,
        /// Number of unacknowledged stanzas
        queue_len: u32,
        /// Counter sent by the peer
        remote_ctr: u32,
    },
    /// The peer's counter is lower than a previous one.
    RemoteAckWentBackwards {
        /// Sequence number of the last stanza acknowledged before
        local_base: u32,
        // NOTE: this is not needed to fully specify the error, but it's
        // needed to generate a `<handled-count-too-high/>` from Self.
        /// Number of unacknowledged stanzas
        queue_len: u32,
        /// Counter sent by the peer
        remote_ctr: u32,
    },
    /// An `<a/>` without a valid `h` attribute.
    InvalidAck,
}

impl fmt::Display for SmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::RemoteAckedMoreStanzas {
                local_base,
                queue_len,
                remote_ctr,
            } => {
                let local_tip = local_base.wrapping_add(*queue_len);
                write!(f, "remote acked more stanzas than we sent: remote counter = {}. queue covers range {}..<{}", remote_ctr, local_base, local_tip)
            }
            Self::RemoteAckWentBackwards {
                local_base,
                remote_ctr,
                ..
            } => {
                write!(f, "remote acked less stanzas than before: remote counter = {}, local queue starts at {}", remote_ctr, local_base)
            }
            Self::InvalidAck => write!(f, "ack without a valid counter"),
        }
    }
}

impl std::error::Error for SmError {}

impl From<SmError> for StreamError {
    fn from(other: SmError) -> Self {
        let (h, send_count) = match other {
            SmError::RemoteAckedMoreStanzas {
                local_base,
                queue_len,
                remote_ctr,
            }
            | SmError::RemoteAckWentBackwards {
                local_base,
                queue_len,
                remote_ctr,
            } => (remote_ctr, local_base.wrapping_add(queue_len)),
            SmError::InvalidAck => {
                return StreamError::new(DefinedCondition::InvalidXml)
                    .with_text("ack without a valid counter")
            }
        };
        StreamError::new(DefinedCondition::UndefinedCondition).with_application_specific(
            Element::builder("handled-count-too-high", ns::SM)
                .attr("h", h.to_string())
                .attr("send-count", send_count.to_string())
                .build(),
        )
    }
}

/// State of stream management on one connection.
pub(crate) struct SmState {
    /// `<enable/>` has been sent, but no answer received yet.
    requested: bool,

    /// `<enabled/>` has been received.
    active: bool,

    /// Last value seen from the remote stanza counter, or the sequence
    /// number of the last stanza taken out of the queue.
    outbound_base: u32,

    /// Stanzas taken out of the queue since the last advancing ack. The
    /// peer may still acknowledge them.
    released: u32,

    /// Counter for received stanzas
    inbound_ctr: u32,

    resumption: Resumption,

    /// Unacked stanzas with their sequence numbers, in the order they
    /// were sent
    unacked: VecDeque<(u32, Element)>,
}

impl Default for SmState {
    fn default() -> Self {
        Self {
            requested: false,
            active: false,
            outbound_base: 0,
            released: 0,
            inbound_ctr: 0,
            resumption: Resumption::NotResumable,
            unacked: VecDeque::new(),
        }
    }
}

impl fmt::Debug for SmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SmState")
            .field("requested", &self.requested)
            .field("active", &self.active)
            .field("outbound_base", &self.outbound_base)
            .field("released", &self.released)
            .field("inbound_ctr", &self.inbound_ctr)
            .field("resumption", &self.resumption)
            .field("len(unacked)", &self.unacked.len())
            .finish()
    }
}

impl SmState {
    /// Whether outbound stanzas are being counted.
    pub fn is_counting(&self) -> bool {
        self.requested || self.active
    }

    /// `<enable/>` has been written. Stanzas written from now on are
    /// tracked.
    pub fn on_enable_sent(&mut self) {
        self.requested = true;
        self.outbound_base = 0;
        self.released = 0;
        self.inbound_ctr = 0;
        self.unacked.clear();
    }

    /// Process `<enabled/>`.
    pub fn on_enabled(&mut self, el: &Element) {
        let resume = matches!(el.attr("resume"), Some("true") | Some("1"));
        self.resumption = match (resume, el.attr("id")) {
            (true, Some(id)) => Resumption::Resumable {
                id: id.to_owned(),
                location: el.attr("location").map(str::to_owned),
                max: el.attr("max").and_then(|max| max.parse().ok()),
            },
            (true, None) => {
                log::warn!("peer replied with <enabled resume='true'/>, but without an ID! cannot make this stream resumable.");
                Resumption::NotResumable
            }
            (false, _) => Resumption::NotResumable,
        };
        self.requested = false;
        self.active = true;
        log::debug!("Stream management enabled: {:?}", self);
    }

    /// Process `<failed/>`. Nothing sent since `<enable/>` is tracked any
    /// longer.
    pub fn on_failed(&mut self) {
        log::debug!(
            "Stream management failed, dropping {} tracked stanzas",
            self.unacked.len()
        );
        self.requested = false;
        self.active = false;
        self.resumption = Resumption::NotResumable;
        self.unacked.clear();
    }

    /// Mark a stanza as sent and keep it in the queue, if stream
    /// management is enabled or being enabled.
    pub fn enqueue(&mut self, stanza: &Element) {
        if !self.is_counting() {
            return;
        }
        let seq = self
            .outbound_base
            .wrapping_add(self.unacked.len() as u32)
            .wrapping_add(1);
        self.unacked.push_back((seq, stanza.clone()));
        log::trace!(
            "Stored stanza #{}. We are now at {} unacked stanzas.",
            seq,
            self.unacked.len()
        );
    }

    /// Process remote `<a/>`
    pub fn remote_acked(&mut self, h: u32) -> Result<(), SmError> {
        // XEP-0198 specifies that counters are mod 2^32, which is handy when
        // you use u32 data types :-).
        let to_drop = h.wrapping_sub(self.outbound_base) as usize;
        if to_drop == 0 {
            log::trace!("remote_acked: no stanzas to drop");
            return Ok(());
        }
        let behind = self.outbound_base.wrapping_sub(h);
        if behind <= self.released {
            log::trace!("remote_acked: {} covers stanzas already taken out", h);
            return Ok(());
        }
        if to_drop > self.unacked.len() {
            let local_base = self.outbound_base;
            let queue_len = self.unacked.len() as u32;
            // A wrapping difference greater than half the number space is a
            // negative difference (RFC 1982).
            return Err(if to_drop as u32 > u32::MAX / 2 {
                SmError::RemoteAckWentBackwards {
                    local_base,
                    queue_len,
                    remote_ctr: h,
                }
            } else {
                SmError::RemoteAckedMoreStanzas {
                    local_base,
                    queue_len,
                    remote_ctr: h,
                }
            });
        }
        self.unacked.drain(..to_drop);
        self.outbound_base = h;
        self.released = 0;
        log::debug!(
            "remote_acked: remote acked {} stanzas, {} left",
            to_drop,
            self.unacked.len()
        );
        Ok(())
    }

    /// Empty the queue. Sequence numbers continue after the stanzas taken.
    pub fn take_unacked(&mut self) -> Vec<Element> {
        let taken = self.unacked.len() as u32;
        self.outbound_base = self.outbound_base.wrapping_add(taken);
        self.released = self.released.wrapping_add(taken);
        self.unacked.drain(..).map(|(_, el)| el).collect()
    }

    /// Count a received stanza.
    pub fn count_inbound(&mut self) {
        if self.active {
            self.inbound_ctr = self.inbound_ctr.wrapping_add(1);
        }
    }

    /// The `<a/>` answering a `<r/>` from the peer.
    pub fn ack_element(&self) -> Element {
        Element::builder("a", ns::SM)
            .attr("h", self.inbound_ctr.to_string())
            .build()
    }
}

/// Shared handle on the stream management state of a connection.
///
/// The handle stays valid after the connection is gone, so that
/// unacknowledged stanzas can be retrieved for retransmission.
#[derive(Debug, Clone, Default)]
pub struct StreamManagement(Arc<Mutex<SmState>>);

impl StreamManagement {
    pub(crate) fn lock(&self) -> MutexGuard<'_, SmState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the peer confirmed stream management on this connection.
    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Stream ID and counters for a resumption attempt, if the peer
    /// allowed resumption.
    pub fn resume_info(&self) -> Option<ResumeInfo> {
        let state = self.lock();
        match state.resumption {
            Resumption::Resumable {
                ref id,
                ref location,
                max,
            } => Some(ResumeInfo {
                id: id.clone(),
                location: location.clone(),
                max,
                inbound_counter: state.inbound_ctr,
            }),
            Resumption::NotResumable => None,
        }
    }

    /// Number of stanzas received since stream management was enabled.
    pub fn inbound_counter(&self) -> u32 {
        self.lock().inbound_ctr
    }

    /// Stanzas not acknowledged yet, with their sequence numbers.
    pub fn unacknowledged(&self) -> Vec<(u32, Element)> {
        self.lock().unacked.iter().cloned().collect()
    }

    /// Remove and return all unacknowledged stanzas, for replay on a new
    /// stream.
    ///
    /// On a live connection, later acks from the peer are still accepted,
    /// including those covering the stanzas taken.
    pub fn take_unacknowledged(&self) -> Vec<Element> {
        self.lock().take_unacked()
    }

    /// Forget everything; the next session starts afresh.
    pub fn reset(&self) {
        *self.lock() = SmState::default();
    }
}

/// `<enable/>`, optionally asking for resumption.
pub fn enable_element(resume: bool) -> Element {
    let builder = Element::builder("enable", ns::SM);
    if resume {
        builder.attr("resume", "true").build()
    } else {
        builder.build()
    }
}

/// `<r/>`
pub fn request_element() -> Element {
    Element::builder("r", ns::SM).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stanza(n: u32) -> Element {
        Element::builder("message", ns::JABBER_CLIENT)
            .attr("id", n.to_string())
            .build()
    }

    fn enabled() -> Element {
        Element::builder("enabled", ns::SM)
            .attr("resume", "true")
            .attr("id", "some-long-sm-id")
            .attr("location", "[2001:41D0:1:A49b::1]:9222")
            .attr("max", "600")
            .build()
    }

    #[test]
    fn ack_truncates_queue_head() {
        let sm = StreamManagement::default();
        sm.lock().on_enable_sent();
        for n in 1..=5 {
            sm.lock().enqueue(&stanza(n));
        }
        sm.lock().remote_acked(3).unwrap();
        let left = sm.unacknowledged();
        assert_eq!(
            left.iter().map(|(seq, _)| *seq).collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert_eq!(left[0].1.attr("id"), Some("4"));
        assert_eq!(left[1].1.attr("id"), Some("5"));
    }

    #[test]
    fn not_counted_before_enable() {
        let mut state = SmState::default();
        state.enqueue(&stanza(1));
        assert!(state.unacked.is_empty());
        state.on_enable_sent();
        state.enqueue(&stanza(2));
        assert_eq!(state.unacked.len(), 1);
        assert_eq!(state.unacked[0].0, 1);
    }

    #[test]
    fn ack_errors() {
        let mut state = SmState::default();
        state.on_enable_sent();
        state.enqueue(&stanza(1));
        state.enqueue(&stanza(2));
        assert_eq!(
            state.remote_acked(3),
            Err(SmError::RemoteAckedMoreStanzas {
                local_base: 0,
                queue_len: 2,
                remote_ctr: 3,
            })
        );
        state.remote_acked(2).unwrap();
        assert!(matches!(
            state.remote_acked(1),
            Err(SmError::RemoteAckWentBackwards { .. })
        ));
        // Repeated acks are fine.
        state.remote_acked(2).unwrap();
    }

    #[test]
    fn counters_wrap_around() {
        let mut state = SmState::default();
        state.on_enable_sent();
        state.outbound_base = u32::MAX - 1;
        for n in 0..3 {
            state.enqueue(&stanza(n));
        }
        let seqs: Vec<_> = state.unacked.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![u32::MAX, 0, 1]);
        state.remote_acked(0).unwrap();
        assert_eq!(state.unacked.len(), 1);
    }

    #[test]
    fn enabled_and_failed() {
        let sm = StreamManagement::default();
        sm.lock().on_enable_sent();
        sm.lock().enqueue(&stanza(1));
        sm.lock().on_enabled(&enabled());
        assert!(sm.is_active());
        sm.lock().count_inbound();
        assert_eq!(
            sm.resume_info(),
            Some(ResumeInfo {
                id: "some-long-sm-id".to_owned(),
                location: Some("[2001:41D0:1:A49b::1]:9222".to_owned()),
                max: Some(600),
                inbound_counter: 1,
            })
        );
        assert_eq!(sm.lock().ack_element().attr("h"), Some("1"));

        sm.lock().on_failed();
        assert!(!sm.is_active());
        assert!(sm.resume_info().is_none());
        assert!(sm.unacknowledged().is_empty());
    }

    #[test]
    fn take_preserves_order_and_reset_clears() {
        let sm = StreamManagement::default();
        sm.lock().on_enable_sent();
        sm.lock().on_enabled(&enabled());
        for n in 1..=3 {
            sm.lock().enqueue(&stanza(n));
        }
        let replay = sm.take_unacknowledged();
        let ids: Vec<_> = replay.iter().filter_map(|el| el.attr("id")).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert!(sm.is_active());
        sm.reset();
        assert!(!sm.is_active());
    }

    #[test]
    fn acks_after_take_on_a_live_stream() {
        let mut state = SmState::default();
        state.on_enable_sent();
        for n in 1..=3 {
            state.enqueue(&stanza(n));
        }
        assert_eq!(state.take_unacked().len(), 3);
        state.enqueue(&stanza(4));
        assert_eq!(state.unacked[0].0, 4);

        // Acks for taken stanzas are not errors, and leave the queue alone.
        state.remote_acked(2).unwrap();
        state.remote_acked(3).unwrap();
        assert_eq!(state.unacked.len(), 1);

        state.remote_acked(4).unwrap();
        assert!(state.unacked.is_empty());
        assert!(matches!(
            state.remote_acked(3),
            Err(SmError::RemoteAckWentBackwards { .. })
        ));
        assert!(matches!(
            state.remote_acked(6),
            Err(SmError::RemoteAckedMoreStanzas { .. })
        ));
    }

    #[test]
    fn handled_count_too_high() {
        let err: StreamError = SmError::RemoteAckedMoreStanzas {
            local_base: 10,
            queue_len: 2,
            remote_ctr: 13,
        }
        .into();
        let app = err.application_specific.unwrap();
        assert!(app.is("handled-count-too-high", ns::SM));
        assert_eq!(app.attr("h"), Some("13"));
        assert_eq!(app.attr("send-count"), Some("12"));
    }
}
