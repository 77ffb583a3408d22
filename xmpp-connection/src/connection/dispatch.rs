// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use minidom::Element;
use tokio::sync::mpsc;

use super::{Shared, WriterCommand};
use crate::codec::CodecError;
use crate::element::{is_stanza, DefinedCondition, StreamElement, StreamError, StreamFeatures};
use crate::error::ProtocolError;
use crate::negotiation::{ChannelUpgrade, FeatureNegotiator, Negotiation};
use crate::ns;
use crate::stream_management::SmError;
use crate::Error;

/// What the reader has to do after an element was dispatched.
#[derive(Debug, PartialEq)]
pub(crate) enum Action {
    /// Keep reading.
    Continue,
    /// The session asked for a stream restart.
    Restart,
    /// Wrap the channel, then restart the stream.
    Upgrade(ChannelUpgrade),
    /// The peer sent its close frame.
    PeerClosed,
    /// The peer sent a stream error; the stream ends after it.
    StreamError(StreamError),
}

fn queue(writer_tx: &mpsc::UnboundedSender<WriterCommand>, element: Element) {
    let command = WriterCommand::Element {
        element: StreamElement::Payload(element),
        flush: true,
        done: None,
    };
    if writer_tx.send(command).is_err() {
        log::debug!("Writer is gone, cannot answer");
    }
}

/// Routes inbound elements, in arrival order.
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    negotiators: Vec<Box<dyn FeatureNegotiator>>,
    /// Index of the negotiator which took over, if any.
    engaged: Option<usize>,
    /// The advertisement withheld from the session while a negotiator is
    /// engaged.
    held: Option<StreamFeatures>,
}

impl Dispatcher {
    pub fn new(
        shared: Arc<Shared>,
        writer_tx: mpsc::UnboundedSender<WriterCommand>,
        negotiators: Vec<Box<dyn FeatureNegotiator>>,
    ) -> Self {
        log::debug!(
            "Registered feature negotiators: {:?}",
            negotiators.iter().map(|n| n.name()).collect::<Vec<_>>()
        );
        Self {
            shared,
            writer_tx,
            negotiators,
            engaged: None,
            held: None,
        }
    }

    pub fn dispatch(&mut self, element: StreamElement) -> Result<Action, Error> {
        match element {
            StreamElement::Open(header) => {
                log::debug!("Stream opened by peer (id {:?})", header.id);
                self.shared.set_peer_header(header.clone());
                Ok(self.deliver(StreamElement::Open(header)))
            }
            StreamElement::Close => Ok(Action::PeerClosed),
            StreamElement::Error(error) => Ok(Action::StreamError(error)),
            StreamElement::Features(features) => self.offer_features(features, 0),
            StreamElement::Payload(el) => self.on_payload(el),
        }
    }

    /// Forget negotiation progress; a restarted stream starts over.
    pub fn on_restart(&mut self) {
        self.engaged = None;
        self.held = None;
    }

    pub fn unregister_negotiators(&mut self) {
        if !self.negotiators.is_empty() {
            log::debug!("Unregistering {} feature negotiators", self.negotiators.len());
        }
        self.negotiators.clear();
        self.on_restart();
    }

    fn deliver(&self, element: StreamElement) -> Action {
        if self.shared.deliver(element) {
            Action::Restart
        } else {
            Action::Continue
        }
    }

    fn offer_features(&mut self, features: StreamFeatures, start: usize) -> Result<Action, Error> {
        let context = self.shared.negotiation_context();
        for (i, negotiator) in self.negotiators.iter_mut().enumerate().skip(start) {
            match negotiator.on_features(&features, &context)? {
                Negotiation::Ignored | Negotiation::Resume => continue,
                Negotiation::Send(element) => queue(&self.writer_tx, element),
                Negotiation::Consumed => (),
                Negotiation::Upgrade(upgrade) => return Ok(Action::Upgrade(upgrade)),
            }
            log::debug!("Feature negotiator {} engaged", negotiator.name());
            self.engaged = Some(i);
            self.held = Some(features);
            return Ok(Action::Continue);
        }
        Ok(self.deliver(StreamElement::Features(features)))
    }

    fn on_payload(&mut self, el: Element) -> Result<Action, Error> {
        if el.has_ns(ns::SM) && self.on_stream_management(&el)? {
            return Ok(Action::Continue);
        }

        if let Some(i) = self.engaged {
            match self.negotiators[i].on_element(&el)? {
                Negotiation::Ignored => (),
                Negotiation::Send(reply) => {
                    queue(&self.writer_tx, reply);
                    return Ok(Action::Continue);
                }
                Negotiation::Consumed => return Ok(Action::Continue),
                Negotiation::Upgrade(upgrade) => {
                    self.on_restart();
                    return Ok(Action::Upgrade(upgrade));
                }
                Negotiation::Resume => {
                    log::debug!("Feature negotiator {} gave up", self.negotiators[i].name());
                    self.engaged = None;
                    return match self.held.take() {
                        Some(features) => self.offer_features(features, i + 1),
                        None => Ok(Action::Continue),
                    };
                }
            }
        }

        if is_stanza(&el, ns::JABBER_CLIENT) {
            self.shared.sm.lock().count_inbound();
        }
        Ok(self.deliver(StreamElement::Payload(el)))
    }

    /// Handle stream management nonzas. Returns whether the element was
    /// consumed; `<enabled/>` and `<failed/>` also go to the session.
    fn on_stream_management(&mut self, el: &Element) -> Result<bool, Error> {
        let mut sm = self.shared.sm.lock();
        match el.name() {
            "r" if sm.is_counting() => {
                let ack = sm.ack_element();
                drop(sm);
                queue(&self.writer_tx, ack);
                Ok(true)
            }
            "a" => {
                let h = el
                    .attr("h")
                    .and_then(|h| h.parse::<u32>().ok())
                    .ok_or(SmError::InvalidAck)?;
                sm.remote_acked(h)?;
                Ok(true)
            }
            "enabled" => {
                sm.on_enabled(el);
                Ok(false)
            }
            "failed" => {
                sm.on_failed();
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

/// The stream error to send to the peer before giving up because of
/// `error`, if any.
pub(crate) fn stream_error_for(error: &Error) -> Option<StreamError> {
    match error {
        Error::Protocol(ProtocolError::StreamManagement(e)) => Some(e.clone().into()),
        Error::Protocol(ProtocolError::Codec(e)) => {
            let condition = match e {
                CodecError::RestrictedXml => DefinedCondition::RestrictedXml,
                CodecError::UnboundPrefix(_) => DefinedCondition::BadNamespacePrefix,
                CodecError::InvalidStreamHeader(_) | CodecError::MissingStreamHeader => {
                    DefinedCondition::InvalidNamespace
                }
                CodecError::TooLarge(_) => DefinedCondition::PolicyViolation,
                _ => DefinedCondition::NotWellFormed,
            };
            Some(StreamError::new(condition).with_text(e.to_string()))
        }
        Error::Protocol(ProtocolError::Compression(e)) => Some(
            StreamError::new(DefinedCondition::UnsupportedFeature)
                .with_text(format!("compression failed: {}", e)),
        ),
        Error::Protocol(ProtocolError::UnexpectedElement(_)) => {
            Some(StreamError::new(DefinedCondition::PolicyViolation))
        }
        _ => None,
    }
}
