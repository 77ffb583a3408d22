// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use minidom::Element;

use super::{ChannelUpgrade, FeatureNegotiator, Negotiation, NegotiationContext};
use crate::config::ChannelEncryption;
use crate::element::StreamFeatures;
use crate::error::TlsError;
use crate::ns;
use crate::Error;

#[derive(Debug, PartialEq, Eq)]
enum State {
    Idle,
    Requested,
}

/// Negotiates `<starttls/>` (RFC 6120, section 5).
#[derive(Debug)]
pub struct StartTlsNegotiator {
    state: State,
}

impl Default for StartTlsNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl StartTlsNegotiator {
    /// Create an idle negotiator.
    pub fn new() -> Self {
        Self { state: State::Idle }
    }
}

impl FeatureNegotiator for StartTlsNegotiator {
    fn name(&self) -> &'static str {
        "starttls"
    }

    fn on_features(
        &mut self,
        features: &StreamFeatures,
        context: &NegotiationContext,
    ) -> Result<Negotiation, Error> {
        if context.secure {
            return Ok(Negotiation::Ignored);
        }
        match features.get("starttls", ns::TLS) {
            Some(starttls) => {
                if context.encryption == ChannelEncryption::Disabled {
                    if starttls.get_child("required", ns::TLS).is_some() {
                        return Err(TlsError::Required.into());
                    }
                    log::debug!("Server offers STARTTLS, but encryption is disabled");
                    return Ok(Negotiation::Ignored);
                }
                log::debug!("Requesting STARTTLS");
                self.state = State::Requested;
                Ok(Negotiation::Send(Element::builder("starttls", ns::TLS).build()))
            }
            None if context.encryption == ChannelEncryption::Required => {
                Err(TlsError::NotOffered.into())
            }
            None => Ok(Negotiation::Ignored),
        }
    }

    fn on_element(&mut self, element: &Element) -> Result<Negotiation, Error> {
        if self.state != State::Requested || !element.has_ns(ns::TLS) {
            return Ok(Negotiation::Ignored);
        }
        self.state = State::Idle;
        match element.name() {
            "proceed" => Ok(Negotiation::Upgrade(ChannelUpgrade::Tls)),
            "failure" => Err(TlsError::Rejected.into()),
            other => {
                log::warn!("Unexpected <{}/> in STARTTLS negotiation", other);
                Err(TlsError::Rejected.into())
            }
        }
    }
}
