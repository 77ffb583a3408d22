// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream feature negotiation which changes the channel itself.
//!
//! Negotiators see the feature advertisement before the session does. A
//! negotiator which engages takes over the elements arriving until it is
//! done, and may end by asking for the channel to be wrapped. The
//! connection then swaps the channel and restarts the stream.

use minidom::Element;

use crate::compression::CompressionMethod;
use crate::config::{ChannelEncryption, ConnectionConfiguration};
use crate::element::StreamFeatures;
use crate::Error;

mod compression;
mod starttls;

pub use self::compression::CompressionNegotiator;
pub use self::starttls::StartTlsNegotiator;

/// How the channel is to be wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelUpgrade {
    /// TLS, as negotiated via STARTTLS
    Tls,
    /// Compression with the given method
    Compression(CompressionMethod),
}

/// Result of offering an element to a negotiator.
#[derive(Debug, PartialEq)]
pub enum Negotiation {
    /// Not handled by this negotiator.
    Ignored,
    /// Handled; send this element to the peer and wait for the answer.
    Send(Element),
    /// Handled; nothing further to do for now.
    Consumed,
    /// Handled; wrap the channel and restart the stream.
    Upgrade(ChannelUpgrade),
    /// The negotiation was abandoned without a restart; the withheld
    /// feature advertisement goes to the session.
    Resume,
}

/// What a negotiator needs to know about the channel.
#[derive(Debug, Clone, Copy)]
pub struct NegotiationContext {
    /// TLS is active.
    pub secure: bool,
    /// Compression is active.
    pub compressed: bool,
    /// Configured encryption mode.
    pub encryption: ChannelEncryption,
}

/// A pluggable stream feature negotiator.
pub trait FeatureNegotiator: Send + 'static {
    /// Name for log lines.
    fn name(&self) -> &'static str;

    /// Look at a feature advertisement. Anything but
    /// [`Negotiation::Ignored`] engages this negotiator.
    fn on_features(
        &mut self,
        features: &StreamFeatures,
        context: &NegotiationContext,
    ) -> Result<Negotiation, Error>;

    /// Look at an element received while this negotiator is engaged.
    fn on_element(&mut self, element: &Element) -> Result<Negotiation, Error>;
}

/// The negotiators for a socket connection, in the order they are
/// consulted: STARTTLS, then compression.
pub fn default_negotiators(config: &ConnectionConfiguration) -> Vec<Box<dyn FeatureNegotiator>> {
    let mut result: Vec<Box<dyn FeatureNegotiator>> = vec![Box::new(StartTlsNegotiator::new())];
    if !config.compression_methods().is_empty() {
        result.push(Box::new(CompressionNegotiator::new(
            config.compression_methods().to_vec(),
        )));
    }
    result
}
