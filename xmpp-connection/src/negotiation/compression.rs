// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use minidom::Element;

use super::{ChannelUpgrade, FeatureNegotiator, Negotiation, NegotiationContext};
use crate::compression::CompressionMethod;
use crate::element::StreamFeatures;
use crate::ns;
use crate::Error;

/// Negotiates stream compression (XEP-0138).
#[derive(Debug)]
pub struct CompressionNegotiator {
    preferred: Vec<CompressionMethod>,
    requested: Option<CompressionMethod>,
}

impl CompressionNegotiator {
    /// Create a negotiator choosing among `preferred`, in that order.
    pub fn new(preferred: Vec<CompressionMethod>) -> Self {
        Self {
            preferred,
            requested: None,
        }
    }

    fn choose(&self, features: &StreamFeatures) -> Option<CompressionMethod> {
        let offered: Vec<CompressionMethod> = features
            .get("compression", ns::FEATURE_COMPRESS)?
            .children()
            .filter(|child| child.is("method", ns::FEATURE_COMPRESS))
            .filter_map(|child| child.text().trim().parse().ok())
            .collect();
        self.preferred
            .iter()
            .copied()
            .filter(CompressionMethod::is_supported)
            .find(|method| offered.contains(method))
    }
}

impl FeatureNegotiator for CompressionNegotiator {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn on_features(
        &mut self,
        features: &StreamFeatures,
        context: &NegotiationContext,
    ) -> Result<Negotiation, Error> {
        if context.compressed {
            return Ok(Negotiation::Ignored);
        }
        let Some(method) = self.choose(features) else {
            return Ok(Negotiation::Ignored);
        };
        log::debug!("Requesting {} compression", method);
        self.requested = Some(method);
        Ok(Negotiation::Send(
            Element::builder("compress", ns::COMPRESS)
                .append(
                    Element::builder("method", ns::COMPRESS)
                        .append(method.as_str())
                        .build(),
                )
                .build(),
        ))
    }

    fn on_element(&mut self, element: &Element) -> Result<Negotiation, Error> {
        if !element.has_ns(ns::COMPRESS) {
            return Ok(Negotiation::Ignored);
        }
        let Some(method) = self.requested.take() else {
            return Ok(Negotiation::Ignored);
        };
        match element.name() {
            "compressed" => Ok(Negotiation::Upgrade(ChannelUpgrade::Compression(method))),
            "failure" => {
                let condition = element
                    .children()
                    .next()
                    .map(|child| child.name().to_owned())
                    .unwrap_or_default();
                log::warn!(
                    "Server refused {} compression ({}), continuing uncompressed",
                    method,
                    condition
                );
                Ok(Negotiation::Resume)
            }
            _ => {
                self.requested = Some(method);
                Ok(Negotiation::Ignored)
            }
        }
    }
}
