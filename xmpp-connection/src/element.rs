// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Units of an XML stream as seen by the connection engine.

use core::fmt;
use core::str::FromStr;

use minidom::Element;
use rand::{thread_rng, Rng};

use crate::ns;

/// One unit of the stream.
///
/// Payloads are opaque to the connection; only framing, errors and the
/// feature advertisement are distinguished.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamElement {
    /// The stream was opened (or re-opened after a restart).
    Open(StreamHeader),

    /// The stream was closed.
    Close,

    /// A stream-level error. It is always followed by the end of the
    /// stream.
    Error(StreamError),

    /// The stream feature advertisement.
    Features(StreamFeatures),

    /// Any other top-level element, including stanzas and negotiation
    /// nonzas.
    Payload(Element),
}

impl StreamElement {
    /// Short description for log lines.
    pub fn describe(&self) -> String {
        match self {
            Self::Open(header) => format!("stream open (id={:?})", header.id),
            Self::Close => "stream close".to_owned(),
            Self::Error(e) => format!("stream error {}", e.condition),
            Self::Features(_) => "stream features".to_owned(),
            Self::Payload(el) => format!("<{} xmlns='{}'/>", el.name(), el.ns()),
        }
    }
}

impl From<Element> for StreamElement {
    fn from(other: Element) -> Self {
        Self::Payload(other)
    }
}

impl From<StreamError> for StreamElement {
    fn from(other: StreamError) -> Self {
        Self::Error(other)
    }
}

/// Attributes of a stream header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// The `from` attribute.
    pub from: Option<String>,

    /// The `to` attribute.
    pub to: Option<String>,

    /// The `id` attribute.
    pub id: Option<String>,

    /// The `version` attribute; `"1.0"` for everything this crate speaks.
    pub version: Option<String>,

    /// The `xml:lang` attribute.
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Header for a client-initiated stream to `domain`.
    pub fn client(domain: &str) -> Self {
        Self {
            from: None,
            to: Some(domain.to_owned()),
            id: None,
            version: Some("1.0".to_owned()),
            lang: None,
        }
    }

    pub(crate) fn set_attr(&mut self, name: &str, value: String) -> bool {
        match name {
            "from" => self.from = Some(value),
            "to" => self.to = Some(value),
            "id" => self.id = Some(value),
            "version" => self.version = Some(value),
            "xml:lang" => self.lang = Some(value),
            _ => return false,
        }
        true
    }

    pub(crate) fn attrs(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("from", self.from.as_deref()),
            ("to", self.to.as_deref()),
            ("id", self.id.as_deref()),
            ("version", self.version.as_deref()),
            ("xml:lang", self.lang.as_deref()),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
    }
}

/// The `<stream:features/>` advertisement.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFeatures(pub Element);

impl StreamFeatures {
    /// Look up an advertised feature.
    pub fn get(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.0.get_child(name, namespace)
    }

    /// Whether a feature is advertised.
    pub fn offers(&self, name: &str, namespace: &str) -> bool {
        self.get(name, namespace).is_some()
    }

    /// Whether XEP-0198 Stream Management is advertised.
    pub fn can_stream_management(&self) -> bool {
        self.offers("sm", ns::SM)
    }
}

macro_rules! defined_conditions {
    ($($variant:ident => $name:literal,)+) => {
        /// RFC 6120 defined stream error conditions.
        #[derive(Debug, Clone, PartialEq, Eq)]
        #[allow(missing_docs)]
        pub enum DefinedCondition {
            $($variant,)+
        }

        impl DefinedCondition {
            /// Element name of the condition.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl FromStr for DefinedCondition {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, ()> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    _ => Err(()),
                }
            }
        }
    }
}

defined_conditions! {
    BadFormat => "bad-format",
    BadNamespacePrefix => "bad-namespace-prefix",
    Conflict => "conflict",
    ConnectionTimeout => "connection-timeout",
    HostGone => "host-gone",
    HostUnknown => "host-unknown",
    ImproperAddressing => "improper-addressing",
    InternalServerError => "internal-server-error",
    InvalidFrom => "invalid-from",
    InvalidNamespace => "invalid-namespace",
    InvalidXml => "invalid-xml",
    NotAuthorized => "not-authorized",
    NotWellFormed => "not-well-formed",
    PolicyViolation => "policy-violation",
    RemoteConnectionFailed => "remote-connection-failed",
    Reset => "reset",
    ResourceConstraint => "resource-constraint",
    RestrictedXml => "restricted-xml",
    SeeOtherHost => "see-other-host",
    SystemShutdown => "system-shutdown",
    UndefinedCondition => "undefined-condition",
    UnsupportedEncoding => "unsupported-encoding",
    UnsupportedFeature => "unsupported-feature",
    UnsupportedStanzaType => "unsupported-stanza-type",
    UnsupportedVersion => "unsupported-version",
}

impl fmt::Display for DefinedCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `<stream:error/>`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamError {
    /// The defined condition.
    pub condition: DefinedCondition,

    /// Human-readable description, if any.
    pub text: Option<String>,

    /// Application-specific condition element, if any.
    pub application_specific: Option<Element>,

    /// For `see-other-host`, the new host.
    pub see_other_host: Option<String>,
}

impl StreamError {
    /// Create an error with only a defined condition.
    pub fn new(condition: DefinedCondition) -> Self {
        Self {
            condition,
            text: None,
            application_specific: None,
            see_other_host: None,
        }
    }

    /// Attach a human-readable description.
    pub fn with_text<T: Into<String>>(mut self, text: T) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Attach an application-specific condition.
    pub fn with_application_specific(mut self, el: Element) -> Self {
        self.application_specific = Some(el);
        self
    }

    /// Interpret the children of a `<stream:error/>` element.
    ///
    /// Unknown or missing conditions map to `undefined-condition`.
    pub fn from_element(el: &Element) -> Self {
        let mut result = Self::new(DefinedCondition::UndefinedCondition);
        for child in el.children() {
            if child.has_ns(ns::XMPP_STREAMS) {
                if child.name() == "text" {
                    result.text = Some(child.text());
                } else if let Ok(condition) = child.name().parse() {
                    if condition == DefinedCondition::SeeOtherHost {
                        result.see_other_host = Some(child.text());
                    }
                    result.condition = condition;
                } else {
                    log::debug!("Unknown stream error condition <{}/>", child.name());
                }
            } else {
                result.application_specific = Some(child.clone());
            }
        }
        result
    }

    /// Build the children of a `<stream:error/>` element.
    pub(crate) fn children(&self) -> Vec<Element> {
        let mut condition = Element::builder(self.condition.as_str(), ns::XMPP_STREAMS);
        if let Some(host) = &self.see_other_host {
            condition = condition.append(host.clone());
        }
        let mut result = vec![condition.build()];
        if let Some(text) = &self.text {
            result.push(
                Element::builder("text", ns::XMPP_STREAMS)
                    .append(text.clone())
                    .build(),
            );
        }
        if let Some(el) = &self.application_specific {
            result.push(el.clone());
        }
        result
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.condition)?;
        if let Some(text) = &self.text {
            write!(f, " ({})", text)?;
        }
        Ok(())
    }
}

/// Whether `el` is a stanza (as opposed to a nonza) in the given default
/// namespace.
pub fn is_stanza(el: &Element, default_ns: &str) -> bool {
    el.has_ns(default_ns) && matches!(el.name(), "iq" | "message" | "presence")
}

fn make_id() -> String {
    let id: u64 = thread_rng().gen();
    format!("{}", id)
}

/// Assign a random ID to a stanza, if no ID has been assigned yet.
///
/// Elements which are not stanzas are left untouched.
pub fn ensure_id(el: &mut Element, default_ns: &str) {
    if !is_stanza(el, default_ns) {
        return;
    }
    if el.attr("id").map_or(true, str::is_empty) {
        el.set_attr("id", make_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_error_from_element() {
        let el = Element::builder("error", ns::STREAM)
            .append(Element::builder("see-other-host", ns::XMPP_STREAMS).append("[2001:db8::1]:5222"))
            .append(Element::builder("text", ns::XMPP_STREAMS).append("moved"))
            .append(Element::builder("escape-your-data", "urn:example"))
            .build();
        let e = StreamError::from_element(&el);
        assert_eq!(e.condition, DefinedCondition::SeeOtherHost);
        assert_eq!(e.see_other_host.as_deref(), Some("[2001:db8::1]:5222"));
        assert_eq!(e.text.as_deref(), Some("moved"));
        assert!(e.application_specific.unwrap().is("escape-your-data", "urn:example"));
    }

    #[test]
    fn unknown_condition_is_undefined() {
        let el = Element::builder("error", ns::STREAM)
            .append(Element::builder("made-up", ns::XMPP_STREAMS))
            .build();
        let e = StreamError::from_element(&el);
        assert_eq!(e.condition, DefinedCondition::UndefinedCondition);
    }

    #[test]
    fn ensure_id_only_touches_stanzas() {
        let mut msg = Element::builder("message", ns::JABBER_CLIENT).build();
        ensure_id(&mut msg, ns::JABBER_CLIENT);
        assert!(msg.attr("id").is_some());

        let mut iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("id", "fixed")
            .build();
        ensure_id(&mut iq, ns::JABBER_CLIENT);
        assert_eq!(iq.attr("id"), Some("fixed"));

        let mut r = Element::builder("r", ns::SM).build();
        ensure_id(&mut r, ns::JABBER_CLIENT);
        assert_eq!(r.attr("id"), None);
    }

    #[test]
    fn header_attrs_skip_unset() {
        let header = StreamHeader::client("example.org");
        let attrs: Vec<_> = header.attrs().collect();
        assert_eq!(attrs, vec![("to", "example.org"), ("version", "1.0")]);
    }
}
