// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use bytes::{Buf, BytesMut};
use minidom::Element;

use super::xml::{self, Item, NsScope};
use super::{Codec, CodecError};
use crate::element::{StreamElement, StreamError, StreamFeatures};
use crate::ns;

/// Largest top-level element [`XmppCodec`] buffers by default.
pub const DEFAULT_MAX_ELEMENT_SIZE: usize = 1024 * 1024;

/// Codec for RFC 6120 XML streams over a byte channel.
///
/// The whole session is one XML document rooted at `<stream:stream>`;
/// each top-level child is decoded into one [`StreamElement`].
#[derive(Debug)]
pub struct XmppCodec {
    default_ns: String,
    /// Namespace context of the peer's stream header, once received.
    scope: Option<NsScope>,
    max_element_size: usize,
    /// Length of the input last found not to hold a complete element.
    scanned: usize,
}

impl Default for XmppCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl XmppCodec {
    /// Codec for client-to-server streams (`jabber:client`).
    pub fn new() -> Self {
        Self::with_default_ns(ns::JABBER_CLIENT)
    }

    /// Codec for streams with a different default namespace.
    pub fn with_default_ns(default_ns: &str) -> Self {
        Self {
            default_ns: default_ns.to_owned(),
            scope: None,
            max_element_size: DEFAULT_MAX_ELEMENT_SIZE,
            scanned: 0,
        }
    }

    /// Fail with [`CodecError::TooLarge`] once an incomplete element
    /// occupies more than `limit` bytes.
    pub fn max_element_size(mut self, limit: usize) -> Self {
        self.max_element_size = limit;
        self
    }

    fn incomplete(&mut self, len: usize) -> Result<Option<StreamElement>, CodecError> {
        if len > self.max_element_size {
            return Err(CodecError::TooLarge(self.max_element_size));
        }
        self.scanned = len;
        Ok(None)
    }
}

/// Sort a top-level element in the stream namespace into its variant.
pub(super) fn classify(el: Element) -> StreamElement {
    if el.is("features", ns::STREAM) {
        StreamElement::Features(StreamFeatures(el))
    } else if el.is("error", ns::STREAM) {
        StreamElement::Error(StreamError::from_element(&el))
    } else {
        StreamElement::Payload(el)
    }
}

impl Codec for XmppCodec {
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<StreamElement>, CodecError> {
        // Whitespace keepalives between top-level elements (RFC 6120,
        // section 4.6.1).
        let whitespace = xml::leading_whitespace(src);
        if whitespace > 0 {
            src.advance(whitespace);
            self.scanned = 0;
        }
        if src.is_empty() {
            return Ok(None);
        }
        // Every element ends with '>'; without a new one, parsing the
        // buffer again cannot complete anything.
        if self.scanned > 0 {
            if let Some(new) = src.get(self.scanned..) {
                if !new.contains(&b'>') {
                    return self.incomplete(src.len());
                }
            }
        }

        let initial;
        let scope = match &self.scope {
            Some(scope) => scope,
            None => {
                initial = NsScope::new(&self.default_ns);
                &initial
            }
        };
        let (item, consumed) = match xml::next_item(src, scope, true)? {
            Some(v) => v,
            None => return self.incomplete(src.len()),
        };
        src.advance(consumed);
        self.scanned = 0;

        match item {
            Item::StreamStart(header, scope) => {
                if self.scope.is_some() {
                    return Err(CodecError::InvalidStreamHeader(
                        "stream header received twice".to_owned(),
                    ));
                }
                self.scope = Some(scope);
                Ok(Some(StreamElement::Open(header)))
            }
            Item::StreamEnd => Ok(Some(StreamElement::Close)),
            Item::Element(_) if self.scope.is_none() => Err(CodecError::MissingStreamHeader),
            Item::Element(el) => Ok(Some(classify(el))),
        }
    }

    fn encode(&mut self, item: &StreamElement, dst: &mut BytesMut) -> Result<(), CodecError> {
        let mut out = String::new();
        match item {
            StreamElement::Open(header) => {
                out.push_str("<?xml version='1.0'?><stream:stream");
                xml::push_attr(&mut out, "xmlns", &self.default_ns);
                xml::push_attr(&mut out, "xmlns:stream", ns::STREAM);
                for (key, value) in header.attrs() {
                    xml::push_attr(&mut out, key, value);
                }
                out.push('>');
            }
            StreamElement::Close => out.push_str("</stream:stream>"),
            StreamElement::Error(error) => {
                out.push_str("<stream:error>");
                for child in error.children() {
                    xml::write_element(&child, ns::STREAM, &mut out);
                }
                out.push_str("</stream:error>");
            }
            StreamElement::Features(features) => {
                out.push_str("<stream:features>");
                for child in features.0.children() {
                    xml::write_element(child, ns::STREAM, &mut out);
                }
                out.push_str("</stream:features>");
            }
            StreamElement::Payload(el) => xml::write_element(el, &self.default_ns, &mut out),
        }
        dst.extend_from_slice(out.as_bytes());
        Ok(())
    }

    fn reset(&mut self) {
        self.scope = None;
        self.scanned = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{DefinedCondition, StreamHeader};

    const HEADER: &[u8] = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='abc' from='example.org' version='1.0' xml:lang='en'>";

    #[test]
    fn decodes_a_stream_in_pieces() {
        let mut codec = XmppCodec::new();
        let mut buf = BytesMut::new();
        let mut full = HEADER.to_vec();
        full.extend_from_slice(b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features> \n<message type='chat'><body>hi</body></message></stream:stream>");

        let mut decoded = Vec::new();
        for chunk in full.chunks(7) {
            buf.extend_from_slice(chunk);
            while let Some(el) = codec.decode(&mut buf).unwrap() {
                decoded.push(el);
            }
        }
        assert!(buf.is_empty());
        assert_eq!(decoded.len(), 4);
        match &decoded[0] {
            StreamElement::Open(header) => {
                assert_eq!(header.id.as_deref(), Some("abc"));
                assert_eq!(header.from.as_deref(), Some("example.org"));
                assert_eq!(header.lang.as_deref(), Some("en"));
            }
            other => panic!("unexpected element: {:?}", other),
        }
        match &decoded[1] {
            StreamElement::Features(f) => assert!(f.offers("starttls", ns::TLS)),
            other => panic!("unexpected element: {:?}", other),
        }
        match &decoded[2] {
            StreamElement::Payload(el) => {
                assert!(el.is("message", ns::JABBER_CLIENT));
                assert_eq!(
                    el.get_child("body", ns::JABBER_CLIENT).unwrap().text(),
                    "hi"
                );
            }
            other => panic!("unexpected element: {:?}", other),
        }
        assert_eq!(decoded[3], StreamElement::Close);
    }

    #[test]
    fn decodes_stream_errors() {
        let mut codec = XmppCodec::new();
        let mut buf = BytesMut::from(HEADER);
        buf.extend_from_slice(b"<stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>");
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(StreamElement::Open(_))
        ));
        match codec.decode(&mut buf).unwrap() {
            Some(StreamElement::Error(e)) => assert_eq!(e.condition, DefinedCondition::Conflict),
            other => panic!("unexpected element: {:?}", other),
        }
    }

    #[test]
    fn mismatched_end_tags_are_rejected() {
        let mut codec = XmppCodec::new();
        let mut buf = BytesMut::from(HEADER);
        buf.extend_from_slice(b"<message><body>hi</foo></bar>");
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(StreamElement::Open(_))
        ));
        match codec.decode(&mut buf) {
            Err(CodecError::MismatchedEndTag { expected, found }) => {
                assert_eq!(expected, "body");
                assert_eq!(found, "foo");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn prefixed_end_tags_must_match_too() {
        let mut codec = XmppCodec::new();
        let mut buf = BytesMut::from(HEADER);
        buf.extend_from_slice(b"<stream:features></features>");
        codec.decode(&mut buf).unwrap();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::MismatchedEndTag { .. })
        ));
    }

    #[test]
    fn oversized_elements_are_refused() {
        let mut codec = XmppCodec::new().max_element_size(64);
        let mut buf = BytesMut::from(HEADER);
        codec.decode(&mut buf).unwrap();

        buf.extend_from_slice(b"<message><body>");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        for _ in 0..4 {
            buf.extend_from_slice(b"0123456789");
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
        buf.extend_from_slice(b"0123456789abcdef");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::TooLarge(64))
        ));
    }

    #[test]
    fn elements_within_the_limit_pass() {
        let mut codec = XmppCodec::new().max_element_size(64);
        let mut buf = BytesMut::from(HEADER);
        codec.decode(&mut buf).unwrap();
        for chunk in [&b"<message><bo"[..], b"dy>0123456789", b"</body>", b"</message>"] {
            buf.extend_from_slice(chunk);
            if let Some(el) = codec.decode(&mut buf).unwrap() {
                match el {
                    StreamElement::Payload(el) => assert!(el.is("message", ns::JABBER_CLIENT)),
                    other => panic!("unexpected element: {:?}", other),
                }
                assert!(buf.is_empty());
                return;
            }
        }
        panic!("message was not decoded");
    }

    #[test]
    fn payload_before_header_is_rejected() {
        let mut codec = XmppCodec::new();
        let mut buf = BytesMut::from(&b"<presence/>"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::MissingStreamHeader)
        ));
    }

    #[test]
    fn reset_expects_a_new_header() {
        let mut codec = XmppCodec::new();
        let mut buf = BytesMut::from(HEADER);
        codec.decode(&mut buf).unwrap();
        codec.reset();
        buf.extend_from_slice(HEADER);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(StreamElement::Open(_))
        ));
    }

    #[test]
    fn encodes_header_and_stanzas() {
        let mut codec = XmppCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                &StreamElement::Open(StreamHeader::client("example.org")),
                &mut buf,
            )
            .unwrap();
        codec
            .encode(
                &StreamElement::Payload(Element::builder("presence", ns::JABBER_CLIENT).build()),
                &mut buf,
            )
            .unwrap();
        codec
            .encode(
                &StreamElement::Payload(Element::builder("r", ns::SM).build()),
                &mut buf,
            )
            .unwrap();
        codec.encode(&StreamElement::Close, &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.org' version='1.0'><presence/><r xmlns='urn:xmpp:sm:3'/></stream:stream>"[..]
        );
    }

    #[test]
    fn encodes_stream_errors() {
        let mut codec = XmppCodec::new();
        let mut buf = BytesMut::new();
        let error = StreamError::new(DefinedCondition::UndefinedCondition);
        codec
            .encode(&StreamElement::Error(error), &mut buf)
            .unwrap();
        assert_eq!(
            &buf[..],
            &b"<stream:error><undefined-condition xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>"[..]
        );
    }
}
