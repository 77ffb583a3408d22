// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use bytes::{Buf, BytesMut};
use minidom::Element;

use super::stream::classify;
use super::xml::{self, Item, NsScope};
use super::{Codec, CodecError};
use crate::element::{StreamElement, StreamHeader};
use crate::ns;

/// Codec for RFC 7395 XMPP over WebSocket.
///
/// Every message is a standalone document; the stream header and footer
/// are replaced by `<open/>` and `<close/>` in the framing namespace.
#[derive(Debug)]
pub struct WebSocketCodec {
    scope: NsScope,
}

impl Default for WebSocketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketCodec {
    /// Create a codec for client-to-server streams.
    pub fn new() -> Self {
        Self {
            scope: NsScope::new(ns::JABBER_CLIENT),
        }
    }
}

fn header_from_open(el: &Element) -> StreamHeader {
    let mut header = StreamHeader::default();
    for (key, value) in el.attrs() {
        header.set_attr(key, value.to_owned());
    }
    header
}

impl Codec for WebSocketCodec {
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<StreamElement>, CodecError> {
        let whitespace = xml::leading_whitespace(src);
        src.advance(whitespace);
        if src.is_empty() {
            return Ok(None);
        }
        let (item, consumed) = match xml::next_item(src, &self.scope, false)? {
            Some(v) => v,
            None => return Ok(None),
        };
        src.advance(consumed);
        let el = match item {
            Item::Element(el) => el,
            Item::StreamStart(..) | Item::StreamEnd => {
                return Err(CodecError::InvalidStreamHeader(
                    "stream framing inside websocket message".to_owned(),
                ))
            }
        };
        if el.is("open", ns::FRAMING) {
            Ok(Some(StreamElement::Open(header_from_open(&el))))
        } else if el.is("close", ns::FRAMING) {
            if let Some(uri) = el.attr("see-other-uri") {
                log::info!("Peer closed the stream, redirecting to {}", uri);
            }
            Ok(Some(StreamElement::Close))
        } else {
            Ok(Some(classify(el)))
        }
    }

    fn encode(&mut self, item: &StreamElement, dst: &mut BytesMut) -> Result<(), CodecError> {
        let mut out = String::new();
        match item {
            StreamElement::Open(header) => {
                out.push_str("<open");
                xml::push_attr(&mut out, "xmlns", ns::FRAMING);
                for (key, value) in header.attrs() {
                    xml::push_attr(&mut out, key, value);
                }
                out.push_str("/>");
            }
            StreamElement::Close => {
                out.push_str("<close");
                xml::push_attr(&mut out, "xmlns", ns::FRAMING);
                out.push_str("/>");
            }
            StreamElement::Error(error) => {
                let el = Element::builder("error", ns::STREAM)
                    .append_all(error.children())
                    .build();
                xml::write_element(&el, "", &mut out);
            }
            StreamElement::Features(features) => xml::write_element(&features.0, "", &mut out),
            // Stanzas carry an explicit namespace in every message.
            StreamElement::Payload(el) => xml::write_element(el, "", &mut out),
        }
        dst.extend_from_slice(out.as_bytes());
        Ok(())
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_framing_elements() {
        let mut codec = WebSocketCodec::new();
        let mut buf = BytesMut::from(&b"<open xmlns='urn:ietf:params:xml:ns:xmpp-framing' from='example.org' id='s1' version='1.0' xml:lang='en'/>"[..]);
        match codec.decode(&mut buf).unwrap() {
            Some(StreamElement::Open(header)) => {
                assert_eq!(header.id.as_deref(), Some("s1"));
                assert_eq!(header.from.as_deref(), Some("example.org"));
            }
            other => panic!("unexpected element: {:?}", other),
        }
        assert!(buf.is_empty());

        buf.extend_from_slice(b"<features xmlns='http://etherx.jabber.org/streams'><sm xmlns='urn:xmpp:sm:3'/></features>");
        match codec.decode(&mut buf).unwrap() {
            Some(StreamElement::Features(f)) => assert!(f.can_stream_management()),
            other => panic!("unexpected element: {:?}", other),
        }

        buf.extend_from_slice(b"<close xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(StreamElement::Close));
    }

    #[test]
    fn multiple_elements_in_one_message() {
        let mut codec = WebSocketCodec::new();
        let mut buf = BytesMut::from(
            &b"<message xmlns='jabber:client'/><presence xmlns='jabber:client'/>"[..],
        );
        let mut n = 0;
        while let Some(el) = codec.decode(&mut buf).unwrap() {
            assert!(matches!(el, StreamElement::Payload(_)));
            n += 1;
        }
        assert_eq!(n, 2);
    }

    #[test]
    fn encodes_with_explicit_namespaces() {
        let mut codec = WebSocketCodec::new();
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
        codec.encode(&StreamElement::Close, &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &b"<open xmlns='urn:ietf:params:xml:ns:xmpp-framing' to='example.org' version='1.0'/><presence xmlns='jabber:client'/><close xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>"[..]
        );
    }
}
