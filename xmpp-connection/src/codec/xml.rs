// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Incremental tree building on top of `quick-xml`, and serialisation.

use std::collections::HashMap;

use minidom::{Element, Node};
use quick_xml::errors::SyntaxError;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::CodecError;
use crate::element::StreamHeader;
use crate::ns;

/// Namespace bindings in effect at some point of the document.
#[derive(Debug, Clone)]
pub(super) struct NsScope {
    default: String,
    prefixes: HashMap<String, String>,
}

impl NsScope {
    pub(super) fn new(default: &str) -> Self {
        let mut prefixes = HashMap::new();
        prefixes.insert("xml".to_owned(), ns::XML.to_owned());
        Self {
            default: default.to_owned(),
            prefixes,
        }
    }

    pub(super) fn default_ns(&self) -> &str {
        &self.default
    }

    fn resolve(&self, prefix: Option<&str>) -> Result<&str, CodecError> {
        match prefix {
            None => Ok(&self.default),
            Some(prefix) => self
                .prefixes
                .get(prefix)
                .map(String::as_str)
                .ok_or_else(|| CodecError::UnboundPrefix(prefix.to_owned())),
        }
    }
}

/// One complete top-level unit.
pub(super) enum Item {
    StreamStart(StreamHeader, NsScope),
    StreamEnd,
    Element(Element),
}

fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

/// Attributes of a start tag, with namespace declarations applied to a new
/// scope derived from `parent`.
fn scoped_attributes(
    start: &BytesStart,
    parent: &NsScope,
) -> Result<(NsScope, Vec<(String, String)>), CodecError> {
    let mut scope = parent.clone();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr?;
        let key = core::str::from_utf8(attr.key.as_ref())?;
        let value = attr.unescape_value()?.into_owned();
        if key == "xmlns" {
            scope.default = value;
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.prefixes.insert(prefix.to_owned(), value);
        } else {
            attrs.push((key.to_owned(), value));
        }
    }
    Ok((scope, attrs))
}

fn open_element(start: &BytesStart, parent: &NsScope) -> Result<(Element, NsScope), CodecError> {
    let (scope, attrs) = scoped_attributes(start, parent)?;
    let qname = core::str::from_utf8(start.name().as_ref())?.to_owned();
    let (prefix, local) = split_qname(&qname);
    let namespace = scope.resolve(prefix)?.to_owned();
    let mut el = Element::builder(local, namespace).build();
    for (key, value) in attrs {
        el.set_attr(key, value);
    }
    Ok((el, scope))
}

fn stream_header(start: &BytesStart, parent: &NsScope) -> Result<Item, CodecError> {
    let (scope, attrs) = scoped_attributes(start, parent)?;
    let name = start.name();
    let qname = core::str::from_utf8(name.as_ref())?;
    let (prefix, _) = split_qname(qname);
    if scope.resolve(prefix)? != ns::STREAM {
        return Err(CodecError::InvalidStreamHeader(format!(
            "<{}/> is not in the stream namespace",
            qname
        )));
    }
    let mut header = StreamHeader::default();
    for (key, value) in attrs {
        if !header.set_attr(&key, value) {
            log::debug!("Ignoring unknown stream header attribute {}", key);
        }
    }
    if let Some(version) = header.version.as_deref() {
        if !version.starts_with("1.") {
            return Err(CodecError::InvalidStreamHeader(format!(
                "unsupported version {}",
                version
            )));
        }
    }
    Ok(Item::StreamStart(header, scope))
}

fn is_stream_tag(start: &BytesStart) -> bool {
    start.local_name().as_ref() == b"stream"
}

/// Number of leading whitespace bytes.
pub(super) fn leading_whitespace(buf: &[u8]) -> usize {
    buf.iter()
        .position(|b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .unwrap_or(buf.len())
}

/// Parse the next complete top-level item from `buf`.
///
/// With `stream_framing`, a top-level `<stream:stream>` start tag and the
/// matching end tag are reported as [`Item::StreamStart`] and
/// [`Item::StreamEnd`]. Returns the item and the number of bytes it
/// occupied, or `None` if `buf` ends before the item does.
pub(super) fn next_item(
    buf: &[u8],
    scope: &NsScope,
    stream_framing: bool,
) -> Result<Option<(Item, usize)>, CodecError> {
    let mut reader = Reader::from_reader(buf);
    {
        let config = reader.config_mut();
        config.trim_text(false);
        config.check_end_names = false;
        // `</stream:stream>` closes a tag opened in an earlier buffer.
        config.allow_unmatched_ends = true;
        config.expand_empty_elements = false;
    }

    let mut stack: Vec<(Element, NsScope, String)> = Vec::new();
    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup)) => {
                return Err(CodecError::RestrictedXml)
            }
            // Any other syntax error is markup cut off by the end of the
            // buffer.
            Err(quick_xml::Error::Syntax(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let position = reader.buffer_position() as usize;
        match event {
            Event::Eof => return Ok(None),
            Event::Decl(_) => (),
            Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {
                return Err(CodecError::RestrictedXml)
            }
            Event::Start(start) => {
                if stack.is_empty() && stream_framing && is_stream_tag(&start) {
                    return Ok(Some((stream_header(&start, scope)?, position)));
                }
                let parent = stack.last().map(|(_, s, _)| s).unwrap_or(scope);
                let (el, child_scope) = open_element(&start, parent)?;
                let qname = core::str::from_utf8(start.name().as_ref())?.to_owned();
                stack.push((el, child_scope, qname));
            }
            Event::Empty(start) => {
                let parent = stack.last().map(|(_, s, _)| s).unwrap_or(scope);
                let (el, _) = open_element(&start, parent)?;
                match stack.last_mut() {
                    Some((parent, _, _)) => {
                        parent.append_child(el);
                    }
                    None => return Ok(Some((Item::Element(el), position))),
                }
            }
            Event::End(end) => match stack.pop() {
                Some((el, _, qname)) => {
                    if end.name().as_ref() != qname.as_bytes() {
                        return Err(CodecError::MismatchedEndTag {
                            expected: qname,
                            found: String::from_utf8_lossy(end.name().as_ref()).into_owned(),
                        });
                    }
                    match stack.last_mut() {
                        Some((parent, _, _)) => {
                            parent.append_child(el);
                        }
                        None => return Ok(Some((Item::Element(el), position))),
                    }
                }
                None if stream_framing => return Ok(Some((Item::StreamEnd, position))),
                None => return Err(CodecError::UnexpectedEndTag),
            },
            Event::Text(text) => {
                if position >= buf.len() {
                    // Possibly cut in the middle of an entity or a UTF-8
                    // sequence.
                    return Ok(None);
                }
                match stack.last_mut() {
                    Some((parent, _, _)) => {
                        parent.append_text_node(text.unescape()?.into_owned());
                    }
                    None => {
                        if leading_whitespace(&text) != text.len() {
                            return Err(CodecError::UnexpectedText);
                        }
                    }
                }
            }
            Event::CData(data) => match stack.last_mut() {
                Some((parent, _, _)) => {
                    parent.append_text_node(core::str::from_utf8(&data)?.to_owned());
                }
                None => return Err(CodecError::UnexpectedText),
            },
        }
    }
}

/// Serialise `el`, declaring its namespace only where it differs from
/// `parent_ns`.
pub(super) fn write_element(el: &Element, parent_ns: &str, out: &mut String) {
    let namespace = el.ns();
    out.push('<');
    out.push_str(el.name());
    if namespace != parent_ns {
        push_attr(out, "xmlns", &namespace);
    }
    for (key, value) in el.attrs() {
        push_attr(out, key, value);
    }
    let mut nodes = el.nodes().peekable();
    if nodes.peek().is_none() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for node in nodes {
        match node {
            Node::Element(child) => write_element(child, &namespace, out),
            Node::Text(text) => out.push_str(&escape(text.as_str())),
        }
    }
    out.push_str("</");
    out.push_str(el.name());
    out.push('>');
}

pub(super) fn push_attr(out: &mut String, key: &str, value: &str) {
    out.push(' ');
    out.push_str(key);
    out.push_str("='");
    out.push_str(&escape(value));
    out.push('\'');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_scope() -> NsScope {
        let mut scope = NsScope::new(ns::JABBER_CLIENT);
        scope
            .prefixes
            .insert("stream".to_owned(), ns::STREAM.to_owned());
        scope
    }

    #[test]
    fn incomplete_element_needs_more_data() {
        let scope = client_scope();
        let buf = b"<iq type='get'><query xmlns='jabber:iq:roster'>";
        assert!(next_item(buf, &scope, true).unwrap().is_none());
        let buf = b"<message><body>fish &am";
        assert!(next_item(buf, &scope, true).unwrap().is_none());
        let buf = b"<presence ty";
        assert!(next_item(buf, &scope, true).unwrap().is_none());
    }

    #[test]
    fn namespaces_are_inherited_and_overridden() {
        let scope = client_scope();
        let buf = b"<iq type='result' id='1'><query xmlns='jabber:iq:roster'><item jid='a@b'/></query></iq><pre";
        let (item, consumed) = next_item(buf, &scope, true).unwrap().unwrap();
        assert_eq!(&buf[consumed..], b"<pre");
        let el = match item {
            Item::Element(el) => el,
            _ => panic!("expected element"),
        };
        assert!(el.is("iq", ns::JABBER_CLIENT));
        assert_eq!(el.attr("id"), Some("1"));
        let query = el.get_child("query", "jabber:iq:roster").unwrap();
        assert!(query.get_child("item", "jabber:iq:roster").is_some());
    }

    #[test]
    fn prefixed_elements_resolve() {
        let scope = client_scope();
        let buf = b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>";
        let (item, consumed) = next_item(buf, &scope, true).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        match item {
            Item::Element(el) => {
                assert!(el.is("features", ns::STREAM));
                assert!(el.get_child("starttls", ns::TLS).is_some());
            }
            _ => panic!("expected element"),
        }
    }

    #[test]
    fn unbound_prefix_is_an_error() {
        let scope = client_scope();
        match next_item(b"<foo:bar/>", &scope, true) {
            Err(CodecError::UnboundPrefix(p)) => assert_eq!(p, "foo"),
            _ => panic!("expected unbound prefix error"),
        }
    }

    #[test]
    fn comments_are_rejected() {
        let scope = client_scope();
        assert!(matches!(
            next_item(b"<!-- hi --><presence/>", &scope, true),
            Err(CodecError::RestrictedXml)
        ));
    }

    #[test]
    fn text_is_escaped_on_output() {
        let el = Element::builder("message", ns::JABBER_CLIENT)
            .attr("to", "a'b@example")
            .append(Element::builder("body", ns::JABBER_CLIENT).append("1 < 2 & 3"))
            .build();
        let mut out = String::new();
        write_element(&el, ns::JABBER_CLIENT, &mut out);
        assert_eq!(
            out,
            "<message to='a&apos;b@example'><body>1 &lt; 2 &amp; 3</body></message>"
        );
    }
}
