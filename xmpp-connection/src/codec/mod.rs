// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Conversion between stream elements and bytes.
//!
//! A [`Codec`] is stateful: the stream header establishes the namespace
//! context of everything that follows it. A stream restart therefore
//! requires a [`Codec::reset`].

use core::fmt;
use std::error::Error as StdError;
use std::sync::Arc;

use bytes::BytesMut;

use crate::element::StreamElement;

mod framing;
mod stream;
mod xml;

pub use framing::WebSocketCodec;
pub use stream::{XmppCodec, DEFAULT_MAX_ELEMENT_SIZE};

/// Errors produced while decoding or encoding.
#[derive(Debug)]
pub enum CodecError {
    /// The input is not well-formed XML.
    Xml(quick_xml::Error),
    /// Names, attribute values or text are not valid UTF-8.
    Utf8(core::str::Utf8Error),
    /// The input uses XML constructs forbidden in XMPP streams (comments,
    /// processing instructions, DTDs).
    RestrictedXml,
    /// A namespace prefix was used without being declared.
    UnboundPrefix(String),
    /// The stream header is invalid.
    InvalidStreamHeader(String),
    /// Something other than a stream header arrived before the stream
    /// header.
    MissingStreamHeader,
    /// An end tag without a matching start tag.
    UnexpectedEndTag,
    /// An end tag whose name differs from the element it closes.
    MismatchedEndTag {
        /// Name of the open element.
        expected: String,
        /// Name in the end tag.
        found: String,
    },
    /// A single element exceeds the configured size limit.
    TooLarge(usize),
    /// Non-whitespace text at the top level of the stream.
    UnexpectedText,
    /// An element cannot be represented with this codec.
    Unsupported(&'static str),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Xml(e) => write!(f, "XML error: {}", e),
            Self::Utf8(e) => write!(f, "invalid UTF-8: {}", e),
            Self::RestrictedXml => write!(f, "restricted XML construct"),
            Self::UnboundPrefix(p) => write!(f, "unbound namespace prefix {:?}", p),
            Self::InvalidStreamHeader(e) => write!(f, "invalid stream header: {}", e),
            Self::MissingStreamHeader => write!(f, "expected stream header"),
            Self::UnexpectedEndTag => write!(f, "unexpected end tag"),
            Self::MismatchedEndTag { expected, found } => {
                write!(f, "end tag </{}> does not close <{}>", found, expected)
            }
            Self::TooLarge(limit) => write!(f, "element exceeds {} bytes", limit),
            Self::UnexpectedText => write!(f, "text at stream level"),
            Self::Unsupported(what) => write!(f, "cannot encode {}", what),
        }
    }
}

impl StdError for CodecError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Xml(e) => Some(e),
            Self::Utf8(e) => Some(e),
            _ => None,
        }
    }
}

impl From<quick_xml::Error> for CodecError {
    fn from(e: quick_xml::Error) -> Self {
        Self::Xml(e)
    }
}

impl From<quick_xml::events::attributes::AttrError> for CodecError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        Self::Xml(e.into())
    }
}

impl From<core::str::Utf8Error> for CodecError {
    fn from(e: core::str::Utf8Error) -> Self {
        Self::Utf8(e)
    }
}

/// Converts between [`StreamElement`]s and bytes.
pub trait Codec: Send + 'static {
    /// Decode the next element from `src`, consuming its bytes.
    ///
    /// Returns `Ok(None)` if `src` does not hold a complete element yet;
    /// the caller appends more bytes and calls again.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<StreamElement>, CodecError>;

    /// Append the serialisation of `item` to `dst`.
    fn encode(&mut self, item: &StreamElement, dst: &mut BytesMut) -> Result<(), CodecError>;

    /// Discard all state, as required by a stream restart.
    fn reset(&mut self);
}

/// Creates fresh codec instances; a connection needs one for each
/// direction.
pub type CodecFactory = Arc<dyn Fn() -> Box<dyn Codec> + Send + Sync>;

/// Factory for the default codec of TCP streams.
pub fn xmpp_codec_factory() -> CodecFactory {
    Arc::new(|| Box::new(XmppCodec::new()))
}

/// Factory for the RFC 7395 WebSocket codec.
pub fn websocket_codec_factory() -> CodecFactory {
    Arc::new(|| Box::new(WebSocketCodec::new()))
}
