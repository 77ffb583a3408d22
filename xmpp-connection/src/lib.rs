// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Connection establishment and stream negotiation for
//! [XMPP](https://xmpp.org/) clients, with asynchronous I/O using
//! [tokio](https://tokio.rs/).
//!
//! This crate turns a service domain into a live XML stream and keeps that
//! stream healthy: it discovers and tries the candidate hosts, secures and
//! compresses the channel, keeps elements in order in both directions,
//! tracks stanza acknowledgements and shuts the stream down within bounded
//! time. Authentication, resource binding and the stanza payloads
//! themselves belong to the layer above, which plugs in as a [`Session`].
//!
//! # Getting started
//!
//! Implement [`Session`], build a [`ConnectionConfiguration`] and hand both
//! to a [`connect::SocketConnector`] (or, with the `websocket` feature, a
//! `websocket::WebSocketConnector`). The resulting [`Connection`] delivers
//! everything it receives to the session. You can find a complete example
//! in the `examples/connect.rs` file in the repository.
//!
//! # Features
//!
//! Supported transports:
//! - [x] Plaintext TCP upgraded with STARTTLS (RFC 6120)
//! - [x] Direct TLS (XEP-0368)
//! - [x] HTTP CONNECT and SOCKS5 proxies
//! - [x] Custom transports via [`Connection::new`]
//! - [x] WebSocket (RFC 7395), with ping-based liveness checks
//! - [ ] BOSH
//!
//! Stream features:
//! - [x] STARTTLS
//! - [x] Stream compression with zlib (XEP-0138)
//! - [x] Stream management acknowledgements (XEP-0198)
//!
//! Cargo features:
//! - `dns` (default): SRV and TXT discovery with `hickory-resolver`
//! - `websocket` (default): the WebSocket transport
//! - `rustls-native-certs` (default) and `webpki-roots`: trust anchors for
//!   the default TLS configuration

#![deny(unsafe_code, missing_docs, bare_trait_objects)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod codec;
pub mod compression;
pub mod config;
pub mod connect;
mod connection;
pub mod element;
pub mod negotiation;
pub mod ns;
pub mod session;
pub mod stream_management;
pub mod tls;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(test)]
mod test_util;

/// Detailed error types
pub mod error;

#[doc(inline)]
/// Generic xmpp-connection Error
pub use crate::error::Error;

pub use crate::config::{ChannelEncryption, ConnectionConfiguration};
pub use crate::connection::Connection;
pub use crate::element::StreamElement;
pub use crate::session::{Session, SessionStatus};

// Re-exports
pub use minidom;
