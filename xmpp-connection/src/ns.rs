// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XML namespaces used by the connection engine.

/// Default namespace of client-to-server streams
pub const JABBER_CLIENT: &str = "jabber:client";

/// Namespace of the `<stream:stream/>` element and its direct control
/// children (`features`, `error`)
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// RFC 6120 stream error conditions
pub const XMPP_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// RFC 6120 STARTTLS
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// XEP-0138 stream feature
pub const FEATURE_COMPRESS: &str = "http://jabber.org/features/compress";

/// XEP-0138 negotiation protocol
pub const COMPRESS: &str = "http://jabber.org/protocol/compress";

/// XEP-0198 Stream Management
pub const SM: &str = "urn:xmpp:sm:3";

/// RFC 7395 WebSocket framing
pub const FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";

/// The `xml:` prefix, which is bound by definition
pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
