// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Interface to the session layer sitting above a connection.

use crate::element::StreamElement;
use crate::Error;

/// Lifecycle state of a session, as reported to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Not connected yet.
    Initial,
    /// Transport connection in progress.
    Connecting,
    /// Stream established, negotiation in progress.
    Connected,
    /// Authentication in progress.
    Authenticating,
    /// Authenticated and usable.
    Authenticated,
    /// Close requested locally.
    Closing,
    /// Closed gracefully.
    Closed,
    /// Connection lost.
    Disconnected,
}

impl SessionStatus {
    /// Whether whitespace keepalives should be sent in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Authenticating | Self::Authenticated
        )
    }
}

/// The session a [`Connection`](crate::Connection) serves.
///
/// The connection only keeps a weak reference to its session. All methods
/// are called from the connection's tasks and must not block.
pub trait Session: Send + Sync + 'static {
    /// Report a fatal error. Called at most once per connection, after
    /// which the connection shuts down.
    fn notify_exception(&self, error: Error);

    /// Deliver an inbound element, in arrival order.
    ///
    /// Return `true` to have the connection restart the stream (e.g.
    /// after successful SASL authentication): decoder state is discarded
    /// and a new stream header is sent.
    fn handle_element(&self, element: StreamElement) -> bool;

    /// The XMPP service domain.
    fn domain(&self) -> &str;

    /// Current lifecycle state.
    fn status(&self) -> SessionStatus;
}
