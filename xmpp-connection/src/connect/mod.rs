// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Establishing the byte channel of a socket [`Connection`].
//!
//! Candidates are tried strictly one after another. Every attempt is
//! bounded by the connect timeout; a failed attempt moves on to the next
//! candidate right away.

use core::future::Future;
use std::io;
use std::sync::{Arc, Weak};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{xmpp_codec_factory, CodecFactory};
use crate::config::ConnectionConfiguration;
use crate::connection::Connection;
use crate::error::ConnectError;
use crate::negotiation::default_negotiators;
use crate::session::Session;
use crate::tls;
use crate::Error;

pub mod dns;
mod proxy;
mod tcp;

pub use dns::{Candidate, DefaultResolver, Resolver, SrvRecord};
pub use tcp::TcpDialer;

/// A duplex byte stream a [`Connection`] can run on.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// The type-erased channel of a connection.
pub type BoxedStream = Box<dyn AsyncReadAndWrite>;

/// Opens low-level connections.
pub trait Dialer: Send + Sync + 'static {
    /// Connect to `host` on `port`.
    fn dial(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = io::Result<BoxedStream>> + Send;
}

/// Connects to an XMPP service over TCP (optionally through a proxy),
/// with DNS service discovery and direct TLS.
pub struct SocketConnector<R: Resolver = DefaultResolver, D: Dialer = TcpDialer> {
    config: Arc<ConnectionConfiguration>,
    resolver: R,
    dialer: D,
    codec_factory: CodecFactory,
}

impl SocketConnector {
    /// Connector using the system resolver and plain TCP (or the
    /// configured proxy).
    pub fn new(config: Arc<ConnectionConfiguration>) -> Self {
        let dialer = TcpDialer::new(config.proxy().cloned());
        Self::with_parts(config, DefaultResolver::default(), dialer)
    }
}

impl<R: Resolver, D: Dialer> SocketConnector<R, D> {
    /// Connector with custom DNS and connect implementations.
    pub fn with_parts(config: Arc<ConnectionConfiguration>, resolver: R, dialer: D) -> Self {
        Self {
            config,
            resolver,
            dialer,
            codec_factory: xmpp_codec_factory(),
        }
    }

    /// Use a different codec for the connections made.
    pub fn codec_factory(mut self, codec_factory: CodecFactory) -> Self {
        self.codec_factory = codec_factory;
        self
    }

    /// The configuration connections are made with.
    pub fn config(&self) -> &Arc<ConnectionConfiguration> {
        &self.config
    }

    /// Connect and wrap the channel in a [`Connection`] serving
    /// `session`.
    ///
    /// The stream is not opened yet; see [`Connection::open`]. No retries
    /// are made beyond the candidate list.
    pub async fn connect(&self, session: Weak<dyn Session>) -> Result<Connection, Error> {
        let (stream, secure) = self.establish().await?;
        Ok(Connection::with_parts(
            stream,
            self.config.clone(),
            session,
            secure,
            &self.codec_factory,
            default_negotiators(&self.config),
        ))
    }

    /// Produce a connected channel and whether it is already encrypted.
    pub async fn establish(&self) -> Result<(BoxedStream, bool), Error> {
        let mut errors = ConnectError::new();
        let fallback = dns::fallback_candidate(&self.config);
        if dns::has_fixed_target(&self.config) {
            log::debug!("Connecting to fixed target {}", fallback);
            return match self.attempt(&fallback, &mut errors).await? {
                Some(result) => Ok(result),
                None => Err(errors.into()),
            };
        }

        let candidates = dns::resolve_candidates(&self.resolver, &self.config).await;
        if candidates.is_empty() {
            log::debug!(
                "No service records for {}, using the domain itself",
                self.config.domain()
            );
        }
        for candidate in candidates.iter().chain(core::iter::once(&fallback)) {
            if let Some(result) = self.attempt(candidate, &mut errors).await? {
                return Ok(result);
            }
        }
        log::debug!("Exhausted all candidates: {}", errors);
        Err(errors.into())
    }

    /// Try one candidate. Connect failures are recorded and yield `None`;
    /// a TLS failure on a direct-TLS candidate is fatal.
    async fn attempt(
        &self,
        candidate: &Candidate,
        errors: &mut ConnectError,
    ) -> Result<Option<(BoxedStream, bool)>, Error> {
        log::debug!("Connecting to {}", candidate);
        let dial = self.dialer.dial(&candidate.host, candidate.port);
        let stream = match tokio::time::timeout(self.config.connect_timeout(), dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                log::debug!("Connection to {} failed: {}", candidate, e);
                errors.push(candidate.to_string(), e);
                return Ok(None);
            }
            Err(_) => {
                log::debug!("Connection to {} timed out", candidate);
                errors.push(
                    candidate.to_string(),
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                );
                return Ok(None);
            }
        };
        log::debug!("Connected to {}", candidate);
        if candidate.direct_tls {
            let stream = tls::upgrade(stream, &self.config, true).await?;
            Ok(Some((stream, true)))
        } else {
            Ok(Some((stream, false)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelEncryption;
    use crate::error::TlsError;
    use crate::test_util::{empty_trust_config, DialOutcome, MockDialer, MockResolver};
    use core::time::Duration;

    fn record(target: &str, priority: u16) -> SrvRecord {
        SrvRecord {
            target: target.to_owned(),
            port: 5222,
            priority,
            weight: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tries_candidates_in_order_until_one_accepts() {
        let resolver = MockResolver::default().srv(
            "_xmpp-client._tcp.example.org.",
            vec![
                record("c3.example.org.", 30),
                record("c1.example.org.", 10),
                record("c2.example.org.", 20),
            ],
        );
        let dialer = MockDialer::default()
            .outcome("c1.example.org", DialOutcome::Refuse)
            .outcome("c2.example.org", DialOutcome::Hang)
            .outcome("c3.example.org", DialOutcome::Accept);
        let config = ConnectionConfiguration::builder("example.org")
            .channel_encryption(ChannelEncryption::Disabled)
            .connect_timeout(Duration::from_secs(3))
            .build()
            .unwrap();
        let connector = SocketConnector::with_parts(Arc::new(config), resolver, dialer);
        let (_stream, secure) = connector.establish().await.unwrap();
        assert!(!secure);
        assert_eq!(
            connector.dialer.attempts(),
            vec![
                "c1.example.org:5222".to_owned(),
                "c2.example.org:5222".to_owned(),
                "c3.example.org:5222".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn root_marker_falls_through_to_domain() {
        let resolver = MockResolver::default()
            .srv("_xmpp-client._tcp.example.org.", vec![record(".", 0)]);
        let dialer = MockDialer::default().outcome("example.org", DialOutcome::Accept);
        let config = ConnectionConfiguration::builder("example.org")
            .channel_encryption(ChannelEncryption::Disabled)
            .build()
            .unwrap();
        let connector = SocketConnector::with_parts(Arc::new(config), resolver, dialer);
        connector.establish().await.unwrap();
        assert_eq!(
            connector.dialer.attempts(),
            vec!["example.org:5222".to_owned()]
        );
    }

    #[tokio::test]
    async fn exhaustion_is_aggregated() {
        let resolver = MockResolver::default().srv(
            "_xmpp-client._tcp.example.org.",
            vec![record("a.example.org.", 0)],
        );
        let config = ConnectionConfiguration::builder("example.org")
            .channel_encryption(ChannelEncryption::Disabled)
            .build()
            .unwrap();
        let connector =
            SocketConnector::with_parts(Arc::new(config), resolver, MockDialer::default());
        match connector.establish().await {
            Err(Error::Connect(e)) => {
                let targets: Vec<_> = e.attempts().iter().map(|(t, _)| t.as_str()).collect();
                assert_eq!(targets, vec!["a.example.org:5222", "example.org:5222"]);
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connect unexpectedly succeeded"),
        }
    }

    #[tokio::test]
    async fn hostname_override_is_the_only_attempt() {
        let resolver = MockResolver::default();
        let config = ConnectionConfiguration::builder("example.org")
            .hostname("xmpp.example.net")
            .port(5280)
            .build()
            .unwrap();
        let connector =
            SocketConnector::with_parts(Arc::new(config), resolver, MockDialer::default());
        assert!(matches!(connector.establish().await, Err(Error::Connect(_))));
        assert_eq!(
            connector.dialer.attempts(),
            vec!["xmpp.example.net:5280".to_owned()]
        );
        assert!(connector.resolver.srv_queries().is_empty());
    }

    #[tokio::test]
    async fn direct_tls_failure_is_fatal() {
        let resolver = MockResolver::default().srv(
            "_xmpps-client._tcp.example.org.",
            vec![record("direct.example.org.", 0)],
        );
        // The accepting peer never speaks TLS and hangs up.
        let dialer = MockDialer::default()
            .outcome("direct.example.org", DialOutcome::AcceptAndClose)
            .outcome("example.org", DialOutcome::Accept);
        let config = ConnectionConfiguration::builder("example.org")
            .channel_encryption(ChannelEncryption::Direct)
            .tls_config(empty_trust_config())
            .build()
            .unwrap();
        let connector = SocketConnector::with_parts(Arc::new(config), resolver, dialer);
        assert!(matches!(
            connector.establish().await,
            Err(Error::Tls(TlsError::Handshake(_)))
        ));
        assert_eq!(
            connector.dialer.attempts(),
            vec!["direct.example.org:5222".to_owned()]
        );
    }
}
