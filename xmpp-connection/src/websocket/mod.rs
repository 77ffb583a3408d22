// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # XMPP over WebSocket
//!
//! [RFC 7395](https://www.rfc-editor.org/rfc/rfc7395) transport. The
//! endpoint is discovered through the `_xmppconnect` TXT record of the
//! domain ([XEP-0156](https://xmpp.org/extensions/xep-0156.html)) or built
//! from the configuration.
//!
//! Every WebSocket text message carries whole elements, so there is no
//! stream-level framing and no channel upgrade. Liveness is checked with
//! transport-level pings when a ping interval is configured.

use core::fmt::Write as _;
use std::io;
use std::net::Ipv6Addr;
use std::sync::{Arc, Weak};

use http::header::SEC_WEBSOCKET_PROTOCOL;
use http::HeaderValue;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{Connector, WebSocketStream};

use crate::codec::{websocket_codec_factory, CodecFactory};
use crate::config::{ChannelEncryption, ConnectionConfiguration};
use crate::connect::dns::{self, DefaultResolver, Resolver};
use crate::connection::{Connection, Shared};
use crate::error::{ConnectError, TlsError};
use crate::session::Session;
use crate::tls::default_client_config;
use crate::Error;

mod ping;
mod stream;


/// Owner name of the XEP-0156 TXT record, relative to the domain.
pub const TXT_XMPPCONNECT: &str = "_xmppconnect";

/// TXT attribute holding the WebSocket endpoint.
pub const TXT_WEBSOCKET_ATTRIBUTE: &str = "_xmpp-client-websocket";

/// Port of constructed `ws://` endpoints.
pub const DEFAULT_WS_PORT: u16 = 5280;

/// Port of constructed `wss://` endpoints.
pub const DEFAULT_WSS_PORT: u16 = 5281;

/// The WebSocket subprotocol of XMPP.
pub const SUBPROTOCOL: &str = "xmpp";

/// Connects to an XMPP service over WebSocket.
pub struct WebSocketConnector<R: Resolver = DefaultResolver> {
    config: Arc<ConnectionConfiguration>,
    resolver: R,
    codec_factory: CodecFactory,
}

impl WebSocketConnector {
    /// Connector using the system resolver.
    pub fn new(config: Arc<ConnectionConfiguration>) -> Self {
        Self::with_resolver(config, DefaultResolver::default())
    }
}

impl<R: Resolver> WebSocketConnector<R> {
    /// Connector with a custom DNS implementation.
    pub fn with_resolver(config: Arc<ConnectionConfiguration>, resolver: R) -> Self {
        Self {
            config,
            resolver,
            codec_factory: websocket_codec_factory(),
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

    /// The URL to connect to.
    ///
    /// An endpoint advertised in DNS is used as is. Otherwise the URL is
    /// built from the hostname (or domain), the port and the configured
    /// path; the scheme is `wss` only under
    /// [`ChannelEncryption::Direct`].
    pub async fn endpoint(&self) -> String {
        if !dns::has_fixed_target(&self.config) {
            if let Some(url) = self.discover().await {
                log::debug!("Using advertised WebSocket endpoint {}", url);
                return url;
            }
        }
        constructed_endpoint(&self.config)
    }

    async fn discover(&self) -> Option<String> {
        let domain = dns::ascii_domain(self.config.domain())?;
        let name = format!("{}.{}.", TXT_XMPPCONNECT, domain);
        match self.resolver.lookup_txt(&name).await {
            Ok(records) => records
                .into_iter()
                .find_map(|mut record| record.remove(TXT_WEBSOCKET_ATTRIBUTE)),
            Err(e) => {
                log::debug!("TXT lookup of {} failed: {}", name, e);
                None
            }
        }
    }

    /// Connect and wrap the WebSocket in a [`Connection`] serving
    /// `session`.
    ///
    /// The handshake is bounded by the connect timeout. The stream is not
    /// opened yet; see [`Connection::open`].
    pub async fn connect(&self, session: Weak<dyn Session>) -> Result<Connection, Error> {
        let url = self.endpoint().await;
        let secure = url.starts_with("wss:");
        let mode = self.config.channel_encryption();
        if !secure && matches!(mode, ChannelEncryption::Required | ChannelEncryption::Direct) {
            log::warn!("Refusing unencrypted WebSocket endpoint {}", url);
            return Err(TlsError::NotOffered.into());
        }

        let mut request = url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        let connector = if secure {
            let tls = match self.config.tls_config() {
                Some(custom) => custom.clone(),
                None => Arc::new(default_client_config()?),
            };
            Connector::Rustls(tls)
        } else {
            Connector::Plain
        };

        log::debug!("Connecting to {}", url);
        let handshake =
            tokio_tungstenite::connect_async_tls_with_config(request, None, true, Some(connector));
        let mut errors = ConnectError::new();
        let ws = match tokio::time::timeout(self.config.connect_timeout(), handshake).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(WsError::Io(e))) => {
                log::debug!("Connection to {} failed: {}", url, e);
                errors.push(url, e);
                return Err(errors.into());
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                log::debug!("Connection to {} timed out", url);
                errors.push(
                    url,
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                );
                return Err(errors.into());
            }
        };
        log::debug!("Connected to {}", url);
        Ok(connection(
            ws,
            self.config.clone(),
            session,
            secure,
            &self.codec_factory,
        ))
    }
}

fn constructed_endpoint(config: &ConnectionConfiguration) -> String {
    let host = config.hostname().unwrap_or(config.domain());
    let (scheme, default_port) = match config.channel_encryption() {
        ChannelEncryption::Direct => ("wss", DEFAULT_WSS_PORT),
        _ => ("ws", DEFAULT_WS_PORT),
    };
    let port = if config.has_port_override() {
        config.port()
    } else {
        default_port
    };
    let mut url = format!("{}://", scheme);
    if host.parse::<Ipv6Addr>().is_ok() {
        let _ = write!(url, "[{}]", host);
    } else {
        url.push_str(host);
    }
    let _ = write!(url, ":{}{}", port, config.web_socket_path());
    url
}

/// Run a connection on an established WebSocket.
///
/// `secure` tells whether the WebSocket runs over TLS. Must be called
/// within a tokio runtime.
pub fn connection<S>(
    ws: WebSocketStream<S>,
    config: Arc<ConnectionConfiguration>,
    session: Weak<dyn Session>,
    secure: bool,
    codec_factory: &CodecFactory,
) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let shared = Shared::new(config, session, secure);
    let writer_tx = stream::spawn(ws, shared.clone(), codec_factory);
    Connection::from_parts(shared, writer_tx)
}
