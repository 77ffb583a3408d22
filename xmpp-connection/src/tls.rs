// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Secure channel establishment with rustls.

use std::io;
use std::sync::Arc;

use tokio_rustls::{
    rustls::pki_types::ServerName,
    rustls::{ClientConfig, RootCertStore},
    TlsConnector,
};

use crate::config::ConnectionConfiguration;
use crate::connect::BoxedStream;
use crate::error::TlsError;

/// ALPN protocol identifier for direct-TLS client connections (XEP-0368).
pub const ALPN_XMPP_CLIENT: &[u8] = b"xmpp-client";

/// Build a client configuration which verifies servers against the
/// platform trust store and/or the bundled webpki roots, depending on
/// enabled features.
pub fn default_client_config() -> Result<ClientConfig, TlsError> {
    #[allow(unused_mut)]
    let mut root_store = RootCertStore::empty();
    #[cfg(feature = "webpki-roots")]
    {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    #[cfg(feature = "rustls-native-certs")]
    {
        match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                let (added, ignored) = root_store.add_parsable_certificates(certs);
                log::debug!(
                    "Loaded {} platform root certificates ({} ignored)",
                    added,
                    ignored
                );
            }
            Err(e) => log::warn!("Could not load platform root certificates: {}", e),
        }
    }
    if root_store.is_empty() {
        log::warn!("No trusted root certificates available, server verification will fail");
    }
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(config)
}

/// Wrap `stream` in TLS, verifying the peer as `domain`.
///
/// The XMPP service domain, not the host name of the SRV target, is the
/// reference identity (RFC 6120, section 13.7.2). With `direct`, the
/// `xmpp-client` ALPN protocol is offered.
pub(crate) async fn upgrade(
    stream: BoxedStream,
    config: &ConnectionConfiguration,
    direct: bool,
) -> Result<BoxedStream, TlsError> {
    let domain = config.domain();
    let name = ServerName::try_from(domain.to_owned())
        .map_err(|_| TlsError::InvalidServerName(domain.to_owned()))?;

    let mut client_config = match config.tls_config() {
        Some(custom) => ClientConfig::clone(custom),
        None => default_client_config()?,
    };
    if direct {
        client_config.alpn_protocols = vec![ALPN_XMPP_CLIENT.to_vec()];
    }

    log::debug!("Starting TLS handshake with {}", domain);
    let connector = TlsConnector::from(Arc::new(client_config));
    let handshake = connector.connect(name, stream);
    let tls_stream = match tokio::time::timeout(config.connect_timeout(), handshake).await {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => return Err(TlsError::Handshake(e)),
        Err(_) => {
            return Err(TlsError::Handshake(io::Error::new(
                io::ErrorKind::TimedOut,
                "TLS handshake timed out",
            )))
        }
    };
    {
        let (_, connection) = tls_stream.get_ref();
        log::debug!(
            "TLS established with {} ({:?}, ALPN {:?})",
            domain,
            connection.protocol_version(),
            connection
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
        );
    }
    Ok(Box::new(tls_stream))
}
