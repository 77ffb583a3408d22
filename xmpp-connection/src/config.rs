// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Connection configuration.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use tokio_rustls::rustls::ClientConfig;

use crate::compression::CompressionMethod;
use crate::Error;

/// Default port for STARTTLS-style client connections
pub const DEFAULT_PORT: u16 = 5222;

/// Default port for direct-TLS client connections (XEP-0368)
pub const DEFAULT_DIRECT_TLS_PORT: u16 = 5223;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_WEB_SOCKET_PATH: &str = "/ws";

/// How the channel is to be encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelEncryption {
    /// Never encrypt. Fails if the server requires STARTTLS.
    Disabled,

    /// Use STARTTLS if the server offers it.
    #[default]
    Optional,

    /// Use STARTTLS and fail if the server does not offer it.
    Required,

    /// Establish TLS immediately after connecting (XEP-0368).
    Direct,
}

/// Kind of proxy to tunnel TCP connections through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// HTTP `CONNECT` proxy
    Http,
    /// SOCKS5 proxy, without authentication
    Socks5,
}

/// Proxy to tunnel TCP connections through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Kind of the proxy.
    pub kind: ProxyKind,
    /// Host name or address of the proxy.
    pub host: String,
    /// Port of the proxy.
    pub port: u16,
}

/// Immutable connection configuration.
///
/// Build it once with [`ConnectionConfiguration::builder`] and share it
/// (usually in an [`Arc`]) across reconnects.
#[derive(Clone)]
pub struct ConnectionConfiguration {
    domain: String,
    hostname: Option<String>,
    port: Option<u16>,
    proxy: Option<ProxyConfig>,
    channel_encryption: ChannelEncryption,
    tls_config: Option<Arc<ClientConfig>>,
    connect_timeout: Duration,
    compression_methods: Vec<CompressionMethod>,
    keep_alive_interval: Option<Duration>,
    web_socket_path: String,
    ping_interval: Option<Duration>,
    response_timeout: Duration,
    language: Option<String>,
    from: Option<String>,
}

impl fmt::Debug for ConnectionConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionConfiguration")
            .field("domain", &self.domain)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("proxy", &self.proxy)
            .field("channel_encryption", &self.channel_encryption)
            .field("tls_config", &self.tls_config.as_ref().map(|_| "custom"))
            .field("connect_timeout", &self.connect_timeout)
            .field("compression_methods", &self.compression_methods)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("web_socket_path", &self.web_socket_path)
            .field("ping_interval", &self.ping_interval)
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}

impl ConnectionConfiguration {
    /// Start building a configuration for the XMPP service at `domain`.
    pub fn builder<S: Into<String>>(domain: S) -> ConnectionConfigurationBuilder {
        ConnectionConfigurationBuilder {
            config: ConnectionConfiguration {
                domain: domain.into(),
                hostname: None,
                port: None,
                proxy: None,
                channel_encryption: ChannelEncryption::default(),
                tls_config: None,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                compression_methods: Vec::new(),
                keep_alive_interval: Some(DEFAULT_KEEP_ALIVE_INTERVAL),
                web_socket_path: DEFAULT_WEB_SOCKET_PATH.to_owned(),
                ping_interval: None,
                response_timeout: DEFAULT_RESPONSE_TIMEOUT,
                language: None,
                from: None,
            },
        }
    }

    /// The XMPP service domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Explicit host to connect to, bypassing DNS service discovery.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// The port to use when no service record dictates one.
    pub fn port(&self) -> u16 {
        match self.port {
            Some(port) => port,
            None if self.channel_encryption == ChannelEncryption::Direct => {
                DEFAULT_DIRECT_TLS_PORT
            }
            None => DEFAULT_PORT,
        }
    }

    /// Whether the port was set explicitly.
    pub fn has_port_override(&self) -> bool {
        self.port.is_some()
    }

    /// Proxy to tunnel TCP connections through.
    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// Channel encryption mode.
    pub fn channel_encryption(&self) -> ChannelEncryption {
        self.channel_encryption
    }

    /// Custom TLS client configuration, overriding trust roots and
    /// certificate verification.
    pub fn tls_config(&self) -> Option<&Arc<ClientConfig>> {
        self.tls_config.as_ref()
    }

    /// Timeout for each low-level connect attempt.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Compression methods, in order of preference. Empty if compression
    /// is disabled.
    pub fn compression_methods(&self) -> &[CompressionMethod] {
        &self.compression_methods
    }

    /// Interval of whitespace keepalives, if enabled.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive_interval
    }

    /// Path of the WebSocket endpoint when the URL is not discovered.
    pub fn web_socket_path(&self) -> &str {
        &self.web_socket_path
    }

    /// Interval of WebSocket pings, if enabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval
    }

    /// How long to wait for a response to a ping.
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// `xml:lang` sent in the stream header.
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// `from` sent in the stream header.
    pub fn from(&self) -> Option<&str> {
        self.from.as_deref()
    }
}

/// Builder for [`ConnectionConfiguration`].
pub struct ConnectionConfigurationBuilder {
    config: ConnectionConfiguration,
}

impl ConnectionConfigurationBuilder {
    /// Connect to this host instead of discovering hosts via DNS.
    pub fn hostname<S: Into<String>>(mut self, hostname: S) -> Self {
        self.config.hostname = Some(hostname.into());
        self
    }

    /// Port to use with a hostname override or as DNS fallback.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    /// Tunnel TCP connections through a proxy.
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    /// Set the channel encryption mode.
    pub fn channel_encryption(mut self, mode: ChannelEncryption) -> Self {
        self.config.channel_encryption = mode;
        self
    }

    /// Use a custom TLS client configuration. Its certificate verifier
    /// replaces the default verification against the platform roots.
    pub fn tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.config.tls_config = Some(config);
        self
    }

    /// Timeout for each low-level connect attempt.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Compression methods, in order of preference.
    pub fn compression_methods<I: IntoIterator<Item = CompressionMethod>>(
        mut self,
        methods: I,
    ) -> Self {
        self.config.compression_methods = methods.into_iter().collect();
        self
    }

    /// Interval of whitespace keepalives. `None` or zero disables them.
    pub fn keep_alive_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.keep_alive_interval = interval.filter(|d| !d.is_zero());
        self
    }

    /// Path of the WebSocket endpoint.
    pub fn web_socket_path<S: Into<String>>(mut self, path: S) -> Self {
        self.config.web_socket_path = path.into();
        self
    }

    /// Interval of WebSocket pings. `None` or zero disables them.
    pub fn ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.ping_interval = interval.filter(|d| !d.is_zero());
        self
    }

    /// How long to wait for responses (pongs).
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// `xml:lang` to send in the stream header.
    pub fn language<S: Into<String>>(mut self, lang: S) -> Self {
        self.config.language = Some(lang.into());
        self
    }

    /// `from` to send in the stream header.
    pub fn from<S: Into<String>>(mut self, from: S) -> Self {
        self.config.from = Some(from.into());
        self
    }

    /// Validate and finish the configuration.
    pub fn build(self) -> Result<ConnectionConfiguration, Error> {
        let config = self.config;
        if config.domain.is_empty() {
            return Err(Error::Config("domain must not be empty".to_owned()));
        }
        if config.connect_timeout.is_zero() {
            return Err(Error::Config("connect timeout must be positive".to_owned()));
        }
        if config.response_timeout.is_zero() {
            return Err(Error::Config("response timeout must be positive".to_owned()));
        }
        if !config.web_socket_path.starts_with('/') {
            return Err(Error::Config(format!(
                "websocket path must be absolute: {}",
                config.web_socket_path
            )));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_follows_encryption_mode() {
        let config = ConnectionConfiguration::builder("example.org")
            .build()
            .unwrap();
        assert_eq!(config.port(), DEFAULT_PORT);
        assert!(!config.has_port_override());

        let config = ConnectionConfiguration::builder("example.org")
            .channel_encryption(ChannelEncryption::Direct)
            .build()
            .unwrap();
        assert_eq!(config.port(), DEFAULT_DIRECT_TLS_PORT);

        let config = ConnectionConfiguration::builder("example.org")
            .channel_encryption(ChannelEncryption::Direct)
            .port(443)
            .build()
            .unwrap();
        assert_eq!(config.port(), 443);
    }

    #[test]
    fn zero_intervals_disable() {
        let config = ConnectionConfiguration::builder("example.org")
            .keep_alive_interval(Some(Duration::ZERO))
            .ping_interval(Some(Duration::ZERO))
            .build()
            .unwrap();
        assert_eq!(config.keep_alive_interval(), None);
        assert_eq!(config.ping_interval(), None);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(ConnectionConfiguration::builder("").build().is_err());
        assert!(ConnectionConfiguration::builder("example.org")
            .web_socket_path("ws")
            .build()
            .is_err());
        assert!(ConnectionConfiguration::builder("example.org")
            .connect_timeout(Duration::ZERO)
            .build()
            .is_err());
    }
}
