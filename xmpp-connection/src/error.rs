// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;
use std::error::Error as StdError;
use std::io;

use crate::codec::CodecError;
use crate::element::StreamError;
use crate::stream_management::SmError;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error on the current channel
    Io(io::Error),
    /// None of the connection candidates could be reached
    Connect(ConnectError),
    /// Secure channel could not be established
    Tls(TlsError),
    /// The stream was terminated with a stream-level error, either
    /// received from the peer or synthesised locally
    Stream(StreamError),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// A transport-level ping was not answered within the response
    /// timeout
    NoPong,
    /// The transport was closed by the peer with a non-normal close code
    ConnectionClosed {
        /// Close code sent by the peer
        code: u16,
        /// Close reason sent by the peer
        reason: String,
    },
    /// WebSocket handshake or transport error
    #[cfg(feature = "websocket")]
    WebSocket(tokio_tungstenite::tungstenite::Error),
    /// Connection closed
    Disconnected,
    /// Should never happen
    InvalidState,
    /// Invalid configuration
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::Connect(e) => write!(fmt, "{}", e),
            Error::Tls(e) => write!(fmt, "TLS error: {}", e),
            Error::Stream(e) => write!(fmt, "stream error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::NoPong => write!(fmt, "no pong received in time"),
            Error::ConnectionClosed { code, reason } => {
                write!(fmt, "connection closed by peer (code {}): {}", code, reason)
            }
            #[cfg(feature = "websocket")]
            Error::WebSocket(e) => write!(fmt, "websocket error: {}", e),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::InvalidState => write!(fmt, "invalid state"),
            Error::Config(e) => write!(fmt, "invalid configuration: {}", e),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Connect(e) => Some(e),
            Error::Tls(e) => Some(e),
            Error::Protocol(e) => Some(e),
            #[cfg(feature = "websocket")]
            Error::WebSocket(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ConnectError> for Error {
    fn from(e: ConnectError) -> Self {
        Error::Connect(e)
    }
}

impl From<TlsError> for Error {
    fn from(e: TlsError) -> Self {
        Error::Tls(e)
    }
}

impl From<StreamError> for Error {
    fn from(e: StreamError) -> Self {
        Error::Stream(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        ProtocolError::Codec(e).into()
    }
}

impl From<SmError> for Error {
    fn from(e: SmError) -> Self {
        ProtocolError::StreamManagement(e).into()
    }
}

#[cfg(feature = "websocket")]
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e)
    }
}

/// Aggregated failure of a connection attempt over all candidates.
#[derive(Debug)]
pub struct ConnectError {
    attempts: Vec<(String, io::Error)>,
}

impl ConnectError {
    pub(crate) fn new() -> Self {
        Self {
            attempts: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, target: String, error: io::Error) {
        self.attempts.push((target, error));
    }

    /// The targets which were tried, in order, with the error each
    /// attempt failed with.
    pub fn attempts(&self) -> &[(String, io::Error)] {
        &self.attempts
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "could not connect to any host")?;
        for (i, (target, error)) in self.attempts.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}: {}", sep, target, error)?;
        }
        Ok(())
    }
}

impl StdError for ConnectError {}

/// Errors while establishing a secure channel
#[derive(Debug)]
pub enum TlsError {
    /// The TLS handshake failed; this includes certificate verification
    /// failures
    Handshake(io::Error),
    /// The service domain is not a valid TLS server name
    InvalidServerName(String),
    /// The TLS client configuration could not be built
    Config(rustls::Error),
    /// Encryption is required but the peer did not offer STARTTLS
    NotOffered,
    /// The peer offered STARTTLS but encryption is disabled locally and the
    /// peer requires it
    Required,
    /// The peer answered the STARTTLS request with `<failure/>`
    Rejected,
}

impl fmt::Display for TlsError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TlsError::Handshake(e) => write!(fmt, "handshake failed: {}", e),
            TlsError::InvalidServerName(name) => write!(fmt, "invalid server name: {}", name),
            TlsError::Config(e) => write!(fmt, "configuration error: {}", e),
            TlsError::NotOffered => write!(fmt, "encryption required but not offered by peer"),
            TlsError::Required => write!(fmt, "peer requires encryption but it is disabled"),
            TlsError::Rejected => write!(fmt, "peer rejected the STARTTLS request"),
        }
    }
}

impl StdError for TlsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            TlsError::Handshake(e) => Some(e),
            TlsError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rustls::Error> for TlsError {
    fn from(e: rustls::Error) -> Self {
        TlsError::Config(e)
    }
}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// The inbound byte stream could not be decoded
    Codec(CodecError),
    /// The peer violated the stream management protocol
    StreamManagement(SmError),
    /// The peer confirmed a compression method which cannot be applied
    Compression(String),
    /// An element arrived which is not valid in the current stream state
    UnexpectedElement(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Codec(e) => write!(fmt, "{}", e),
            ProtocolError::StreamManagement(e) => write!(fmt, "stream management: {}", e),
            ProtocolError::Compression(e) => write!(fmt, "compression failed: {}", e),
            ProtocolError::UnexpectedElement(name) => {
                write!(fmt, "unexpected element <{}/>", name)
            }
        }
    }
}

impl StdError for ProtocolError {}

/// An [`io::Error`] reduced to its kind and message so that it can be
/// handed to more than one receiver.
#[derive(Debug, Clone)]
pub struct OpaqueIoError {
    kind: io::ErrorKind,
    message: String,
}

impl OpaqueIoError {
    /// Kind of the original error.
    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    /// Rebuild an [`io::Error`] from this error.
    pub fn to_io_error(&self) -> io::Error {
        io::Error::new(self.kind, self.message.clone())
    }
}

impl From<&io::Error> for OpaqueIoError {
    fn from(other: &io::Error) -> Self {
        Self {
            kind: other.kind(),
            message: other.to_string(),
        }
    }
}

impl fmt::Display for OpaqueIoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for OpaqueIoError {}
