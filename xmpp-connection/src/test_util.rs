// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Fakes for the collaborators of the connection engine.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, Weak};

use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::connect::dns::{ResolveError, Resolver, SrvRecord};
use crate::connect::{BoxedStream, Dialer};
use crate::element::StreamElement;
use crate::session::{Session, SessionStatus};
use crate::Error;

/// TLS configuration trusting nothing.
pub(crate) fn empty_trust_config() -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth(),
    )
}

/// A self-signed certificate for `domain`: a client configuration which
/// trusts it, and an acceptor which presents it.
pub(crate) fn self_signed_tls(domain: &str) -> (Arc<ClientConfig>, TlsAcceptor) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![domain.to_owned()]).unwrap();
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    roots.add(cert_der.clone()).unwrap();
    let client = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    (Arc::new(client), TlsAcceptor::from(Arc::new(server)))
}

/// What a [`RecordingSession`] saw.
#[derive(Debug)]
pub(crate) enum Recorded {
    Element(StreamElement),
    Exception(Error),
}

/// Session which records everything it is handed.
pub(crate) struct RecordingSession {
    domain: String,
    status: Mutex<SessionStatus>,
    restart_on: Mutex<Option<String>>,
    events: mpsc::UnboundedSender<Recorded>,
}

impl RecordingSession {
    pub fn new(domain: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<Recorded>) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            domain: domain.to_owned(),
            status: Mutex::new(SessionStatus::Connected),
            restart_on: Mutex::new(None),
            events,
        });
        (session, rx)
    }

    pub fn weak(self: &Arc<Self>) -> Weak<dyn Session> {
        let session: Arc<dyn Session> = self.clone();
        Arc::downgrade(&session)
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Ask for a stream restart after receiving an element with this name.
    pub fn restart_on(&self, name: &str) {
        *self.restart_on.lock().unwrap() = Some(name.to_owned());
    }
}

impl Session for RecordingSession {
    fn notify_exception(&self, error: Error) {
        let _ = self.events.send(Recorded::Exception(error));
    }

    fn handle_element(&self, element: StreamElement) -> bool {
        let restart = match (&element, &*self.restart_on.lock().unwrap()) {
            (StreamElement::Payload(el), Some(name)) => el.name() == name,
            _ => false,
        };
        let _ = self.events.send(Recorded::Element(element));
        restart
    }

    fn domain(&self) -> &str {
        &self.domain
    }

    fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap()
    }
}

/// Resolver answering from fixed tables.
#[derive(Default)]
pub(crate) struct MockResolver {
    srv: HashMap<String, Vec<SrvRecord>>,
    txt: HashMap<String, Vec<HashMap<String, String>>>,
    srv_queries: Mutex<Vec<String>>,
}

impl MockResolver {
    pub fn srv(mut self, name: &str, records: Vec<SrvRecord>) -> Self {
        self.srv.insert(name.to_owned(), records);
        self
    }

    pub fn txt(mut self, name: &str, attributes: &[(&str, &str)]) -> Self {
        let record = attributes
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        self.txt.entry(name.to_owned()).or_default().push(record);
        self
    }

    pub fn srv_queries(&self) -> Vec<String> {
        self.srv_queries.lock().unwrap().clone()
    }
}

impl Resolver for MockResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, ResolveError> {
        self.srv_queries.lock().unwrap().push(name.to_owned());
        match self.srv.get(name) {
            Some(records) => Ok(records.clone()),
            None => Err(format!("{}: NXDOMAIN", name).into()),
        }
    }

    async fn lookup_txt(&self, name: &str) -> Result<Vec<HashMap<String, String>>, ResolveError> {
        match self.txt.get(name) {
            Some(records) => Ok(records.clone()),
            None => Err(format!("{}: NXDOMAIN", name).into()),
        }
    }
}

/// How a [`MockDialer`] treats a host.
#[derive(Debug, Clone, Copy)]
pub(crate) enum DialOutcome {
    Refuse,
    Hang,
    Accept,
    AcceptAndClose,
}

/// Dialer which records attempts and connects to in-memory peers.
#[derive(Default)]
pub(crate) struct MockDialer {
    outcomes: HashMap<String, DialOutcome>,
    attempts: Mutex<Vec<String>>,
    peers: Mutex<Vec<DuplexStream>>,
}

impl MockDialer {
    pub fn outcome(mut self, host: &str, outcome: DialOutcome) -> Self {
        self.outcomes.insert(host.to_owned(), outcome);
        self
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

impl Dialer for MockDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        self.attempts
            .lock()
            .unwrap()
            .push(format!("{}:{}", host, port));
        match self
            .outcomes
            .get(host)
            .copied()
            .unwrap_or(DialOutcome::Refuse)
        {
            DialOutcome::Refuse => Err(io::ErrorKind::ConnectionRefused.into()),
            DialOutcome::Hang => core::future::pending().await,
            DialOutcome::Accept => {
                let (client, server) = tokio::io::duplex(65536);
                self.peers.lock().unwrap().push(server);
                Ok(Box::new(client))
            }
            DialOutcome::AcceptAndClose => {
                let (client, _server) = tokio::io::duplex(65536);
                Ok(Box::new(client))
            }
        }
    }
}
