// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # The live connection
//!
//! A [`Connection`] runs two tasks:
//!
//! - The *reader* decodes the inbound byte stream and dispatches elements
//!   in arrival order, to stream management, to the feature negotiators
//!   and finally to the [`Session`].
//! - The *writer* serialises outbound elements in submission order. All
//!   writes, including the stream header, the close frame and
//!   keepalives, go through its command queue.
//!
//! When a negotiator asks for a channel upgrade, the reader detaches the
//! write half from the writer (which stops writing until it gets a new
//! one), joins both halves, wraps the channel and hands the new write half
//! back. Neither task ever touches the channel while the other one
//! replaces it.
//!
//! All fatal errors go through [`Shared::fail`], which notifies the
//! session exactly once and stops both tasks.

use core::time::Duration;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

#[cfg(feature = "websocket")]
use bytes::Bytes;
use tokio::io::WriteHalf;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;

use crate::codec::{xmpp_codec_factory, CodecFactory};
use crate::config::ConnectionConfiguration;
use crate::connect::BoxedStream;
use crate::element::{
    ensure_id, is_stanza, DefinedCondition, StreamElement, StreamError, StreamHeader,
};
use crate::error::OpaqueIoError;
use crate::negotiation::{default_negotiators, FeatureNegotiator, NegotiationContext};
use crate::ns;
use crate::session::Session;
use crate::stream_management::{self, StreamManagement};
use crate::Error;

mod dispatch;
mod socket;


pub(crate) use self::dispatch::{stream_error_for, Action, Dispatcher};

/// How long the reader waits for the peer's close frame.
pub(crate) const READER_CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a close waits for the writer to drain its queue.
pub(crate) const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

pub(crate) type Completion = oneshot::Sender<io::Result<()>>;

/// A channel which was upgraded, handed back to the writer.
pub(crate) struct Reattach {
    pub half: WriteHalf<BoxedStream>,
    /// Whether a fresh stream header must be sent on it.
    pub restart: bool,
}

/// Commands processed by the writer task, in order.
pub(crate) enum WriterCommand {
    /// Send the stream header.
    Open { done: Completion },

    /// Serialise an element; with `flush`, also flush the channel.
    Element {
        element: StreamElement,
        flush: bool,
        done: Option<Completion>,
    },

    /// Flush buffered bytes.
    Flush { done: Completion },

    /// Reset the encoder and send a fresh stream header.
    Restart,

    /// Give up the write half until it is handed back.
    Detach {
        half_tx: oneshot::Sender<WriteHalf<BoxedStream>>,
        reattach_rx: oneshot::Receiver<Reattach>,
    },

    /// Send a transport-level ping.
    #[cfg(feature = "websocket")]
    Ping(Bytes),

    /// Send the close frame (if the stream was opened) and stop.
    Close { done: Completion },
}

/// Complete a queued write, handing a copy of any error to the caller.
pub(crate) fn complete(done: Option<Completion>, result: &io::Result<()>) {
    if let Some(done) = done {
        let result = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(OpaqueIoError::from(e).to_io_error()),
        };
        // The caller may have given up waiting.
        let _ = done.send(result);
    }
}

/// State shared between the tasks and the [`Connection`] handle.
pub(crate) struct Shared {
    pub config: Arc<ConnectionConfiguration>,
    session: Weak<dyn Session>,
    pub sm: StreamManagement,
    opened: AtomicBool,
    closing: AtomicBool,
    failed: AtomicBool,
    secure: AtomicBool,
    compressed: AtomicBool,
    generation: AtomicU64,
    peer_header: Mutex<Option<StreamHeader>>,
    live_tasks: AtomicUsize,
    closed_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Shared {
    pub fn new(
        config: Arc<ConnectionConfiguration>,
        session: Weak<dyn Session>,
        secure: bool,
    ) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            session,
            sm: StreamManagement::default(),
            opened: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            secure: AtomicBool::new(secure),
            compressed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            peer_header: Mutex::new(None),
            live_tasks: AtomicUsize::new(0),
            closed_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The header this side opens streams with.
    pub fn stream_header(&self) -> StreamHeader {
        let mut header = StreamHeader::client(self.config.domain());
        header.from = self.config.from().map(str::to_owned);
        header.lang = self.config.language().map(str::to_owned);
        header
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn set_opened(&self) {
        self.opened.store(true, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Mark the connection as closing; returns whether it already was.
    fn start_closing(&self) -> bool {
        self.closing.swap(true, Ordering::SeqCst)
    }

    pub fn set_secure(&self) {
        self.secure.store(true, Ordering::SeqCst);
    }

    pub fn set_compressed(&self) {
        self.compressed.store(true, Ordering::SeqCst);
    }

    /// Count a channel swap, returning the new generation.
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn negotiation_context(&self) -> NegotiationContext {
        NegotiationContext {
            secure: self.secure.load(Ordering::SeqCst),
            compressed: self.compressed.load(Ordering::SeqCst),
            encryption: self.config.channel_encryption(),
        }
    }

    pub fn set_peer_header(&self, header: StreamHeader) {
        *self
            .peer_header
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(header);
    }

    /// Whether the session is in a state which warrants keepalives.
    pub fn session_active(&self) -> bool {
        self.session
            .upgrade()
            .map_or(false, |session| session.status().is_active())
    }

    /// Hand an element to the session. Returns whether the session asks
    /// for a stream restart.
    pub fn deliver(&self, element: StreamElement) -> bool {
        match self.session.upgrade() {
            Some(session) => session.handle_element(element),
            None => {
                log::debug!("Session is gone, dropping {}", element.describe());
                false
            }
        }
    }

    /// Bookkeeping for an element about to be serialised.
    pub fn prepare_outbound(&self, element: &mut StreamElement) {
        let StreamElement::Payload(el) = element else {
            return;
        };
        if is_stanza(el, ns::JABBER_CLIENT) {
            ensure_id(el, ns::JABBER_CLIENT);
            self.sm.lock().enqueue(el);
        } else if el.is("enable", ns::SM) {
            self.sm.lock().on_enable_sent();
        }
    }

    /// Report a fatal error and stop both tasks. Only the first call has
    /// an effect.
    pub fn fail(&self, error: Error) {
        if self.failed.swap(true, Ordering::SeqCst) {
            log::debug!("Ignoring error after failure: {}", error);
            return;
        }
        if self.is_closing() {
            log::debug!("Error while closing: {}", error);
        } else {
            log::debug!("Connection failed: {}", error);
            match self.session.upgrade() {
                Some(session) => session.notify_exception(error),
                None => log::debug!("Session is gone, not reporting the error"),
            }
        }
        self.abort_tasks();
    }

    pub fn register_task(&self, handle: AbortHandle) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    pub fn abort_tasks(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            task.abort();
        }
    }

    /// Count a reader or writer task as running until the guard is
    /// dropped. Must be taken before the task is spawned.
    pub fn task_guard(self: &Arc<Self>) -> TaskGuard {
        self.live_tasks.fetch_add(1, Ordering::SeqCst);
        TaskGuard(self.clone())
    }
}

/// Keeps the connection from counting as closed while a task runs.
pub(crate) struct TaskGuard(Arc<Shared>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.0.live_tasks.fetch_sub(1, Ordering::SeqCst) == 1 {
            log::debug!("Connection to {} released", self.0.config.domain());
            self.0.closed_tx.send_replace(true);
        }
    }
}

/// Queue `error` followed by the close frame, and give the writer a
/// moment to send both. The writer stops afterwards.
pub(crate) async fn emit_stream_error(
    writer_tx: &mpsc::UnboundedSender<WriterCommand>,
    error: StreamError,
) {
    log::debug!("Sending stream error {}", error);
    let command = WriterCommand::Element {
        element: StreamElement::Error(error),
        flush: false,
        done: None,
    };
    if writer_tx.send(command).is_err() {
        return;
    }
    let (done, rx) = oneshot::channel();
    if writer_tx.send(WriterCommand::Close { done }).is_ok() {
        let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, rx).await;
    }
}

/// The error reported when the peer ends the stream unasked.
pub(crate) fn closed_by_peer() -> Error {
    Error::Stream(
        StreamError::new(DefinedCondition::UndefinedCondition).with_text("stream closed by peer"),
    )
}

/// A stream error received earlier wins over whatever ended the stream
/// after it.
pub(crate) fn take_pending(pending: Option<StreamError>, fallback: Option<Error>) -> Error {
    match (pending, fallback) {
        (Some(error), _) => Error::Stream(error),
        (None, Some(error)) => error,
        (None, None) => Error::InvalidState,
    }
}

/// A connection to an XMPP server.
///
/// Created by a connector, or with [`Connection::new`] on a channel
/// established by other means. The connection serves a [`Session`], which
/// receives all inbound elements and fatal errors.
pub struct Connection {
    shared: Arc<Shared>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
}

impl Connection {
    /// Run a connection on `stream` with the default codec and feature
    /// negotiators. `secure` tells whether `stream` is already encrypted.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        stream: BoxedStream,
        config: Arc<ConnectionConfiguration>,
        session: Weak<dyn Session>,
        secure: bool,
    ) -> Self {
        let negotiators = default_negotiators(&config);
        Self::with_parts(
            stream,
            config,
            session,
            secure,
            &xmpp_codec_factory(),
            negotiators,
        )
    }

    /// Run a connection on `stream` with a custom codec and custom feature
    /// negotiators, consulted in order.
    pub fn with_parts(
        stream: BoxedStream,
        config: Arc<ConnectionConfiguration>,
        session: Weak<dyn Session>,
        secure: bool,
        codec_factory: &CodecFactory,
        negotiators: Vec<Box<dyn FeatureNegotiator>>,
    ) -> Self {
        let shared = Shared::new(config, session, secure);
        let writer_tx = socket::spawn(stream, shared.clone(), codec_factory, negotiators);
        Self { shared, writer_tx }
    }

    pub(crate) fn from_parts(
        shared: Arc<Shared>,
        writer_tx: mpsc::UnboundedSender<WriterCommand>,
    ) -> Self {
        Self { shared, writer_tx }
    }

    async fn submit<F: FnOnce(Completion) -> WriterCommand>(&self, make: F) -> Result<(), Error> {
        if self.shared.is_closing() {
            return Err(Error::Disconnected);
        }
        let (tx, rx) = oneshot::channel();
        self.writer_tx
            .send(make(tx))
            .map_err(|_| Error::Disconnected)?;
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Disconnected),
        }
    }

    /// Send the stream header. Completes once it was handed to the
    /// channel.
    pub async fn open(&self) -> Result<(), Error> {
        self.submit(|done| WriterCommand::Open { done }).await
    }

    /// Serialise `element` without flushing.
    ///
    /// Stanzas without an `id` get one assigned. Completes once the bytes
    /// were handed to the channel.
    pub async fn write<E: Into<StreamElement>>(&self, element: E) -> Result<(), Error> {
        let element = element.into();
        self.submit(|done| WriterCommand::Element {
            element,
            flush: false,
            done: Some(done),
        })
        .await
    }

    /// Serialise `element` and flush.
    pub async fn send<E: Into<StreamElement>>(&self, element: E) -> Result<(), Error> {
        let element = element.into();
        self.submit(|done| WriterCommand::Element {
            element,
            flush: true,
            done: Some(done),
        })
        .await
    }

    /// Flush bytes buffered by previous writes.
    pub async fn flush(&self) -> Result<(), Error> {
        self.submit(|done| WriterCommand::Flush { done }).await
    }

    /// Ask the peer to enable stream management (XEP-0198).
    ///
    /// Stanzas written after the request are tracked until acknowledged.
    pub async fn enable_stream_management(&self, resume: bool) -> Result<(), Error> {
        self.send(stream_management::enable_element(resume)).await
    }

    /// Ask the peer to acknowledge the stanzas received so far.
    pub async fn request_ack(&self) -> Result<(), Error> {
        self.send(stream_management::request_element()).await
    }

    /// The stream management state of this connection. The handle stays
    /// usable after the connection is gone.
    pub fn stream_management(&self) -> StreamManagement {
        self.shared.sm.clone()
    }

    /// Close the stream.
    ///
    /// Sends a single close frame (if the stream was opened), waits a
    /// bounded time for the peer to close its side and releases the
    /// channel. Calling this more than once is harmless.
    pub async fn close(&self) -> Result<(), Error> {
        if self.shared.start_closing() {
            self.closed().await;
            return Ok(());
        }
        log::debug!("Closing connection to {}", self.shared.config.domain());
        let (done, rx) = oneshot::channel();
        if self.writer_tx.send(WriterCommand::Close { done }).is_ok() {
            match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, rx).await {
                Ok(Ok(Ok(()))) => (),
                Ok(Ok(Err(e))) => log::debug!("Could not send close frame: {}", e),
                Ok(Err(_)) => (),
                Err(_) => log::debug!("Writer did not drain in time"),
            }
        }
        if tokio::time::timeout(READER_CLOSE_TIMEOUT, self.closed())
            .await
            .is_err()
        {
            log::debug!("Peer did not close the stream in time");
            self.shared.abort_tasks();
            self.closed().await;
        }
        Ok(())
    }

    /// Wait until both tasks of the connection have ended and the channel
    /// has been released.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Whether the channel has been released.
    pub fn is_closed(&self) -> bool {
        *self.shared.closed_tx.borrow()
    }

    /// Whether the stream header was sent.
    pub fn is_opened(&self) -> bool {
        self.shared.is_opened()
    }

    /// The most recent stream header received from the peer.
    pub fn peer_header(&self) -> Option<StreamHeader> {
        self.shared
            .peer_header
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of channel upgrades performed so far.
    pub fn channel_generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Whether the channel is encrypted.
    pub fn is_secure(&self) -> bool {
        self.shared.secure.load(Ordering::SeqCst)
    }

    /// Whether the channel is compressed.
    pub fn is_compressed(&self) -> bool {
        self.shared.compressed.load(Ordering::SeqCst)
    }

    /// The configuration of this connection.
    pub fn config(&self) -> &Arc<ConnectionConfiguration> {
        &self.shared.config
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.abort_tasks();
    }
}
