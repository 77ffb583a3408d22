// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reader and writer tasks on a WebSocket.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use super::ping::{self, PendingPings};
use crate::codec::{Codec, CodecFactory};
use crate::connection::{
    closed_by_peer, complete, emit_stream_error, stream_error_for, take_pending, Action,
    Dispatcher, Shared, TaskGuard, WriterCommand, READER_CLOSE_TIMEOUT,
};
use crate::element::{StreamElement, StreamError};
use crate::error::ProtocolError;
use crate::Error;

/// Start the reader, writer and (if configured) ping tasks on `ws`.
pub(super) fn spawn<S>(
    ws: WebSocketStream<S>,
    shared: Arc<Shared>,
    codec_factory: &CodecFactory,
) -> mpsc::UnboundedSender<WriterCommand>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let pings = Arc::new(PendingPings::default());

    let writer = Writer {
        shared: shared.clone(),
        codec: codec_factory(),
        buf: BytesMut::new(),
        sink,
    };
    // No feature negotiation happens on WebSocket streams.
    let reader = Reader {
        shared: shared.clone(),
        writer_tx: writer_tx.clone(),
        codec: codec_factory(),
        buf: BytesMut::new(),
        dispatcher: Dispatcher::new(shared.clone(), writer_tx.clone(), Vec::new()),
        pings: pings.clone(),
    };

    let writer_guard = shared.task_guard();
    let reader_guard = shared.task_guard();
    let writer_task = tokio::spawn(writer.run(writer_rx, writer_guard));
    let reader_task = tokio::spawn(reader.run(stream, reader_guard));
    shared.register_task(writer_task.abort_handle());
    shared.register_task(reader_task.abort_handle());

    let interval = shared
        .config
        .ping_interval()
        .filter(|interval| !interval.is_zero());
    if let Some(interval) = interval {
        let response_timeout = shared.config.response_timeout();
        let monitor = tokio::spawn(ping::monitor(
            pings,
            shared.clone(),
            writer_tx.clone(),
            interval,
            response_timeout,
        ));
        shared.register_task(monitor.abort_handle());
    }
    writer_tx
}

fn into_io(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Writer<S> {
    shared: Arc<Shared>,
    codec: Box<dyn Codec>,
    buf: BytesMut,
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Writer<S> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WriterCommand>, _guard: TaskGuard) {
        while let Some(command) = rx.recv().await {
            match self.handle(command).await {
                Ok(Flow::Continue) => (),
                Ok(Flow::Stop) => break,
                Err(e) => {
                    self.shared.fail(Error::Io(e));
                    break;
                }
            }
        }
        log::trace!("WebSocket writer stopped");
    }

    async fn handle(&mut self, command: WriterCommand) -> io::Result<Flow> {
        match command {
            WriterCommand::Open { done } => {
                let result = self.write_open().await;
                complete(Some(done), &result);
                result.map(|()| Flow::Continue)
            }
            WriterCommand::Element {
                mut element,
                flush,
                done,
            } => {
                self.shared.prepare_outbound(&mut element);
                if let Err(e) = self.codec.encode(&element, &mut self.buf) {
                    log::warn!("Cannot encode {}: {}", element.describe(), e);
                    self.buf.clear();
                    complete(
                        done,
                        &Err(io::Error::new(io::ErrorKind::InvalidInput, e)),
                    );
                    return Ok(Flow::Continue);
                }
                let result = self.write_message(flush).await;
                complete(done, &result);
                result.map(|()| Flow::Continue)
            }
            WriterCommand::Flush { done } => {
                let result = self.sink.flush().await.map_err(into_io);
                complete(Some(done), &result);
                result.map(|()| Flow::Continue)
            }
            WriterCommand::Restart => {
                self.codec.reset();
                self.write_open().await.map(|()| Flow::Continue)
            }
            WriterCommand::Ping(token) => {
                log::trace!("Sending ping {:?}", token);
                self.sink
                    .send(Message::Ping(token))
                    .await
                    .map_err(into_io)?;
                Ok(Flow::Continue)
            }
            WriterCommand::Detach { .. } => {
                // Dropping the handover channel fails the upgrade.
                log::warn!("Channel upgrades are not possible on WebSocket streams");
                Ok(Flow::Continue)
            }
            WriterCommand::Close { done } => {
                let result = self.write_close().await;
                complete(Some(done), &result);
                if let Err(e) = result {
                    log::debug!("Sending close frame failed: {}", e);
                }
                Ok(Flow::Stop)
            }
        }
    }

    async fn write_open(&mut self) -> io::Result<()> {
        let header = self.shared.stream_header();
        self.codec
            .encode(&StreamElement::Open(header), &mut self.buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.write_message(true).await?;
        self.shared.set_opened();
        Ok(())
    }

    async fn write_close(&mut self) -> io::Result<()> {
        if self.shared.is_opened() {
            self.codec
                .encode(&StreamElement::Close, &mut self.buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            self.write_message(false).await?;
        }
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(into_io)
    }

    /// Send the buffered serialisation as one text message.
    async fn write_message(&mut self, flush: bool) -> io::Result<()> {
        let text = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        log::trace!("SEND {}", text);
        let message = Message::text(text);
        if flush {
            self.sink.send(message).await
        } else {
            self.sink.feed(message).await
        }
        .map_err(into_io)
    }
}

struct Reader {
    shared: Arc<Shared>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    codec: Box<dyn Codec>,
    buf: BytesMut,
    dispatcher: Dispatcher,
    pings: Arc<PendingPings>,
}

impl Reader {
    async fn run<S>(mut self, stream: SplitStream<WebSocketStream<S>>, _guard: TaskGuard)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.read_loop(stream).await;
        self.dispatcher.unregister_negotiators();
        match result {
            Ok(()) => log::debug!("WebSocket stream closed"),
            Err(error) => {
                if let Some(stream_error) = stream_error_for(&error) {
                    if !self.shared.is_closing() {
                        emit_stream_error(&self.writer_tx, stream_error).await;
                    }
                }
                self.shared.fail(error);
            }
        }
    }

    async fn read_loop<S>(&mut self, mut stream: SplitStream<WebSocketStream<S>>) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut pending: Option<StreamError> = None;
        loop {
            let next = if pending.is_some() {
                match tokio::time::timeout(READER_CLOSE_TIMEOUT, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => return Err(take_pending(pending, None)),
                }
            } else {
                stream.next().await
            };
            let message = match next {
                None => {
                    return self.peer_gone(
                        pending,
                        Error::Io(io::ErrorKind::UnexpectedEof.into()),
                    )
                }
                Some(Err(e)) => return Err(take_pending(pending, Some(e.into()))),
                Some(Ok(message)) => message,
            };

            match message {
                Message::Text(text) => {
                    log::trace!("RECV {}", text.as_str());
                    self.buf.extend_from_slice(text.as_bytes());
                }
                Message::Pong(payload) => {
                    self.pings.pong(&payload);
                    continue;
                }
                Message::Close(Some(frame)) if frame.code != CloseCode::Normal => {
                    log::debug!("Peer closed the WebSocket with {}", frame);
                    let error = Error::ConnectionClosed {
                        code: frame.code.into(),
                        reason: frame.reason.to_string(),
                    };
                    return Err(take_pending(pending, Some(error)));
                }
                Message::Close(_) => return self.peer_gone(pending, closed_by_peer()),
                Message::Binary(_) => {
                    let error = ProtocolError::UnexpectedElement("binary message".to_owned());
                    return Err(take_pending(pending, Some(error.into())));
                }
                // Pings are answered by the transport.
                Message::Ping(_) | Message::Frame(_) => continue,
            }

            loop {
                let element = match self.codec.decode(&mut self.buf) {
                    Ok(Some(element)) => element,
                    Ok(None) => break,
                    Err(e) => return Err(take_pending(pending, Some(e.into()))),
                };
                match self.dispatcher.dispatch(element)? {
                    Action::Continue => (),
                    Action::Restart => {
                        log::debug!("Restarting stream on request of the session");
                        self.codec.reset();
                        self.buf.clear();
                        self.dispatcher.on_restart();
                        self.writer_tx
                            .send(WriterCommand::Restart)
                            .map_err(|_| Error::Disconnected)?;
                        break;
                    }
                    Action::Upgrade(upgrade) => {
                        log::warn!("Cannot apply {:?} to a WebSocket stream", upgrade);
                        return Err(Error::InvalidState);
                    }
                    Action::PeerClosed => return self.peer_gone(pending, closed_by_peer()),
                    Action::StreamError(error) => {
                        log::warn!("Received stream error: {}", error);
                        pending = Some(error);
                    }
                }
            }
        }
    }

    fn peer_gone(&self, pending: Option<StreamError>, error: Error) -> Result<(), Error> {
        if pending.is_none() && self.shared.is_closing() {
            log::debug!("Peer acknowledged stream close");
            return Ok(());
        }
        Err(take_pending(pending, Some(error)))
    }
}
