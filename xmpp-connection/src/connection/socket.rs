// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reader and writer tasks on a duplex byte stream.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::{
    closed_by_peer, complete, emit_stream_error, stream_error_for, take_pending, Action,
    Dispatcher, Reattach, Shared, TaskGuard, WriterCommand, READER_CLOSE_TIMEOUT,
};
use crate::codec::{Codec, CodecFactory};
use crate::compression::{CompressedStream, CompressionMethod};
use crate::connect::BoxedStream;
use crate::element::{StreamElement, StreamError};
use crate::error::ProtocolError;
use crate::negotiation::{ChannelUpgrade, FeatureNegotiator};
use crate::tls;
use crate::Error;

const READ_BUFFER_SIZE: usize = 8192;

/// Start the reader and writer tasks on `stream`.
pub(super) fn spawn(
    stream: BoxedStream,
    shared: Arc<Shared>,
    codec_factory: &CodecFactory,
    negotiators: Vec<Box<dyn FeatureNegotiator>>,
) -> mpsc::UnboundedSender<WriterCommand> {
    let (read_half, write_half) = tokio::io::split(stream);
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();

    let writer = Writer {
        shared: shared.clone(),
        codec: codec_factory(),
        buf: BytesMut::new(),
    };
    let reader = Reader {
        shared: shared.clone(),
        writer_tx: writer_tx.clone(),
        codec: codec_factory(),
        buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
        dispatcher: Dispatcher::new(shared.clone(), writer_tx.clone(), negotiators),
    };

    let writer_guard = shared.task_guard();
    let reader_guard = shared.task_guard();
    let writer_task = tokio::spawn(writer.run(writer_rx, write_half, writer_guard));
    let reader_task = tokio::spawn(reader.run(read_half, reader_guard));
    shared.register_task(writer_task.abort_handle());
    shared.register_task(reader_task.abort_handle());
    writer_tx
}

fn wrap_compression(
    stream: BoxedStream,
    method: CompressionMethod,
) -> Result<BoxedStream, (BoxedStream, String)> {
    match method {
        CompressionMethod::Zlib => Ok(Box::new(CompressedStream::zlib(stream))),
        other => Err((stream, format!("{} is not supported", other))),
    }
}

async fn tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => core::future::pending().await,
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Writer {
    shared: Arc<Shared>,
    codec: Box<dyn Codec>,
    buf: BytesMut,
}

impl Writer {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<WriterCommand>,
        mut half: WriteHalf<BoxedStream>,
        _guard: TaskGuard,
    ) {
        let mut keepalive = self.shared.config.keep_alive_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let command = tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                _ = tick(&mut keepalive) => {
                    if let Err(e) = self.keepalive(&mut half).await {
                        self.shared.fail(Error::Io(e));
                        break;
                    }
                    continue;
                }
            };

            let result = match command {
                WriterCommand::Detach {
                    half_tx,
                    reattach_rx,
                } => {
                    if let Err(e) = half.flush().await {
                        self.shared.fail(Error::Io(e));
                        break;
                    }
                    if let Err(half) = half_tx.send(half) {
                        drop(half);
                        break;
                    }
                    log::trace!("Write half detached");
                    let Ok(reattach) = reattach_rx.await else {
                        log::debug!("Channel was not handed back, stopping writer");
                        break;
                    };
                    half = reattach.half;
                    if reattach.restart {
                        self.codec.reset();
                        self.write_open(&mut half).await.map(|()| Flow::Continue)
                    } else {
                        Ok(Flow::Continue)
                    }
                }
                command => self.handle(command, &mut half).await,
            };
            match result {
                Ok(Flow::Continue) => (),
                Ok(Flow::Stop) => break,
                Err(e) => {
                    self.shared.fail(Error::Io(e));
                    break;
                }
            }
        }
        log::trace!("Writer stopped");
    }

    async fn handle(
        &mut self,
        command: WriterCommand,
        half: &mut WriteHalf<BoxedStream>,
    ) -> io::Result<Flow> {
        match command {
            WriterCommand::Open { done } => {
                let result = self.write_open(half).await;
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
                    // Only this element is affected.
                    log::warn!("Cannot encode {}: {}", element.describe(), e);
                    self.buf.clear();
                    complete(
                        done,
                        &Err(io::Error::new(io::ErrorKind::InvalidInput, e)),
                    );
                    return Ok(Flow::Continue);
                }
                let result = self.write_buffered(half, flush).await;
                complete(done, &result);
                result.map(|()| Flow::Continue)
            }
            WriterCommand::Flush { done } => {
                let result = half.flush().await;
                complete(Some(done), &result);
                result.map(|()| Flow::Continue)
            }
            WriterCommand::Restart => {
                self.codec.reset();
                self.write_open(half).await.map(|()| Flow::Continue)
            }
            WriterCommand::Close { done } => {
                let result = if self.shared.is_opened() {
                    match self.codec.encode(&StreamElement::Close, &mut self.buf) {
                        Ok(()) => self.write_buffered(half, true).await,
                        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidInput, e)),
                    }
                } else {
                    Ok(())
                };
                complete(Some(done), &result);
                // Errors are not fatal anymore at this point.
                if let Err(e) = result {
                    log::debug!("Sending close frame failed: {}", e);
                }
                Ok(Flow::Stop)
            }
            #[cfg(feature = "websocket")]
            WriterCommand::Ping(_) => Ok(Flow::Continue),
            WriterCommand::Detach { .. } => Ok(Flow::Continue),
        }
    }

    async fn write_open(&mut self, half: &mut WriteHalf<BoxedStream>) -> io::Result<()> {
        let header = self.shared.stream_header();
        self.codec
            .encode(&StreamElement::Open(header), &mut self.buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.write_buffered(half, true).await?;
        self.shared.set_opened();
        Ok(())
    }

    async fn write_buffered(
        &mut self,
        half: &mut WriteHalf<BoxedStream>,
        flush: bool,
    ) -> io::Result<()> {
        log::trace!("SEND {}", String::from_utf8_lossy(&self.buf));
        let result = half.write_all(&self.buf).await;
        self.buf.clear();
        result?;
        if flush {
            half.flush().await?;
        }
        Ok(())
    }

    async fn keepalive(&mut self, half: &mut WriteHalf<BoxedStream>) -> io::Result<()> {
        if !self.shared.is_opened() || self.shared.is_closing() || !self.shared.session_active() {
            return Ok(());
        }
        log::trace!("Sending whitespace keepalive");
        half.write_all(b" ").await?;
        half.flush().await
    }
}

struct Reader {
    shared: Arc<Shared>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    codec: Box<dyn Codec>,
    buf: BytesMut,
    dispatcher: Dispatcher,
}

impl Reader {
    async fn run(mut self, half: ReadHalf<BoxedStream>, _guard: TaskGuard) {
        let result = self.read_loop(half).await;
        self.dispatcher.unregister_negotiators();
        match result {
            Ok(()) => log::debug!("Stream closed"),
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

    async fn read_loop(&mut self, mut half: ReadHalf<BoxedStream>) -> Result<(), Error> {
        // A received stream error takes precedence over whatever ends the
        // stream after it.
        let mut pending: Option<StreamError> = None;
        loop {
            let element = match self.codec.decode(&mut self.buf) {
                Ok(Some(element)) => element,
                Ok(None) => {
                    let before = self.buf.len();
                    let read = half.read_buf(&mut self.buf);
                    let result = if pending.is_some() {
                        match tokio::time::timeout(READER_CLOSE_TIMEOUT, read).await {
                            Ok(result) => result,
                            Err(_) => return Err(take_pending(pending, None)),
                        }
                    } else {
                        read.await
                    };
                    match result {
                        Ok(0) => return self.end_of_stream(pending),
                        Ok(_) => {
                            log::trace!("RECV {}", String::from_utf8_lossy(&self.buf[before..]));
                            continue;
                        }
                        Err(e) => return Err(take_pending(pending, Some(Error::Io(e)))),
                    }
                }
                Err(e) => return Err(take_pending(pending, Some(e.into()))),
            };

            match self.dispatcher.dispatch(element)? {
                Action::Continue => (),
                Action::Restart => {
                    log::debug!("Restarting stream on request of the session");
                    self.restart();
                    self.writer_tx
                        .send(WriterCommand::Restart)
                        .map_err(|_| Error::Disconnected)?;
                }
                Action::Upgrade(upgrade) => {
                    half = self.upgrade(half, upgrade).await?;
                }
                Action::PeerClosed => {
                    return if self.shared.is_closing() {
                        log::debug!("Peer acknowledged stream close");
                        Ok(())
                    } else {
                        Err(take_pending(pending, Some(closed_by_peer())))
                    };
                }
                Action::StreamError(error) => {
                    log::warn!("Received stream error: {}", error);
                    pending = Some(error);
                }
            }
        }
    }

    fn end_of_stream(&self, pending: Option<StreamError>) -> Result<(), Error> {
        if pending.is_none() && self.shared.is_closing() {
            log::debug!("Peer closed the channel");
            return Ok(());
        }
        Err(take_pending(
            pending,
            Some(Error::Io(io::ErrorKind::UnexpectedEof.into())),
        ))
    }

    fn restart(&mut self) {
        self.codec.reset();
        self.buf.clear();
        self.dispatcher.on_restart();
    }

    /// Swap the channel for a wrapped one.
    ///
    /// The writer is parked while the channel is replaced. Bytes read but
    /// not decoded yet belong to the old channel and are discarded.
    async fn upgrade(
        &mut self,
        half: ReadHalf<BoxedStream>,
        upgrade: ChannelUpgrade,
    ) -> Result<ReadHalf<BoxedStream>, Error> {
        let (half_tx, half_rx) = oneshot::channel();
        let (reattach_tx, reattach_rx) = oneshot::channel();
        self.writer_tx
            .send(WriterCommand::Detach {
                half_tx,
                reattach_rx,
            })
            .map_err(|_| Error::Disconnected)?;
        let write_half = half_rx.await.map_err(|_| Error::Disconnected)?;
        let stream = half.unsplit(write_half);

        if !self.buf.is_empty() {
            log::warn!(
                "Discarding {} bytes received before the channel upgrade",
                self.buf.len()
            );
        }
        self.restart();

        let stream = match upgrade {
            ChannelUpgrade::Tls => tls::upgrade(stream, &self.shared.config, false).await?,
            ChannelUpgrade::Compression(method) => match wrap_compression(stream, method) {
                Ok(stream) => stream,
                Err((stream, message)) => {
                    // The peer already compresses; the old channel is only
                    // good for telling it that we cannot.
                    let (read_half, write_half) = tokio::io::split(stream);
                    let _ = reattach_tx.send(Reattach {
                        half: write_half,
                        restart: false,
                    });
                    drop(read_half);
                    return Err(ProtocolError::Compression(message).into());
                }
            },
        };

        let (read_half, write_half) = tokio::io::split(stream);
        reattach_tx
            .send(Reattach {
                half: write_half,
                restart: true,
            })
            .map_err(|_| Error::Disconnected)?;
        match upgrade {
            ChannelUpgrade::Tls => self.shared.set_secure(),
            ChannelUpgrade::Compression(_) => self.shared.set_compressed(),
        }
        let generation = self.shared.next_generation();
        log::debug!(
            "Channel upgraded ({:?}), now at generation {}",
            upgrade,
            generation
        );
        Ok(read_half)
    }
}
