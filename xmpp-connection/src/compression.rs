// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream compression (XEP-0138).

use core::fmt;
use core::pin::Pin;
use core::str::FromStr;
use core::task::{Context, Poll};
use std::io;

use bytes::{Buf, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const READ_CHUNK: usize = 4096;

/// A compression method as named in XEP-0138 negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionMethod {
    /// RFC 1950 ZLIB
    Zlib,
    /// LZW (XEP-0229). Can be advertised, but is never applied.
    Lzw,
}

impl CompressionMethod {
    /// Name used in `<method/>`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zlib => "zlib",
            Self::Lzw => "lzw",
        }
    }

    /// Whether a channel can be wrapped with this method.
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Zlib)
    }
}

impl FromStr for CompressionMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "zlib" => Ok(Self::Zlib),
            "lzw" => Ok(Self::Lzw),
            _ => Err(()),
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn zlib_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

pin_project_lite::pin_project! {
    /// Wrapper which zlib-compresses everything written and decompresses
    /// everything read.
    ///
    /// Every write is completed with a sync flush, so that each element is
    /// decodable by the peer as soon as it has been sent.
    pub struct CompressedStream<T> {
        #[pin]
        inner: T,
        compress: Compress,
        decompress: Decompress,
        rx_buf: BytesMut,
        rx_eof: bool,
        tx_buf: Vec<u8>,
        tx_pos: usize,
    }
}

impl<T> CompressedStream<T> {
    /// Wrap `inner` with zlib.
    pub fn zlib(inner: T) -> Self {
        Self {
            inner,
            compress: Compress::new(Compression::default(), true),
            decompress: Decompress::new(true),
            rx_buf: BytesMut::new(),
            rx_eof: false,
            tx_buf: Vec::new(),
            tx_pos: 0,
        }
    }

    /// Obtain a reference to the wrapped stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

fn compress_into(compress: &mut Compress, mut input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
    loop {
        out.reserve(input.len() / 2 + 64);
        let before = compress.total_in();
        compress
            .compress_vec(input, out, FlushCompress::Sync)
            .map_err(zlib_error)?;
        let consumed = (compress.total_in() - before) as usize;
        input = &input[consumed..];
        // The flush is complete once the compressor stops filling all of
        // the output space it was given.
        if input.is_empty() && out.len() < out.capacity() {
            return Ok(());
        }
    }
}

fn poll_drain<T: AsyncWrite>(
    mut inner: Pin<&mut T>,
    cx: &mut Context<'_>,
    buf: &mut Vec<u8>,
    pos: &mut usize,
) -> Poll<io::Result<()>> {
    while *pos < buf.len() {
        let n = ready!(inner.as_mut().poll_write(cx, &buf[*pos..]))?;
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
        *pos += n;
    }
    buf.clear();
    *pos = 0;
    Poll::Ready(Ok(()))
}

impl<T: AsyncRead> AsyncRead for CompressedStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        read_buf: &mut ReadBuf,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        if read_buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if !this.rx_buf.is_empty() {
                let out = read_buf.initialize_unfilled();
                let before_in = this.decompress.total_in();
                let before_out = this.decompress.total_out();
                let status = this
                    .decompress
                    .decompress(&this.rx_buf[..], out, FlushDecompress::None)
                    .map_err(zlib_error)?;
                let consumed = (this.decompress.total_in() - before_in) as usize;
                let produced = (this.decompress.total_out() - before_out) as usize;
                this.rx_buf.advance(consumed);
                if status == Status::StreamEnd {
                    *this.rx_eof = true;
                }
                if produced > 0 {
                    read_buf.advance(produced);
                    return Poll::Ready(Ok(()));
                }
            }
            if *this.rx_eof {
                return Poll::Ready(Ok(()));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            ready!(this.inner.as_mut().poll_read(cx, &mut chunk_buf))?;
            if chunk_buf.filled().is_empty() {
                *this.rx_eof = true;
                if !this.rx_buf.is_empty() {
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                return Poll::Ready(Ok(()));
            }
            this.rx_buf.extend_from_slice(chunk_buf.filled());
        }
    }
}

impl<T: AsyncWrite> AsyncWrite for CompressedStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        ready!(poll_drain(this.inner.as_mut(), cx, this.tx_buf, this.tx_pos))?;
        compress_into(this.compress, buf, this.tx_buf)?;
        // Push out as much as possible right away; the rest goes with the
        // next write or flush.
        if let Poll::Ready(Err(e)) = poll_drain(this.inner, cx, this.tx_buf, this.tx_pos) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(poll_drain(this.inner.as_mut(), cx, this.tx_buf, this.tx_pos))?;
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(poll_drain(this.inner.as_mut(), cx, this.tx_buf, this.tx_pos))?;
        this.inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn each_write_is_readable_immediately() {
        let (lhs, rhs) = tokio::io::duplex(65536);
        let mut lhs = CompressedStream::zlib(lhs);
        let mut rhs = CompressedStream::zlib(rhs);

        lhs.write_all(b"<presence/>").await.unwrap();
        lhs.flush().await.unwrap();
        let mut buf = [0u8; 64];
        let n = rhs.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<presence/>");

        rhs.write_all(b"<message/>").await.unwrap();
        rhs.flush().await.unwrap();
        let n = lhs.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<message/>");
    }

    #[tokio::test]
    async fn large_payload_survives() {
        let (lhs, rhs) = tokio::io::duplex(1024);
        let mut lhs = CompressedStream::zlib(lhs);
        let mut rhs = CompressedStream::zlib(rhs);
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            lhs.write_all(&payload).await.unwrap();
            lhs.shutdown().await.unwrap();
        });
        let mut received = Vec::new();
        rhs.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[test]
    fn method_names() {
        assert_eq!("zlib".parse(), Ok(CompressionMethod::Zlib));
        assert_eq!(CompressionMethod::Lzw.as_str(), "lzw");
        assert!(!CompressionMethod::Lzw.is_supported());
        assert!("deflate".parse::<CompressionMethod>().is_err());
    }
}
