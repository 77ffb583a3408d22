// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::io;

use tokio::net::TcpStream;

use super::{proxy, BoxedStream, Dialer};
use crate::config::ProxyConfig;

/// Connects over TCP, directly or through a proxy.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    proxy: Option<ProxyConfig>,
}

impl TcpDialer {
    /// Dialer tunnelling through `proxy`, if given.
    pub fn new(proxy: Option<ProxyConfig>) -> Self {
        Self { proxy }
    }
}

impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = match &self.proxy {
            None => TcpStream::connect((host, port)).await?,
            Some(proxy) => {
                log::debug!(
                    "Connecting to {}:{} via {:?} proxy {}:{}",
                    host,
                    port,
                    proxy.kind,
                    proxy.host,
                    proxy.port
                );
                let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
                proxy::establish(&mut stream, proxy.kind, host, port).await?;
                stream
            }
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dials_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"<hello/>").await.unwrap();
        });
        let mut stream = TcpDialer::default().dial("127.0.0.1", port).await.unwrap();
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"<hello/>");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dials_through_http_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            while !request.ends_with(b"\r\n\r\n") {
                request.push(socket.read_u8().await.unwrap());
            }
            socket
                .write_all(b"HTTP/1.0 200 OK\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8(request).unwrap()
        });
        let dialer = TcpDialer::new(Some(ProxyConfig {
            kind: ProxyKind::Http,
            host: "127.0.0.1".to_owned(),
            port,
        }));
        dialer.dial("xmpp.example.org", 5222).await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT xmpp.example.org:5222 "));
    }
}
