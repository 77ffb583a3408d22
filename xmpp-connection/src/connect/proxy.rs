// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tunnelling through HTTP `CONNECT` and SOCKS5 proxies.

use std::io;
use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ProxyKind;

const MAX_RESPONSE_HEADER: usize = 8192;

fn proxy_error<S: Into<String>>(msg: S) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, msg.into())
}

/// Ask the proxy on `stream` to open a tunnel to `host:port`.
pub(crate) async fn establish<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    kind: ProxyKind,
    host: &str,
    port: u16,
) -> io::Result<()> {
    match kind {
        ProxyKind::Http => http_connect(stream, host, port).await,
        ProxyKind::Socks5 => socks5_connect(stream, host, port).await,
    }
}

async fn http_connect<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    port: u16,
) -> io::Result<()> {
    let authority = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Byte by byte, so that nothing beyond the response header is consumed.
    let mut response = Vec::new();
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_RESPONSE_HEADER {
            return Err(proxy_error("proxy response header too long"));
        }
        response.push(stream.read_u8().await?);
    }
    let status_line = response
        .split(|b| *b == b'\r')
        .next()
        .map(String::from_utf8_lossy)
        .unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or("");
    let status = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") || !status.starts_with('2') || status.len() != 3 {
        return Err(proxy_error(format!(
            "proxy refused tunnel: {}",
            status_line.trim()
        )));
    }
    log::debug!("HTTP proxy tunnel to {} established", authority);
    Ok(())
}

fn socks5_reply_message(code: u8) -> &'static str {
    match code {
        1 => "general SOCKS server failure",
        2 => "connection not allowed by ruleset",
        3 => "network unreachable",
        4 => "host unreachable",
        5 => "connection refused",
        6 => "TTL expired",
        7 => "command not supported",
        8 => "address type not supported",
        _ => "unknown SOCKS5 error",
    }
}

async fn socks5_connect<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    port: u16,
) -> io::Result<()> {
    // Version 5, one method: no authentication.
    stream.write_all(&[5, 1, 0]).await?;
    stream.flush().await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [5, 0] {
        return Err(proxy_error("SOCKS5 proxy requires unsupported authentication"));
    }

    let mut request = vec![5, 1, 0];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(1);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(4);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len())
                .map_err(|_| proxy_error("host name too long for SOCKS5"))?;
            request.push(3);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 5 {
        return Err(proxy_error("invalid SOCKS5 reply"));
    }
    if reply[1] != 0 {
        return Err(proxy_error(format!(
            "SOCKS5 proxy: {}",
            socks5_reply_message(reply[1])
        )));
    }
    let addr_len = match reply[3] {
        1 => 4,
        4 => 16,
        3 => stream.read_u8().await? as usize,
        _ => return Err(proxy_error("invalid SOCKS5 address type")),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    log::debug!("SOCKS5 tunnel to {}:{} established", host, port);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn http_connect_success() {
        let (mut client, mut proxy) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            let mut request = Vec::new();
            while !request.ends_with(b"\r\n\r\n") {
                request.push(proxy.read_u8().await.unwrap());
            }
            proxy
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n<stream>")
                .await
                .unwrap();
            String::from_utf8(request).unwrap()
        });
        establish(&mut client, ProxyKind::Http, "xmpp.example.org", 5222)
            .await
            .unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT xmpp.example.org:5222 HTTP/1.1\r\n"));
        // Tunnelled bytes are left in the stream.
        let mut rest = [0u8; 8];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"<stream>");
    }

    #[tokio::test]
    async fn http_connect_refused() {
        let (mut client, mut proxy) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let _ = proxy.read(&mut buf).await;
            proxy
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .unwrap();
        });
        let err = establish(&mut client, ProxyKind::Http, "xmpp.example.org", 5222)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn socks5_domain_request() {
        let (mut client, mut proxy) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            proxy.write_all(&[5, 0]).await.unwrap();
            let mut head = [0u8; 5];
            proxy.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[5, 1, 0, 3]);
            let mut name = vec![0u8; head[4] as usize + 2];
            proxy.read_exact(&mut name).await.unwrap();
            proxy
                .write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0x14, 0x66])
                .await
                .unwrap();
            name
        });
        establish(&mut client, ProxyKind::Socks5, "example.org", 5222)
            .await
            .unwrap();
        let name = server.await.unwrap();
        assert_eq!(&name[..11], b"example.org");
        assert_eq!(&name[11..], &5222u16.to_be_bytes());
    }

    #[tokio::test]
    async fn socks5_failure_code() {
        let (mut client, mut proxy) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).await.unwrap();
            proxy.write_all(&[5, 0]).await.unwrap();
            let mut request = [0u8; 10];
            proxy.read_exact(&mut request).await.unwrap();
            proxy
                .write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });
        let err = establish(&mut client, ProxyKind::Socks5, "192.0.2.1", 5222)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }
}
