//! HTTP-CONNECT front-end.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{relay, ChannelMux, FrontError, FrontProtocol};

/// Largest request head we accept before giving up.
const MAX_HEAD: usize = 8192;

const RESP_OK: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const RESP_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const RESP_METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";
const RESP_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Serve one HTTP client: parse `CONNECT host:port`, tunnel, relay.
pub(crate) async fn handle_connect(
    mux: &Arc<ChannelMux>,
    mut stream: TcpStream,
) -> Result<(), FrontError> {
    let head = match read_request_head(&mut stream).await {
        Ok(head) => head,
        Err(e) => {
            let _ = stream.write_all(RESP_BAD_REQUEST).await;
            return Err(e);
        }
    };

    let (host, port) = match parse_connect_target(&head) {
        Ok(target) => target,
        Err(e @ FrontError::Protocol(_)) => {
            let response = if head.starts_with("CONNECT") {
                RESP_BAD_REQUEST
            } else {
                RESP_METHOD_NOT_ALLOWED
            };
            let _ = stream.write_all(response).await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    match mux.open_tunnel(&host, port, FrontProtocol::HttpConnect).await {
        Ok(channel) => {
            stream.write_all(RESP_OK).await?;
            tracing::info!(host = %host, port, cid = channel.cid(), "http tunnel open");
            relay(channel, stream).await;
            Ok(())
        }
        Err(e) => {
            let _ = stream.write_all(RESP_BAD_GATEWAY).await;
            Err(FrontError::Rpc(e))
        }
    }
}

/// Read the request head through the blank line.
///
/// Byte-at-a-time so nothing after the head is consumed; CONNECT clients
/// wait for the 200 before sending tunnel bytes, but there is no reason to
/// bet on it.
async fn read_request_head(stream: &mut TcpStream) -> Result<String, FrontError> {
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD {
            return Err(FrontError::Protocol("request head too large".into()));
        }
        head.push(stream.read_u8().await?);
    }
    String::from_utf8(head).map_err(|_| FrontError::Protocol("request head is not UTF-8".into()))
}

/// Extract `host` and `port` from `CONNECT host:port HTTP/1.x`.
fn parse_connect_target(head: &str) -> Result<(String, u16), FrontError> {
    let request_line = head
        .split("\r\n")
        .next()
        .ok_or_else(|| FrontError::Protocol("empty request".into()))?;
    let mut parts = request_line.split_whitespace();

    let method = parts
        .next()
        .ok_or_else(|| FrontError::Protocol("missing method".into()))?;
    if method != "CONNECT" {
        return Err(FrontError::Protocol(format!("method {method} not supported")));
    }

    let target = parts
        .next()
        .ok_or_else(|| FrontError::Protocol("missing target".into()))?;
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| FrontError::Protocol("target has no port".into()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| FrontError::Protocol("bad port".into()))?;

    // Bracketed IPv6 literals arrive as [addr]:port.
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    Ok((host.to_owned(), port))
}
