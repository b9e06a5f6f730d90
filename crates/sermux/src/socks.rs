//! SOCKS5 front-end (RFC 1928 subset: no auth, CONNECT only).

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{relay, ChannelMux, FrontError, FrontProtocol};

pub(crate) const SOCKS_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Serve one SOCKS5 client: negotiate, resolve the target, tunnel, relay.
pub(crate) async fn handle_socks5(
    mux: &Arc<ChannelMux>,
    mut stream: TcpStream,
) -> Result<(), FrontError> {
    // Method negotiation.
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(FrontError::Protocol(format!("bad SOCKS version {}", head[0])));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(FrontError::Protocol("no acceptable auth method".into()));
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP ADDR PORT.
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    if req[0] != SOCKS_VERSION {
        return Err(FrontError::Protocol("bad request version".into()));
    }

    let host = match req[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name)
                .map_err(|_| FrontError::Protocol("domain name is not UTF-8".into()))?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        other => {
            send_reply(&mut stream, REP_ATYP_NOT_SUPPORTED).await?;
            return Err(FrontError::Protocol(format!("address type {other} not supported")));
        }
    };
    let port = stream.read_u16().await?;

    if req[1] != CMD_CONNECT {
        send_reply(&mut stream, REP_COMMAND_NOT_SUPPORTED).await?;
        return Err(FrontError::Protocol(format!("command {} not supported", req[1])));
    }

    match mux.open_tunnel(&host, port, FrontProtocol::Socks5).await {
        Ok(channel) => {
            send_reply(&mut stream, REP_SUCCEEDED).await?;
            tracing::info!(host = %host, port, cid = channel.cid(), "socks5 tunnel open");
            relay(channel, stream).await;
            Ok(())
        }
        Err(e) => {
            send_reply(&mut stream, REP_HOST_UNREACHABLE).await?;
            Err(FrontError::Rpc(e))
        }
    }
}

/// Reply with a zeroed IPv4 bind address, per the standard shortcut.
async fn send_reply(stream: &mut TcpStream, rep: u8) -> std::io::Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}
