//! The host-side front door.
//!
//! One TCP listener serves both front-ends: the first byte of a SOCKS5
//! session is always the version octet 0x05, which no HTTP method starts
//! with, so a single peek routes the connection.

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::{http, socks, ChannelMux};

/// Accept loop: sniff each connection and hand it to the right front-end.
pub async fn run_front_door(mux: Arc<ChannelMux>, listener: TcpListener) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let mux = mux.clone();
        tokio::spawn(async move {
            let mut first = [0u8; 1];
            let is_socks = match stream.peek(&mut first).await {
                Ok(1) => first[0] == socks::SOCKS_VERSION,
                _ => return,
            };
            let result = if is_socks {
                socks::handle_socks5(&mux, stream).await
            } else {
                http::handle_connect(&mux, stream).await
            };
            match result {
                Ok(()) => tracing::debug!(%peer, "front-end session finished"),
                Err(e) => tracing::debug!(%peer, error = %e, "front-end session failed"),
            }
        });
    }
}
