//! The byte pump between a TCP socket and a virtual channel.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::VirtualChannel;

const COPY_BUF: usize = 4096;

/// Pipe bytes both ways until either side closes.
///
/// Channel EOF shuts down the socket's write side; socket EOF (or error)
/// closes the channel, which sends the close signal to the peer.
pub async fn relay(channel: Arc<VirtualChannel>, stream: TcpStream) {
    let (mut tcp_rd, mut tcp_wr) = stream.into_split();

    let to_tcp = {
        let channel = channel.clone();
        async move {
            let mut buf = vec![0u8; COPY_BUF];
            loop {
                match channel.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        let _ = tcp_wr.shutdown().await;
                        break;
                    }
                    Ok(n) => {
                        if tcp_wr.write_all(&buf[..n]).await.is_err() {
                            channel.close();
                            break;
                        }
                    }
                }
            }
        }
    };

    let to_channel = {
        let channel = channel.clone();
        async move {
            let mut buf = vec![0u8; COPY_BUF];
            loop {
                match tcp_rd.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        channel.close();
                        break;
                    }
                    Ok(n) => {
                        if channel.write(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    };

    tokio::join!(to_tcp, to_channel);
    tracing::debug!(cid = channel.cid(), "relay finished");
}
