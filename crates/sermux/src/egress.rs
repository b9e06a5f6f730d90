//! The proxy-side egress dialer.

use std::sync::Arc;

use tokio::net::TcpStream;

use crate::{relay, ChannelMux, RpcError};

/// Register the TCP dialer that services Connect commands.
///
/// The dial resolves the Connect RPC; the relay then runs on its own task
/// until either the socket or the channel closes.
pub fn install_egress(mux: &Arc<ChannelMux>) {
    mux.control().set_dialer(Box::new(|channel, host, port, proto| {
        Box::pin(async move {
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| RpcError::Refused(format!("dial {host}:{port}: {e}")))?;
            tracing::info!(cid = channel.cid(), host = %host, port, ?proto, "outbound dial up");
            tokio::spawn(relay(channel, stream));
            Ok(())
        })
    }));
}
