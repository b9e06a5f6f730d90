//! sermux: TCP tunneling over multiplexed serial links.
//!
//! A "host" side accepts local SOCKS5 or HTTP-CONNECT clients; a "proxy"
//! side dials the real destinations. Every client connection becomes a
//! virtual channel multiplexed over one or more shared links carrying
//! framed, byte-stuffed packets.
//!
//! ```text
//!  client ──▶ front door ──▶ ChannelMux ══ PortEngine ══ serial link ═╗
//!  (SOCKS5 / HTTP)              │                                     ║
//!                        VirtualChannel(cid)                          ║
//!                                                                     ║
//!  internet ◀── egress dialer ◀── ChannelMux ══ PortEngine ══════════╝
//! ```
//!
//! The control channel (cid 0) carries the Establish/Connect/Dispose RPC
//! as self-describing [`VarMap`] payloads; its frames bypass the data
//! queue so RPC never sits behind a bulk-transfer backlog.
//!
//! # Wiring it up
//!
//! ```ignore
//! // Proxy (egress) side:
//! let engine = PortEngine::new(0, StreamLink::new(device));
//! let mux = ChannelMux::new(vec![engine]);
//! install_egress(&mux);
//! mux.start();
//!
//! // Host side:
//! let engine = PortEngine::new(0, StreamLink::new(device));
//! let mux = ChannelMux::new(vec![engine]);
//! mux.start();
//! run_front_door(mux, TcpListener::bind(addr).await?).await?;
//! ```
//!
//! [`VarMap`]: sermux_core::VarMap

mod channel;
mod control;
mod egress;
mod engine;
mod error;
mod host;
mod http;
mod link;
mod mux;
mod relay;
mod socks;

pub use channel::*;
pub use control::*;
pub use egress::*;
pub use engine::*;
pub use error::*;
pub use host::*;
pub use link::*;
pub use mux::*;
pub use relay::*;

// The codec layer is part of the public surface.
pub use sermux_core::*;
