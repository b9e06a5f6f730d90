//! The sermux binary: run the host (front door) or the proxy (egress) end.
//!
//! The link between the two ends is any byte stream; this binary wires a
//! TCP socket into the link seam, in either connect or listen mode, which
//! also covers serial devices exported over TCP by a terminal server.
//!
//! ```text
//! sermux proxy --link-listen 0.0.0.0:7000
//! sermux host --link-connect 10.0.0.2:7000 --listen 127.0.0.1:1080
//! curl -x socks5://127.0.0.1:1080 https://example.com
//! ```

use clap::{Parser, Subcommand};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sermux::{install_egress, run_front_door, ChannelMux, PortEngine, StreamLink};

#[derive(Parser)]
#[command(name = "sermux", about = "TCP tunneling over multiplexed serial links")]
struct Cli {
    /// Dial the peer's link endpoint.
    #[arg(long, global = true, value_name = "ADDR", conflicts_with = "link_listen")]
    link_connect: Option<String>,

    /// Wait for the peer to dial this link endpoint.
    #[arg(long, global = true, value_name = "ADDR")]
    link_listen: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept SOCKS5 / HTTP-CONNECT clients and tunnel them to the proxy.
    Host {
        /// Front-door listen address.
        #[arg(long, default_value = "127.0.0.1:1080")]
        listen: String,
    },
    /// Dial destinations on behalf of the host.
    Proxy,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let link = open_link(&cli).await?;
    let mux = ChannelMux::new(vec![PortEngine::new(0, link)]);

    match cli.command {
        Command::Host { listen } => {
            mux.start();
            let listener = TcpListener::bind(&listen).await?;
            tracing::info!(%listen, "front door up");
            run_front_door(mux, listener).await?;
        }
        Command::Proxy => {
            install_egress(&mux);
            mux.start();
            tracing::info!("egress up, waiting for tunnels");
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            mux.shutdown().await;
        }
    }
    Ok(())
}

/// Bring up the link stream per the flags.
async fn open_link(cli: &Cli) -> Result<StreamLink, Box<dyn std::error::Error>> {
    let stream = match (&cli.link_connect, &cli.link_listen) {
        (Some(addr), None) => {
            tracing::info!(%addr, "dialing link peer");
            TcpStream::connect(addr).await?
        }
        (None, Some(addr)) => {
            let listener = TcpListener::bind(addr).await?;
            tracing::info!(%addr, "waiting for link peer");
            let (stream, peer) = listener.accept().await?;
            tracing::info!(%peer, "link peer connected");
            stream
        }
        _ => return Err("exactly one of --link-connect or --link-listen is required".into()),
    };
    stream.set_nodelay(true)?;
    Ok(StreamLink::new(stream))
}
