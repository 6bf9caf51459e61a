//! A thin demo binary exercising `securechan` end to end: bind-and-accept on
//! one side, dial on the other, optionally negotiate a secure channel, then
//! exchange a single hello message.

use std::net::SocketAddr;

use anyhow::{bail, Result};
use clap::Parser;
use securechan::{self, ChannelEvent, SecureEvent};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "securechan", about = "Point-to-point framed messaging demo")]
struct Args {
    /// Bind and accept a single inbound connection on this address.
    #[clap(long, conflicts_with = "connect")]
    listen: Option<SocketAddr>,

    /// Dial a peer already listening on this address.
    #[clap(long, conflicts_with = "listen")]
    connect: Option<SocketAddr>,

    /// Negotiate a secure channel before exchanging the demo message.
    #[clap(long)]
    secure: bool,

    /// Increase log verbosity; repeat for more detail (0=info .. 3=trace).
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn initialize_logger(verbosity: u8) {
    let directive = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    std::env::set_var("RUST_LOG", directive);

    let filter = EnvFilter::from_default_env()
        .add_directive("mio=off".parse().unwrap())
        .add_directive("tokio_util=off".parse().unwrap());

    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(verbosity > 2).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logger(args.verbose);

    match (args.listen, args.connect) {
        (Some(addr), None) => run_listener(addr, args.secure).await,
        (None, Some(addr)) => run_dialer(addr, args.secure).await,
        _ => bail!("exactly one of --listen or --connect is required"),
    }
}

async fn run_listener(addr: SocketAddr, secure: bool) -> Result<()> {
    let listener = securechan::Listener::bind(addr).await?;
    tracing::info!(%addr, "listening for a single connection");
    let (mut handle, mut events) = listener.start();

    let securechan::ListenerEvent::Connected { channel, events: channel_events, peer_address } =
        events.recv().await.expect("listener closed before accepting a connection");
    tracing::info!(%peer_address, "accepted connection");

    if secure {
        let (secure_channel, mut secure_events) = securechan::handshake(channel, channel_events).await?;
        drain_secure(&mut secure_events).await;
        drop(secure_channel);
    } else {
        drain_plain(channel_events).await;
    }

    handle.stop().await;
    Ok(())
}

async fn run_dialer(addr: SocketAddr, secure: bool) -> Result<()> {
    let (channel, events) = securechan::dial(addr).await?;
    tracing::info!(%addr, "dialed peer");

    let mut hello = securechan::Attributes::new();
    hello.insert("hello".to_string(), bytes::Bytes::from_static(b"world"));

    if secure {
        let (secure_channel, mut secure_events) = securechan::handshake(channel, events).await?;
        secure_channel.send(&hello);
        drain_secure(&mut secure_events).await;
    } else {
        channel.send(1, &hello, securechan::UNKNOWN_CONTEXT);
        drain_plain(events).await;
    }

    Ok(())
}

async fn drain_plain(mut events: tokio::sync::mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::MessageReceived { context, type_code, attrs, .. } => {
                tracing::info!(context, type_code, attrs = ?attrs, "message received");
            }
            ChannelEvent::MessageSendComplete { context } => tracing::debug!(context, "send complete"),
            ChannelEvent::Error { error, .. } => tracing::warn!(%error, "channel error"),
            ChannelEvent::Disconnected => {
                tracing::info!("peer disconnected");
                return;
            }
        }
    }
}

async fn drain_secure(events: &mut tokio::sync::mpsc::UnboundedReceiver<SecureEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SecureEvent::MessageReceived { context, attrs } => {
                tracing::info!(context, attrs = ?attrs, "secure message received");
            }
            SecureEvent::Errored { error, .. } => tracing::warn!(%error, "secure channel error"),
            SecureEvent::Disconnected => {
                tracing::info!("peer disconnected");
                return;
            }
        }
    }
}
