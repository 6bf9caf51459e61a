//! The two ways a channel comes into existence: accepting inbound
//! connections, or dialing out to a peer.
//!
//! Deliberately thin: no peer bookkeeping, no reconnection, no backlog
//! tuning beyond what `TcpListener` gives for free.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::message::{ChannelEvent, MessageChannel};

/// Events emitted by a running [`Listener`].
pub enum ListenerEvent {
    Connected { channel: MessageChannel, events: mpsc::UnboundedReceiver<ChannelEvent>, peer_address: SocketAddr },
}

/// Connects out to `addr` and wraps the resulting stream in a [`MessageChannel`].
pub async fn dial(addr: SocketAddr) -> Result<(MessageChannel, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
    let stream = TcpStream::connect(addr).await?;
    tracing::info!(%addr, "dialed peer");
    MessageChannel::new(stream)
}

/// A bound TCP listener that hands out one [`MessageChannel`] per accepted
/// connection through its own event stream.
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(local_addr = %listener.local_addr()?, "listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawns the accept loop, returning a handle to stop it and its event stream.
    ///
    /// A failure to accept a single connection is logged and does not stop
    /// the loop; the loop itself ends (and the event stream closes) only if
    /// the listening socket itself errors out.
    pub fn start(self) -> (ListenerHandle, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(accept_loop(self.listener, tx));
        (ListenerHandle { task: Some(task) }, rx)
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<ListenerEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_address)) => match MessageChannel::new(stream) {
                Ok((channel, channel_events)) => {
                    tracing::info!(%peer_address, "accepted connection");
                    if events.send(ListenerEvent::Connected { channel, events: channel_events, peer_address }).is_err() {
                        return;
                    }
                }
                Err(error) => tracing::warn!(%error, %peer_address, "failed to wrap accepted connection"),
            },
            Err(error) => {
                tracing::error!(%error, "listener socket errored; accept loop stopping");
                return;
            }
        }
    }
}

/// A handle to a running accept loop.
pub struct ListenerHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ListenerHandle {
    /// Stops the accept loop. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_and_dial_round_trip() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (mut handle, mut listener_events) = listener.start();

        let (dial_channel, mut dial_events) = dial(addr).await.unwrap();

        let ListenerEvent::Connected { channel: accepted_channel, events: mut accepted_events, peer_address } =
            listener_events.recv().await.unwrap();
        assert_eq!(peer_address, dial_channel.remote_address());

        let mut attrs = crate::attrs::Attributes::new();
        attrs.insert("k".to_string(), bytes::Bytes::from_static(b"v"));
        dial_channel.send(42, &attrs, crate::message::UNKNOWN_CONTEXT);

        match accepted_events.recv().await.unwrap() {
            ChannelEvent::MessageReceived { type_code, attrs: received, .. } => {
                assert_eq!(type_code, 42);
                assert_eq!(received, attrs);
            }
            other => panic!("unexpected event {other:?}"),
        }

        accepted_channel.send(43, &crate::attrs::Attributes::new(), crate::message::UNKNOWN_CONTEXT);
        match dial_events.recv().await.unwrap() {
            ChannelEvent::MessageReceived { type_code, .. } => assert_eq!(type_code, 43),
            other => panic!("unexpected event {other:?}"),
        }

        handle.stop().await;
    }
}
