//! Wire framing and the plaintext message channel.
//!
//! Frame layout (29-byte header, all integers little-endian):
//!
//! ```text
//! start_byte:u8 ++ total_length:i32 ++ message_context:u64 ++ response_context:u64 ++ type_code:u64 ++ payload
//! ```
//!
//! `total_length` counts the whole frame, header included, so a message with
//! no attributes has `total_length == HEADER_LEN`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::attrs::{self, Attributes};
use crate::error::{ChannelError, ProtocolError};
use crate::pump::{PumpResult, ReadPumpHandle};

pub const START_BYTE: u8 = 0x47;
pub const HEADER_LEN: usize = 1 + 4 + 8 + 8 + 8;
pub const UNKNOWN_CONTEXT: u64 = u64::MAX;

pub const RSA_TYPE: u64 = 4391;
pub const AES_TYPE: u64 = 4392;
pub const SECURE_TYPE: u64 = 7919;

/// Events emitted by a [`MessageChannel`] over its lifetime.
#[derive(Debug)]
pub enum ChannelEvent {
    MessageReceived { context: u64, type_code: u64, response_context: u64, attrs: Attributes },
    MessageSendComplete { context: u64 },
    Error { context: Option<u64>, error: Arc<ChannelError> },
    Disconnected,
}

struct Header {
    total_length: i32,
    message_context: u64,
    response_context: u64,
    type_code: u64,
}

fn parse_header(buf: &[u8]) -> Result<Header, ProtocolError> {
    let mut buf = Bytes::copy_from_slice(buf);
    let start = buf.get_u8();
    if start != START_BYTE {
        return Err(ProtocolError::BadStartByte { found: start, expected: START_BYTE });
    }
    let total_length = buf.get_i32_le();
    if (total_length as i64) < HEADER_LEN as i64 {
        return Err(ProtocolError::HeaderLengthTooShort { declared: total_length, minimum: HEADER_LEN });
    }
    let message_context = buf.get_u64_le();
    let response_context = buf.get_u64_le();
    let type_code = buf.get_u64_le();
    Ok(Header { total_length, message_context, response_context, type_code })
}

fn write_header(dst: &mut BytesMut, total_length: i32, message_context: u64, response_context: u64, type_code: u64) {
    dst.put_u8(START_BYTE);
    dst.put_i32_le(total_length);
    dst.put_u64_le(message_context);
    dst.put_u64_le(response_context);
    dst.put_u64_le(type_code);
}

struct OutgoingFrame {
    context: u64,
    bytes: Bytes,
}

/// A framed, typed-and-attributed message channel over a connected TCP stream.
///
/// Reads and writes are each serialized by a single dedicated task: the
/// receive loop uses a [`ReadPumpHandle`] to pull exact-length buffers off the
/// wire, and a single writer task drains an ordered outbound queue so that
/// frames reach the wire in the order their contexts were allocated.
pub struct MessageChannel {
    remote_address: SocketAddr,
    context_counter: AtomicU64,
    disconnected: Arc<AtomicBool>,
    outbox: mpsc::UnboundedSender<OutgoingFrame>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    receive_task: Option<tokio::task::JoinHandle<()>>,
    write_task: Option<tokio::task::JoinHandle<()>>,
}

impl MessageChannel {
    /// Wraps an already-connected stream, spawning the receive loop and the
    /// ordered writer. Returns the channel alongside its event stream.
    pub fn new(stream: TcpStream) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
        let remote_address = stream.peer_addr()?;
        let (read_half, mut write_half) = tokio::io::split(stream);

        let pump = ReadPumpHandle::spawn(read_half);
        let disconnected = Arc::new(AtomicBool::new(false));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<OutgoingFrame>();

        let write_task = {
            let event_tx = event_tx.clone();
            let disconnected = disconnected.clone();
            tokio::spawn(async move {
                while let Some(frame) = outbox_rx.recv().await {
                    if let Err(error) = write_half.write_all(&frame.bytes).await {
                        tracing::warn!(%error, context = frame.context, "failed to write frame");
                        emit_disconnect(&event_tx, &disconnected);
                        return;
                    }
                    let _ = event_tx.send(ChannelEvent::MessageSendComplete { context: frame.context });
                }
            })
        };

        let receive_task = {
            let event_tx = event_tx.clone();
            let disconnected = disconnected.clone();
            tokio::spawn(receive_loop(pump, event_tx, disconnected, remote_address))
        };

        Ok((
            Self {
                remote_address,
                context_counter: AtomicU64::new(0),
                disconnected,
                outbox: outbox_tx,
                events: event_tx,
                receive_task: Some(receive_task),
                write_task: Some(write_task),
            },
            event_rx,
        ))
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    /// Allocates the next message-context, frames `attrs` under `type_code`,
    /// and enqueues the frame for the writer task.
    ///
    /// Returns [`UNKNOWN_CONTEXT`] (and emits an [`ChannelEvent::Error`])
    /// without allocating a context if the channel is disconnected, a single
    /// attribute value is too large to frame, or the framed message as a
    /// whole would overflow the `i32` total-length field.
    pub fn send(&self, type_code: u64, attrs: &Attributes, response_context: u64) -> u64 {
        if self.disconnected.load(Ordering::SeqCst) {
            let _ = self.events.send(ChannelEvent::Error { context: None, error: Arc::new(ChannelError::Disconnected) });
            return UNKNOWN_CONTEXT;
        }

        let mut payload = BytesMut::with_capacity(attrs::encoded_len(attrs));
        if let Err(error) = attrs::encode(attrs, &mut payload) {
            let _ = self.events.send(ChannelEvent::Error { context: None, error: Arc::new(ChannelError::Protocol(error)) });
            return UNKNOWN_CONTEXT;
        }

        let total_length = HEADER_LEN + payload.len();
        if total_length > i32::MAX as usize {
            let _ = self.events.send(ChannelEvent::Error {
                context: None,
                error: Arc::new(ChannelError::Protocol(ProtocolError::FrameTooLarge(total_length))),
            });
            return UNKNOWN_CONTEXT;
        }

        let context = self.context_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let mut frame = BytesMut::with_capacity(total_length);
        write_header(&mut frame, total_length as i32, context, response_context, type_code);
        frame.unsplit(payload);

        if self.outbox.send(OutgoingFrame { context, bytes: frame.freeze() }).is_err() {
            return UNKNOWN_CONTEXT;
        }
        context
    }

    /// Releases the underlying stream and waits for both workers to exit.
    pub async fn dispose(&mut self) {
        self.disconnected.store(true, Ordering::SeqCst);
        if let Some(task) = self.receive_task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(task) = self.write_task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

fn emit_disconnect(events: &mpsc::UnboundedSender<ChannelEvent>, disconnected: &AtomicBool) {
    if disconnected.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
        let _ = events.send(ChannelEvent::Disconnected);
    }
}

async fn receive_loop(
    pump: ReadPumpHandle,
    events: mpsc::UnboundedSender<ChannelEvent>,
    disconnected: Arc<AtomicBool>,
    remote_address: SocketAddr,
) {
    loop {
        let header_rx = pump.begin_read(HEADER_LEN);
        let header_bytes = match header_rx.await {
            Ok(PumpResult::Filled(buf)) => buf,
            Ok(PumpResult::Disconnected) | Err(_) => {
                tracing::info!(%remote_address, "channel disconnected");
                emit_disconnect(&events, &disconnected);
                return;
            }
        };
        pump.end_read();

        let header = match parse_header(&header_bytes) {
            Ok(header) => header,
            Err(error) => {
                tracing::warn!(%error, %remote_address, "malformed message header");
                let _ = events.send(ChannelEvent::Error { context: None, error: Arc::new(ChannelError::Protocol(error)) });
                continue;
            }
        };

        let payload_len = header.total_length as usize - HEADER_LEN;
        let payload = if payload_len == 0 {
            Bytes::new()
        } else {
            let payload_rx = pump.begin_read(payload_len);
            match payload_rx.await {
                Ok(PumpResult::Filled(buf)) => {
                    pump.end_read();
                    Bytes::from(buf)
                }
                Ok(PumpResult::Disconnected) | Err(_) => {
                    tracing::info!(%remote_address, "channel disconnected mid-message");
                    emit_disconnect(&events, &disconnected);
                    return;
                }
            }
        };

        match attrs::decode(payload) {
            Ok(attrs) => {
                tracing::debug!(context = header.message_context, type_code = header.type_code, %remote_address, "message received");
                let _ = events.send(ChannelEvent::MessageReceived {
                    context: header.message_context,
                    type_code: header.type_code,
                    response_context: header.response_context,
                    attrs,
                });
            }
            Err(error) => {
                tracing::warn!(%error, %remote_address, "malformed message payload");
                let _ = events.send(ChannelEvent::Error {
                    context: Some(header.message_context),
                    error: Arc::new(ChannelError::Protocol(error)),
                });
            }
        }
    }
}
