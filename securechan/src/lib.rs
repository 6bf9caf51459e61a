//! A point-to-point framed messaging channel, with an optional AES-encrypted
//! overlay negotiated by a one-round RSA handshake.
//!
//! ```text
//! Listener/dial -> MessageChannel -> (optional) handshake -> SecureChannel
//! ```
//!
//! [`MessageChannel`] frames typed, keyed-attribute messages over a TCP
//! stream (see [`message`] for the wire format). [`handshake::handshake`]
//! runs over a fresh `MessageChannel` to negotiate per-direction AES-256-CBC
//! keys and hands back a [`secure::SecureChannel`] that transparently
//! encrypts and decrypts message payloads. [`listener::Listener`] and
//! [`listener::dial`] are the two ways a `MessageChannel` comes into being.

#![forbid(unsafe_code)]

pub mod attrs;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod message;
pub mod pump;
pub mod secure;

pub use attrs::Attributes;
pub use error::{ChannelError, CryptoError, HandshakeError, ProtocolError};
pub use handshake::handshake;
pub use listener::{dial, Listener, ListenerEvent, ListenerHandle};
pub use message::{ChannelEvent, MessageChannel, AES_TYPE, RSA_TYPE, SECURE_TYPE, UNKNOWN_CONTEXT};
pub use secure::{SecureChannel, SecureEvent};
