//! Layered error taxonomy for the channel stack.
//!
//! Mirrors the severity split the rest of the crate relies on: protocol and
//! crypto errors are per-message and non-fatal to a live channel, while
//! `ChannelError::Disconnected` and handshake errors are terminal.

use thiserror::Error;

/// Malformed wire data: bad start byte, bad lengths, duplicate/missing attributes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected start byte {found:#04x}, expected {expected:#04x}")]
    BadStartByte { found: u8, expected: u8 },

    #[error("declared attribute value length {0} is negative")]
    NegativeValueLength(i32),

    #[error("attribute key {0:?} is not valid ASCII")]
    NonAsciiKey(String),

    #[error("duplicate attribute key {0:?}")]
    DuplicateKey(String),

    #[error("payload ended with {0} trailing byte(s) after the last attribute")]
    TrailingBytes(usize),

    #[error("message header declared total length {declared}, but the minimum possible is {minimum}")]
    HeaderLengthTooShort { declared: i32, minimum: usize },

    #[error("expected exactly the attributes {expected:?}, found {found:?}")]
    UnexpectedAttributes {
        expected: &'static [&'static str],
        found: Vec<String>,
    },

    #[error("attribute value too large to send: {0} bytes")]
    ValueTooLarge(usize),

    #[error("framed message length {0} exceeds what the i32 total-length field can express")]
    FrameTooLarge(usize),
}

/// Cryptographic failures in the handshake or the secure overlay.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("RSA key generation failed: {0}")]
    KeyGeneration(String),

    #[error("RSA encryption failed: {0}")]
    Encrypt(String),

    #[error("RSA decryption failed: {0}")]
    Decrypt(String),

    #[error("invalid RSA public key encoding: {0}")]
    InvalidPublicKey(String),

    #[error("AES-CBC decryption or unpadding failed")]
    AesDecrypt,

    #[error("symmetric key or IV had the wrong length: expected {expected}, got {found}")]
    BadKeyLength { expected: usize, found: usize },
}

/// Errors surfaced by a [`crate::message::MessageChannel`].
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("operation attempted on a disposed channel")]
    Disposed,

    #[error("the peer disconnected")]
    Disconnected,
}

/// Errors surfaced by a [`crate::handshake`] run.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("handshake message was malformed: {0}")]
    Format(#[from] ProtocolError),

    #[error("the underlying channel reported an error: {0}")]
    ChannelErrored(String),

    #[error("the underlying channel disconnected before the handshake completed")]
    Disconnected,
}
