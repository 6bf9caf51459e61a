//! The encrypted overlay: AES-256-CBC/ISO10126 payload encryption on top of a
//! plaintext [`MessageChannel`].
//!
//! Every secure message rides on the wire as a single outer message of
//! [`SECURE_TYPE`] carrying one attribute, `"M"`, whose value is the
//! ciphertext of the inner attribute payload. The outer message-context is
//! left unencrypted and carried straight through.

use std::sync::Arc;

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use block_padding::Iso10126;
use bytes::{Bytes, BytesMut};
use rand::RngCore;
use tokio::sync::mpsc;

use crate::attrs::{self, Attributes};
use crate::error::{ChannelError, CryptoError, ProtocolError};
use crate::message::{ChannelEvent, MessageChannel, SECURE_TYPE, UNKNOWN_CONTEXT};

const AES_KEY_LEN: usize = 32;
const AES_IV_LEN: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// A generated or received AES-256 key/IV pair, used for exactly one direction.
#[derive(Clone)]
pub(crate) struct CipherPair {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl CipherPair {
    pub fn generate(rng: &mut impl RngCore) -> Self {
        let mut key = vec![0u8; AES_KEY_LEN];
        let mut iv = vec![0u8; AES_IV_LEN];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    pub fn from_parts(key: Vec<u8>, iv: Vec<u8>) -> Result<Self, CryptoError> {
        if key.len() != AES_KEY_LEN {
            return Err(CryptoError::BadKeyLength { expected: AES_KEY_LEN, found: key.len() });
        }
        if iv.len() != AES_IV_LEN {
            return Err(CryptoError::BadKeyLength { expected: AES_IV_LEN, found: iv.len() });
        }
        Ok(Self { key, iv })
    }

    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(self.key.as_slice().into(), self.iv.as_slice().into()).encrypt_padded_vec_mut::<Iso10126>(plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Aes256CbcDec::new(self.key.as_slice().into(), self.iv.as_slice().into())
            .decrypt_padded_vec_mut::<Iso10126>(ciphertext)
            .map_err(|_| CryptoError::AesDecrypt)
    }
}

/// Events emitted by a [`SecureChannel`].
#[derive(Debug)]
pub enum SecureEvent {
    MessageReceived { context: u64, attrs: Attributes },
    Errored { context: Option<u64>, error: Arc<ChannelError> },
    Disconnected,
}

/// A [`MessageChannel`] wrapped with per-direction AES-256-CBC encryption.
pub struct SecureChannel {
    inner: MessageChannel,
    outbound: CipherPair,
    forward_task: Option<tokio::task::JoinHandle<()>>,
}

impl SecureChannel {
    pub(crate) fn new(
        inner: MessageChannel,
        inner_events: mpsc::UnboundedReceiver<ChannelEvent>,
        outbound: CipherPair,
        inbound: CipherPair,
    ) -> (Self, mpsc::UnboundedReceiver<SecureEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let forward_task = tokio::spawn(forward_loop(inner_events, inbound, tx));
        (Self { inner, outbound, forward_task: Some(forward_task) }, rx)
    }

    /// Encrypts `attrs` under the outbound cipher and sends it as a single
    /// [`SECURE_TYPE`] message. Returns [`UNKNOWN_CONTEXT`] if encoding or
    /// encryption fails; the underlying channel emits its own error event in
    /// that case.
    pub fn send(&self, attrs: &Attributes) -> u64 {
        let mut plaintext = BytesMut::with_capacity(attrs::encoded_len(attrs));
        if attrs::encode(attrs, &mut plaintext).is_err() {
            return UNKNOWN_CONTEXT;
        }

        let ciphertext = self.outbound.encrypt(&plaintext);

        let mut outer = Attributes::new();
        outer.insert("M".to_string(), Bytes::from(ciphertext));
        self.inner.send(SECURE_TYPE, &outer, UNKNOWN_CONTEXT)
    }

    pub fn remote_address(&self) -> std::net::SocketAddr {
        self.inner.remote_address()
    }

    pub async fn dispose(&mut self) {
        if let Some(task) = self.forward_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.inner.dispose().await;
    }
}

async fn forward_loop(mut events: mpsc::UnboundedReceiver<ChannelEvent>, inbound: CipherPair, out: mpsc::UnboundedSender<SecureEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::MessageReceived { context, type_code, attrs, .. } => {
                if type_code != SECURE_TYPE || attrs.len() != 1 {
                    let found: Vec<String> = attrs.keys().cloned().collect();
                    let error = ProtocolError::UnexpectedAttributes { expected: &["M"], found };
                    let _ = out.send(SecureEvent::Errored { context: Some(context), error: Arc::new(ChannelError::Protocol(error)) });
                    continue;
                }
                let Some(ciphertext) = attrs.get("M") else {
                    let error = ProtocolError::UnexpectedAttributes { expected: &["M"], found: vec![] };
                    let _ = out.send(SecureEvent::Errored { context: Some(context), error: Arc::new(ChannelError::Protocol(error)) });
                    continue;
                };

                let plaintext = match inbound.decrypt(ciphertext) {
                    Ok(pt) => pt,
                    Err(error) => {
                        tracing::warn!(%error, context, "failed to decrypt secure message");
                        let _ = out.send(SecureEvent::Errored { context: Some(context), error: Arc::new(ChannelError::Crypto(error)) });
                        continue;
                    }
                };

                match attrs::decode(Bytes::from(plaintext)) {
                    Ok(attrs) => {
                        let _ = out.send(SecureEvent::MessageReceived { context, attrs });
                    }
                    Err(error) => {
                        let _ = out.send(SecureEvent::Errored { context: Some(context), error: Arc::new(ChannelError::Protocol(error)) });
                    }
                }
            }
            ChannelEvent::MessageSendComplete { .. } => {}
            ChannelEvent::Error { context, error } => {
                let _ = out.send(SecureEvent::Errored { context, error });
            }
            ChannelEvent::Disconnected => {
                let _ = out.send(SecureEvent::Disconnected);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_aes_cbc() {
        let mut rng = rand::thread_rng();
        let cipher = CipherPair::generate(&mut rng);

        let plaintext = b"hello world, this spans more than one AES block".to_vec();
        let ciphertext = cipher.encrypt(&plaintext);
        assert_ne!(ciphertext, plaintext);

        let decrypted = cipher.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn rejects_short_keys() {
        assert!(CipherPair::from_parts(vec![0u8; 10], vec![0u8; AES_IV_LEN]).is_err());
        assert!(CipherPair::from_parts(vec![0u8; AES_KEY_LEN], vec![0u8; 3]).is_err());
    }

    async fn loopback_pair() -> (tokio::net::TcpStream, tokio::net::TcpStream) {
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn non_secure_message_yields_format_error() {
        let (server, client) = loopback_pair().await;
        let (server_channel, _server_events) = MessageChannel::new(server).unwrap();
        let (client_channel, client_events) = MessageChannel::new(client).unwrap();

        let mut rng = rand::thread_rng();
        let (mut client_secure, mut client_events) =
            SecureChannel::new(client_channel, client_events, CipherPair::generate(&mut rng), CipherPair::generate(&mut rng));

        // A message that never went through a `SecureChannel::send` at all:
        // wrong type-code and no `"M"` attribute.
        server_channel.send(SECURE_TYPE + 1, &Attributes::new(), UNKNOWN_CONTEXT);

        match client_events.recv().await.unwrap() {
            SecureEvent::Errored { error, .. } => {
                assert!(matches!(*error, ChannelError::Protocol(ProtocolError::UnexpectedAttributes { .. })))
            }
            other => panic!("unexpected event {other:?}"),
        }

        client_secure.dispose().await;
    }

    #[tokio::test]
    async fn wrong_attribute_name_yields_format_error() {
        let (server, client) = loopback_pair().await;
        let (server_channel, _server_events) = MessageChannel::new(server).unwrap();
        let (client_channel, client_events) = MessageChannel::new(client).unwrap();

        let mut rng = rand::thread_rng();
        let (mut client_secure, mut client_events) =
            SecureChannel::new(client_channel, client_events, CipherPair::generate(&mut rng), CipherPair::generate(&mut rng));

        // Right type-code, but the lone attribute isn't named "M".
        let mut outer = Attributes::new();
        outer.insert("X".to_string(), Bytes::from_static(b"not ciphertext"));
        server_channel.send(SECURE_TYPE, &outer, UNKNOWN_CONTEXT);

        match client_events.recv().await.unwrap() {
            SecureEvent::Errored { error, .. } => {
                assert!(matches!(*error, ChannelError::Protocol(ProtocolError::UnexpectedAttributes { .. })))
            }
            other => panic!("unexpected event {other:?}"),
        }

        client_secure.dispose().await;
    }

    #[tokio::test]
    async fn decrypt_failure_yields_crypto_error() {
        let (server, client) = loopback_pair().await;
        let (server_channel, server_events) = MessageChannel::new(server).unwrap();
        let (client_channel, client_events) = MessageChannel::new(client).unwrap();

        let mut rng = rand::thread_rng();
        let server_outbound = CipherPair::generate(&mut rng);
        // Deliberately mismatched with `server_outbound`: the client will
        // never be able to decrypt what the server encrypts.
        let client_inbound = CipherPair::generate(&mut rng);

        let (server_secure, _server_events) = SecureChannel::new(server_channel, server_events, server_outbound, CipherPair::generate(&mut rng));
        let (mut client_secure, mut client_events) =
            SecureChannel::new(client_channel, client_events, CipherPair::generate(&mut rng), client_inbound);

        let mut attrs = Attributes::new();
        attrs.insert("hello".to_string(), Bytes::from_static(b"world"));
        server_secure.send(&attrs);

        match client_events.recv().await.unwrap() {
            SecureEvent::Errored { error, .. } => assert!(matches!(*error, ChannelError::Crypto(CryptoError::AesDecrypt))),
            other => panic!("unexpected event {other:?}"),
        }

        client_secure.dispose().await;
    }
}
