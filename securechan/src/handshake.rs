//! The one-round asymmetric handshake that negotiates the two AES key/IV
//! pairs used by a [`SecureChannel`].
//!
//! Runs over a plaintext [`MessageChannel`]: the local side generates an RSA
//! keypair plus its own outbound AES key/IV, announces its RSA public key
//! (`RSA_TYPE`), and waits for the peer to do the same. On seeing the peer's
//! public key it wraps its outbound AES material and sends it (`AES_TYPE`);
//! on seeing the peer's wrapped AES material it unwraps it with its own RSA
//! private key. Once both halves have landed, a [`SecureChannel`] is built.
//!
//! The two halves are joined by plain sequential control flow on a single
//! consumer of the channel's event stream, rather than a cross-task
//! rendezvous: this crate delivers channel events to exactly one consumer at
//! a time (see the module docs on [`crate::message`]), so there is no second
//! task whose completion a barrier would need to wait for.

use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tokio::sync::mpsc;

use crate::attrs::Attributes;
use crate::error::{CryptoError, HandshakeError, ProtocolError};
use crate::message::{ChannelEvent, MessageChannel, AES_TYPE, RSA_TYPE, UNKNOWN_CONTEXT};
use crate::secure::{CipherPair, SecureChannel, SecureEvent};

/// RSA modulus size for the handshake keypair, in bits.
const RSA_KEY_BITS: usize = 3072;

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

/// Runs the handshake to completion over `channel`, consuming its event
/// stream, and returns a ready [`SecureChannel`] (with its own event stream)
/// on success.
pub async fn handshake(
    channel: MessageChannel,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) -> Result<(SecureChannel, mpsc::UnboundedReceiver<SecureEvent>), HandshakeError> {
    let mut rng = OsRng;

    let inbound_private = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS).map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    let inbound_public = RsaPublicKey::from(&inbound_private);
    let outbound_symmetric = CipherPair::generate(&mut rng);

    let public_der = inbound_public.to_pkcs1_der().map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    let mut announce = Attributes::new();
    announce.insert("R".to_string(), bytes::Bytes::from(public_der.as_bytes().to_vec()));
    channel.send(RSA_TYPE, &announce, UNKNOWN_CONTEXT);
    tracing::debug!("handshake: announced RSA public key");

    let mut outbound_complete = false;
    let mut inbound_complete = false;
    let mut inbound_symmetric: Option<CipherPair> = None;

    while !(outbound_complete && inbound_complete) {
        let event = events.recv().await.ok_or(HandshakeError::Disconnected)?;

        match event {
            ChannelEvent::MessageReceived { type_code, attrs, .. } if type_code == RSA_TYPE => {
                if outbound_complete {
                    continue;
                }
                if attrs.len() != 1 {
                    return Err(ProtocolError::UnexpectedAttributes { expected: &["R"], found: attrs.keys().cloned().collect() }.into());
                }
                let r = attrs
                    .get("R")
                    .ok_or_else(|| ProtocolError::UnexpectedAttributes { expected: &["R"], found: attrs.keys().cloned().collect() })?;

                let peer_public = RsaPublicKey::from_pkcs1_der(r).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

                let encrypted_iv = peer_public.encrypt(&mut rng, oaep(), &outbound_symmetric.iv).map_err(|e| CryptoError::Encrypt(e.to_string()))?;
                let encrypted_key = peer_public.encrypt(&mut rng, oaep(), &outbound_symmetric.key).map_err(|e| CryptoError::Encrypt(e.to_string()))?;

                let mut wrapped = Attributes::new();
                wrapped.insert("V".to_string(), bytes::Bytes::from(encrypted_iv));
                wrapped.insert("K".to_string(), bytes::Bytes::from(encrypted_key));
                channel.send(AES_TYPE, &wrapped, UNKNOWN_CONTEXT);

                outbound_complete = true;
                tracing::debug!("handshake: outbound direction complete");
            }
            ChannelEvent::MessageReceived { type_code, attrs, .. } if type_code == AES_TYPE => {
                if inbound_complete {
                    continue;
                }
                if attrs.len() != 2 {
                    return Err(ProtocolError::UnexpectedAttributes { expected: &["V", "K"], found: attrs.keys().cloned().collect() }.into());
                }
                let v = attrs
                    .get("V")
                    .ok_or_else(|| ProtocolError::UnexpectedAttributes { expected: &["V", "K"], found: attrs.keys().cloned().collect() })?;
                let k = attrs
                    .get("K")
                    .ok_or_else(|| ProtocolError::UnexpectedAttributes { expected: &["V", "K"], found: attrs.keys().cloned().collect() })?;

                let iv = inbound_private.decrypt(oaep(), v).map_err(|e| CryptoError::Decrypt(e.to_string()))?;
                let key = inbound_private.decrypt(oaep(), k).map_err(|e| CryptoError::Decrypt(e.to_string()))?;

                inbound_symmetric = Some(CipherPair::from_parts(key, iv)?);
                inbound_complete = true;
                tracing::debug!("handshake: inbound direction complete");
            }
            ChannelEvent::MessageReceived { type_code, .. } => {
                tracing::debug!(type_code, "handshake: ignoring unrelated message");
            }
            ChannelEvent::MessageSendComplete { .. } => {}
            ChannelEvent::Error { error, .. } => {
                return Err(HandshakeError::ChannelErrored(error.to_string()));
            }
            ChannelEvent::Disconnected => {
                return Err(HandshakeError::Disconnected);
            }
        }
    }

    tracing::info!("handshake complete");
    Ok(SecureChannel::new(channel, events, outbound_symmetric, inbound_symmetric.expect("inbound_complete implies Some")))
}
