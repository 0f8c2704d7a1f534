//! Hello/Connect handshake: nonce exchange, signed key transport, cipher setup.
//!
//! Transcript convention (both sides): `encrypted_key || encrypted_iv || client_nonce || server_nonce`.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::cipher::{CipherContext, CipherError};
use crate::identity::{Identity, IdentityError, PeerId};
use crate::protocol::{Connect, Hello, PROTOCOL_VERSION};

pub const NONCE_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    HelloSent,
    HelloReceived,
    KeyExchanged,
    Ready,
    Failed,
}

/// Which end of the stream we are. The client speaks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Client,
    Server,
}

pub fn random_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn hello(identity: &dyn Identity, nonce: &[u8]) -> Hello {
    Hello {
        protocol_version: PROTOCOL_VERSION,
        public_key: identity.public_key(),
        nonce: nonce.to_vec(),
    }
}

/// Check a peer's hello and return its fingerprint.
pub fn accept_hello(hello: &Hello) -> Result<PeerId, HandshakeError> {
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(HandshakeError::Version(hello.protocol_version));
    }
    if hello.nonce.len() != NONCE_LEN {
        return Err(HandshakeError::Nonce);
    }
    Ok(PeerId::from_public_key(&hello.public_key))
}

/// Bytes covered by the client's signature.
pub fn connect_transcript(
    encrypted_key: &[u8],
    encrypted_iv: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        encrypted_key.len() + encrypted_iv.len() + client_nonce.len() + server_nonce.len(),
    );
    out.extend_from_slice(encrypted_key);
    out.extend_from_slice(encrypted_iv);
    out.extend_from_slice(client_nonce);
    out.extend_from_slice(server_nonce);
    out
}

/// Client side: fresh session cipher, sealed to the server and signed over both nonces.
pub fn client_key_exchange(
    identity: &dyn Identity,
    server_hello: &Hello,
    client_nonce: &[u8],
) -> Result<(CipherContext, Connect), HandshakeError> {
    let cipher = CipherContext::generate();
    let encrypted_key = identity.encrypt_for(&server_hello.public_key, cipher.key())?;
    let encrypted_iv = identity.encrypt_for(&server_hello.public_key, cipher.iv())?;
    let transcript = connect_transcript(
        &encrypted_key,
        &encrypted_iv,
        client_nonce,
        &server_hello.nonce,
    );
    let signature = identity.sign(&transcript);
    Ok((
        cipher,
        Connect::Exchange {
            encrypted_key,
            encrypted_iv,
            signature,
        },
    ))
}

/// Server side: verify the client's signature, then open the session key/IV.
pub fn server_accept(
    identity: &dyn Identity,
    client_hello: &Hello,
    connect: &Connect,
    server_nonce: &[u8],
) -> Result<CipherContext, HandshakeError> {
    let Connect::Exchange {
        encrypted_key,
        encrypted_iv,
        signature,
    } = connect
    else {
        return Err(HandshakeError::UnexpectedAck);
    };
    let transcript = connect_transcript(
        encrypted_key,
        encrypted_iv,
        &client_hello.nonce,
        server_nonce,
    );
    identity
        .verify(&transcript, signature, &client_hello.public_key)
        .map_err(|_| HandshakeError::BadSignature)?;
    let key = identity.decrypt(encrypted_key)?;
    let iv = identity.decrypt(encrypted_iv)?;
    Ok(CipherContext::from_slices(&key, &iv)?)
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("invalid nonce")]
    Nonce,
    #[error("connection verify failed")]
    BadSignature,
    #[error("expected key exchange, got acknowledgement")]
    UnexpectedAck,
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
}
