//! Peer identity: keypairs, peer ID fingerprint, signatures and sealed-box encryption.

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

/// Public key bundle length: Ed25519 verifying key (32) + X25519 public key (32).
pub const PUBLIC_KEY_LEN: usize = 64;

const KEY_FILE: &str = "identity.key";
const SEAL_INFO: &[u8] = b"xbridge-seal-v1";
const SEAL_NONCE_LEN: usize = 12;
const SEAL_MIN_LEN: usize = 32 + SEAL_NONCE_LEN + 16;

/// Peer ID: first 16 bytes of SHA-256 over the public key bundle.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "hex_16")] [u8; 16]);

mod hex_16 {
    use serde::{Deserialize, Deserializer, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(v))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(d)?;
        let buf = hex::decode(s).map_err(serde::de::Error::custom)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl PeerId {
    pub fn from_public_key(public: &[u8]) -> Self {
        let digest = Sha256::digest(public);
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        PeerId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let buf = hex::decode(s).map_err(|_| IdentityError::InvalidPeerId)?;
        let id: [u8; 16] = buf.try_into().map_err(|_| IdentityError::InvalidPeerId)?;
        Ok(PeerId(id))
    }
}

/// Key/identity provider used by the handshake.
pub trait Identity: Send + Sync {
    /// Public key bundle sent in `Hello`.
    fn public_key(&self) -> Vec<u8>;

    fn fingerprint(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }

    fn sign(&self, message: &[u8]) -> Vec<u8>;

    fn verify(&self, message: &[u8], signature: &[u8], peer_public: &[u8])
        -> Result<(), IdentityError>;

    /// Encrypt so that only the holder of `peer_public` can read it.
    fn encrypt_for(&self, peer_public: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, IdentityError>;

    /// Open a payload produced by a peer's `encrypt_for` with our public key.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, IdentityError>;
}

/// Ed25519 signing key + X25519 static secret. Keep secrets private; expose only the bundle and peer ID.
pub struct Keypair {
    signing: SigningKey,
    exchange: StaticSecret,
    public: [u8; PUBLIC_KEY_LEN],
}

impl Keypair {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let exchange = StaticSecret::random_from_rng(OsRng);
        Self::from_parts(signing, exchange)
    }

    fn from_parts(signing: SigningKey, exchange: StaticSecret) -> Self {
        let mut public = [0u8; PUBLIC_KEY_LEN];
        public[..32].copy_from_slice(signing.verifying_key().as_bytes());
        public[32..].copy_from_slice(X25519PublicKey::from(&exchange).as_bytes());
        Self {
            signing,
            exchange,
            public,
        }
    }

    /// Load `<dir>/identity.key`, generating and persisting a new keypair when absent.
    pub fn load(dir: &Path) -> Result<Self, IdentityError> {
        let path = dir.join(KEY_FILE);
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            return Self::from_secret_bytes(&bytes);
        }
        let keypair = Self::generate();
        std::fs::create_dir_all(dir)?;
        // Owner-only from the moment it exists.
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;
        file.write_all(&keypair.secret_bytes())?;
        file.sync_all()?;
        tracing::info!(peer = %keypair.fingerprint(), path = %path.display(), "generated identity");
        Ok(keypair)
    }

    fn from_secret_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != 64 {
            return Err(IdentityError::KeyLength {
                expected: 64,
                got: bytes.len(),
            });
        }
        let mut signing = [0u8; 32];
        let mut exchange = [0u8; 32];
        signing.copy_from_slice(&bytes[..32]);
        exchange.copy_from_slice(&bytes[32..]);
        Ok(Self::from_parts(
            SigningKey::from_bytes(&signing),
            StaticSecret::from(exchange),
        ))
    }

    fn secret_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.signing.to_bytes());
        out.extend_from_slice(&self.exchange.to_bytes());
        out
    }

    pub fn public_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public
    }
}

impl Identity for Keypair {
    fn public_key(&self) -> Vec<u8> {
        self.public.to_vec()
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    fn verify(
        &self,
        message: &[u8],
        signature: &[u8],
        peer_public: &[u8],
    ) -> Result<(), IdentityError> {
        let (verifying, _) = split_bundle(peer_public)?;
        let verifying =
            VerifyingKey::from_bytes(&verifying).map_err(|_| IdentityError::InvalidPublicKey)?;
        let signature =
            Signature::from_slice(signature).map_err(|_| IdentityError::BadSignature)?;
        verifying
            .verify(message, &signature)
            .map_err(|_| IdentityError::BadSignature)
    }

    fn encrypt_for(&self, peer_public: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, IdentityError> {
        let (_, exchange) = split_bundle(peer_public)?;
        let recipient = X25519PublicKey::from(exchange);
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&recipient);
        let cipher = seal_cipher(shared.as_bytes())?;

        let mut nonce = [0u8; SEAL_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| IdentityError::Seal)?;

        let mut out = Vec::with_capacity(32 + SEAL_NONCE_LEN + sealed.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, IdentityError> {
        if ciphertext.len() < SEAL_MIN_LEN {
            return Err(IdentityError::Open);
        }
        let mut ephemeral = [0u8; 32];
        ephemeral.copy_from_slice(&ciphertext[..32]);
        let nonce = &ciphertext[32..32 + SEAL_NONCE_LEN];
        let shared = self
            .exchange
            .diffie_hellman(&X25519PublicKey::from(ephemeral));
        seal_cipher(shared.as_bytes())?
            .decrypt(Nonce::from_slice(nonce), &ciphertext[32 + SEAL_NONCE_LEN..])
            .map_err(|_| IdentityError::Open)
    }
}

fn split_bundle(public: &[u8]) -> Result<([u8; 32], [u8; 32]), IdentityError> {
    if public.len() != PUBLIC_KEY_LEN {
        return Err(IdentityError::InvalidPublicKey);
    }
    let mut verifying = [0u8; 32];
    let mut exchange = [0u8; 32];
    verifying.copy_from_slice(&public[..32]);
    exchange.copy_from_slice(&public[32..]);
    Ok((verifying, exchange))
}

fn seal_cipher(shared: &[u8; 32]) -> Result<ChaCha20Poly1305, IdentityError> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut key = [0u8; 32];
    hk.expand(SEAL_INFO, &mut key)
        .map_err(|_| IdentityError::Seal)?;
    ChaCha20Poly1305::new_from_slice(&key).map_err(|_| IdentityError::Seal)
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid peer id")]
    InvalidPeerId,
    #[error("invalid key length: expected {expected}, got {got}")]
    KeyLength { expected: usize, got: usize },
    #[error("signature verification failed")]
    BadSignature,
    #[error("sealing failed")]
    Seal,
    #[error("opening sealed payload failed")]
    Open,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
