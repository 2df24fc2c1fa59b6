//! Default crypto provider for agent sessions.
//!
//! - Bootstrap keys: x25519 (256 bits)
//! - Session keys: SHA-256 over the x25519 shared secret
//! - Traffic: ChaCha20-Poly1305, sealed as `base64(nonce || ciphertext)`

use agent_relay_core::{
    CryptoProvider, Keypair, SessionKey,
    traits::CryptoError,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, AeadCore, KeyInit},
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Only key size the x25519 provider produces.
pub const KEYPAIR_BITS: usize = 256;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SESSION_KEY_CONTEXT: &[u8] = b"agent-relay/session-key/v1";

/// x25519 + ChaCha20-Poly1305 provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardCrypto;

impl StandardCrypto {
    /// Create the provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn cipher_for(key: &SessionKey) -> Result<ChaCha20Poly1305, CryptoError> {
    ChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| {
        CryptoError::InvalidKey(format!(
            "expected {KEY_LEN}-byte session key, got {}",
            key.as_bytes().len()
        ))
    })
}

fn key_bytes(bytes: &[u8], what: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    <[u8; KEY_LEN]>::try_from(bytes).map_err(|_| {
        CryptoError::InvalidKey(format!(
            "{what} must be {KEY_LEN} bytes, got {}",
            bytes.len()
        ))
    })
}

impl CryptoProvider for StandardCrypto {
    fn generate_asymmetric_keypair(&self, bits: usize) -> Result<Keypair, CryptoError> {
        if bits != KEYPAIR_BITS {
            return Err(CryptoError::UnsupportedKeySize(bits));
        }
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let secret_bytes = Zeroizing::new(secret.to_bytes());
        Ok(Keypair::new(public.as_bytes().to_vec(), secret_bytes.to_vec()))
    }

    fn symmetric_encrypt(&self, plaintext: &[u8], key: &SessionKey) -> Result<String, CryptoError> {
        let cipher = cipher_for(key)?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    fn symmetric_decrypt(
        &self,
        ciphertext: &str,
        key: &SessionKey,
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = cipher_for(key)?;
        let sealed = BASE64
            .decode(ciphertext.trim())
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::Decrypt(format!(
                "sealed payload is {} bytes, shorter than the nonce",
                sealed.len()
            )));
        }

        let (nonce, body) = sealed.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }

    fn derive_session_key(
        &self,
        local: &Keypair,
        peer_public: &[u8],
    ) -> Result<SessionKey, CryptoError> {
        let secret = StaticSecret::from(key_bytes(local.secret(), "secret key")?);
        let peer = PublicKey::from(key_bytes(peer_public, "peer public key")?);

        let shared = secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            tracing::warn!("rejected low-order peer public key");
            return Err(CryptoError::InvalidKey("low-order peer public key".into()));
        }

        let mut hasher = Sha256::new();
        hasher.update(SESSION_KEY_CONTEXT);
        hasher.update(shared.as_bytes());
        Ok(SessionKey::new(hasher.finalize().to_vec()))
    }
}
