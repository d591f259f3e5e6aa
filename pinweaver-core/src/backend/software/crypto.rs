//! Key material and primitives of the software backend.
//!
//! - Leaf MAC: HMAC-SHA256 over `label (u64 LE) || metadata`.
//! - Sealed secrets: XChaCha20-Poly1305, associated data = label bytes.
//! - Pairing: X25519, pairing key = HKDF-SHA256 of the shared secret.
//! - Biometrics session key: HKDF-SHA256 of the pairing key salted with
//!   `client_nonce || server_nonce`.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::backend::{BackendError, BackendResult};
use crate::hash_tree::Label;
use crate::types::Hash;

const PAIRING_INFO: &[u8] = b"pinweaver pairing";
const SESSION_INFO: &[u8] = b"pinweaver biometrics session";

/// Size of an XChaCha20-Poly1305 nonce.
pub const NONCE_SIZE: usize = 24;

/// Backend-internal keys. Never leave the backend.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub(super) struct BackendKeys {
    hmac_key: [u8; 32],
    seal_key: [u8; 32],
}

impl BackendKeys {
    pub(super) fn generate() -> Self {
        Self {
            hmac_key: random_bytes(),
            seal_key: random_bytes(),
        }
    }

    /// MAC of a leaf; also its node value in the tree.
    pub(super) fn leaf_mac(&self, label: Label, metadata: &[u8]) -> BackendResult<Hash> {
        Ok(self.mac_state(label, metadata)?.finalize().into_bytes().into())
    }

    /// Constant-time check of `mac` against the leaf contents.
    pub(super) fn verify_leaf_mac(
        &self,
        label: Label,
        metadata: &[u8],
        mac: &Hash,
    ) -> BackendResult<()> {
        self.mac_state(label, metadata)?
            .verify_slice(mac)
            .map_err(|_| BackendError::InvalidLeaf {
                reason: format!("MAC mismatch for label {label}"),
            })
    }

    fn mac_state(&self, label: Label, metadata: &[u8]) -> BackendResult<Hmac<Sha256>> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.hmac_key).map_err(|e| {
            BackendError::Hardware {
                reason: format!("HMAC init failed: {e}"),
            }
        })?;
        mac.update(&label.0.to_le_bytes());
        mac.update(metadata);
        Ok(mac)
    }

    pub(super) fn seal(
        &self,
        label: Label,
        plaintext: &[u8],
    ) -> BackendResult<([u8; NONCE_SIZE], Vec<u8>)> {
        let nonce = random_bytes::<NONCE_SIZE>();
        let ciphertext = aead_encrypt(&self.seal_key, &nonce, &label.0.to_le_bytes(), plaintext)?;
        Ok((nonce, ciphertext))
    }

    pub(super) fn unseal(
        &self,
        label: Label,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
    ) -> BackendResult<Vec<u8>> {
        aead_decrypt(&self.seal_key, nonce, &label.0.to_le_bytes(), ciphertext).map_err(|_| {
            BackendError::InvalidLeaf {
                reason: format!("sealed secrets of label {label} do not open"),
            }
        })
    }
}

impl std::fmt::Debug for BackendKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendKeys")
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

/// Key shared with an external auth channel after `generate_pk`.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub(super) struct PairingKey(pub(super) [u8; 32]);

impl std::fmt::Debug for PairingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PairingKey([REDACTED])")
    }
}

/// Derives the channel pairing key from an X25519 shared secret.
///
/// Both the backend and the paired client run this on their side of the
/// key agreement.
///
/// # Errors
///
/// Returns [`BackendError::Hardware`] if HKDF expansion fails.
pub fn derive_pairing_key(shared_secret: &[u8; 32]) -> BackendResult<[u8; 32]> {
    hkdf_expand(None, shared_secret, PAIRING_INFO)
}

/// Derives the per-attempt key that encrypts a rate limiter's HE secret.
///
/// # Errors
///
/// Returns [`BackendError::Hardware`] if HKDF expansion fails.
pub fn derive_session_key(
    pairing_key: &[u8; 32],
    client_nonce: &[u8; 32],
    server_nonce: &[u8; 32],
) -> BackendResult<[u8; 32]> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(client_nonce);
    salt[32..].copy_from_slice(server_nonce);
    hkdf_expand(Some(&salt), pairing_key, SESSION_INFO)
}

/// Opens `encrypted_he_secret` from a `StartBiometricsAuth` reply.
///
/// # Errors
///
/// Returns [`BackendError::InvalidArgument`] if the ciphertext does not
/// authenticate under `session_key`.
pub fn decrypt_he_secret(
    session_key: &[u8; 32],
    iv: &[u8; NONCE_SIZE],
    encrypted_he_secret: &[u8],
) -> BackendResult<Vec<u8>> {
    aead_decrypt(session_key, iv, &[], encrypted_he_secret).map_err(|_| {
        BackendError::InvalidArgument {
            reason: "encrypted HE secret does not authenticate".to_string(),
        }
    })
}

pub(super) fn encrypt_he_secret(
    session_key: &[u8; 32],
    iv: &[u8; NONCE_SIZE],
    he_secret: &[u8],
) -> BackendResult<Vec<u8>> {
    aead_encrypt(session_key, iv, &[], he_secret)
}

pub(super) fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn hkdf_expand(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> BackendResult<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut key = [0u8; 32];
    hkdf.expand(info, &mut key)
        .map_err(|_| BackendError::Hardware {
            reason: "HKDF expansion failed".to_string(),
        })?;
    Ok(key)
}

fn aead_encrypt(
    key: &[u8; 32],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> BackendResult<Vec<u8>> {
    XChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| BackendError::Hardware {
            reason: "XChaCha20-Poly1305 encryption failed".to_string(),
        })
}

fn aead_decrypt(
    key: &[u8; 32],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, chacha20poly1305::aead::Error> {
    XChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
}
