/**
 * protocol/crypto.rs
 *
 * Challenge/proof material: salted password hashing with the
 * server-selected algorithm, and nonce proofs (AES-GCM encrypted
 * nonces demonstrating knowledge of a shared secret).
 */

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha3::{Digest, Sha3_256};

/// Server-issued salt length.
pub const SALT_SIZE: usize = 16;

/// AES-GCM IV length, prepended to every proof blob.
const IV_SIZE: usize = 12;

/// 256-bit key derived from a password or password hash.
pub type SessionKey = [u8; 32];

/// Crypto errors
#[derive(Debug)]
pub enum CryptoError {
    UnknownHashKind(u8),
    EncryptFailed,
    /// Wrong key, truncated blob or tampered ciphertext.
    DecryptFailed,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::UnknownHashKind(kind) => write!(f, "Unknown hash kind: {}", kind),
            CryptoError::EncryptFailed => write!(f, "Nonce encryption failed"),
            CryptoError::DecryptFailed => write!(f, "Nonce decryption failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Hash algorithm selector carried in an auth challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Blake3,
    Sha3,
}

impl HashKind {
    pub fn from_u8(value: u8) -> Result<Self, CryptoError> {
        match value {
            0 => Ok(HashKind::Blake3),
            1 => Ok(HashKind::Sha3),
            other => Err(CryptoError::UnknownHashKind(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            HashKind::Blake3 => 0,
            HashKind::Sha3 => 1,
        }
    }
}

/// Hash a password with a server-issued salt using the selected
/// algorithm. The result doubles as the AES key for the auth proof.
pub fn password_hash(password: &str, salt: &[u8; SALT_SIZE], kind: HashKind) -> SessionKey {
    match kind {
        HashKind::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            hasher.update(password.as_bytes());
            hasher.update(salt);
            *hasher.finalize().as_bytes()
        }
        HashKind::Sha3 => {
            let mut hasher = Sha3_256::new();
            hasher.update(password.as_bytes());
            hasher.update(salt);
            hasher.finalize().into()
        }
    }
}

/// Derive the long-lived session key from a shared secret (the device
/// password). Unsalted: both sides must reach the same key offline.
pub fn derive_session_key(secret: &str) -> SessionKey {
    *blake3::hash(secret.as_bytes()).as_bytes()
}

/// Encrypt a challenge nonce into a proof blob: random IV followed by
/// the AES-256-GCM ciphertext of the nonce bytes.
pub fn encrypt_nonce(nonce: u32, key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let iv: [u8; IV_SIZE] = rand::random();

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), nonce.to_be_bytes().as_ref())
        .map_err(|_| CryptoError::EncryptFailed)?;

    let mut proof = Vec::with_capacity(IV_SIZE + ciphertext.len());
    proof.extend_from_slice(&iv);
    proof.extend_from_slice(&ciphertext);
    Ok(proof)
}

/// Decrypt a proof blob back into the nonce it was built from.
pub fn decrypt_nonce(proof: &[u8], key: &SessionKey) -> Result<u32, CryptoError> {
    if proof.len() <= IV_SIZE {
        return Err(CryptoError::DecryptFailed);
    }

    let (iv, ciphertext) = proof.split_at(IV_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)?;

    let bytes: [u8; 4] = plaintext
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::DecryptFailed)?;
    Ok(u32::from_be_bytes(bytes))
}

/// Encrypt an arbitrary payload for an encrypted wire frame.
pub fn encrypt_payload(payload: &[u8], key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let iv: [u8; IV_SIZE] = rand::random();

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), payload)
        .map_err(|_| CryptoError::EncryptFailed)?;

    let mut blob = Vec::with_capacity(IV_SIZE + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt an encrypted wire frame payload.
pub fn decrypt_payload(blob: &[u8], key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    if blob.len() <= IV_SIZE {
        return Err(CryptoError::DecryptFailed);
    }

    let (iv, ciphertext) = blob.split_at(IV_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}
