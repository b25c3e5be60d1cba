use std::collections::HashMap;
use std::string;

use aws_lc_rs::{
    aead::{AES_256_GCM, Aad, Nonce, RandomizedNonceKey},
    rand::fill,
};
use base64::{Engine, prelude::BASE64_STANDARD};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while encrypting secret contents.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("An unspecified error occurred while encrypting data")]
    Unspecified(#[from] aws_lc_rs::error::Unspecified),

    #[error("Secret contents could not be serialized for encryption: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors that can occur while decrypting secret contents.
#[derive(Debug, Error)]
pub enum DecryptionError {
    #[error("An unspecified error occurred while decrypting data")]
    Unspecified(#[from] aws_lc_rs::error::Unspecified),

    #[error("An error occurred while decoding BASE64 data for decryption: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("An error occurred while converting bytes to UTF-8 for decryption: {0}")]
    FromUtf8(#[from] string::FromUtf8Error),

    #[error("Decrypted secret contents are not valid: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("There was a mismatch in the key id while decrypting data (got: {0}, expected: {1})")]
    MismatchedKeyId(u32, u32),
}

/// Holds an encryption key and its identifier.
///
/// The identifier is stored alongside every ciphertext so that key rotation
/// can detect records sealed under an older key.
pub struct EncryptionKey {
    /// Unique identifier for the key.
    pub id: u32,
    /// The key material used for encryption and decryption.
    pub key: RandomizedNonceKey,
}

/// An encrypted value with its key id and nonce, as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedValue {
    /// Identifier of the key used for encryption.
    pub id: u32,
    /// Base64-encoded nonce used during encryption.
    pub nonce: String,
    /// Base64-encoded ciphertext.
    pub value: String,
}

/// Encrypts a secret's key/value contents under the given [`EncryptionKey`].
///
/// The map is serialized to JSON before sealing, so the values stay
/// byte-exact through a round trip.
pub fn encrypt_contents(
    contents: &HashMap<String, String>,
    encryption_key: &EncryptionKey,
) -> Result<EncryptedValue, EncryptionError> {
    let plaintext = serde_json::to_vec(contents)?;
    let (ciphertext, nonce) = encrypt(&plaintext, &encryption_key.key)?;

    Ok(EncryptedValue {
        id: encryption_key.id,
        nonce: BASE64_STANDARD.encode(nonce.as_ref()),
        value: BASE64_STANDARD.encode(ciphertext),
    })
}

/// Decrypts secret contents previously produced by [`encrypt_contents`].
///
/// Fails if the key id does not match the configured key, or if decoding,
/// decryption, or deserialization fails.
pub fn decrypt_contents(
    encrypted_value: &EncryptedValue,
    encryption_key: &EncryptionKey,
) -> Result<HashMap<String, String>, DecryptionError> {
    if encrypted_value.id != encryption_key.id {
        return Err(DecryptionError::MismatchedKeyId(
            encrypted_value.id,
            encryption_key.id,
        ));
    }

    let ciphertext = BASE64_STANDARD.decode(&encrypted_value.value)?;
    let nonce = Nonce::try_assume_unique_for_key(&BASE64_STANDARD.decode(&encrypted_value.nonce)?)?;

    let plaintext = decrypt(ciphertext, nonce, &encryption_key.key)?;
    let contents = serde_json::from_slice(&plaintext)?;

    Ok(contents)
}

fn encrypt(
    plaintext: &[u8],
    key: &RandomizedNonceKey,
) -> Result<(Vec<u8>, Nonce), aws_lc_rs::error::Unspecified> {
    let mut in_out = plaintext.to_vec();
    let nonce = key.seal_in_place_append_tag(Aad::empty(), &mut in_out)?;

    Ok((in_out, nonce))
}

fn decrypt(
    mut ciphertext: Vec<u8>,
    nonce: Nonce,
    key: &RandomizedNonceKey,
) -> Result<Vec<u8>, aws_lc_rs::error::Unspecified> {
    let plaintext = key.open_in_place(nonce, Aad::empty(), &mut ciphertext)?;

    Ok(plaintext.to_vec())
}

/// Generates a random key of length `T` bytes for use with AES-256-GCM.
///
/// # Panics
/// Panics if `T` does not match the required key length for the cipher.
pub fn generate_random_key<const T: usize>()
-> Result<RandomizedNonceKey, aws_lc_rs::error::Unspecified> {
    let mut key_bytes = [0u8; T];
    fill(&mut key_bytes)?;

    let key = RandomizedNonceKey::new(&AES_256_GCM, &key_bytes)?;

    Ok(key)
}
