/// NIP-44: Encrypted Payloads (Versioned)
///
/// Conversation crypto used by every higher layer: seals, wraps and the
/// encrypted form body. Only version 2 is implemented.
///
/// - secp256k1 ECDH, x-coordinate only
/// - HKDF-SHA256 (extract for the conversation key, expand per message)
/// - length-prefixed padding to a power-of-two chunk
/// - ChaCha20 for encryption
/// - HMAC-SHA256 over `nonce || ciphertext`
/// - base64 for encoding
use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use bitcoin_hashes::{hmac, sha256, Hash, HashEngine};
use chacha20::{
    cipher::{KeyIvInit, StreamCipher},
    ChaCha20,
};
use rand::{rngs::OsRng, RngCore};
use secp256k1::{SecretKey, XOnlyPublicKey};
use thiserror::Error;

use crate::keys;

/// Version byte for the encryption algorithm
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Version {
    /// secp256k1 ECDH, HKDF, padding, ChaCha20, HMAC-SHA256
    V2 = 2,
}

impl TryFrom<u8> for Version {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            2 => Ok(Version::V2),
            _ => Err(Error::DecryptionFailed),
        }
    }
}

/// Errors that can occur during encryption/decryption.
///
/// Decryption deliberately has a single failure kind: a wrong key and a
/// corrupted payload are indistinguishable to the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid key")]
    InvalidKey,

    /// Plaintext must be 1..=65535 bytes
    #[error("invalid plaintext length: {0}")]
    InvalidPlaintextLength(usize),
}

const SALT: &[u8] = b"nip44-v2";
const NONCE_SIZE: usize = 32;
const CHACHA_KEY_SIZE: usize = 32;
const CHACHA_NONCE_SIZE: usize = 12;
const HMAC_KEY_SIZE: usize = 32;
const VERSION_SIZE: usize = 1;
const MAC_SIZE: usize = 32;
const MIN_PLAINTEXT_SIZE: usize = 1;
const MAX_PLAINTEXT_SIZE: usize = 65535;
const MIN_ENCODED_SIZE: usize = 132;
const MAX_ENCODED_SIZE: usize = 87472;
const MIN_DECODED_SIZE: usize = 99;
const MAX_DECODED_SIZE: usize = 65603;

/// Symmetric key shared by two identities.
///
/// `ConversationKey::derive(a_sk, b_pk) == ConversationKey::derive(b_sk, a_pk)`.
#[derive(Clone, PartialEq, Eq)]
pub struct ConversationKey([u8; 32]);

impl ConversationKey {
    /// Derive the conversation key from a local secret key and a remote x-only public key.
    pub fn derive(secret_key: &SecretKey, public_key: &XOnlyPublicKey) -> Result<Self, Error> {
        let remote = keys::to_even_public_key(public_key).map_err(|_| Error::InvalidKey)?;
        let point = secp256k1::ecdh::shared_secret_point(&remote, secret_key);
        let shared_x = &point[..32];
        Ok(ConversationKey(hmac_sha256(SALT, &[shared_x])))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ConversationKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConversationKey(<redacted>)")
    }
}

struct MessageKeys {
    chacha_key: [u8; CHACHA_KEY_SIZE],
    chacha_nonce: [u8; CHACHA_NONCE_SIZE],
    hmac_key: [u8; HMAC_KEY_SIZE],
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut engine = hmac::HmacEngine::<sha256::Hash>::new(key);
    for part in parts {
        engine.input(part);
    }
    hmac::Hmac::<sha256::Hash>::from_engine(engine).to_byte_array()
}

/// HKDF-expand the conversation key with the message nonce as info (76 bytes).
fn message_keys(conversation_key: &ConversationKey, nonce: &[u8; NONCE_SIZE]) -> MessageKeys {
    let mut okm = [0u8; 96];
    let mut previous: Vec<u8> = Vec::new();
    for (i, block) in okm.chunks_mut(32).enumerate() {
        let counter = [i as u8 + 1];
        let t = hmac_sha256(conversation_key.as_bytes(), &[&previous, nonce, &counter]);
        block.copy_from_slice(&t);
        previous = t.to_vec();
    }

    let mut keys = MessageKeys {
        chacha_key: [0u8; CHACHA_KEY_SIZE],
        chacha_nonce: [0u8; CHACHA_NONCE_SIZE],
        hmac_key: [0u8; HMAC_KEY_SIZE],
    };
    keys.chacha_key.copy_from_slice(&okm[0..32]);
    keys.chacha_nonce.copy_from_slice(&okm[32..44]);
    keys.hmac_key.copy_from_slice(&okm[44..76]);
    keys
}

/// Constant-time comparison of two byte arrays
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

fn apply_chacha20(keys: &MessageKeys, data: &mut [u8]) {
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(data);
}

/// Padded length for a plaintext of `unpadded_len` bytes.
pub fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (unpadded_len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((unpadded_len - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let len = plaintext.len();
    if !(MIN_PLAINTEXT_SIZE..=MAX_PLAINTEXT_SIZE).contains(&len) {
        return Err(Error::InvalidPlaintextLength(len));
    }
    let mut padded = Vec::with_capacity(2 + calc_padded_len(len));
    padded.extend_from_slice(&(len as u16).to_be_bytes());
    padded.extend_from_slice(plaintext);
    padded.resize(2 + calc_padded_len(len), 0);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<Vec<u8>, Error> {
    if padded.len() < 2 {
        return Err(Error::DecryptionFailed);
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len < MIN_PLAINTEXT_SIZE
        || 2 + len > padded.len()
        || padded.len() != 2 + calc_padded_len(len)
    {
        return Err(Error::DecryptionFailed);
    }
    Ok(padded[2..2 + len].to_vec())
}

/// Encrypt a UTF-8 plaintext under a conversation key.
pub fn encrypt(conversation_key: &ConversationKey, plaintext: &str) -> Result<String, Error> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    encrypt_with_nonce(conversation_key, plaintext, nonce)
}

/// Encrypt with a caller-chosen nonce. Only meant for test vectors.
pub fn encrypt_with_nonce(
    conversation_key: &ConversationKey,
    plaintext: &str,
    nonce: [u8; NONCE_SIZE],
) -> Result<String, Error> {
    let keys = message_keys(conversation_key, &nonce);
    let mut ciphertext = pad(plaintext.as_bytes())?;
    apply_chacha20(&keys, &mut ciphertext);

    let mac = hmac_sha256(&keys.hmac_key, &[&nonce, &ciphertext]);

    let mut payload =
        Vec::with_capacity(VERSION_SIZE + NONCE_SIZE + ciphertext.len() + MAC_SIZE);
    payload.push(Version::V2 as u8);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    payload.extend_from_slice(&mac);

    Ok(general_purpose::STANDARD.encode(&payload))
}

/// Decrypt a base64 payload under a conversation key.
pub fn decrypt(conversation_key: &ConversationKey, encoded_payload: &str) -> Result<String, Error> {
    if !(MIN_ENCODED_SIZE..=MAX_ENCODED_SIZE).contains(&encoded_payload.len())
        || encoded_payload.starts_with('#')
    {
        return Err(Error::DecryptionFailed);
    }
    let payload = general_purpose::STANDARD
        .decode(encoded_payload)
        .map_err(|_| Error::DecryptionFailed)?;
    if !(MIN_DECODED_SIZE..=MAX_DECODED_SIZE).contains(&payload.len()) {
        return Err(Error::DecryptionFailed);
    }
    Version::try_from(payload[0])?;

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&payload[VERSION_SIZE..VERSION_SIZE + NONCE_SIZE]);
    let mac_start = payload.len() - MAC_SIZE;
    let ciphertext = &payload[VERSION_SIZE + NONCE_SIZE..mac_start];

    let keys = message_keys(conversation_key, &nonce);
    let expected_mac = hmac_sha256(&keys.hmac_key, &[&nonce, ciphertext]);
    if !constant_time_eq(&expected_mac, &payload[mac_start..]) {
        return Err(Error::DecryptionFailed);
    }

    let mut padded = ciphertext.to_vec();
    apply_chacha20(&keys, &mut padded);
    let plaintext = unpad(&padded)?;
    String::from_utf8(plaintext).map_err(|_| Error::DecryptionFailed)
}

/// Key-pair convenience wrapper over the conversation-key API.
pub struct Nip44;

impl Nip44 {
    /// Encrypt plaintext with the sender's secret key and the recipient's public key
    pub fn encrypt(
        plaintext: &str,
        sender_sk: &SecretKey,
        recipient_pk: &XOnlyPublicKey,
    ) -> Result<String, Error> {
        let conversation_key = ConversationKey::derive(sender_sk, recipient_pk)?;
        encrypt(&conversation_key, plaintext)
    }

    /// Decrypt a payload with the recipient's secret key and the sender's public key
    pub fn decrypt(
        encoded_payload: &str,
        recipient_sk: &SecretKey,
        sender_pk: &XOnlyPublicKey,
    ) -> Result<String, Error> {
        let conversation_key = ConversationKey::derive(recipient_sk, sender_pk)?;
        decrypt(&conversation_key, encoded_payload)
    }

    /// Hex encoded conversation key for two identities
    pub fn get_conversation_key(
        sender_sk: &SecretKey,
        recipient_pk: &XOnlyPublicKey,
    ) -> Result<String, Error> {
        Ok(ConversationKey::derive(sender_sk, recipient_pk)?.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_len_table() {
        let cases = [
            (16, 32),
            (32, 32),
            (33, 64),
            (49, 64),
            (64, 64),
            (65, 96),
            (100, 128),
            (200, 224),
            (320, 320),
            (383, 384),
            (515, 640),
            (900, 1024),
            (65535, 65536),
        ];
        for (len, expected) in cases {
            assert_eq!(calc_padded_len(len), expected, "len {}", len);
        }
    }

    #[test]
    fn test_pad_unpad() {
        let padded = pad(b"hello").unwrap();
        assert_eq!(padded.len(), 34);
        assert_eq!(&padded[..2], &[0, 5]);
        assert_eq!(unpad(&padded).unwrap(), b"hello");
    }

    #[test]
    fn test_empty_plaintext_rejected() {
        let key = ConversationKey::from_bytes([7u8; 32]);
        assert_eq!(encrypt(&key, ""), Err(Error::InvalidPlaintextLength(0)));
    }

    #[test]
    fn test_unpad_rejects_wrong_padding() {
        let mut padded = pad(b"hello").unwrap();
        padded.push(0);
        assert_eq!(unpad(&padded), Err(Error::DecryptionFailed));
    }

    #[test]
    fn test_wrong_key_is_decryption_failed() {
        let key = ConversationKey::from_bytes([1u8; 32]);
        let other = ConversationKey::from_bytes([2u8; 32]);
        let payload = encrypt(&key, "secret form body").unwrap();
        assert_eq!(decrypt(&other, &payload), Err(Error::DecryptionFailed));
        assert_eq!(decrypt(&key, &payload).unwrap(), "secret form body");
    }

    #[test]
    fn test_unknown_version_is_decryption_failed() {
        let key = ConversationKey::from_bytes([1u8; 32]);
        let payload = encrypt(&key, "x").unwrap();
        let mut raw = general_purpose::STANDARD.decode(payload).unwrap();
        raw[0] = 1;
        let tampered = general_purpose::STANDARD.encode(raw);
        assert_eq!(decrypt(&key, &tampered), Err(Error::DecryptionFailed));
    }
}
