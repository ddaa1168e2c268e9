/// NIP-04: Encrypted Direct Message (legacy)
///
/// AES-256-CBC keyed by the raw ECDH x-coordinate, encoded as
/// `base64(ciphertext)?iv=base64(iv)`. Kept so a [`crate::signer::Signer`]
/// can speak both encryption standards; new payloads use NIP-44.
use aes::Aes256;
use base64::{engine::general_purpose, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use secp256k1::{SecretKey, XOnlyPublicKey};
use thiserror::Error;

use crate::keys;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_SIZE: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid key")]
    InvalidKey,

    #[error("decryption failed")]
    DecryptionFailed,
}

fn shared_key(secret_key: &SecretKey, public_key: &XOnlyPublicKey) -> Result<[u8; 32], Error> {
    let remote = keys::to_even_public_key(public_key).map_err(|_| Error::InvalidKey)?;
    let point = secp256k1::ecdh::shared_secret_point(&remote, secret_key);
    let mut key = [0u8; 32];
    key.copy_from_slice(&point[..32]);
    Ok(key)
}

pub fn encrypt(
    plaintext: &str,
    sender_sk: &SecretKey,
    recipient_pk: &XOnlyPublicKey,
) -> Result<String, Error> {
    let key = shared_key(sender_sk, recipient_pk)?;
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    Ok(format!(
        "{}?iv={}",
        general_purpose::STANDARD.encode(ciphertext),
        general_purpose::STANDARD.encode(iv)
    ))
}

pub fn decrypt(
    content: &str,
    recipient_sk: &SecretKey,
    sender_pk: &XOnlyPublicKey,
) -> Result<String, Error> {
    let key = shared_key(recipient_sk, sender_pk)?;
    let (ciphertext_b64, iv_b64) = content.split_once("?iv=").ok_or(Error::DecryptionFailed)?;

    let ciphertext = general_purpose::STANDARD
        .decode(ciphertext_b64.trim())
        .map_err(|_| Error::DecryptionFailed)?;
    let iv: [u8; IV_SIZE] = general_purpose::STANDARD
        .decode(iv_b64.trim())
        .map_err(|_| Error::DecryptionFailed)?
        .try_into()
        .map_err(|_| Error::DecryptionFailed)?;

    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Error::DecryptionFailed)?;
    String::from_utf8(plaintext).map_err(|_| Error::DecryptionFailed)
}
