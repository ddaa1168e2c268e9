//! secp256k1 identities.
//!
//! Every participant (form owner, viewer, editor, submitter, one-time wrap
//! sender) is a [`Keys`] value: a secret scalar plus its BIP-340 x-only
//! public key.
use std::fmt;

use bitcoin_hashes::{hmac, sha256, Hash, HashEngine};
use secp256k1::{KeyPair, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct Keys {
    key_pair: KeyPair,
    public_key: XOnlyPublicKey,
}

impl Keys {
    pub fn new(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let key_pair = KeyPair::from_secret_key(&secp, &secret_key);
        let (public_key, _) = XOnlyPublicKey::from_keypair(&key_pair);
        Keys {
            key_pair,
            public_key,
        }
    }

    /// Fresh random identity.
    pub fn generate() -> Self {
        Keys::new(SecretKey::new(&mut rand::thread_rng()))
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self> {
        Ok(Keys::new(parse_secret_key(secret_hex)?))
    }

    pub fn secret_key(&self) -> SecretKey {
        self.key_pair.secret_key()
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.key_pair.secret_bytes())
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn public_key(&self) -> XOnlyPublicKey {
        self.public_key
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }
}

impl PartialEq for Keys {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
    }
}

impl Eq for Keys {}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

pub fn parse_secret_key(secret_hex: &str) -> Result<SecretKey> {
    let bytes = hex::decode(secret_hex)?;
    Ok(SecretKey::from_slice(&bytes)?)
}

pub fn parse_public_key(public_hex: &str) -> Result<XOnlyPublicKey> {
    let bytes = hex::decode(public_hex)?;
    Ok(XOnlyPublicKey::from_slice(&bytes)?)
}

/// Lift an x-only key to the even-parity full point used for ECDH.
pub fn to_even_public_key(public_key: &XOnlyPublicKey) -> Result<PublicKey> {
    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    compressed[1..].copy_from_slice(&public_key.serialize());
    Ok(PublicKey::from_slice(&compressed)?)
}

/// Submit key handed to a participant for answering a form.
///
/// Deterministic in (signing key, form id, recipient), so re-issuing a grant
/// hands out the same submit identity: anonymous towards the recipient's main
/// key, linkable across that recipient's responses.
pub fn derive_submit_keys(
    signing_keys: &Keys,
    form_id: &str,
    recipient: &XOnlyPublicKey,
) -> Result<Keys> {
    if form_id.is_empty() {
        return Err(Error::InvalidFormId);
    }
    let mut engine = hmac::HmacEngine::<sha256::Hash>::new(&signing_keys.key_pair.secret_bytes());
    engine.input(b"submit:");
    engine.input(form_id.as_bytes());
    engine.input(b":");
    engine.input(hex::encode(recipient.serialize()).as_bytes());
    let digest = hmac::Hmac::<sha256::Hash>::from_engine(engine).to_byte_array();
    Ok(Keys::new(SecretKey::from_slice(&digest)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SK_HEX: &str = "0beebd062ec8735f4243466049d7747ef5d6594ee838de147f8aab842b15e273";

    #[test]
    fn test_hex_roundtrip() {
        let keys = Keys::from_secret_hex(SK_HEX).unwrap();
        assert_eq!(keys.secret_hex(), SK_HEX);
        let pk = parse_public_key(&keys.public_key_hex()).unwrap();
        assert_eq!(pk, keys.public_key());
    }

    #[test]
    fn test_debug_hides_secret() {
        let keys = Keys::from_secret_hex(SK_HEX).unwrap();
        assert!(!format!("{:?}", keys).contains(SK_HEX));
    }

    #[test]
    fn test_invalid_hex_rejected() {
        assert!(matches!(parse_public_key("zz"), Err(Error::InvalidKey(_))));
        assert!(matches!(Keys::from_secret_hex("00"), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_submit_keys_deterministic_per_recipient() {
        let signing = Keys::generate();
        let alice = Keys::generate().public_key();
        let bob = Keys::generate().public_key();

        let a1 = derive_submit_keys(&signing, "f1", &alice).unwrap();
        let a2 = derive_submit_keys(&signing, "f1", &alice).unwrap();
        let b = derive_submit_keys(&signing, "f1", &bob).unwrap();

        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_ne!(a1.public_key(), alice);
    }

    #[test]
    fn test_submit_keys_need_form_id() {
        let signing = Keys::generate();
        let alice = Keys::generate().public_key();
        assert!(matches!(
            derive_submit_keys(&signing, "", &alice),
            Err(Error::InvalidFormId)
        ));
    }
}
