//! The acting user as an explicit capability.
//!
//! Operations that act as "the current user" take a `&dyn Signer` instead
//! of reading ambient state. Remote signers (browser extensions, bunkers)
//! never hand out their secret key, so everything they are asked to do is
//! expressed as sign / encrypt / decrypt calls.
use async_trait::async_trait;
use secp256k1::XOnlyPublicKey;

use crate::error::{Error, Result};
use crate::event::{Event, UnsignedEvent};
use crate::keys::Keys;
use crate::{nip04, nip44};

#[async_trait]
pub trait Signer: Send + Sync {
    async fn public_key(&self) -> Result<XOnlyPublicKey>;

    /// Sign an event whose pubkey is this signer's key.
    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event>;

    async fn nip04_encrypt(&self, peer: &XOnlyPublicKey, plaintext: &str) -> Result<String>;

    async fn nip04_decrypt(&self, peer: &XOnlyPublicKey, ciphertext: &str) -> Result<String>;

    async fn nip44_encrypt(&self, peer: &XOnlyPublicKey, plaintext: &str) -> Result<String>;

    async fn nip44_decrypt(&self, peer: &XOnlyPublicKey, payload: &str) -> Result<String>;

    async fn public_key_hex(&self) -> Result<String> {
        Ok(hex::encode(self.public_key().await?.serialize()))
    }
}

/// Signer backed by a locally held secret key.
#[derive(Debug, Clone)]
pub struct KeySigner {
    keys: Keys,
}

impl KeySigner {
    pub fn new(keys: Keys) -> Self {
        KeySigner { keys }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }
}

#[async_trait]
impl Signer for KeySigner {
    async fn public_key(&self) -> Result<XOnlyPublicKey> {
        Ok(self.keys.public_key())
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event> {
        unsigned.sign(&self.keys)
    }

    async fn nip04_encrypt(&self, peer: &XOnlyPublicKey, plaintext: &str) -> Result<String> {
        Ok(nip04::encrypt(plaintext, &self.keys.secret_key(), peer)?)
    }

    async fn nip04_decrypt(&self, peer: &XOnlyPublicKey, ciphertext: &str) -> Result<String> {
        Ok(nip04::decrypt(ciphertext, &self.keys.secret_key(), peer)?)
    }

    async fn nip44_encrypt(&self, peer: &XOnlyPublicKey, plaintext: &str) -> Result<String> {
        nip44::Nip44::encrypt(plaintext, &self.keys.secret_key(), peer).map_err(Error::from)
    }

    async fn nip44_decrypt(&self, peer: &XOnlyPublicKey, payload: &str) -> Result<String> {
        nip44::Nip44::decrypt(payload, &self.keys.secret_key(), peer).map_err(Error::from)
    }
}
