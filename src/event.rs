//! Nostr event envelope: canonical id, Schnorr signature and tag access.
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin_hashes::{sha256, Hash};
use secp256k1::{schnorr, Message, Secp256k1};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keys::{self, Keys};

/// An event that has not been signed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// A signed nostr event as it travels between relays and clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// Hex SHA-256 over the NIP-01 canonical array
/// `[0, pubkey, created_at, kind, tags, content]`.
pub fn compute_id(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String> {
    let serialized = serde_json::to_string(&(0, pubkey, created_at, kind, tags, content))?;
    let hash = sha256::Hash::hash(serialized.as_bytes());
    Ok(hex::encode(hash.to_byte_array()))
}

/// Current unix time in seconds.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Timestamp for the next version of a replaceable event.
///
/// Relays keep the newest `created_at` per (kind, author, `d`), so a
/// republish must be strictly newer than what it replaces even when the
/// local clock lags.
pub fn next_revision_timestamp(previous: u64, now: u64) -> u64 {
    now.max(previous.saturating_add(1))
}

/// Kinds 30000..40000 are replaced per (kind, author, `d` tag).
pub fn is_parameterized_replaceable(kind: u32) -> bool {
    (30000..40000).contains(&kind)
}

impl UnsignedEvent {
    pub fn new(pubkey: &str, kind: u32, content: &str, tags: Vec<Vec<String>>, created_at: u64) -> Self {
        UnsignedEvent {
            pubkey: pubkey.to_string(),
            created_at,
            kind,
            tags,
            content: content.to_string(),
        }
    }

    pub fn compute_id(&self) -> Result<String> {
        compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }

    /// Sign with `keys`; the event's pubkey must belong to them.
    pub fn sign(self, keys: &Keys) -> Result<Event> {
        if self.pubkey != keys.public_key_hex() {
            return Err(Error::InvalidKey(format!(
                "event pubkey {} does not match signing key",
                self.pubkey
            )));
        }
        let id = self.compute_id()?;
        let id_bytes = hex::decode(&id).map_err(|e| Error::MalformedEvent(e.to_string()))?;
        let message = Message::from_slice(&id_bytes)?;

        let secp = Secp256k1::new();
        let sig = secp.sign_schnorr_with_rng(&message, keys.key_pair(), &mut rand::thread_rng());

        Ok(Event {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(&sig[..]),
        })
    }
}

impl Event {
    /// Check that the id matches the content and the signature matches the id.
    pub fn verify(&self) -> Result<()> {
        let expected = compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        if expected != self.id {
            return Err(Error::MalformedEvent(format!("event id mismatch for {}", self.id)));
        }
        let pubkey = keys::parse_public_key(&self.pubkey)
            .map_err(|_| Error::MalformedEvent(format!("bad pubkey {}", self.pubkey)))?;
        let sig_bytes = hex::decode(&self.sig).map_err(|_| Error::InvalidSignature)?;
        let sig = schnorr::Signature::from_slice(&sig_bytes).map_err(|_| Error::InvalidSignature)?;
        let id_bytes = hex::decode(&self.id).map_err(|e| Error::MalformedEvent(e.to_string()))?;
        let message = Message::from_slice(&id_bytes)?;

        let secp = Secp256k1::verification_only();
        secp.verify_schnorr(&sig, &message, &pubkey)
            .map_err(|_| Error::InvalidSignature)
    }

    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// First values of every tag named `name`, in order.
    pub fn tag_values(&self, name: &str) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1))
            .map(String::as_str)
            .collect()
    }

    /// The `d` tag of a replaceable event.
    pub fn identifier(&self) -> Option<&str> {
        self.tag_value("d")
    }

    /// `kind:pubkey:d` address of a parameterized replaceable event.
    pub fn coordinate(&self) -> Option<String> {
        self.identifier()
            .map(|d| format!("{}:{}:{}", self.kind, self.pubkey, d))
    }

    /// Strip the signature, e.g. to republish modified content.
    pub fn to_unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }
}
