/// NIP-59: Gift Wrap, alias-addressed
///
/// Three layers carry a capability to one recipient:
/// - Rumor: unsigned event with the payload and its claimed author
/// - Seal (kind 13): the rumor, NIP-44 encrypted and signed by the real author
/// - Wrap (kind 1059): the seal, NIP-44 encrypted under a one-time key
///
/// Unlike plain NIP-59 the wrap's `p` tag is an alias
/// (see [`crate::alias`]), never the recipient's real key.
use secp256k1::XOnlyPublicKey;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::trace;

use crate::alias;
use crate::error::{Error, Result};
use crate::event::{self, Event, UnsignedEvent};
use crate::keys::{self, Keys};
use crate::nip44::{self, ConversationKey};
use crate::signer::Signer;

pub const SEAL_KIND: u32 = 13;
pub const GIFT_WRAP_KIND: u32 = 1059;

const TWO_DAYS: u64 = 2 * 24 * 60 * 60;

/// Unsigned innermost layer. Leaking it proves nothing about its author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rumor {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Signed by the real author, kind 13, no tags.
pub type Seal = Event;

/// Signed by a one-time key, kind 1059, a single alias `p` tag.
pub type Wrap = Event;

impl Rumor {
    pub fn from_unsigned(unsigned: UnsignedEvent) -> Result<Self> {
        let id = unsigned.compute_id()?;
        Ok(Rumor {
            id,
            pubkey: unsigned.pubkey,
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
        })
    }

    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    fn check_id(&self) -> Result<()> {
        let expected = event::compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        if expected != self.id {
            return Err(Error::MalformedEvent(format!("rumor id mismatch for {}", self.id)));
        }
        Ok(())
    }
}

/// Random timestamp up to two days in the past, so seal and wrap times do
/// not reveal when the grant was issued.
pub fn random_past_timestamp() -> u64 {
    event::unix_time().saturating_sub(rand::random::<u64>() % TWO_DAYS)
}

fn parse_layer<T: DeserializeOwned>(json: &str, layer: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| Error::MalformedEvent(format!("{}: {}", layer, e)))
}

/// Unsigned rumor authored by `author`, stamped with the current time.
pub fn create_rumor(kind: u32, content: &str, tags: Vec<Vec<String>>, author: &Keys) -> Result<Rumor> {
    let unsigned = UnsignedEvent::new(&author.public_key_hex(), kind, content, tags, event::unix_time());
    Rumor::from_unsigned(unsigned)
}

/// Seal `rumor` for `recipient_pk`, signed by the rumor's real author.
pub fn create_seal(
    rumor: &Rumor,
    author: &Keys,
    recipient_pk: &XOnlyPublicKey,
    created_at: Option<u64>,
) -> Result<Seal> {
    if rumor.pubkey != author.public_key_hex() {
        return Err(Error::InvalidKey(
            "rumor author does not match sealing key".to_string(),
        ));
    }
    let rumor_json = serde_json::to_string(rumor)?;
    let conversation_key = ConversationKey::derive(&author.secret_key(), recipient_pk)?;
    let encrypted_rumor = nip44::encrypt(&conversation_key, &rumor_json)?;

    let timestamp = created_at.unwrap_or_else(random_past_timestamp);
    UnsignedEvent::new(&author.public_key_hex(), SEAL_KIND, &encrypted_rumor, vec![], timestamp)
        .sign(author)
}

/// Wrap a seal under a fresh one-time key, addressed by alias.
///
/// `form_author` and `form_id` only feed the alias; the recipient must know
/// both to find the wrap later.
pub fn create_wrap(
    seal: &Seal,
    recipient_pk: &XOnlyPublicKey,
    form_author: &str,
    form_id: &str,
    created_at: Option<u64>,
) -> Result<Wrap> {
    if seal.kind != SEAL_KIND {
        return Err(Error::MalformedEvent(format!(
            "expected seal kind {}, got {}",
            SEAL_KIND, seal.kind
        )));
    }
    let recipient_hex = hex::encode(recipient_pk.serialize());
    let alias = alias::alias_pubkey(GIFT_WRAP_KIND, form_author, form_id, &recipient_hex)?;

    let seal_json = serde_json::to_string(seal)?;
    let one_time = Keys::generate();
    let conversation_key = ConversationKey::derive(&one_time.secret_key(), recipient_pk)?;
    let encrypted_seal = nip44::encrypt(&conversation_key, &seal_json)?;

    let timestamp = created_at.unwrap_or_else(random_past_timestamp);
    let tags = vec![vec!["p".to_string(), alias]];
    trace!("wrapping seal {} for form {}", seal.id, form_id);
    UnsignedEvent::new(&one_time.public_key_hex(), GIFT_WRAP_KIND, &encrypted_seal, tags, timestamp)
        .sign(&one_time)
}

fn check_wrap(wrap: &Wrap) -> Result<XOnlyPublicKey> {
    if wrap.kind != GIFT_WRAP_KIND {
        return Err(Error::MalformedEvent(format!(
            "expected wrap kind {}, got {}",
            GIFT_WRAP_KIND, wrap.kind
        )));
    }
    wrap.verify()?;
    keys::parse_public_key(&wrap.pubkey)
}

fn check_seal(seal: &Seal) -> Result<XOnlyPublicKey> {
    if seal.kind != SEAL_KIND {
        return Err(Error::MalformedEvent(format!(
            "expected seal kind {}, got {}",
            SEAL_KIND, seal.kind
        )));
    }
    if !seal.tags.is_empty() {
        return Err(Error::MalformedEvent("seal must not carry tags".to_string()));
    }
    seal.verify()?;
    keys::parse_public_key(&seal.pubkey)
}

fn check_rumor(rumor: &Rumor, seal: &Seal) -> Result<()> {
    rumor.check_id()?;
    if rumor.pubkey != seal.pubkey {
        return Err(Error::MalformedEvent(
            "rumor author differs from seal signer".to_string(),
        ));
    }
    Ok(())
}

/// Decrypt the outer layer. Fails with [`Error::Decryption`] for anyone but
/// the recipient.
pub fn unwrap(wrap: &Wrap, recipient: &Keys) -> Result<Seal> {
    let sender = check_wrap(wrap)?;
    let seal_json = nip44::Nip44::decrypt(&wrap.content, &recipient.secret_key(), &sender)?;
    parse_layer(&seal_json, "seal")
}

/// Decrypt a seal, checking that the rumor's claimed author signed it.
pub fn unseal(seal: &Seal, recipient: &Keys) -> Result<Rumor> {
    let author = check_seal(seal)?;
    let rumor_json = nip44::Nip44::decrypt(&seal.content, &recipient.secret_key(), &author)?;
    let rumor: Rumor = parse_layer(&rumor_json, "rumor")?;
    check_rumor(&rumor, seal)?;
    Ok(rumor)
}

/// Unwrap and unseal in one step.
pub fn open_wrap(wrap: &Wrap, recipient: &Keys) -> Result<Rumor> {
    let seal = unwrap(wrap, recipient)?;
    unseal(&seal, recipient)
}

/// Same as [`open_wrap`] for a signer that never exposes its secret key.
pub async fn open_wrap_with_signer(wrap: &Wrap, signer: &dyn Signer) -> Result<Rumor> {
    let sender = check_wrap(wrap)?;
    let seal_json = signer.nip44_decrypt(&sender, &wrap.content).await?;
    let seal: Seal = parse_layer(&seal_json, "seal")?;

    let author = check_seal(&seal)?;
    let rumor_json = signer.nip44_decrypt(&author, &seal.content).await?;
    let rumor: Rumor = parse_layer(&rumor_json, "rumor")?;
    check_rumor(&rumor, &seal)?;
    Ok(rumor)
}
