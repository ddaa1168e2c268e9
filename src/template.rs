//! Form body encryption.
//!
//! The body is the JSON array of `name`, `settings` and `field` tags,
//! NIP-44 encrypted under the conversation key between the form's signing
//! key and its view key. Because the key is symmetric, the view key holder
//! (with the author's pubkey) and the signing key holder (with the view
//! pubkey) both open it.
use secp256k1::XOnlyPublicKey;
use tracing::debug;

use crate::error::{Error, Result};
use crate::form::FormSpec;
use crate::keys::Keys;
use crate::nip44::{self, ConversationKey};

/// Key material able to open an encrypted form body.
#[derive(Debug, Clone)]
pub enum BodyKey {
    /// Holder of the form's view key.
    Viewer(Keys),
    /// Holder of the form's signing key, who also knows the view pubkey.
    Editor {
        signing_keys: Keys,
        view_pk: XOnlyPublicKey,
    },
}

impl BodyKey {
    fn conversation_key(&self, author_pk: &XOnlyPublicKey) -> Result<ConversationKey> {
        let key = match self {
            BodyKey::Viewer(view_keys) => ConversationKey::derive(&view_keys.secret_key(), author_pk)?,
            BodyKey::Editor {
                signing_keys,
                view_pk,
            } => {
                if signing_keys.public_key() != *author_pk {
                    return Err(Error::Decryption);
                }
                ConversationKey::derive(&signing_keys.secret_key(), view_pk)?
            }
        };
        Ok(key)
    }
}

pub fn encrypt_form_body(signing_keys: &Keys, view_pk: &XOnlyPublicKey, spec: &FormSpec) -> Result<String> {
    let body = serde_json::to_string(&spec.to_tags()?)?;
    let conversation_key = ConversationKey::derive(&signing_keys.secret_key(), view_pk)?;
    debug!("encrypting form body of {} bytes", body.len());
    Ok(nip44::encrypt(&conversation_key, &body)?)
}

/// Open an encrypted body. A wrong key is [`Error::Decryption`]; a body that
/// decrypts but does not parse is [`Error::MalformedEvent`].
pub fn decrypt_form_body(key: &BodyKey, author_pk: &XOnlyPublicKey, ciphertext: &str) -> Result<FormSpec> {
    let conversation_key = key.conversation_key(author_pk)?;
    let body = nip44::decrypt(&conversation_key, ciphertext)?;
    let tags: Vec<Vec<String>> = serde_json::from_str(&body)
        .map_err(|e| Error::MalformedEvent(format!("form body: {}", e)))?;
    FormSpec::from_tags(&tags)
}
