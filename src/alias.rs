//! Alias addressing for wraps.
//!
//! A wrap never names its real recipient. Its only `p` tag is
//! `sha256("<kind>:<form author>:<form id>:<recipient>")`, so locating it
//! requires already knowing all four inputs.
use bitcoin_hashes::{sha256, Hash};

use crate::error::{Error, Result};
use crate::pool::Filter;

/// Hex alias pubkey for a recipient of one form.
pub fn alias_pubkey(kind: u32, form_author: &str, form_id: &str, recipient: &str) -> Result<String> {
    if form_id.is_empty() {
        return Err(Error::InvalidFormId);
    }
    let preimage = format!("{}:{}:{}:{}", kind, form_author, form_id, recipient);
    Ok(hex::encode(sha256::Hash::hash(preimage.as_bytes()).to_byte_array()))
}

/// Filter selecting every wrap addressed to `alias`.
pub fn alias_filter(kind: u32, alias: &str) -> Filter {
    Filter::new().kind(kind).pubkey_tag(alias)
}
