//! Access control and encryption for Nostr forms.
//!
//! Forms are published as replaceable events. Their bodies can be encrypted
//! under a per-form view key, and the keys that let someone view, edit or
//! submit are handed out as NIP-59 gift wraps addressed by alias.
pub mod access;
pub mod alias;
pub mod config;
pub mod error;
pub mod event;
pub mod form;
pub mod grant;
pub mod keys;
pub mod logging;
pub mod nip04;
pub mod nip44;
pub mod nip59;
pub mod pool;
pub mod response;
pub mod signer;
pub mod template;

pub use error::{Error, Result};
pub use event::{Event, UnsignedEvent};
pub use keys::Keys;
