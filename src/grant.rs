//! Access grants.
//!
//! A grant is a kind 18 rumor authored by the form's signing key and
//! carrying whichever of the edit, view and submit keys the recipient gets.
//! It is sealed and wrapped twice: once for the recipient and once for the
//! issuer, so the owner's other sessions can rebuild who holds what.
use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;
use secp256k1::XOnlyPublicKey;
use tracing::{debug, info, warn};

use crate::alias;
use crate::error::{Error, Result};
use crate::event::{Event, UnsignedEvent};
use crate::form;
use crate::keys::{self, Keys};
use crate::nip59::{self, Rumor, GIFT_WRAP_KIND};
use crate::pool::{self, RelayPool};
use crate::signer::Signer;
use crate::template::BodyKey;

pub const GRANT_KIND: u32 = 18;

pub const EDIT_ACCESS: &str = "EditAccess";
pub const VIEW_ACCESS: &str = "ViewAccess";
pub const SUBMIT_ACCESS: &str = "SubmitAccess";

/// Rights held by one pubkey over one form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub edit: bool,
    pub view: bool,
    pub submit: bool,
}

impl Capabilities {
    pub fn union(self, other: Capabilities) -> Capabilities {
        Capabilities {
            edit: self.edit || other.edit,
            view: self.view || other.view,
            submit: self.submit || other.submit,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.edit || self.view || self.submit)
    }
}

/// A grant as received by its recipient.
#[derive(Debug, Clone)]
pub struct CapabilityGrant {
    pub form_author: String,
    pub form_id: String,
    pub recipient: String,
    pub issued_at: u64,
    pub edit_key: Option<Keys>,
    pub view_key: Option<Keys>,
    pub submit_key: Option<Keys>,
}

fn key_tag(rumor: &Rumor, name: &str) -> Result<Option<Keys>> {
    match rumor.tag_value(name) {
        None => Ok(None),
        Some(secret) => Keys::from_secret_hex(secret)
            .map(Some)
            .map_err(|_| Error::MalformedEvent(format!("{} tag holds no valid key", name))),
    }
}

impl CapabilityGrant {
    /// Parse an opened grant rumor.
    pub fn from_rumor(rumor: &Rumor) -> Result<Self> {
        if rumor.kind != GRANT_KIND {
            return Err(Error::MalformedEvent(format!(
                "expected grant kind {}, got {}",
                GRANT_KIND, rumor.kind
            )));
        }
        let coordinate = rumor
            .tag_value("a")
            .ok_or_else(|| Error::MalformedEvent("grant has no form coordinate".to_string()))?;
        let (form_author, form_id) = form::parse_coordinate(coordinate)?;
        if rumor.pubkey != form_author {
            return Err(Error::MalformedEvent(
                "grant not issued by the form's signing key".to_string(),
            ));
        }
        let recipient = rumor
            .tag_value("p")
            .ok_or_else(|| Error::MalformedEvent("grant has no recipient".to_string()))?
            .to_string();

        let edit_key = key_tag(rumor, EDIT_ACCESS)?;
        if let Some(edit) = &edit_key {
            if edit.public_key_hex() != form_author {
                return Err(Error::MalformedEvent(
                    "edit key does not match form author".to_string(),
                ));
            }
        }
        Ok(CapabilityGrant {
            form_author,
            form_id,
            recipient,
            issued_at: rumor.created_at,
            edit_key,
            view_key: key_tag(rumor, VIEW_ACCESS)?,
            submit_key: key_tag(rumor, SUBMIT_ACCESS)?,
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            edit: self.edit_key.is_some(),
            view: self.view_key.is_some(),
            submit: self.submit_key.is_some(),
        }
    }

    pub fn coordinate(&self) -> String {
        form::coordinate(&self.form_author, &self.form_id)
    }

    /// Key for reading an encrypted form body. An edit key alone is not
    /// enough since it does not reveal the view pubkey.
    pub fn body_key(&self) -> Result<BodyKey> {
        self.view_key
            .clone()
            .map(BodyKey::Viewer)
            .ok_or(Error::MissingCapability("view"))
    }

    pub fn submit_keys(&self) -> Result<&Keys> {
        self.submit_key.as_ref().ok_or(Error::MissingCapability("submit"))
    }

    /// Sign a new version of the form. Only an edit key can do this.
    pub fn republish(&self, unsigned: UnsignedEvent) -> Result<Event> {
        let edit_key = self.edit_key.as_ref().ok_or(Error::MissingCapability("edit"))?;
        let d = unsigned
            .tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("d"))
            .and_then(|t| t.get(1));
        if unsigned.kind != form::FORM_TEMPLATE_KIND
            || unsigned.pubkey != self.form_author
            || d != Some(&self.form_id)
        {
            return Err(Error::MalformedEvent(
                "republish must target the granted form".to_string(),
            ));
        }
        unsigned.sign(edit_key)
    }
}

/// Wraps produced for one recipient.
#[derive(Debug, Clone)]
pub struct GrantOutput {
    pub recipient: String,
    pub capabilities: Capabilities,
    pub recipient_wrap: Event,
    /// Self-addressed copy for the issuer's own archive.
    pub issuer_wrap: Event,
}

impl GrantOutput {
    pub fn wraps(&self) -> [&Event; 2] {
        [&self.recipient_wrap, &self.issuer_wrap]
    }
}

/// Build the wraps granting `recipient_pk` access to the form.
///
/// Editors receive the form's real signing key. A view key is passed on when
/// given, and every recipient gets a submit key derived for them.
/// The form event itself is left untouched.
pub fn grant_access(
    form_event: &Event,
    recipient_pk: &XOnlyPublicKey,
    signing_keys: &Keys,
    view_keys: Option<&Keys>,
    is_editor: bool,
) -> Result<GrantOutput> {
    let form_id = match form_event.identifier() {
        Some(d) if !d.is_empty() => d.to_string(),
        _ => return Err(Error::InvalidFormId),
    };
    let author = signing_keys.public_key_hex();
    if form_event.pubkey != author {
        return Err(Error::InvalidKey(
            "signing keys do not own this form".to_string(),
        ));
    }
    let recipient = hex::encode(recipient_pk.serialize());
    let submit_keys = keys::derive_submit_keys(signing_keys, &form_id, recipient_pk)?;

    let mut tags = vec![
        vec!["a".to_string(), form::coordinate(&author, &form_id)],
        vec!["p".to_string(), recipient.clone()],
    ];
    if is_editor {
        tags.push(vec![EDIT_ACCESS.to_string(), signing_keys.secret_hex()]);
    }
    if let Some(view) = view_keys {
        tags.push(vec![VIEW_ACCESS.to_string(), view.secret_hex()]);
    }
    tags.push(vec![SUBMIT_ACCESS.to_string(), submit_keys.secret_hex()]);

    let rumor = nip59::create_rumor(GRANT_KIND, "", tags, signing_keys)?;

    let seal = nip59::create_seal(&rumor, signing_keys, recipient_pk, None)?;
    let recipient_wrap = nip59::create_wrap(&seal, recipient_pk, &author, &form_id, None)?;

    let issuer_pk = signing_keys.public_key();
    let issuer_seal = nip59::create_seal(&rumor, signing_keys, &issuer_pk, None)?;
    let issuer_wrap = nip59::create_wrap(&issuer_seal, &issuer_pk, &author, &form_id, None)?;

    let capabilities = Capabilities {
        edit: is_editor,
        view: view_keys.is_some(),
        submit: true,
    };
    info!("granted {:?} on {} to {}", capabilities, form_id, recipient);
    Ok(GrantOutput {
        recipient,
        capabilities,
        recipient_wrap,
        issuer_wrap,
    })
}

/// One recipient of a batch grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub pubkey: String,
    pub is_editor: bool,
}

/// Merge viewer and editor lists into one entry per pubkey, in order of
/// first appearance. A pubkey in both lists becomes an editor.
pub fn merge_participants(viewers: &[String], editors: &[String]) -> Vec<Participant> {
    let mut merged: Vec<Participant> = Vec::new();
    for (pubkey, is_editor) in viewers
        .iter()
        .map(|p| (p, false))
        .chain(editors.iter().map(|p| (p, true)))
    {
        match merged.iter_mut().find(|m| &m.pubkey == pubkey) {
            Some(existing) => existing.is_editor |= is_editor,
            None => merged.push(Participant {
                pubkey: pubkey.clone(),
                is_editor,
            }),
        }
    }
    merged
}

/// One grant per participant.
pub fn grant_all(
    form_event: &Event,
    participants: &[Participant],
    signing_keys: &Keys,
    view_keys: Option<&Keys>,
) -> Result<Vec<GrantOutput>> {
    participants
        .iter()
        .map(|participant| {
            let recipient_pk = keys::parse_public_key(&participant.pubkey)?;
            grant_access(form_event, &recipient_pk, signing_keys, view_keys, participant.is_editor)
        })
        .collect()
}

/// Publish every wrap of every grant concurrently.
///
/// Fails when a recipient wrap reached no relay. A lost issuer copy only
/// costs the archive and is logged.
pub async fn dispatch_grants(
    pool: &dyn RelayPool,
    relays: &[String],
    grants: &[GrantOutput],
    wait: Duration,
) -> Result<()> {
    let sends = grants.iter().flat_map(|grant| {
        grant
            .wraps()
            .into_iter()
            .map(move |wrap| pool::publish_checked(pool, relays, wrap, wait))
    });
    let results = join_all(sends).await;

    let mut first_failure = None;
    for (idx, result) in results.into_iter().enumerate() {
        if let Err(e) = result {
            let grant = &grants[idx / 2];
            if idx % 2 == 0 {
                warn!("grant wrap for {} not published: {}", grant.recipient, e);
                first_failure.get_or_insert(e);
            } else {
                warn!("issuer copy for {} not published: {}", grant.recipient, e);
            }
        }
    }
    match first_failure {
        Some(e) => Err(e),
        None => {
            debug!("dispatched {} grants", grants.len());
            Ok(())
        }
    }
}

/// Who holds which capability on one form, as seen by its issuer.
#[derive(Debug, Default, Clone)]
pub struct GrantLedger {
    entries: HashMap<String, Capabilities>,
}

impl GrantLedger {
    pub fn new() -> Self {
        GrantLedger::default()
    }

    pub fn record(&mut self, pubkey: &str, capabilities: Capabilities) {
        let entry = self.entries.entry(pubkey.to_string()).or_default();
        *entry = entry.union(capabilities);
    }

    pub fn record_output(&mut self, output: &GrantOutput) {
        self.record(&output.recipient, output.capabilities);
    }

    pub fn record_grant(&mut self, grant: &CapabilityGrant) {
        self.record(&grant.recipient, grant.capabilities());
    }

    pub fn capabilities(&self, pubkey: &str) -> Capabilities {
        self.entries.get(pubkey).copied().unwrap_or_default()
    }

    /// Pubkeys holding every right in `required`, sorted.
    pub fn holders(&self, required: Capabilities) -> Vec<&str> {
        let mut holders: Vec<&str> = self
            .entries
            .iter()
            .filter(|(_, caps)| caps.union(required) == **caps)
            .map(|(pubkey, _)| pubkey.as_str())
            .collect();
        holders.sort_unstable();
        holders
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Open every grant in `wraps` that `signer` can read. Wraps it cannot
/// open are skipped.
async fn open_grants(wraps: &[Event], signer: &dyn Signer) -> Vec<CapabilityGrant> {
    let mut grants = Vec::new();
    for wrap in wraps {
        let opened = nip59::open_wrap_with_signer(wrap, signer)
            .await
            .and_then(|rumor| CapabilityGrant::from_rumor(&rumor));
        match opened {
            Ok(grant) => grants.push(grant),
            Err(Error::Decryption) => debug!("wrap {} not readable by us", wrap.id),
            Err(e) => warn!("skipping wrap {}: {}", wrap.id, e),
        }
    }
    grants
}

/// Find and open the signer's newest grant for a form.
///
/// `Ok(None)` means relays answered and no readable grant exists.
pub async fn fetch_grant(
    pool: &dyn RelayPool,
    relays: &[String],
    signer: &dyn Signer,
    form_author: &str,
    form_id: &str,
    wait: Duration,
) -> Result<Option<CapabilityGrant>> {
    let me = signer.public_key_hex().await?;
    let alias = alias::alias_pubkey(GIFT_WRAP_KIND, form_author, form_id, &me)?;
    let wraps = pool
        .query_once(relays, vec![alias::alias_filter(GIFT_WRAP_KIND, &alias)], wait)
        .await?;
    debug!("found {} candidate wraps for {}", wraps.len(), form_id);

    let grant = open_grants(&wraps, signer)
        .await
        .into_iter()
        .filter(|g| g.form_author == form_author && g.form_id == form_id && g.recipient == me)
        .max_by_key(|g| g.issued_at);
    Ok(grant)
}

/// Rebuild the ledger of a form from the issuer copies on relays.
pub async fn load_ledger(
    pool: &dyn RelayPool,
    relays: &[String],
    issuer: &dyn Signer,
    form_id: &str,
    wait: Duration,
) -> Result<GrantLedger> {
    let author = issuer.public_key_hex().await?;
    let alias = alias::alias_pubkey(GIFT_WRAP_KIND, &author, form_id, &author)?;
    let wraps = pool
        .query_once(relays, vec![alias::alias_filter(GIFT_WRAP_KIND, &alias)], wait)
        .await?;

    let mut ledger = GrantLedger::new();
    for grant in open_grants(&wraps, issuer).await {
        if grant.form_author == author && grant.form_id == form_id {
            ledger.record_grant(&grant);
        }
    }
    info!("ledger for {} rebuilt with {} holders", form_id, ledger.len());
    Ok(ledger)
}
