//! Access requests and their acceptance.
//!
//! A user without access publishes a signed request naming the form. The
//! owner collects pending requests and accepts them in a batch: one grant
//! per requester, then a single republished form event listing all of them.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{self, Event, UnsignedEvent};
use crate::form;
use crate::grant::{self, Capabilities, GrantOutput};
use crate::keys::{self, Keys};
use crate::pool::{self, Filter, RelayPool};
use crate::signer::Signer;

pub const ACCESS_REQUEST_KIND: u32 = 1070;

/// Requested level of access, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Vote,
    View,
    Edit,
}

impl AccessType {
    pub fn grants_view(self) -> bool {
        self >= AccessType::View
    }

    pub fn is_editor(self) -> bool {
        self == AccessType::Edit
    }

    pub fn capabilities(self) -> Capabilities {
        Capabilities {
            edit: self.is_editor(),
            view: self.grants_view(),
            submit: true,
        }
    }
}

/// Content of an access request event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequest {
    pub pubkey: String,
    pub access_type: AccessType,
}

impl AccessRequest {
    /// Validate a request event addressed to the form at `form_coordinate`.
    pub fn from_event(event: &Event, form_coordinate: &str) -> Result<Self> {
        if event.kind != ACCESS_REQUEST_KIND {
            return Err(Error::MalformedEvent(format!(
                "expected request kind {}, got {}",
                ACCESS_REQUEST_KIND, event.kind
            )));
        }
        event.verify()?;
        if event.tag_value("a") != Some(form_coordinate) {
            return Err(Error::MalformedEvent(format!(
                "request {} is for another form",
                event.id
            )));
        }
        let request: AccessRequest = serde_json::from_str(&event.content)
            .map_err(|e| Error::MalformedEvent(format!("request content: {}", e)))?;
        if request.pubkey != event.pubkey {
            return Err(Error::MalformedEvent(
                "request pubkey differs from its signer".to_string(),
            ));
        }
        Ok(request)
    }
}

/// Where a pubkey stands with respect to one form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    NoAccess,
    /// A request is out. There is no rejection message, so an ignored
    /// request stays in this state.
    Requested(AccessType),
    Granted,
}

/// Filter for requests addressed to a form.
pub fn request_filter(form_author: &str, form_id: &str) -> Filter {
    Filter::new()
        .kind(ACCESS_REQUEST_KIND)
        .coordinate(&form::coordinate(form_author, form_id))
        .pubkey_tag(form_author)
}

/// Build and sign a request as the signer's identity.
pub async fn create_access_request(
    signer: &dyn Signer,
    form_author: &str,
    form_id: &str,
    access_type: AccessType,
) -> Result<Event> {
    if form_id.is_empty() {
        return Err(Error::InvalidFormId);
    }
    keys::parse_public_key(form_author)?;
    let pubkey = signer.public_key_hex().await?;
    let content = serde_json::to_string(&AccessRequest {
        pubkey: pubkey.clone(),
        access_type,
    })?;
    let tags = vec![
        vec!["a".to_string(), form::coordinate(form_author, form_id)],
        vec!["p".to_string(), form_author.to_string()],
    ];
    let unsigned = UnsignedEvent::new(&pubkey, ACCESS_REQUEST_KIND, &content, tags, event::unix_time());
    signer.sign_event(unsigned).await
}

/// Create a request and publish it.
pub async fn request_access(
    pool: &dyn RelayPool,
    relays: &[String],
    signer: &dyn Signer,
    form_author: &str,
    form_id: &str,
    access_type: AccessType,
    wait: Duration,
) -> Result<Event> {
    let request = create_access_request(signer, form_author, form_id, access_type).await?;
    pool::publish_checked(pool, relays, &request, wait).await?;
    info!("requested {:?} access to {}", access_type, form_id);
    Ok(request)
}

/// State of `pubkey` given the current form event and known requests.
pub fn access_state(form_event: &Event, requests: &[AccessRequest], pubkey: &str) -> AccessState {
    if form::has_access(form_event, pubkey) {
        return AccessState::Granted;
    }
    requests
        .iter()
        .filter(|r| r.pubkey == pubkey)
        .map(|r| r.access_type)
        .max()
        .map_or(AccessState::NoAccess, AccessState::Requested)
}

/// One entry per requester, keeping the strongest access type asked for.
fn collapse(requests: impl IntoIterator<Item = AccessRequest>) -> Vec<AccessRequest> {
    let mut collapsed: Vec<AccessRequest> = Vec::new();
    for request in requests {
        match collapsed.iter_mut().find(|r| r.pubkey == request.pubkey) {
            Some(existing) => existing.access_type = existing.access_type.max(request.access_type),
            None => collapsed.push(request),
        }
    }
    collapsed
}

/// Requests still waiting for the owner. Invalid events are skipped and
/// pubkeys that already participate are dropped.
pub fn pending_requests(form_event: &Event, events: &[Event]) -> Result<Vec<AccessRequest>> {
    let coordinate = form_event.coordinate().ok_or(Error::InvalidFormId)?;
    let valid = events.iter().filter_map(|ev| match AccessRequest::from_event(ev, &coordinate) {
        Ok(request) => Some(request),
        Err(e) => {
            debug!("ignoring request {}: {}", ev.id, e);
            None
        }
    });
    Ok(collapse(valid)
        .into_iter()
        .filter(|r| !form::has_access(form_event, &r.pubkey))
        .collect())
}

/// Query relays for pending requests on a form.
pub async fn fetch_pending_requests(
    pool: &dyn RelayPool,
    relays: &[String],
    form_event: &Event,
    wait: Duration,
) -> Result<Vec<AccessRequest>> {
    let form_id = form_event.identifier().ok_or(Error::InvalidFormId)?;
    let events = pool
        .query_once(relays, vec![request_filter(&form_event.pubkey, form_id)], wait)
        .await?;
    pending_requests(form_event, &events)
}

/// Result of a batch accept.
#[derive(Debug, Clone)]
pub struct AcceptOutcome {
    pub grants: Vec<GrantOutput>,
    /// The republished form event.
    pub form_event: Event,
}

/// Newest known version of a form: the relays' copy when it is newer than
/// `form_event`, otherwise `form_event` itself.
pub async fn latest_form_version(
    pool: &dyn RelayPool,
    relays: &[String],
    form_event: &Event,
    wait: Duration,
) -> Result<Event> {
    let form_id = form_event.identifier().ok_or(Error::InvalidFormId)?;
    let filter = Filter::new()
        .kind(form_event.kind)
        .author(&form_event.pubkey)
        .identifier(form_id);
    let remote = pool::fetch_latest(pool, relays, filter, wait).await?;
    Ok(match remote {
        Some(remote) if supersedes(&remote, form_event) && remote.verify().is_ok() => {
            debug!(
                "rebasing form {} onto newer version {} ({} > {})",
                form_id, remote.id, remote.created_at, form_event.created_at
            );
            remote
        }
        _ => form_event.clone(),
    })
}

fn supersedes(candidate: &Event, current: &Event) -> bool {
    candidate.pubkey == current.pubkey
        && (candidate.created_at > current.created_at
            || (candidate.created_at == current.created_at && candidate.id < current.id))
}

/// Accept a batch of requests.
///
/// The newest version of the form is read from the relays first and the
/// participants are appended to it, so a stale local copy does not roll back
/// another session's changes. Grants are dispatched next, then the form is
/// republished once. If that republish fails the wraps are already out and
/// are not withdrawn; the error is [`Error::Transport`].
///
/// Every grant on an encrypted form carries the view key, since a voter who
/// cannot read the fields cannot answer them.
pub async fn accept_requests(
    pool: &dyn RelayPool,
    relays: &[String],
    form_event: &Event,
    signing_keys: &Keys,
    view_keys: Option<&Keys>,
    requests: &[AccessRequest],
    wait: Duration,
) -> Result<AcceptOutcome> {
    let requests = collapse(requests.iter().cloned());
    if requests.is_empty() {
        return Ok(AcceptOutcome {
            grants: Vec::new(),
            form_event: form_event.clone(),
        });
    }

    let base = latest_form_version(pool, relays, form_event, wait).await?;
    let encrypted = form::is_encrypted(&base);
    let mut grants = Vec::with_capacity(requests.len());
    for request in &requests {
        let recipient_pk = keys::parse_public_key(&request.pubkey)?;
        let view = if encrypted || request.access_type.grants_view() {
            view_keys
        } else {
            None
        };
        grants.push(grant::grant_access(
            &base,
            &recipient_pk,
            signing_keys,
            view,
            request.access_type.is_editor(),
        )?);
    }
    grant::dispatch_grants(pool, relays, &grants, wait).await?;

    let participants: Vec<String> = requests.iter().map(|r| r.pubkey.clone()).collect();
    let republished = form::add_participants(&base, &participants, event::unix_time()).sign(signing_keys)?;
    if let Err(e) = pool::publish_checked(pool, relays, &republished, wait).await {
        warn!(
            "{} grants dispatched but form {} was not republished: {}",
            grants.len(),
            republished.id,
            e
        );
        return Err(Error::Transport(format!("form republish failed: {}", e)));
    }
    info!(
        "accepted {} requests, form republished at {}",
        grants.len(),
        republished.created_at
    );
    Ok(AcceptOutcome {
        grants,
        form_event: republished,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::{FormSpec, FormTemplate};
    use crate::signer::KeySigner;

    fn form(owner: &Keys) -> Event {
        FormTemplate::new("f1", FormSpec::new("Poll"))
            .to_event(owner, None, 100)
            .unwrap()
    }

    #[test]
    fn test_access_type_wire_names() {
        let request = AccessRequest {
            pubkey: "aa".to_string(),
            access_type: AccessType::Vote,
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"pubkey":"aa","accessType":"vote"}"#
        );
        assert!(AccessType::Edit > AccessType::View);
        assert_eq!(
            AccessType::View.capabilities(),
            Capabilities { edit: false, view: true, submit: true }
        );
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let owner = Keys::generate();
        let user = KeySigner::new(Keys::generate());
        let ev = create_access_request(&user, &owner.public_key_hex(), "f1", AccessType::View)
            .await
            .unwrap();
        let coordinate = form::coordinate(&owner.public_key_hex(), "f1");
        let request = AccessRequest::from_event(&ev, &coordinate).unwrap();
        assert_eq!(request.pubkey, user.keys().public_key_hex());
        assert_eq!(request.access_type, AccessType::View);
        assert!(request_filter(&owner.public_key_hex(), "f1").matches(&ev));
    }

    #[tokio::test]
    async fn test_request_needs_form_id() {
        let owner = Keys::generate();
        let user = KeySigner::new(Keys::generate());
        assert!(matches!(
            create_access_request(&user, &owner.public_key_hex(), "", AccessType::Vote).await,
            Err(Error::InvalidFormId)
        ));
    }

    #[test]
    fn test_request_for_someone_else_rejected() {
        let owner = Keys::generate();
        let user = Keys::generate();
        let coordinate = form::coordinate(&owner.public_key_hex(), "f1");
        let content = serde_json::to_string(&AccessRequest {
            pubkey: Keys::generate().public_key_hex(),
            access_type: AccessType::Edit,
        })
        .unwrap();
        let ev = UnsignedEvent::new(
            &user.public_key_hex(),
            ACCESS_REQUEST_KIND,
            &content,
            vec![vec!["a".to_string(), coordinate.clone()]],
            10,
        )
        .sign(&user)
        .unwrap();
        assert!(matches!(
            AccessRequest::from_event(&ev, &coordinate),
            Err(Error::MalformedEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_requests_collapse_and_filter() {
        let owner = Keys::generate();
        let mut template = FormTemplate::new("f1", FormSpec::new("Poll"));
        let member = KeySigner::new(Keys::generate());
        template.participants.push(member.keys().public_key_hex());
        let form_event = template.to_event(&owner, None, 100).unwrap();

        let alice = KeySigner::new(Keys::generate());
        let author = owner.public_key_hex();
        let events = vec![
            create_access_request(&alice, &author, "f1", AccessType::Vote).await.unwrap(),
            create_access_request(&alice, &author, "f1", AccessType::Edit).await.unwrap(),
            create_access_request(&member, &author, "f1", AccessType::View).await.unwrap(),
            create_access_request(&alice, &author, "other", AccessType::View).await.unwrap(),
        ];

        let pending = pending_requests(&form_event, &events).unwrap();
        assert_eq!(
            pending,
            vec![AccessRequest {
                pubkey: alice.keys().public_key_hex(),
                access_type: AccessType::Edit,
            }]
        );
    }

    #[test]
    fn test_access_state_transitions() {
        let owner = Keys::generate();
        let form_event = form(&owner);
        let alice = Keys::generate().public_key_hex();
        let requests = vec![AccessRequest {
            pubkey: alice.clone(),
            access_type: AccessType::View,
        }];

        assert_eq!(access_state(&form_event, &[], &alice), AccessState::NoAccess);
        assert_eq!(
            access_state(&form_event, &requests, &alice),
            AccessState::Requested(AccessType::View)
        );
        let granted = form::add_participants(&form_event, &[alice.clone()], 200)
            .sign(&owner)
            .unwrap();
        assert_eq!(access_state(&granted, &requests, &alice), AccessState::Granted);
        assert_eq!(
            access_state(&form_event, &[], &owner.public_key_hex()),
            AccessState::Granted
        );
    }
}
