// Grant issuance, opening and the capabilities each grant carries.

use std::time::Duration;

use nostr_form_access::alias;
use nostr_form_access::form::{self, FieldDescriptor, FormSpec, FormTemplate};
use nostr_form_access::grant::{
    self, dispatch_grants, fetch_grant, grant_access, grant_all, load_ledger, merge_participants,
    Capabilities, CapabilityGrant, EDIT_ACCESS, VIEW_ACCESS,
};
use nostr_form_access::nip59::{self, GIFT_WRAP_KIND};
use nostr_form_access::pool::memory::MemoryRelayPool;
use nostr_form_access::signer::KeySigner;
use nostr_form_access::template::{decrypt_form_body, BodyKey};
use nostr_form_access::{Error, Event, Keys};
use serde_json::json;

const RELAY: &str = "wss://forms.example";
const WAIT: Duration = Duration::from_millis(200);

fn spec() -> FormSpec {
    let mut spec = FormSpec::new("Team retro");
    spec.settings.encrypt_form = true;
    spec.settings.description = Some("What went well?".to_string());
    spec.settings.extra.insert("titleImageUrl".to_string(), json!("https://img.example/x.png"));
    let mut mood = FieldDescriptor::new("q1", "option", "Mood");
    mood.options = json!([["g", "good"], ["b", "bad"]]);
    spec.fields.push(mood);
    spec.fields.push(FieldDescriptor::new("q2", "text", "Notes"));
    spec
}

fn encrypted_form(owner: &Keys, view: &Keys) -> Event {
    FormTemplate::new("f1", spec())
        .to_event(owner, Some(&view.public_key()), 1_700_000_000)
        .unwrap()
}

#[test]
fn test_f1_scenario() -> anyhow::Result<()> {
    let owner = Keys::generate();
    let view = Keys::generate();
    let recipient = Keys::generate();
    let stranger = Keys::generate();
    let form_event = encrypted_form(&owner, &view);

    let output = grant_access(&form_event, &recipient.public_key(), &owner, Some(&view), false)?;

    let expected_alias = alias::alias_pubkey(
        GIFT_WRAP_KIND,
        &owner.public_key_hex(),
        "f1",
        &recipient.public_key_hex(),
    )?;
    assert_eq!(output.recipient_wrap.tags, vec![vec!["p".to_string(), expected_alias]]);

    let rumor = nip59::open_wrap(&output.recipient_wrap, &recipient)?;
    assert!(rumor
        .tags
        .contains(&vec![VIEW_ACCESS.to_string(), view.secret_hex()]));
    assert!(!rumor.tags.iter().any(|t| t[0] == EDIT_ACCESS));

    let grant = CapabilityGrant::from_rumor(&rumor)?;
    let body = decrypt_form_body(&grant.body_key()?, &owner.public_key(), &form_event.content)?;
    assert_eq!(body, spec());

    assert!(matches!(
        nip59::open_wrap(&output.recipient_wrap, &stranger),
        Err(Error::Decryption)
    ));
    Ok(())
}

#[test]
fn test_view_key_sufficiency_for_every_holder() -> anyhow::Result<()> {
    let owner = Keys::generate();
    let view = Keys::generate();
    let form_event = encrypted_form(&owner, &view);

    let holders: Vec<Keys> = (0..3).map(|_| Keys::generate()).collect();
    for holder in &holders {
        let output = grant_access(&form_event, &holder.public_key(), &owner, Some(&view), false)?;
        let grant = CapabilityGrant::from_rumor(&nip59::open_wrap(&output.recipient_wrap, holder)?)?;
        let parsed = FormTemplate::from_event(&form_event, Some(&grant.body_key()?))?;
        assert_eq!(parsed.spec, spec());
    }
    Ok(())
}

#[test]
fn test_capability_separation() -> anyhow::Result<()> {
    let owner = Keys::generate();
    let view = Keys::generate();
    let viewer = Keys::generate();
    let editor = Keys::generate();
    let form_event = encrypted_form(&owner, &view);

    let view_only = grant_access(&form_event, &viewer.public_key(), &owner, Some(&view), false)?;
    let view_grant = CapabilityGrant::from_rumor(&nip59::open_wrap(&view_only.recipient_wrap, &viewer)?)?;
    let next = form::add_participants(&form_event, &[viewer.public_key_hex()], 1_700_000_100);
    assert!(matches!(
        view_grant.republish(next.clone()),
        Err(Error::MissingCapability("edit"))
    ));

    let edit = grant_access(&form_event, &editor.public_key(), &owner, Some(&view), true)?;
    let edit_grant = CapabilityGrant::from_rumor(&nip59::open_wrap(&edit.recipient_wrap, &editor)?)?;
    let republished = edit_grant.republish(next)?;
    assert!(republished.verify().is_ok());
    assert_eq!(republished.pubkey, owner.public_key_hex());
    assert_eq!(republished.created_at, 1_700_000_100);
    Ok(())
}

#[test]
fn test_grant_idempotence() -> anyhow::Result<()> {
    let owner = Keys::generate();
    let view = Keys::generate();
    let recipient = Keys::generate();
    let form_event = encrypted_form(&owner, &view);

    let first = grant_access(&form_event, &recipient.public_key(), &owner, Some(&view), false)?;
    let second = grant_access(&form_event, &recipient.public_key(), &owner, Some(&view), false)?;
    assert_ne!(first.recipient_wrap.id, second.recipient_wrap.id);
    assert_ne!(first.recipient_wrap.content, second.recipient_wrap.content);
    assert_eq!(first.recipient_wrap.tags, second.recipient_wrap.tags);

    let g1 = CapabilityGrant::from_rumor(&nip59::open_wrap(&first.recipient_wrap, &recipient)?)?;
    let g2 = CapabilityGrant::from_rumor(&nip59::open_wrap(&second.recipient_wrap, &recipient)?)?;
    assert_eq!(g1.capabilities(), g2.capabilities());
    // submit identity is stable across re-issues
    assert_eq!(g1.submit_key, g2.submit_key);

    let once = form::add_participants(&form_event, &[recipient.public_key_hex()], 1_700_000_100).sign(&owner)?;
    let twice = form::add_participants(&once, &[recipient.public_key_hex()], 1_700_000_100);
    assert_eq!(once.tag_values("p").len(), 1);
    assert_eq!(twice.tags.iter().filter(|t| t[0] == "p").count(), 1);
    assert_eq!(twice.created_at, 1_700_000_101);
    Ok(())
}

#[test]
fn test_public_form_grant_has_no_view_key() -> anyhow::Result<()> {
    let owner = Keys::generate();
    let voter = Keys::generate();
    let form_event = FormTemplate::new("open", FormSpec::new("Open poll")).to_event(&owner, None, 10)?;

    let output = grant_access(&form_event, &voter.public_key(), &owner, None, false)?;
    let grant = CapabilityGrant::from_rumor(&nip59::open_wrap(&output.recipient_wrap, &voter)?)?;
    assert_eq!(
        grant.capabilities(),
        Capabilities { edit: false, view: false, submit: true }
    );
    assert!(matches!(grant.body_key(), Err(Error::MissingCapability("view"))));
    assert!(grant.submit_keys().is_ok());
    Ok(())
}

#[tokio::test]
async fn test_batch_grants_through_relays() -> anyhow::Result<()> {
    let pool = MemoryRelayPool::new(&[RELAY]);
    let relays = vec![RELAY.to_string()];
    let owner = Keys::generate();
    let view = Keys::generate();
    let form_event = encrypted_form(&owner, &view);

    let alice = KeySigner::new(Keys::generate());
    let bob = KeySigner::new(Keys::generate());
    let viewers = vec![alice.keys().public_key_hex(), bob.keys().public_key_hex()];
    let editors = vec![bob.keys().public_key_hex()];
    let participants = merge_participants(&viewers, &editors);
    assert_eq!(participants.len(), 2);

    let grants = grant_all(&form_event, &participants, &owner, Some(&view))?;
    dispatch_grants(&pool, &relays, &grants, WAIT).await?;
    assert_eq!(pool.stored(RELAY).await.len(), 4);

    let alice_grant = fetch_grant(&pool, &relays, &alice, &owner.public_key_hex(), "f1", WAIT)
        .await?
        .expect("alice has a grant");
    assert_eq!(
        alice_grant.capabilities(),
        Capabilities { edit: false, view: true, submit: true }
    );
    let bob_grant = fetch_grant(&pool, &relays, &bob, &owner.public_key_hex(), "f1", WAIT)
        .await?
        .expect("bob has a grant");
    assert!(bob_grant.capabilities().edit);

    let nobody = KeySigner::new(Keys::generate());
    assert!(fetch_grant(&pool, &relays, &nobody, &owner.public_key_hex(), "f1", WAIT)
        .await?
        .is_none());

    let ledger = load_ledger(&pool, &relays, &KeySigner::new(owner.clone()), "f1", WAIT).await?;
    assert_eq!(ledger.len(), 2);
    assert_eq!(
        ledger.holders(Capabilities { edit: true, ..Default::default() }),
        vec![bob.keys().public_key_hex().as_str()]
    );
    Ok(())
}

#[tokio::test]
async fn test_dispatch_fails_when_no_relay_accepts() -> anyhow::Result<()> {
    use nostr_form_access::pool::memory::RelayMode;

    let pool = MemoryRelayPool::new(&[RELAY]);
    pool.set_mode(RELAY, RelayMode::Rejecting("blocked".to_string())).await;
    let owner = Keys::generate();
    let view = Keys::generate();
    let form_event = encrypted_form(&owner, &view);
    let grants = grant_all(
        &form_event,
        &grant::merge_participants(&[Keys::generate().public_key_hex()], &[]),
        &owner,
        Some(&view),
    )?;

    let result = dispatch_grants(&pool, &[RELAY.to_string()], &grants, WAIT).await;
    assert!(matches!(result, Err(Error::Transport(_))));
    Ok(())
}
