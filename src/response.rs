//! Form responses.
//!
//! A response is signed by the submitter, usually with the submit key from
//! their grant. Answers travel as `response` tags, or NIP-44 encrypted to
//! the form author when the form asks for encrypted responses.
use std::time::Duration;

use secp256k1::XOnlyPublicKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{Error, Result};
use crate::event::{self, Event, UnsignedEvent};
use crate::form::{self, FormSpec};
use crate::keys::{self, Keys};
use crate::nip44;
use crate::pool::{Filter, RelayPool};

pub const RESPONSE_KIND: u32 = 1069;

/// One answer, the `["response", fieldId, answer, metadataJson]` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEntry {
    pub field_id: String,
    pub answer: String,
    #[serde(default)]
    pub metadata: Value,
}

impl ResponseEntry {
    pub fn new(field_id: &str, answer: &str) -> Self {
        ResponseEntry {
            field_id: field_id.to_string(),
            answer: answer.to_string(),
            metadata: Value::Object(Map::new()),
        }
    }

    pub fn to_tag(&self) -> Result<Vec<String>> {
        Ok(vec![
            "response".to_string(),
            self.field_id.clone(),
            self.answer.clone(),
            serde_json::to_string(&self.metadata)?,
        ])
    }

    pub fn from_tag(tag: &[String]) -> Result<Self> {
        match tag {
            [name, field_id, answer, rest @ ..] if name == "response" && !field_id.is_empty() => {
                let metadata = match rest.first() {
                    None => Value::Object(Map::new()),
                    Some(raw) => serde_json::from_str(raw).map_err(|e| {
                        Error::MalformedEvent(format!("response {} metadata: {}", field_id, e))
                    })?,
                };
                Ok(ResponseEntry {
                    field_id: field_id.clone(),
                    answer: answer.clone(),
                    metadata,
                })
            }
            _ => Err(Error::MalformedEvent("bad response tag".to_string())),
        }
    }
}

fn entry_tags(entries: &[ResponseEntry]) -> Result<Vec<Vec<String>>> {
    entries.iter().map(ResponseEntry::to_tag).collect()
}

fn entries_from_tags(tags: &[Vec<String>]) -> Result<Vec<ResponseEntry>> {
    tags.iter()
        .filter(|t| t.first().map(String::as_str) == Some("response"))
        .map(|t| ResponseEntry::from_tag(t))
        .collect()
}

/// Sign a response to the form `form_id` of `form_author`.
pub fn build_response(
    form_author: &XOnlyPublicKey,
    form_id: &str,
    submitter: &Keys,
    entries: &[ResponseEntry],
    encrypt: bool,
) -> Result<Event> {
    if form_id.is_empty() {
        return Err(Error::InvalidFormId);
    }
    let author_hex = hex::encode(form_author.serialize());
    let mut tags = vec![vec!["a".to_string(), form::coordinate(&author_hex, form_id)]];
    let content = if encrypt {
        let body = serde_json::to_string(&entry_tags(entries)?)?;
        nip44::Nip44::encrypt(&body, &submitter.secret_key(), form_author)?
    } else {
        tags.extend(entry_tags(entries)?);
        String::new()
    };
    UnsignedEvent::new(
        &submitter.public_key_hex(),
        RESPONSE_KIND,
        &content,
        tags,
        event::unix_time(),
    )
    .sign(submitter)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub id: String,
    pub submitter: String,
    pub form_author: String,
    pub form_id: String,
    pub created_at: u64,
    pub entries: Vec<ResponseEntry>,
}

impl ParsedResponse {
    /// Every answer must refer to a field of `spec`.
    pub fn check_fields(&self, spec: &FormSpec) -> Result<()> {
        match self.entries.iter().find(|e| spec.field(&e.field_id).is_none()) {
            Some(entry) => Err(Error::MalformedEvent(format!(
                "response {} answers unknown field {}",
                self.id, entry.field_id
            ))),
            None => Ok(()),
        }
    }
}

/// Validate a response event into its entries.
///
/// `decrypt_key` is the form's signing key, needed only for encrypted
/// responses; without it those fail with [`Error::Decryption`].
pub fn parse_response(event: &Event, decrypt_key: Option<&Keys>) -> Result<ParsedResponse> {
    if event.kind != RESPONSE_KIND {
        return Err(Error::MalformedEvent(format!(
            "expected response kind {}, got {}",
            RESPONSE_KIND, event.kind
        )));
    }
    event.verify()?;
    let coordinate = event
        .tag_value("a")
        .ok_or_else(|| Error::MalformedEvent("response names no form".to_string()))?;
    let (form_author, form_id) = form::parse_coordinate(coordinate)?;

    let entries = if event.content.is_empty() {
        entries_from_tags(&event.tags)?
    } else {
        let key = decrypt_key.ok_or(Error::Decryption)?;
        let submitter = keys::parse_public_key(&event.pubkey)?;
        let body = nip44::Nip44::decrypt(&event.content, &key.secret_key(), &submitter)?;
        let tags: Vec<Vec<String>> = serde_json::from_str(&body)
            .map_err(|e| Error::MalformedEvent(format!("response body: {}", e)))?;
        entries_from_tags(&tags)?
    };
    Ok(ParsedResponse {
        id: event.id.clone(),
        submitter: event.pubkey.clone(),
        form_author,
        form_id,
        created_at: event.created_at,
        entries,
    })
}

pub fn response_filter(form_author: &str, form_id: &str) -> Filter {
    Filter::new()
        .kind(RESPONSE_KIND)
        .coordinate(&form::coordinate(form_author, form_id))
}

/// Fetch and parse every response to a form, skipping ones that do not parse.
pub async fn fetch_responses(
    pool: &dyn RelayPool,
    relays: &[String],
    form_author: &str,
    form_id: &str,
    decrypt_key: Option<&Keys>,
    wait: Duration,
) -> Result<Vec<ParsedResponse>> {
    let events = pool
        .query_once(relays, vec![response_filter(form_author, form_id)], wait)
        .await?;
    let mut responses: Vec<ParsedResponse> = events
        .iter()
        .filter_map(|ev| match parse_response(ev, decrypt_key) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("skipping response {}: {}", ev.id, e);
                None
            }
        })
        .collect();
    responses.sort_by_key(|r| r.created_at);
    Ok(responses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::FieldDescriptor;
    use serde_json::json;

    fn entries() -> Vec<ResponseEntry> {
        let mut choice = ResponseEntry::new("q1", "o2");
        choice.metadata = json!({"message": "Pizza"});
        vec![choice, ResponseEntry::new("q2", "no onions")]
    }

    #[test]
    fn test_plain_response() {
        let owner = Keys::generate();
        let submitter = Keys::generate();
        let ev = build_response(&owner.public_key(), "f1", &submitter, &entries(), false).unwrap();

        assert!(ev.content.is_empty());
        let parsed = parse_response(&ev, None).unwrap();
        assert_eq!(parsed.entries, entries());
        assert_eq!(parsed.form_id, "f1");
        assert_eq!(parsed.submitter, submitter.public_key_hex());
    }

    #[test]
    fn test_encrypted_response_needs_owner_key() {
        let owner = Keys::generate();
        let submitter = Keys::generate();
        let ev = build_response(&owner.public_key(), "f1", &submitter, &entries(), true).unwrap();

        assert!(ev.tag_values("response").is_empty());
        assert!(matches!(parse_response(&ev, None), Err(Error::Decryption)));
        assert!(matches!(
            parse_response(&ev, Some(&Keys::generate())),
            Err(Error::Decryption)
        ));
        assert_eq!(parse_response(&ev, Some(&owner)).unwrap().entries, entries());
    }

    #[test]
    fn test_malformed_response_tag() {
        let owner = Keys::generate();
        let submitter = Keys::generate();
        let coordinate = form::coordinate(&owner.public_key_hex(), "f1");
        let ev = UnsignedEvent::new(
            &submitter.public_key_hex(),
            RESPONSE_KIND,
            "",
            vec![
                vec!["a".to_string(), coordinate],
                vec!["response".to_string(), "q1".to_string()],
            ],
            10,
        )
        .sign(&submitter)
        .unwrap();
        assert!(matches!(parse_response(&ev, None), Err(Error::MalformedEvent(_))));
    }

    #[test]
    fn test_check_fields() {
        let owner = Keys::generate();
        let submitter = Keys::generate();
        let ev = build_response(&owner.public_key(), "f1", &submitter, &entries(), false).unwrap();
        let parsed = parse_response(&ev, None).unwrap();

        let mut spec = FormSpec::new("Lunch");
        spec.fields.push(FieldDescriptor::new("q1", "option", "Cuisine"));
        assert!(parsed.check_fields(&spec).is_err());
        spec.fields.push(FieldDescriptor::new("q2", "text", "Notes"));
        assert!(parsed.check_fields(&spec).is_ok());
    }
}
