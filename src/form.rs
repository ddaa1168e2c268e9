//! Form template events.
//!
//! A form is a parameterized replaceable event. Its body (name, settings
//! and fields) travels as tags, or as NIP-44 ciphertext in `content` when
//! the owner asked for an encrypted form. Addressing tags stay in the clear
//! either way.
use secp256k1::XOnlyPublicKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::event::{self, Event, UnsignedEvent};
use crate::keys::{self, Keys};
use crate::template::{self, BodyKey};

pub const FORM_TEMPLATE_KIND: u32 = 30168;

/// One field of a form, the `["field", id, dataType, label, options, config]` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub id: String,
    pub data_type: String,
    pub label: String,
    #[serde(default)]
    pub options: Value,
    #[serde(default)]
    pub config: Value,
}

impl FieldDescriptor {
    pub fn new(id: &str, data_type: &str, label: &str) -> Self {
        FieldDescriptor {
            id: id.to_string(),
            data_type: data_type.to_string(),
            label: label.to_string(),
            options: Value::Array(vec![]),
            config: Value::Object(Map::new()),
        }
    }

    pub fn to_tag(&self) -> Result<Vec<String>> {
        Ok(vec![
            "field".to_string(),
            self.id.clone(),
            self.data_type.clone(),
            self.label.clone(),
            serde_json::to_string(&self.options)?,
            serde_json::to_string(&self.config)?,
        ])
    }

    /// Parse a `field` tag. Options and config may be omitted, but when
    /// present they must be valid JSON.
    pub fn from_tag(tag: &[String]) -> Result<Self> {
        if tag.first().map(String::as_str) != Some("field") {
            return Err(Error::MalformedEvent("not a field tag".to_string()));
        }
        if tag.len() < 4 || tag[1].is_empty() {
            return Err(Error::MalformedEvent(format!(
                "field tag needs id, type and label, got {} entries",
                tag.len()
            )));
        }
        let json_at = |idx: usize, default: Value| -> Result<Value> {
            match tag.get(idx) {
                None => Ok(default),
                Some(raw) if raw.is_empty() => Ok(default),
                Some(raw) => serde_json::from_str(raw).map_err(|e| {
                    Error::MalformedEvent(format!("field {} has bad json: {}", tag[1], e))
                }),
            }
        };
        Ok(FieldDescriptor {
            id: tag[1].clone(),
            data_type: tag[2].clone(),
            label: tag[3].clone(),
            options: json_at(4, Value::Array(vec![]))?,
            config: json_at(5, Value::Object(Map::new()))?,
        })
    }
}

/// The `settings` tag. Keys this crate does not know about are kept in
/// `extra` so they survive a republish.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub encrypt_form: bool,
    #[serde(default)]
    pub disallow_anonymous: bool,
    #[serde(default)]
    pub encrypt_responses: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Name, settings and fields: the part of a form that may be encrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct FormSpec {
    pub name: String,
    pub settings: FormSettings,
    pub fields: Vec<FieldDescriptor>,
}

impl FormSpec {
    pub fn new(name: &str) -> Self {
        FormSpec {
            name: name.to_string(),
            settings: FormSettings::default(),
            fields: Vec::new(),
        }
    }

    pub fn field(&self, id: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn to_tags(&self) -> Result<Vec<Vec<String>>> {
        let mut tags = vec![
            vec!["name".to_string(), self.name.clone()],
            vec!["settings".to_string(), serde_json::to_string(&self.settings)?],
        ];
        for field in &self.fields {
            tags.push(field.to_tag()?);
        }
        Ok(tags)
    }

    /// Rebuild from body tags, ignoring tags that are not part of the body.
    pub fn from_tags(tags: &[Vec<String>]) -> Result<Self> {
        let mut name = None;
        let mut settings = None;
        let mut fields = Vec::new();
        for tag in tags {
            match tag.first().map(String::as_str) {
                Some("name") => name = tag.get(1).cloned(),
                Some("settings") => {
                    let raw = tag
                        .get(1)
                        .ok_or_else(|| Error::MalformedEvent("empty settings tag".to_string()))?;
                    settings = Some(serde_json::from_str(raw).map_err(|e| {
                        Error::MalformedEvent(format!("bad settings json: {}", e))
                    })?);
                }
                Some("field") => fields.push(FieldDescriptor::from_tag(tag)?),
                _ => {}
            }
        }
        let name = name.ok_or_else(|| Error::MalformedEvent("form has no name".to_string()))?;
        Ok(FormSpec {
            name,
            settings: settings.unwrap_or_default(),
            fields,
        })
    }
}

/// `30168:<author>:<form id>`.
pub fn coordinate(form_author: &str, form_id: &str) -> String {
    format!("{}:{}:{}", FORM_TEMPLATE_KIND, form_author, form_id)
}

/// Split a form coordinate into author and form id.
pub fn parse_coordinate(coordinate: &str) -> Result<(String, String)> {
    let mut parts = coordinate.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(kind), Some(author), Some(form_id)) if kind == FORM_TEMPLATE_KIND.to_string() => {
            if form_id.is_empty() {
                return Err(Error::InvalidFormId);
            }
            Ok((author.to_string(), form_id.to_string()))
        }
        _ => Err(Error::MalformedEvent(format!("bad form coordinate {}", coordinate))),
    }
}

/// Everything needed to publish one version of a form.
#[derive(Debug, Clone, PartialEq)]
pub struct FormTemplate {
    pub form_id: String,
    pub spec: FormSpec,
    pub relays: Vec<String>,
    /// Pubkeys that were granted access, the `p` tags.
    pub participants: Vec<String>,
    pub allowed: Vec<String>,
}

impl FormTemplate {
    pub fn new(form_id: &str, spec: FormSpec) -> Self {
        FormTemplate {
            form_id: form_id.to_string(),
            spec,
            relays: Vec::new(),
            participants: Vec::new(),
            allowed: Vec::new(),
        }
    }

    /// Build and sign the form event.
    ///
    /// An encrypted form needs `view_pk`; its body goes into `content`
    /// and only `d`, `name` and the addressing tags stay readable.
    pub fn to_event(
        &self,
        signing_keys: &Keys,
        view_pk: Option<&XOnlyPublicKey>,
        created_at: u64,
    ) -> Result<Event> {
        if self.form_id.is_empty() {
            return Err(Error::InvalidFormId);
        }
        let mut tags = vec![vec!["d".to_string(), self.form_id.clone()]];
        let content = if self.spec.settings.encrypt_form {
            let view_pk = view_pk.ok_or(Error::MissingCapability("view"))?;
            tags.push(vec!["name".to_string(), self.spec.name.clone()]);
            template::encrypt_form_body(signing_keys, view_pk, &self.spec)?
        } else {
            tags.extend(self.spec.to_tags()?);
            String::new()
        };
        for relay in &self.relays {
            tags.push(vec!["relay".to_string(), relay.clone()]);
        }
        for pubkey in &self.participants {
            tags.push(vec!["p".to_string(), pubkey.clone()]);
        }
        for pubkey in &self.allowed {
            tags.push(vec!["allowed".to_string(), pubkey.clone()]);
        }
        UnsignedEvent::new(
            &signing_keys.public_key_hex(),
            FORM_TEMPLATE_KIND,
            &content,
            tags,
            created_at,
        )
        .sign(signing_keys)
    }

    /// Parse a form event. Encrypted forms need a [`BodyKey`], otherwise
    /// reading them fails with [`Error::Decryption`].
    pub fn from_event(event: &Event, key: Option<&BodyKey>) -> Result<Self> {
        if event.kind != FORM_TEMPLATE_KIND {
            return Err(Error::MalformedEvent(format!(
                "expected form kind {}, got {}",
                FORM_TEMPLATE_KIND, event.kind
            )));
        }
        let form_id = match event.identifier() {
            Some(d) if !d.is_empty() => d.to_string(),
            _ => return Err(Error::InvalidFormId),
        };
        let spec = if is_encrypted(event) {
            let key = key.ok_or(Error::Decryption)?;
            let author = keys::parse_public_key(&event.pubkey)?;
            template::decrypt_form_body(key, &author, &event.content)?
        } else {
            FormSpec::from_tags(&event.tags)?
        };
        let owned = |name: &str| -> Vec<String> {
            event.tag_values(name).into_iter().map(str::to_string).collect()
        };
        Ok(FormTemplate {
            form_id,
            spec,
            relays: owned("relay"),
            participants: owned("p"),
            allowed: owned("allowed"),
        })
    }
}

/// An encrypted form carries its body in `content` and has no `settings` tag.
pub fn is_encrypted(event: &Event) -> bool {
    !event.content.is_empty() && event.tag_value("settings").is_none()
}

/// Whether `pubkey` authored the form or is one of its participants.
pub fn has_access(event: &Event, pubkey: &str) -> bool {
    event.pubkey == pubkey || event.tag_values("p").contains(&pubkey)
}

/// Next version of `event` with `pubkeys` appended as `p` tags.
///
/// Pubkeys already present are skipped, and the timestamp is strictly newer
/// than the current version.
pub fn add_participants(event: &Event, pubkeys: &[String], now: u64) -> UnsignedEvent {
    let mut unsigned = event.to_unsigned();
    for pubkey in pubkeys {
        let present = unsigned
            .tags
            .iter()
            .any(|t| t.first().map(String::as_str) == Some("p") && t.get(1) == Some(pubkey));
        if !present {
            unsigned.tags.push(vec!["p".to_string(), pubkey.clone()]);
        }
    }
    unsigned.created_at = event::next_revision_timestamp(event.created_at, now);
    unsigned
}
