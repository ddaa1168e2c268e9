//! Relay pool abstraction.
//!
//! The access-control core never talks to sockets. It publishes and queries
//! through a [`RelayPool`], and treats every relay as unreliable: a relay
//! that does not answer in time says nothing about whether the data exists.
use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::event::Event;

pub mod memory;

/// Subscription filter, serialized in NIP-01 shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(rename = "#d", skip_serializing_if = "Option::is_none")]
    pub d_tags: Option<Vec<String>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub p_tags: Option<Vec<String>>,
    #[serde(rename = "#a", skip_serializing_if = "Option::is_none")]
    pub a_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

fn push(list: &mut Option<Vec<String>>, value: &str) {
    list.get_or_insert_with(Vec::new).push(value.to_string());
}

fn tag_matches(event: &Event, name: &str, wanted: &Option<Vec<String>>) -> bool {
    match wanted {
        None => true,
        Some(values) => event
            .tag_values(name)
            .iter()
            .any(|v| values.iter().any(|w| w == v)),
    }
}

impl Filter {
    pub fn new() -> Self {
        Filter::default()
    }

    pub fn id(mut self, id: &str) -> Self {
        push(&mut self.ids, id);
        self
    }

    pub fn author(mut self, author: &str) -> Self {
        push(&mut self.authors, author);
        self
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn identifier(mut self, d: &str) -> Self {
        push(&mut self.d_tags, d);
        self
    }

    pub fn pubkey_tag(mut self, pubkey: &str) -> Self {
        push(&mut self.p_tags, pubkey);
        self
    }

    pub fn coordinate(mut self, coordinate: &str) -> Self {
        push(&mut self.a_tags, coordinate);
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if self.since.map_or(false, |since| event.created_at < since) {
            return false;
        }
        if self.until.map_or(false, |until| event.created_at > until) {
            return false;
        }
        tag_matches(event, "d", &self.d_tags)
            && tag_matches(event, "p", &self.p_tags)
            && tag_matches(event, "a", &self.a_tags)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishStatus {
    Accepted,
    Rejected(String),
    /// The relay did not acknowledge within the bounded wait.
    TimedOut,
}

/// Per-relay result of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub relay: String,
    pub status: PublishStatus,
}

impl PublishOutcome {
    pub fn is_accepted(&self) -> bool {
        self.status == PublishStatus::Accepted
    }
}

/// Messages delivered to a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Event { relay: String, event: Event },
    /// The relay has sent every stored event matching the filters.
    EndOfStored { relay: String },
    Closed { relay: String, reason: String },
}

/// Closable handle on a live subscription.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    relays: Vec<String>,
    receiver: mpsc::UnboundedReceiver<RelayMessage>,
}

impl Subscription {
    pub fn new(
        id: String,
        relays: Vec<String>,
        receiver: mpsc::UnboundedReceiver<RelayMessage>,
    ) -> Self {
        Subscription {
            id,
            relays,
            receiver,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// Next message, or `None` once the subscription is closed and drained.
    pub async fn next(&mut self) -> Option<RelayMessage> {
        self.receiver.recv().await
    }

    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Abstract publish/subscribe capability over a set of relays.
#[async_trait]
pub trait RelayPool: Send + Sync {
    /// Send `event` to every relay in `relays`, one outcome per relay.
    async fn publish(&self, relays: &[String], event: &Event) -> Vec<PublishOutcome>;

    /// Open a subscription; stored events are followed by one
    /// [`RelayMessage::EndOfStored`] per relay, then live events.
    async fn subscribe(&self, relays: &[String], filters: Vec<Filter>) -> Result<Subscription>;

    /// Collect stored events until every relay finished or `wait` expired.
    ///
    /// Succeeds when at least one relay answered. Fails with
    /// [`Error::Transport`] when every relay closed the subscription, and
    /// with [`Error::TransportTimeout`] when none answered in time.
    async fn query_once(
        &self,
        relays: &[String],
        filters: Vec<Filter>,
        wait: Duration,
    ) -> Result<Vec<Event>> {
        let relays = dedup_relays(relays);
        if relays.is_empty() {
            return Err(Error::Transport("no relays to query".to_string()));
        }
        let mut sub = self.subscribe(&relays, filters).await?;
        let deadline = tokio::time::Instant::now() + wait;

        let mut events: Vec<Event> = Vec::new();
        let mut seen = HashSet::new();
        let mut responded = HashSet::new();
        let mut finished = HashSet::new();
        let mut closed = HashSet::new();
        while finished.len() < relays.len() {
            match tokio::time::timeout_at(deadline, sub.next()).await {
                Ok(Some(RelayMessage::Event { relay, event })) => {
                    trace!("event {} from {}", event.id, relay);
                    responded.insert(relay);
                    if seen.insert(event.id.clone()) {
                        events.push(event);
                    }
                }
                Ok(Some(RelayMessage::EndOfStored { relay })) => {
                    responded.insert(relay.clone());
                    finished.insert(relay);
                }
                Ok(Some(RelayMessage::Closed { relay, reason })) => {
                    debug!("relay {} closed subscription {}: {}", relay, sub.id(), reason);
                    closed.insert(relay.clone());
                    finished.insert(relay);
                }
                Ok(None) => break,
                Err(_) => {
                    let silent: Vec<&String> =
                        relays.iter().filter(|r| !finished.contains(*r)).collect();
                    warn!("query {} timed out waiting on {:?}", sub.id(), silent);
                    break;
                }
            }
        }
        sub.close();

        if responded.is_empty() {
            if closed.len() == relays.len() {
                return Err(Error::Transport(format!(
                    "every relay closed query {}",
                    sub.id()
                )));
            }
            return Err(Error::TransportTimeout(wait));
        }
        debug!(
            "query {} returned {} events from {}/{} relays",
            sub.id(),
            events.len(),
            responded.len(),
            relays.len()
        );
        Ok(events)
    }
}

fn dedup_relays(relays: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    relays
        .iter()
        .filter(|r| seen.insert(r.as_str()))
        .cloned()
        .collect()
}

/// Publish with a bounded wait; succeeds when any relay accepted.
pub async fn publish_checked(
    pool: &dyn RelayPool,
    relays: &[String],
    event: &Event,
    wait: Duration,
) -> Result<Vec<PublishOutcome>> {
    let relays = dedup_relays(relays);
    let outcomes = tokio::time::timeout(wait, pool.publish(&relays, event))
        .await
        .map_err(|_| Error::TransportTimeout(wait))?;

    for outcome in &outcomes {
        match &outcome.status {
            PublishStatus::Accepted => debug!("relay {} accepted {}", outcome.relay, event.id),
            PublishStatus::Rejected(reason) => {
                warn!("relay {} rejected {}: {}", outcome.relay, event.id, reason)
            }
            PublishStatus::TimedOut => debug!("relay {} did not ack {}", outcome.relay, event.id),
        }
    }

    if outcomes.iter().any(PublishOutcome::is_accepted) {
        Ok(outcomes)
    } else if outcomes.iter().all(|o| o.status == PublishStatus::TimedOut) {
        Err(Error::TransportTimeout(wait))
    } else {
        Err(Error::Transport(format!("no relay accepted event {}", event.id)))
    }
}

/// Newest event matching `filter`, ties broken by lowest id.
pub async fn fetch_latest(
    pool: &dyn RelayPool,
    relays: &[String],
    filter: Filter,
    wait: Duration,
) -> Result<Option<Event>> {
    let events = pool.query_once(relays, vec![filter], wait).await?;
    Ok(events.into_iter().max_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| b.id.cmp(&a.id))
    }))
}
