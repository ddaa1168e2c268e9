//! In-memory relay pool.
//!
//! Behaves like a set of independent relays: each keeps its own store,
//! applies latest-wins to parameterized replaceable events, and may be
//! taken offline or set to reject writes.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};

use super::{Filter, PublishOutcome, PublishStatus, RelayMessage, RelayPool, Subscription};
use crate::error::Result;
use crate::event::{is_parameterized_replaceable, Event};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMode {
    Online,
    /// Never answers: publishes time out, subscriptions stay silent.
    Offline,
    /// Answers but refuses writes and closes subscriptions.
    Rejecting(String),
}

#[derive(Debug)]
struct MemoryRelay {
    events: Vec<Event>,
    mode: RelayMode,
}

struct LiveSubscription {
    relays: Vec<String>,
    filters: Vec<Filter>,
    sender: mpsc::UnboundedSender<RelayMessage>,
}

pub struct MemoryRelayPool {
    relays: RwLock<HashMap<String, MemoryRelay>>,
    live: Mutex<Vec<LiveSubscription>>,
    next_id: AtomicU64,
}

impl MemoryRelayPool {
    pub fn new(urls: &[&str]) -> Self {
        let relays = urls
            .iter()
            .map(|url| {
                (
                    url.to_string(),
                    MemoryRelay {
                        events: Vec::new(),
                        mode: RelayMode::Online,
                    },
                )
            })
            .collect();
        MemoryRelayPool {
            relays: RwLock::new(relays),
            live: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub async fn set_mode(&self, url: &str, mode: RelayMode) {
        if let Some(relay) = self.relays.write().await.get_mut(url) {
            info!("relay {} now {:?}", url, mode);
            relay.mode = mode;
        }
    }

    /// Snapshot of everything a relay currently stores.
    pub async fn stored(&self, url: &str) -> Vec<Event> {
        self.relays
            .read()
            .await
            .get(url)
            .map(|r| r.events.clone())
            .unwrap_or_default()
    }
}

impl MemoryRelay {
    fn store(&mut self, event: &Event) -> PublishStatus {
        if event.verify().is_err() {
            return PublishStatus::Rejected("invalid: bad signature or id".to_string());
        }
        if self.events.iter().any(|e| e.id == event.id) {
            return PublishStatus::Rejected("duplicate: already have this event".to_string());
        }
        if is_parameterized_replaceable(event.kind) {
            let d = event.identifier().unwrap_or_default();
            let existing = self.events.iter().position(|e| {
                e.kind == event.kind
                    && e.pubkey == event.pubkey
                    && e.identifier().unwrap_or_default() == d
            });
            if let Some(pos) = existing {
                let current = &self.events[pos];
                let newer = event.created_at > current.created_at
                    || (event.created_at == current.created_at && event.id < current.id);
                if !newer {
                    return PublishStatus::Rejected("duplicate: have a newer version".to_string());
                }
                self.events.remove(pos);
            }
        }
        self.events.push(event.clone());
        PublishStatus::Accepted
    }

    fn matching(&self, filters: &[Filter]) -> Vec<Event> {
        let mut out = Vec::new();
        for filter in filters {
            let mut hits: Vec<&Event> = self.events.iter().filter(|e| filter.matches(e)).collect();
            hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if let Some(limit) = filter.limit {
                hits.truncate(limit);
            }
            for event in hits {
                if !out.iter().any(|e: &Event| e.id == event.id) {
                    out.push(event.clone());
                }
            }
        }
        out
    }
}

#[async_trait]
impl RelayPool for MemoryRelayPool {
    async fn publish(&self, relays: &[String], event: &Event) -> Vec<PublishOutcome> {
        let mut outcomes = Vec::with_capacity(relays.len());
        {
            let mut store = self.relays.write().await;
            for url in relays {
                let status = match store.get_mut(url) {
                    None => PublishStatus::Rejected("unknown relay".to_string()),
                    Some(relay) => match relay.mode.clone() {
                        RelayMode::Offline => PublishStatus::TimedOut,
                        RelayMode::Rejecting(reason) => PublishStatus::Rejected(reason),
                        RelayMode::Online => relay.store(event),
                    },
                };
                outcomes.push(PublishOutcome {
                    relay: url.clone(),
                    status,
                });
            }
        }

        let mut live = self.live.lock().await;
        live.retain(|sub| !sub.sender.is_closed());
        for outcome in outcomes.iter().filter(|o| o.is_accepted()) {
            for sub in live.iter() {
                if sub.relays.contains(&outcome.relay) && sub.filters.iter().any(|f| f.matches(event)) {
                    let _ = sub.sender.send(RelayMessage::Event {
                        relay: outcome.relay.clone(),
                        event: event.clone(),
                    });
                }
            }
        }
        outcomes
    }

    async fn subscribe(&self, relays: &[String], filters: Vec<Filter>) -> Result<Subscription> {
        let id = format!("sub-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut online = Vec::new();
        {
            let store = self.relays.read().await;
            for url in relays {
                match store.get(url).map(|r| (&r.mode, r)) {
                    None => {
                        let _ = sender.send(RelayMessage::Closed {
                            relay: url.clone(),
                            reason: "unknown relay".to_string(),
                        });
                    }
                    Some((RelayMode::Offline, _)) => {}
                    Some((RelayMode::Rejecting(reason), _)) => {
                        let _ = sender.send(RelayMessage::Closed {
                            relay: url.clone(),
                            reason: reason.clone(),
                        });
                    }
                    Some((RelayMode::Online, relay)) => {
                        for event in relay.matching(&filters) {
                            let _ = sender.send(RelayMessage::Event {
                                relay: url.clone(),
                                event,
                            });
                        }
                        let _ = sender.send(RelayMessage::EndOfStored { relay: url.clone() });
                        online.push(url.clone());
                    }
                }
            }
        }
        debug!("{} opened on {} live relays", id, online.len());
        self.live.lock().await.push(LiveSubscription {
            relays: online,
            filters,
            sender,
        });
        Ok(Subscription::new(id, relays.to_vec(), receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::event::UnsignedEvent;
    use crate::keys::Keys;
    use std::time::Duration;

    const A: &str = "wss://a.example";
    const B: &str = "wss://b.example";

    fn relays() -> Vec<String> {
        vec![A.to_string(), B.to_string()]
    }

    fn form_event(keys: &Keys, created_at: u64, name: &str) -> Event {
        UnsignedEvent::new(
            &keys.public_key_hex(),
            30168,
            "",
            vec![
                vec!["d".to_string(), "f1".to_string()],
                vec!["name".to_string(), name.to_string()],
            ],
            created_at,
        )
        .sign(keys)
        .unwrap()
    }

    #[tokio::test]
    async fn test_latest_wins_for_replaceable() {
        let pool = MemoryRelayPool::new(&[A]);
        let keys = Keys::generate();
        let relays = vec![A.to_string()];

        let v1 = form_event(&keys, 100, "v1");
        let v2 = form_event(&keys, 200, "v2");
        let stale = form_event(&keys, 150, "stale");

        assert!(pool.publish(&relays, &v1).await[0].is_accepted());
        assert!(pool.publish(&relays, &v2).await[0].is_accepted());
        assert!(!pool.publish(&relays, &stale).await[0].is_accepted());

        let stored = pool.stored(A).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, v2.id);
    }

    #[tokio::test]
    async fn test_query_once_tolerates_offline_relay() {
        let pool = MemoryRelayPool::new(&[A, B]);
        let keys = Keys::generate();
        let ev = form_event(&keys, 100, "v1");
        pool.publish(&relays(), &ev).await;
        pool.set_mode(B, RelayMode::Offline).await;

        let found = pool
            .query_once(&relays(), vec![Filter::new().kind(30168)], Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_query_once_times_out_when_all_offline() {
        let pool = MemoryRelayPool::new(&[A, B]);
        pool.set_mode(A, RelayMode::Offline).await;
        pool.set_mode(B, RelayMode::Offline).await;

        let result = pool
            .query_once(&relays(), vec![Filter::new()], Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(Error::TransportTimeout(_))));
    }

    #[tokio::test]
    async fn test_query_once_fails_fast_when_all_closed() {
        let pool = MemoryRelayPool::new(&[A, B]);
        pool.set_mode(A, RelayMode::Rejecting("auth-required".to_string())).await;
        pool.set_mode(B, RelayMode::Rejecting("blocked".to_string())).await;

        let result = pool
            .query_once(&relays(), vec![Filter::new()], Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(Error::Transport(_))));

        // one silent relay keeps the outcome a timeout
        pool.set_mode(B, RelayMode::Offline).await;
        let result = pool
            .query_once(&relays(), vec![Filter::new()], Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(Error::TransportTimeout(_))));
    }

    #[tokio::test]
    async fn test_live_events_reach_subscription() {
        let pool = MemoryRelayPool::new(&[A]);
        let relays = vec![A.to_string()];
        let mut sub = pool
            .subscribe(&relays, vec![Filter::new().kind(30168)])
            .await
            .unwrap();
        assert_eq!(sub.next().await, Some(RelayMessage::EndOfStored { relay: A.to_string() }));

        let keys = Keys::generate();
        let ev = form_event(&keys, 100, "v1");
        pool.publish(&relays, &ev).await;

        match sub.next().await {
            Some(RelayMessage::Event { event, .. }) => assert_eq!(event.id, ev.id),
            other => panic!("expected live event, got {:?}", other),
        }
        sub.close();
    }

    #[tokio::test]
    async fn test_rejecting_relay() {
        let pool = MemoryRelayPool::new(&[A]);
        pool.set_mode(A, RelayMode::Rejecting("blocked: paid relay".to_string())).await;
        let keys = Keys::generate();
        let outcomes = pool.publish(&[A.to_string()], &form_event(&keys, 1, "x")).await;
        assert_eq!(
            outcomes[0].status,
            PublishStatus::Rejected("blocked: paid relay".to_string())
        );
    }
}
