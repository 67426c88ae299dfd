//! Per-instance subscriptions: source name to interested listeners

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crossbeam::channel::Sender;

use super::message::{InboundMessage, Payload};

/// Identifies a listener within one instance
pub type ListenerId = u64;

type Callback = dyn Fn(&InboundMessage) + Send + Sync;

/// Receiver of inbound messages for one source
#[derive(Clone)]
pub enum Listener {
    Channel(Sender<InboundMessage>),
    Callback(Arc<Callback>),
}

impl Listener {
    /// Hand over a message; false when the channel's receiver is gone
    pub fn notify(&self, msg: &InboundMessage) -> bool {
        match self {
            Self::Channel(tx) => tx.send(msg.clone()).is_ok(),
            Self::Callback(f) => {
                f(msg);
                true
            }
        }
    }
}

#[derive(Default)]
struct SourceEntry {
    listeners: Vec<(ListenerId, Listener)>,
    latest: Option<Payload>,
}

/// Subscriptions of one instance
#[derive(Default)]
pub struct SubscriptionTable {
    sources: BTreeMap<String, SourceEntry>,
    next_listener: ListenerId,
}

impl SubscriptionTable {
    pub fn contains(&self, source: &str) -> bool {
        self.sources.contains_key(source)
    }

    /// Returns false if the source was already subscribed
    pub fn insert(&mut self, source: &str) -> bool {
        if self.contains(source) {
            return false;
        }
        self.sources.insert(source.to_string(), SourceEntry::default());
        true
    }

    /// Drop the source and its listeners; false if it was not subscribed
    pub fn remove(&mut self, source: &str) -> bool {
        self.sources.remove(source).is_some()
    }

    /// Attach a listener to a subscribed source
    pub fn add_listener(&mut self, source: &str, listener: Listener) -> Option<ListenerId> {
        let entry = self.sources.get_mut(source)?;
        self.next_listener += 1;
        entry.listeners.push((self.next_listener, listener));
        Some(self.next_listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        for entry in self.sources.values_mut() {
            if let Some(pos) = entry.listeners.iter().position(|(l, _)| *l == id) {
                entry.listeners.remove(pos);
                return true;
            }
        }
        false
    }

    /// Store the payload as the source's latest value and return its
    /// listeners; `None` when the source is not subscribed
    pub fn record(
        &mut self,
        source: &str,
        payload: &Payload,
    ) -> Option<Vec<(ListenerId, Listener)>> {
        let entry = self.sources.get_mut(source)?;
        entry.latest = Some(payload.clone());
        Some(entry.listeners.clone())
    }

    pub fn latest(&self, source: &str) -> Option<Payload> {
        self.sources.get(source).and_then(|e| e.latest.clone())
    }

    pub fn listener_count(&self, source: &str) -> usize {
        self.sources.get(source).map_or(0, |e| e.listeners.len())
    }

    pub fn sources(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    /// Remove everything, returning the sources that were subscribed
    pub fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.sources).into_keys().collect()
    }
}

impl fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.sources.iter().map(|(k, v)| (k, v.listeners.len())))
            .finish()
    }
}
