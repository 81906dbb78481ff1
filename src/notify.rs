use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Event, Span};

const CHANNEL_CAPACITY: usize = 256;

/// What a `listen` subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedItem {
    Committed {
        event: Event,
    },
    /// An occupying appointment stopped occupying `span`. Lists waitlist
    /// entries whose preferences match it, oldest first.
    SlotFreed {
        professional_id: Ulid,
        location_id: Ulid,
        span: Span,
        waitlist_entries: Vec<Ulid>,
    },
}

/// Broadcast hub for the per-professional change feed.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<FeedItem>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a professional's feed. Creates the channel if needed.
    pub fn subscribe(&self, professional_id: Ulid) -> broadcast::Receiver<FeedItem> {
        let sender = self
            .channels
            .entry(professional_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, professional_id: Ulid, item: FeedItem) {
        if let Some(sender) = self.channels.get(&professional_id) {
            let _ = sender.send(item);
        }
    }

    /// Drop a channel (e.g. when the professional is removed).
    pub fn remove(&self, professional_id: &Ulid) {
        self.channels.remove(professional_id);
    }
}
