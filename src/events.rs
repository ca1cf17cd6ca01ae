use std::collections::HashMap;

use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::types::{ScanEvent, ScanUpdate};

/// In-process publish/subscribe hub with one broadcast "room" per scan id.
///
/// Rooms are independent: publishing never touches another scan's channel.
#[derive(Debug)]
pub struct EventHub {
    rooms: RwLock<HashMap<String, broadcast::Sender<ScanUpdate>>>,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Create the room for `scan_id` (or reuse it) and return a publisher bound to it.
    pub async fn open(&self, scan_id: &str) -> ScanPublisher {
        let mut rooms = self.rooms.write().await;
        let sender = rooms
            .entry(scan_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        ScanPublisher {
            scan_id: scan_id.to_string(),
            sender,
        }
    }

    /// Join an existing room. `None` when the scan is unknown or already finished.
    pub async fn subscribe(&self, scan_id: &str) -> Option<broadcast::Receiver<ScanUpdate>> {
        self.rooms.read().await.get(scan_id).map(|s| s.subscribe())
    }

    /// Publish into an existing room only; returns false when the room is gone.
    pub async fn publish_to(&self, scan_id: &str, event: ScanEvent) -> bool {
        let rooms = self.rooms.read().await;
        let Some(sender) = rooms.get(scan_id) else {
            return false;
        };
        let _ = sender.send(ScanUpdate {
            scan_id: Some(scan_id.to_string()),
            event,
        });
        true
    }

    /// Drop the room. Subscribers still drain whatever was buffered, then see `Closed`.
    pub async fn close(&self, scan_id: &str) {
        if self.rooms.write().await.remove(scan_id).is_some() {
            debug!(scan_id, "event room closed");
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

/// Handle used by the coordinator and executors to publish into one scan's room.
#[derive(Debug, Clone)]
pub struct ScanPublisher {
    scan_id: String,
    sender: broadcast::Sender<ScanUpdate>,
}

impl ScanPublisher {
    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    /// Fire-and-forget: having no subscriber is not an error.
    pub fn publish(&self, event: ScanEvent) {
        let _ = self.sender.send(ScanUpdate {
            scan_id: Some(self.scan_id.clone()),
            event,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanUpdate> {
        self.sender.subscribe()
    }
}
