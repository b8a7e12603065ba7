//! Explicit record cache shared between the publish flow and its caller.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use deltapush_protocol::RemoteFileRecord;

/// Last known state of each record, keyed by record id.
///
/// Cloning yields another handle to the same map. The active session is the
/// only writer; readers may look entries up at any time.
#[derive(Debug, Clone, Default)]
pub struct RecordCache {
    records: Arc<RwLock<HashMap<String, RemoteFileRecord>>>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, record_id: &str) -> Option<RemoteFileRecord> {
        self.records.read().ok()?.get(record_id).cloned()
    }

    /// Stores `record`, replacing any earlier copy.
    pub fn insert(&self, record: &RemoteFileRecord) {
        if let Ok(mut map) = self.records.write() {
            map.insert(record.id.clone(), record.clone());
        }
    }

    pub fn evict(&self, record_id: &str) -> Option<RemoteFileRecord> {
        self.records.write().ok()?.remove(record_id)
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.records.write() {
            map.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
