//! The data object base: identity, timestamps, retention and streamer link.

use crate::core::error::DataId;
use crate::core::types::DataKind;
use crate::data::coherence::{CoherenceStore, Retention, TransferCounts};
use crate::device::ExecutionDevice;
use crate::execution::streaming::Streamer;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static TIMESTAMP: AtomicU64 = AtomicU64::new(1);

/// Draw the next value of the process-wide timestamp counter.
///
/// Values are strictly increasing and never reused.
pub fn next_timestamp() -> u64 {
    TIMESTAMP.fetch_add(1, Ordering::Relaxed)
}

/// State shared by every data object.
pub struct DataObjectBase {
    id: DataId,
    store: CoherenceStore,
    streamer: RwLock<Option<Weak<dyn Streamer>>>,
}

impl DataObjectBase {
    /// Create a fresh, uninitialized base.
    pub fn new() -> Self {
        let id = DataId::new();
        Self {
            id,
            store: CoherenceStore::new(id),
            streamer: RwLock::new(None),
        }
    }

    /// The coherence store holding every representation of this object.
    pub fn store(&self) -> &CoherenceStore {
        &self.store
    }
}

impl Default for DataObjectBase {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DataObjectBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataObjectBase")
            .field("id", &self.id)
            .field("timestamp", &self.store.timestamp())
            .finish()
    }
}

/// A typed payload whose storage is managed by a coherence store.
pub trait DataObject: Send + Sync + fmt::Debug {
    /// Shared base state.
    fn base(&self) -> &DataObjectBase;

    /// Kind of object, used for port typing.
    fn kind(&self) -> DataKind;

    /// Object identity.
    fn id(&self) -> DataId {
        self.base().id
    }

    /// Modification timestamp. Changes only when content changes.
    fn timestamp(&self) -> u64 {
        self.base().store.timestamp()
    }

    /// Timestamp drawn when the object was constructed.
    fn creation_timestamp(&self) -> u64 {
        self.base().store.creation_timestamp()
    }

    /// Record a content change made outside an access guard.
    fn update_modified_timestamp(&self) {
        self.base().store.touch();
    }

    /// Keep the representation on `device` alive until the handle drops.
    fn retain(&self, device: &ExecutionDevice) -> Retention {
        self.base().store.retain(device)
    }

    /// Number of live retentions for `device`.
    fn reference_count(&self, device: &ExecutionDevice) -> u32 {
        self.base().store.reference_count(device)
    }

    /// Whether this object is one frame of a streaming sequence.
    fn is_dynamic(&self) -> bool {
        self.streamer().is_some()
    }

    /// The streamer producing this object, if it is still alive.
    fn streamer(&self) -> Option<Arc<dyn Streamer>> {
        self.base().streamer.read().as_ref().and_then(Weak::upgrade)
    }

    /// Link this object to the streamer producing it. Not owning.
    fn set_streamer(&self, streamer: &Arc<dyn Streamer>) {
        *self.base().streamer.write() = Some(Arc::downgrade(streamer));
    }

    /// Transfer counters of the underlying store.
    fn transfer_counts(&self) -> TransferCounts {
        self.base().store.transfer_counts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_increase() {
        let a = next_timestamp();
        let b = next_timestamp();
        assert!(b > a);
    }
}
