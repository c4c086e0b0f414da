//! Room store mock for admission tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::MockRoomStore;
//!
//! let store = MockRoomStore::new()
//!     .with_room("standup")
//!     .with_deleted_room("retro");
//!
//! let sfu = TestSfu::builder()
//!     .admission("registered")
//!     .store(store.shared())
//!     .spawn()
//!     .await?;
//! ```

use chrono::Utc;
use common::types::RoomId;
use sfu_signaling::store::{NewRoomRecord, RoomFilter, RoomRecord, RoomStore, StoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory `RoomStore` with seeding helpers and failure injection.
#[derive(Debug, Clone, Default)]
pub struct MockRoomStore {
    inner: Arc<MockRoomStoreInner>,
}

#[derive(Debug, Default)]
struct MockRoomStoreInner {
    records: Mutex<HashMap<RoomId, RoomRecord>>,
    unavailable: AtomicBool,
    lookups: AtomicUsize,
}

impl MockRoomStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a live, public room record.
    #[must_use]
    pub fn with_room(self, room_id: &str) -> Self {
        self.insert(room_id, false);
        self
    }

    /// Seed a soft-deleted room record.
    #[must_use]
    pub fn with_deleted_room(self, room_id: &str) -> Self {
        self.insert(room_id, true);
        self
    }

    /// Make every call fail with `StoreError::Unavailable`.
    #[must_use]
    pub fn unavailable(self) -> Self {
        self.set_unavailable(true);
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `get_room_record` calls so far.
    pub fn lookups(&self) -> usize {
        self.inner.lookups.load(Ordering::SeqCst)
    }

    /// The store as a trait object for `TestSfuBuilder::store`.
    pub fn shared(&self) -> Arc<dyn RoomStore> {
        Arc::new(self.clone())
    }

    fn insert(&self, room_id: &str, deleted: bool) {
        let now = Utc::now();
        let record = RoomRecord {
            room_id: RoomId::from(room_id),
            name: format!("Room {room_id}"),
            is_public: true,
            deleted,
            created_at: now,
            deleted_at: deleted.then_some(now),
        };
        self.inner
            .records
            .lock()
            .unwrap()
            .insert(record.room_id.clone(), record);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("mock store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RoomStore for MockRoomStore {
    async fn create_room_record(&self, record: NewRoomRecord) -> Result<RoomRecord, StoreError> {
        self.check_available()?;
        let room_id = record.room_id.unwrap_or_default();
        let mut records = self.inner.records.lock().unwrap();
        if records.contains_key(&room_id) {
            return Err(StoreError::Duplicate(room_id));
        }
        let created = RoomRecord {
            room_id: room_id.clone(),
            name: record.name,
            is_public: record.is_public,
            deleted: false,
            created_at: Utc::now(),
            deleted_at: None,
        };
        records.insert(room_id, created.clone());
        Ok(created)
    }

    async fn get_room_record(&self, room_id: &RoomId) -> Result<Option<RoomRecord>, StoreError> {
        self.inner.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.inner.records.lock().unwrap().get(room_id).cloned())
    }

    async fn list_rooms(&self, filter: RoomFilter) -> Result<Vec<RoomRecord>, StoreError> {
        self.check_available()?;
        let mut rooms: Vec<RoomRecord> = self
            .inner
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| filter.include_deleted || !r.deleted)
            .filter(|r| !filter.public_only || r.is_public)
            .cloned()
            .collect();
        rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rooms)
    }

    async fn mark_room_deleted(&self, room_id: &RoomId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut records = self.inner.records.lock().unwrap();
        match records.get_mut(room_id) {
            Some(record) if !record.deleted => {
                record.deleted = true;
                record.deleted_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn active_room_count(&self) -> Result<usize, StoreError> {
        self.check_available()?;
        Ok(self
            .inner
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| !r.deleted)
            .count())
    }
}
