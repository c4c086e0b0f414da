//! Room-record store.
//!
//! Room metadata (name, visibility, soft-delete flag) lives in an external
//! store. The signaling core only reads it for admission checks and
//! diagnostics; persistence backends implement [`RoomStore`].
//! [`InMemoryRoomStore`] serves tests and single-node deployments.

use chrono::{DateTime, Utc};
use common::types::RoomId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

/// A persisted room record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub room_id: RoomId,
    pub name: String,
    pub is_public: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Fields supplied when creating a record.
#[derive(Debug, Clone)]
pub struct NewRoomRecord {
    /// Identifier to use; generated when `None`.
    pub room_id: Option<RoomId>,
    pub name: String,
    pub is_public: bool,
}

/// Listing filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomFilter {
    /// Only public rooms.
    pub public_only: bool,
    /// Include soft-deleted rooms.
    pub include_deleted: bool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("room record already exists: {0}")]
    Duplicate(RoomId),

    #[error("room store unavailable: {0}")]
    Unavailable(String),
}

/// Room metadata store.
#[async_trait::async_trait]
pub trait RoomStore: Send + Sync {
    /// Create a record; fails on duplicate ids.
    async fn create_room_record(&self, record: NewRoomRecord) -> Result<RoomRecord, StoreError>;

    /// Fetch a record, including soft-deleted ones.
    async fn get_room_record(&self, room_id: &RoomId) -> Result<Option<RoomRecord>, StoreError>;

    /// List records matching `filter`, oldest first.
    async fn list_rooms(&self, filter: RoomFilter) -> Result<Vec<RoomRecord>, StoreError>;

    /// Soft-delete a record. Returns false if it does not exist or was
    /// already deleted.
    async fn mark_room_deleted(&self, room_id: &RoomId) -> Result<bool, StoreError>;

    /// Number of records not marked deleted.
    async fn active_room_count(&self) -> Result<usize, StoreError>;
}

/// Store backed by a map in process memory.
#[derive(Default)]
pub struct InMemoryRoomStore {
    records: Mutex<HashMap<RoomId, RoomRecord>>,
}

impl InMemoryRoomStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RoomStore for InMemoryRoomStore {
    async fn create_room_record(&self, record: NewRoomRecord) -> Result<RoomRecord, StoreError> {
        let room_id = record.room_id.unwrap_or_default();
        let mut records = self.records.lock().await;
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
        Ok(self.records.lock().await.get(room_id).cloned())
    }

    async fn list_rooms(&self, filter: RoomFilter) -> Result<Vec<RoomRecord>, StoreError> {
        let records = self.records.lock().await;
        let mut rooms: Vec<RoomRecord> = records
            .values()
            .filter(|r| filter.include_deleted || !r.deleted)
            .filter(|r| !filter.public_only || r.is_public)
            .cloned()
            .collect();
        rooms.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.room_id.cmp(&b.room_id))
        });
        Ok(rooms)
    }

    async fn mark_room_deleted(&self, room_id: &RoomId) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
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
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| !r.deleted)
            .count())
    }
}
