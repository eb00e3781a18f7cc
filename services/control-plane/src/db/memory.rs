//! In-process store for dev mode and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::store::{ClaimRequest, Fields, Filter, Record, Store};
use super::StoreError;

/// A [`Store`] held entirely in memory.
///
/// A single mutex guards every collection, so each call (a claim included) is
/// one critical section.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, HashMap<String, Record>>>,
    unique_keys: Vec<(String, String)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `field` unique within `collection`, like a unique index.
    pub fn with_unique_key(mut self, collection: &str, field: &str) -> Self {
        self.unique_keys
            .push((collection.to_string(), field.to_string()));
        self
    }

    fn check_unique(
        &self,
        collection: &str,
        rows: &HashMap<String, Record>,
        id: &str,
        data: &Fields,
    ) -> Result<(), StoreError> {
        for (_, field) in self.unique_keys.iter().filter(|(c, _)| c == collection) {
            let Some(value) = data.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            let taken = rows
                .values()
                .any(|r| r.id != id && r.data.get(field) == Some(value));
            if taken {
                return Err(StoreError::conflict(
                    collection,
                    format!("{field} {value} already exists"),
                ));
            }
        }
        Ok(())
    }
}

fn sorted(mut records: Vec<Record>) -> Vec<Record> {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    records
}

fn merge(data: &mut Fields, patch: Fields) {
    for (key, value) in patch {
        data.insert(key, value);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create(&self, collection: &str, id: &str, data: Fields) -> Result<Record, StoreError> {
        let mut collections = self.collections.lock().await;
        let rows = collections.entry(collection.to_string()).or_default();

        if rows.contains_key(id) {
            return Err(StoreError::conflict(collection, format!("id {id} already exists")));
        }
        self.check_unique(collection, rows, id, &data)?;

        let now = Utc::now();
        let record = Record {
            id: id.to_string(),
            data,
            created_at: now,
            updated_at: now,
        };
        rows.insert(id.to_string(), record.clone());
        Ok(record)
    }

    async fn find(&self, collection: &str, id: &str) -> Result<Option<Record>, StoreError> {
        let collections = self.collections.lock().await;
        Ok(collections.get(collection).and_then(|rows| rows.get(id)).cloned())
    }

    async fn find_where(
        &self,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError> {
        let collections = self.collections.lock().await;
        let Some(rows) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut matched = sorted(
            rows.values()
                .filter(|r| filter.matches(&r.data))
                .cloned()
                .collect(),
        );
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn update(&self, collection: &str, id: &str, patch: Fields) -> Result<Record, StoreError> {
        let mut collections = self.collections.lock().await;
        let rows = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::not_found(collection, id))?;

        let mut next = rows
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(collection, id))?;
        merge(&mut next.data, patch);
        self.check_unique(collection, rows, id, &next.data)?;

        next.updated_at = Utc::now();
        rows.insert(id.to_string(), next.clone());
        Ok(next)
    }

    async fn upsert(&self, collection: &str, id: &str, data: Fields) -> Result<Record, StoreError> {
        let mut collections = self.collections.lock().await;
        let rows = collections.entry(collection.to_string()).or_default();

        let now = Utc::now();
        let record = match rows.get(id) {
            Some(existing) => {
                let mut next = existing.clone();
                merge(&mut next.data, data);
                next.updated_at = now;
                next
            }
            None => Record {
                id: id.to_string(),
                data,
                created_at: now,
                updated_at: now,
            },
        };
        self.check_unique(collection, rows, id, &record.data)?;
        rows.insert(id.to_string(), record.clone());
        Ok(record)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let mut collections = self.collections.lock().await;
        Ok(collections
            .get_mut(collection)
            .is_some_and(|rows| rows.remove(id).is_some()))
    }

    async fn compare_and_set(
        &self,
        collection: &str,
        id: &str,
        expected: &Filter,
        patch: Fields,
    ) -> Result<Option<Record>, StoreError> {
        let mut collections = self.collections.lock().await;
        let Some(record) = collections.get_mut(collection).and_then(|rows| rows.get_mut(id)) else {
            return Ok(None);
        };
        if !expected.matches(&record.data) {
            return Ok(None);
        }

        merge(&mut record.data, patch);
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn claim(&self, collection: &str, request: &ClaimRequest) -> Result<Vec<Record>, StoreError> {
        let mut collections = self.collections.lock().await;
        let Some(rows) = collections.get_mut(collection) else {
            return Ok(Vec::new());
        };

        let mut take = request.limit;
        if let Some(cap) = &request.in_flight {
            let in_flight = rows.values().filter(|r| cap.filter.matches(&r.data)).count();
            take = take.min(cap.max.saturating_sub(in_flight));
        }
        if take == 0 {
            return Ok(Vec::new());
        }

        let candidates: Vec<String> = sorted(
            rows.values()
                .filter(|r| request.filter.matches(&r.data))
                .cloned()
                .collect(),
        )
        .into_iter()
        .take(take)
        .map(|r| r.id)
        .collect();

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(record) = rows.get_mut(&id) {
                merge(&mut record.data, request.patch.clone());
                record.updated_at = now;
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("unique_keys", &self.unique_keys)
            .finish_non_exhaustive()
    }
}
