//! The persistence seam.
//!
//! Every collection is a set of records keyed by id, each holding a flat JSON
//! object. Domain modules encode their types into [`Fields`] and decode
//! [`Record`]s back; the store never knows what a tenant or a job is.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::StoreError;

/// A record's user fields.
pub type Fields = serde_json::Map<String, Value>;

/// Keys owned by the store and never stored inside `data`.
const MANAGED_KEYS: [&str; 3] = ["id", "created_at", "updated_at"];

/// One stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub data: Fields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Decodes the record into a domain type whose `id`, `created_at` and
    /// `updated_at` fields come from the store.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        let mut object = self.data.clone();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        object.insert("created_at".to_string(), serde_json::to_value(self.created_at)?);
        object.insert("updated_at".to_string(), serde_json::to_value(self.updated_at)?);
        Ok(serde_json::from_value(Value::Object(object))?)
    }

    /// A field as a string, when present.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Encodes a domain value into fields, dropping the store-managed keys.
pub fn to_fields<T: Serialize>(value: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(mut object) => {
            for key in MANAGED_KEYS {
                object.remove(key);
            }
            Ok(object)
        }
        other => Err(StoreError::Serialization(serde::ser::Error::custom(format!(
            "expected an object, got {other}"
        )))),
    }
}

/// Builds a [`Fields`] patch from `(key, value)` pairs.
pub fn fields<I, K>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// One predicate over a record's fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The field equals the value. A missing field equals `null`.
    Eq(String, Value),
    /// The field is a timestamp strictly before the instant.
    Before(String, DateTime<Utc>),
}

/// Conjunction of conditions. The empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(field.into(), value.into()));
        self
    }

    pub fn before(mut self, field: impl Into<String>, instant: DateTime<Utc>) -> Self {
        self.conditions.push(Condition::Before(field.into(), instant));
        self
    }

    /// Evaluates the filter against in-memory fields.
    pub fn matches(&self, data: &Fields) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq(field, expected) => data.get(field).unwrap_or(&Value::Null) == expected,
            Condition::Before(field, instant) => data
                .get(field)
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .is_some_and(|ts| ts.with_timezone(&Utc) < *instant),
        })
    }
}

/// Caps how many records may be in the claimed state at once.
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightCap {
    /// Serialisation scope; claims sharing a scope never run concurrently.
    pub scope: String,
    /// Matches the records already in flight.
    pub filter: Filter,
    pub max: usize,
}

/// An atomic claim: pick up to `limit` records matching `filter`, oldest
/// first, and apply `patch` to each of them in the same step.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRequest {
    pub filter: Filter,
    pub patch: Fields,
    pub limit: usize,
    pub in_flight: Option<InFlightCap>,
}

/// Record persistence.
///
/// Implementations must make [`Store::compare_and_set`] and [`Store::claim`]
/// atomic with respect to every other call on the same store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts a new record. Fails with `Conflict` when the id or a unique
    /// key is already taken.
    async fn create(&self, collection: &str, id: &str, data: Fields) -> Result<Record, StoreError>;

    async fn find(&self, collection: &str, id: &str) -> Result<Option<Record>, StoreError>;

    /// Records matching `filter`, oldest first.
    async fn find_where(
        &self,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError>;

    /// Merges `patch` into an existing record and refreshes `updated_at`.
    async fn update(&self, collection: &str, id: &str, patch: Fields) -> Result<Record, StoreError>;

    /// Inserts the record, or merges `data` into the existing fields in one
    /// step. Fields absent from `data` keep their stored value.
    async fn upsert(&self, collection: &str, id: &str, data: Fields) -> Result<Record, StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

    /// Merges `patch` only if the record currently matches `expected`.
    /// Returns `None` when the record is missing or does not match.
    async fn compare_and_set(
        &self,
        collection: &str,
        id: &str,
        expected: &Filter,
        patch: Fields,
    ) -> Result<Option<Record>, StoreError>;

    async fn claim(&self, collection: &str, request: &ClaimRequest) -> Result<Vec<Record>, StoreError>;

    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        id: String,
        name: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    }

    #[test]
    fn test_to_fields_drops_managed_keys() {
        let now = Utc::now();
        let widget = Widget {
            id: "w1".to_string(),
            name: "gear".to_string(),
            created_at: now,
            updated_at: now,
        };
        let fields = to_fields(&widget).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["name"], "gear");
    }

    #[test]
    fn test_decode_injects_managed_keys() {
        let now = Utc::now();
        let record = Record {
            id: "w1".to_string(),
            data: fields([("name", json!("gear"))]),
            created_at: now,
            updated_at: now,
        };
        let widget: Widget = record.decode().unwrap();
        assert_eq!(widget.id, "w1");
        assert_eq!(widget.created_at, now);
    }

    #[test]
    fn test_filter_eq_treats_missing_as_null() {
        let data = fields([("status", json!("pending"))]);
        assert!(Filter::new().eq("status", "pending").matches(&data));
        assert!(Filter::new().eq("claimed_by", Value::Null).matches(&data));
        assert!(!Filter::new().eq("status", "claimed").matches(&data));
    }

    #[test]
    fn test_filter_before() {
        let now = Utc::now();
        let data = fields([(
            "lease_expires_at",
            serde_json::to_value(now - Duration::seconds(5)).unwrap(),
        )]);
        assert!(Filter::new().before("lease_expires_at", now).matches(&data));
        assert!(!Filter::new()
            .before("lease_expires_at", now - Duration::seconds(10))
            .matches(&data));
        assert!(!Filter::new().before("missing", now).matches(&data));
    }
}
