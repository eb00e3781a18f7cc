//! Postgres-backed store.
//!
//! All collections share the `fleet_records` table; a record's fields live in
//! the `data` JSONB column. Filters compile to JSONB containment for equality
//! and a `timestamptz` cast for time comparisons.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{
    postgres::{PgPool, PgRow},
    Postgres, QueryBuilder, Row,
};
use tracing::debug;

use super::store::{ClaimRequest, Condition, Fields, Filter, Record, Store};
use super::StoreError;

const RETURNING: &str = " RETURNING id, data, created_at, updated_at";

/// Postgres error code for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

struct RecordRow(Record);

impl<'r> sqlx::FromRow<'r, PgRow> for RecordRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let data: Value = row.try_get("data")?;
        let data = match data {
            Value::Object(object) => object,
            _ => Fields::new(),
        };
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
        Ok(Self(Record {
            id: row.try_get("id")?,
            data,
            created_at,
            updated_at,
        }))
    }
}

/// A [`Store`] over a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_write_error(collection: &str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return StoreError::conflict(collection, db_err.message().to_string());
        }
    }
    StoreError::from(err)
}

/// Appends `AND <condition>` for every condition of the filter.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    for condition in &filter.conditions {
        match condition {
            Condition::Eq(field, Value::Null) => {
                qb.push(" AND (data->").push_bind(field.clone());
                qb.push(" IS NULL OR data->").push_bind(field.clone());
                qb.push(" = 'null'::jsonb)");
            }
            Condition::Eq(field, value) => {
                let mut contained = Fields::new();
                contained.insert(field.clone(), value.clone());
                qb.push(" AND data @> ").push_bind(Value::Object(contained));
            }
            Condition::Before(field, instant) => {
                qb.push(" AND (data->>").push_bind(field.clone());
                qb.push(")::timestamptz < ").push_bind(*instant);
            }
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create(&self, collection: &str, id: &str, data: Fields) -> Result<Record, StoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            INSERT INTO fleet_records (collection, id, data)
            VALUES ($1, $2, $3)
            RETURNING id, data, created_at, updated_at
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(Value::Object(data))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_write_error(collection, e))?;

        Ok(row.0)
    }

    async fn find(&self, collection: &str, id: &str) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT id, data, created_at, updated_at
            FROM fleet_records
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.0))
    }

    async fn find_where(
        &self,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT id, data, created_at, updated_at FROM fleet_records WHERE collection = ",
        );
        qb.push_bind(collection.to_string());
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at, id");
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build_query_as::<RecordRow>().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn update(&self, collection: &str, id: &str, patch: Fields) -> Result<Record, StoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            UPDATE fleet_records
            SET data = data || $3, updated_at = now()
            WHERE collection = $1 AND id = $2
            RETURNING id, data, created_at, updated_at
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(Value::Object(patch))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_write_error(collection, e))?;

        row.map(|r| r.0)
            .ok_or_else(|| StoreError::not_found(collection, id))
    }

    async fn upsert(&self, collection: &str, id: &str, data: Fields) -> Result<Record, StoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            INSERT INTO fleet_records (collection, id, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, id)
            DO UPDATE SET data = fleet_records.data || EXCLUDED.data, updated_at = now()
            RETURNING id, data, created_at, updated_at
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(Value::Object(data))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_write_error(collection, e))?;

        Ok(row.0)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM fleet_records WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_set(
        &self,
        collection: &str,
        id: &str,
        expected: &Filter,
        patch: Fields,
    ) -> Result<Option<Record>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE fleet_records SET data = data || ");
        qb.push_bind(Value::Object(patch));
        qb.push(", updated_at = now() WHERE collection = ")
            .push_bind(collection.to_string());
        qb.push(" AND id = ").push_bind(id.to_string());
        push_filter(&mut qb, expected);
        qb.push(RETURNING);

        let row = qb
            .build_query_as::<RecordRow>()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_write_error(collection, e))?;
        Ok(row.map(|r| r.0))
    }

    async fn claim(&self, collection: &str, request: &ClaimRequest) -> Result<Vec<Record>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut take = request.limit as i64;
        if let Some(cap) = &request.in_flight {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(&cap.scope)
                .execute(&mut *tx)
                .await?;

            let mut count = QueryBuilder::<Postgres>::new(
                "SELECT count(*) FROM fleet_records WHERE collection = ",
            );
            count.push_bind(collection.to_string());
            push_filter(&mut count, &cap.filter);
            let in_flight: i64 = count.build_query_scalar().fetch_one(&mut *tx).await?;

            take = take.min((cap.max as i64 - in_flight).max(0));
            debug!(scope = %cap.scope, in_flight, take, "Applied in-flight cap");
        }

        if take == 0 {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE fleet_records SET data = data || ");
        qb.push_bind(Value::Object(request.patch.clone()));
        qb.push(", updated_at = now() WHERE collection = ")
            .push_bind(collection.to_string());
        qb.push(" AND id IN (SELECT id FROM fleet_records WHERE collection = ")
            .push_bind(collection.to_string());
        push_filter(&mut qb, &request.filter);
        qb.push(" ORDER BY created_at, id LIMIT ").push_bind(take);
        qb.push(" FOR UPDATE SKIP LOCKED)");
        qb.push(RETURNING);

        let rows = qb.build_query_as::<RecordRow>().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let mut claimed: Vec<Record> = rows.into_iter().map(|r| r.0).collect();
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(claimed)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
