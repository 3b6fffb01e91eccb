//! SQLite-backed [`Store`] implementation.
//!
//! Field maps are stored as JSON in the tagged [`FieldValue`] encoding so
//! every variant survives a round trip. One [`Store::commit_batch`] call is
//! one SQLite transaction.
//!
//! [`FieldValue`]: course_harness_core::models::FieldValue

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use course_harness_core::models::{
    BackupSnapshot, BackupSummary, Collection, FieldMap, PendingMutation, Record, RecordRef,
};
use course_harness_core::store::{apply_mutation, check_batch_size, Store, DEFAULT_MAX_BATCH_SIZE};

/// SQLite implementation of the [`Store`] trait.
///
/// Wraps a [`SqlitePool`] over the schema created by
/// [`run_migrations`](crate::migrate::run_migrations): `collections`,
/// `records` and `backups`.
pub struct SqliteStore {
    pool: SqlitePool,
    max_batch_size: usize,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn decode_fields(json: &str) -> Result<FieldMap> {
    serde_json::from_str(json).context("corrupt fields_json")
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

async fn apply_in_tx(tx: &mut Transaction<'_, Sqlite>, mutation: &PendingMutation) -> Result<()> {
    let now = Utc::now().timestamp();
    match &mutation.reference {
        RecordRef::Collection { id } => {
            let existing: Option<String> =
                sqlx::query_scalar("SELECT fields_json FROM collections WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut **tx)
                    .await?;
            let existing = existing.as_deref().map(decode_fields).transpose()?;
            let next = apply_mutation(existing.as_ref(), mutation)?;

            sqlx::query(
                r#"
                INSERT INTO collections (id, fields_json, updated_at) VALUES (?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    fields_json = excluded.fields_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(id)
            .bind(serde_json::to_string(&next)?)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        RecordRef::Child { collection, id } => {
            let parent: Option<String> =
                sqlx::query_scalar("SELECT id FROM collections WHERE id = ?")
                    .bind(collection)
                    .fetch_optional(&mut **tx)
                    .await?;
            if parent.is_none() {
                bail!("collection not found: {}", collection);
            }

            let existing: Option<String> = sqlx::query_scalar(
                "SELECT fields_json FROM records WHERE collection_id = ? AND id = ?",
            )
            .bind(collection)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
            let existing = existing.as_deref().map(decode_fields).transpose()?;
            let next = apply_mutation(existing.as_ref(), mutation)?;

            sqlx::query(
                r#"
                INSERT INTO records (collection_id, id, fields_json, updated_at) VALUES (?, ?, ?, ?)
                ON CONFLICT(collection_id, id) DO UPDATE SET
                    fields_json = excluded.fields_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(collection)
            .bind(id)
            .bind(serde_json::to_string(&next)?)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn list_collections(&self) -> Result<Vec<Collection>> {
        let rows = sqlx::query("SELECT id, fields_json FROM collections ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let json: String = row.get("fields_json");
                Ok(Collection::new(id, decode_fields(&json)?))
            })
            .collect()
    }

    async fn list_records(&self, collection: &str) -> Result<Vec<RecordRef>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM records WHERE collection_id = ? ORDER BY id")
                .bind(collection)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids
            .into_iter()
            .map(|id| RecordRef::child(collection, id))
            .collect())
    }

    async fn get_record(&self, reference: &RecordRef) -> Result<Option<Record>> {
        let json: Option<String> = match reference {
            RecordRef::Collection { id } => {
                sqlx::query_scalar("SELECT fields_json FROM collections WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            RecordRef::Child { collection, id } => {
                sqlx::query_scalar(
                    "SELECT fields_json FROM records WHERE collection_id = ? AND id = ?",
                )
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        match json {
            Some(json) => Ok(Some(Record::new(reference.clone(), decode_fields(&json)?))),
            None => Ok(None),
        }
    }

    async fn commit_batch(&self, mutations: &[PendingMutation]) -> Result<()> {
        check_batch_size(mutations, self.max_batch_size)?;
        let mut tx = self.pool.begin().await?;
        for m in mutations {
            apply_in_tx(&mut tx, m)
                .await
                .with_context(|| format!("applying mutation to {}", m.reference))?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn put_snapshot(&self, snapshot: &BackupSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backups (id, label, created_at, scope, record_count, checksum, payload_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.label)
        .bind(format_ts(snapshot.created_at))
        .bind(&snapshot.scope)
        .bind(snapshot.record_count as i64)
        .bind(&snapshot.checksum)
        .bind(serde_json::to_string(snapshot)?)
        .execute(&self.pool)
        .await
        .with_context(|| format!("storing backup {}", snapshot.id))?;
        Ok(())
    }

    async fn get_snapshot(&self, id: &str) -> Result<Option<BackupSnapshot>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT payload_json FROM backups WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match json {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("corrupt backup payload")?,
            )),
            None => Ok(None),
        }
    }

    async fn list_snapshots(&self) -> Result<Vec<BackupSummary>> {
        let rows = sqlx::query(
            "SELECT id, label, created_at, scope, record_count, checksum \
             FROM backups ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let created_at: String = row.get("created_at");
                let record_count: i64 = row.get("record_count");
                Ok(BackupSummary {
                    id: row.get("id"),
                    label: row.get("label"),
                    created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
                    scope: row.get("scope"),
                    record_count: record_count as usize,
                    checksum: row.get("checksum"),
                })
            })
            .collect()
    }
}
