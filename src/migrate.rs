use anyhow::Result;
use sqlx::SqlitePool;

/// Create the course store schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Top-level collection records (courses)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            id TEXT PRIMARY KEY,
            fields_json TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Child records (questions), one subcollection per collection
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            collection_id TEXT NOT NULL,
            id TEXT NOT NULL,
            fields_json TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection_id, id),
            FOREIGN KEY (collection_id) REFERENCES collections(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Immutable backup snapshots
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS backups (
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            created_at TEXT NOT NULL,
            scope TEXT,
            record_count INTEGER NOT NULL,
            checksum TEXT NOT NULL,
            payload_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_backups_created ON backups(created_at)")
        .execute(pool)
        .await?;

    Ok(())
}
