use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Execution records (workflow engine state)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            object_key TEXT NOT NULL,
            object_version TEXT NOT NULL,
            file_type TEXT NOT NULL,
            descriptor_json TEXT NOT NULL,
            state TEXT NOT NULL,
            import_attempts INTEGER NOT NULL DEFAULT 0,
            notify_attempts INTEGER NOT NULL DEFAULT 0,
            last_error_kind TEXT,
            last_error_message TEXT,
            last_error_retryable INTEGER,
            retry_at INTEGER,
            summary_json TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            lease_owner TEXT,
            lease_expires_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Arrival buffer
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS arrival_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            body TEXT NOT NULL,
            receipt TEXT,
            receive_count INTEGER NOT NULL DEFAULT 0,
            visible_at INTEGER NOT NULL,
            enqueued_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS arrival_dead_letters (
            id INTEGER PRIMARY KEY,
            body TEXT NOT NULL,
            receive_count INTEGER NOT NULL,
            enqueued_at INTEGER NOT NULL,
            dead_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Import bookkeeping: one row per committed (key, version)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS imports (
            source_object_key TEXT NOT NULL,
            source_object_version TEXT NOT NULL,
            file_type TEXT NOT NULL,
            row_count INTEGER NOT NULL,
            imported_at INTEGER NOT NULL,
            PRIMARY KEY (source_object_key, source_object_version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Measurement tables
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ac_level0 (
            stw INTEGER NOT NULL,
            backend TEXT NOT NULL,
            frontend TEXT NOT NULL,
            sig_type TEXT NOT NULL,
            ssb_att TEXT NOT NULL,
            ssb_fq TEXT NOT NULL,
            prescaler INTEGER NOT NULL,
            inttime REAL NOT NULL,
            mode INTEGER NOT NULL,
            acd_mon TEXT NOT NULL,
            cc BLOB NOT NULL,
            source_object_key TEXT NOT NULL,
            source_object_version TEXT NOT NULL,
            created INTEGER NOT NULL,
            PRIMARY KEY (stw, backend)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fba_level0 (
            stw INTEGER PRIMARY KEY,
            mech_type TEXT NOT NULL,
            source_object_key TEXT NOT NULL,
            source_object_version TEXT NOT NULL,
            created INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS shk_level0 (
            stw INTEGER NOT NULL,
            shk_type TEXT NOT NULL,
            value REAL NOT NULL,
            source_object_key TEXT NOT NULL,
            source_object_version TEXT NOT NULL,
            created INTEGER NOT NULL,
            PRIMARY KEY (stw, shk_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS attitude_level0 (
            stw INTEGER PRIMARY KEY,
            soda INTEGER NOT NULL,
            year INTEGER NOT NULL,
            mon INTEGER NOT NULL,
            day INTEGER NOT NULL,
            hour INTEGER NOT NULL,
            min INTEGER NOT NULL,
            secs REAL NOT NULL,
            orbit REAL NOT NULL,
            qt TEXT NOT NULL,
            qa TEXT NOT NULL,
            qe TEXT NOT NULL,
            gps TEXT NOT NULL,
            acs REAL NOT NULL,
            source_object_key TEXT NOT NULL,
            source_object_version TEXT NOT NULL,
            created INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Notification outbox
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subscriber_id TEXT NOT NULL,
            trigger_object_key TEXT NOT NULL,
            trigger_object_version TEXT NOT NULL,
            file_type TEXT NOT NULL,
            row_count INTEGER NOT NULL,
            payload TEXT NOT NULL,
            emitted_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_state ON executions(state, updated_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_arrival_queue_visible ON arrival_queue(visible_at)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_notifications_subscriber ON notifications(subscriber_id, id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
