//! SQLite import sink.
//!
//! A batch is written in one transaction together with a row in
//! `imports` keyed by (`source_object_key`, `source_object_version`). When
//! that row already exists the transaction is rolled back and the commit
//! reports [`CommitOutcome::AlreadyCommitted`], so replays of the same file
//! version never duplicate data.
//!
//! Measurement rows are upserted on their natural keys: a newer file
//! covering the same satellite time replaces the older values.

use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction};

use level0_core::error::StoreError;
use level0_core::format::rows::{AcRecord, AttitudeRecord, FbaRecord, MeasurementRows, ShkRecord};
use level0_core::models::FileType;
use level0_core::ports::{CommitOutcome, ImportBatch, ImportSink};

use crate::db::store_error;

#[derive(Clone)]
pub struct SqliteImportSink {
    pool: SqlitePool,
}

/// Provenance columns shared by every measurement table.
struct Provenance<'a> {
    key: &'a str,
    version: &'a str,
    created: i64,
}

impl SqliteImportSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Rows currently stored for a file type.
    pub async fn row_count(&self, file_type: FileType) -> Result<i64, StoreError> {
        let sql = match file_type {
            FileType::Ac1 => "SELECT COUNT(*) FROM ac_level0 WHERE backend = 'AC1'",
            FileType::Ac2 => "SELECT COUNT(*) FROM ac_level0 WHERE backend = 'AC2'",
            FileType::Fba => "SELECT COUNT(*) FROM fba_level0",
            FileType::Shk => "SELECT COUNT(*) FROM shk_level0",
            FileType::Att => "SELECT COUNT(*) FROM attitude_level0",
        };
        sqlx::query_scalar(sql)
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)
    }

    pub async fn import_count(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM imports")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)
    }
}

fn json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

/// Correlator products as little-endian f64 words.
pub fn encode_cc(cc: &[f64]) -> Vec<u8> {
    cc.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_cc(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| {
            let mut word = [0u8; 8];
            word.copy_from_slice(c);
            f64::from_le_bytes(word)
        })
        .collect()
}

async fn insert_spectra(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[AcRecord],
    p: &Provenance<'_>,
) -> Result<(), StoreError> {
    for r in rows {
        sqlx::query(
            r#"
            INSERT INTO ac_level0 (stw, backend, frontend, sig_type, ssb_att, ssb_fq,
                                   prescaler, inttime, mode, acd_mon, cc,
                                   source_object_key, source_object_version, created)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(stw, backend) DO UPDATE SET
                frontend = excluded.frontend,
                sig_type = excluded.sig_type,
                ssb_att = excluded.ssb_att,
                ssb_fq = excluded.ssb_fq,
                prescaler = excluded.prescaler,
                inttime = excluded.inttime,
                mode = excluded.mode,
                acd_mon = excluded.acd_mon,
                cc = excluded.cc,
                source_object_key = excluded.source_object_key,
                source_object_version = excluded.source_object_version,
                created = excluded.created
            "#,
        )
        .bind(r.stw as i64)
        .bind(&r.backend)
        .bind(&r.frontend)
        .bind(&r.sig_type)
        .bind(json(&r.ssb_att)?)
        .bind(json(&r.ssb_fq)?)
        .bind(r.prescaler as i64)
        .bind(r.inttime)
        .bind(r.mode as i64)
        .bind(json(&r.acd_mon)?)
        .bind(encode_cc(&r.cc))
        .bind(p.key)
        .bind(p.version)
        .bind(p.created)
        .execute(&mut **tx)
        .await
        .map_err(store_error)?;
    }
    Ok(())
}

async fn insert_mechanism(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[FbaRecord],
    p: &Provenance<'_>,
) -> Result<(), StoreError> {
    for r in rows {
        sqlx::query(
            r#"
            INSERT INTO fba_level0 (stw, mech_type, source_object_key, source_object_version, created)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(stw) DO UPDATE SET
                mech_type = excluded.mech_type,
                source_object_key = excluded.source_object_key,
                source_object_version = excluded.source_object_version,
                created = excluded.created
            "#,
        )
        .bind(r.stw as i64)
        .bind(&r.mech_type)
        .bind(p.key)
        .bind(p.version)
        .bind(p.created)
        .execute(&mut **tx)
        .await
        .map_err(store_error)?;
    }
    Ok(())
}

async fn insert_housekeeping(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[ShkRecord],
    p: &Provenance<'_>,
) -> Result<(), StoreError> {
    for r in rows {
        sqlx::query(
            r#"
            INSERT INTO shk_level0 (stw, shk_type, value, source_object_key, source_object_version, created)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(stw, shk_type) DO UPDATE SET
                value = excluded.value,
                source_object_key = excluded.source_object_key,
                source_object_version = excluded.source_object_version,
                created = excluded.created
            "#,
        )
        .bind(r.stw as i64)
        .bind(&r.shk_type)
        .bind(r.value)
        .bind(p.key)
        .bind(p.version)
        .bind(p.created)
        .execute(&mut **tx)
        .await
        .map_err(store_error)?;
    }
    Ok(())
}

async fn insert_attitude(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[AttitudeRecord],
    p: &Provenance<'_>,
) -> Result<(), StoreError> {
    for r in rows {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO attitude_level0
                (stw, soda, year, mon, day, hour, min, secs, orbit, qt, qa, qe, gps, acs,
                 source_object_key, source_object_version, created)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.stw as i64)
        .bind(r.soda as i64)
        .bind(r.year as i64)
        .bind(r.mon as i64)
        .bind(r.day as i64)
        .bind(r.hour as i64)
        .bind(r.min as i64)
        .bind(r.secs)
        .bind(r.orbit)
        .bind(json(&r.qt)?)
        .bind(json(&r.qa)?)
        .bind(json(&r.qe)?)
        .bind(json(&r.gps)?)
        .bind(r.acs)
        .bind(p.key)
        .bind(p.version)
        .bind(p.created)
        .execute(&mut **tx)
        .await
        .map_err(store_error)?;
    }
    Ok(())
}

#[async_trait]
impl ImportSink for SqliteImportSink {
    async fn commit(&self, batch: &ImportBatch) -> Result<CommitOutcome, StoreError> {
        let created = batch.import_timestamp.timestamp_millis();
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO imports (source_object_key, source_object_version, file_type, row_count, imported_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source_object_key, source_object_version) DO NOTHING
            "#,
        )
        .bind(&batch.source_object_key)
        .bind(&batch.source_object_version)
        .bind(batch.file_type.to_string())
        .bind(batch.rows.len() as i64)
        .bind(created)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await.map_err(store_error)?;
            return Ok(CommitOutcome::AlreadyCommitted);
        }

        let provenance = Provenance {
            key: &batch.source_object_key,
            version: &batch.source_object_version,
            created,
        };
        match &batch.rows {
            MeasurementRows::Spectra(rows) => insert_spectra(&mut tx, rows, &provenance).await?,
            MeasurementRows::Mechanism(rows) => {
                insert_mechanism(&mut tx, rows, &provenance).await?
            }
            MeasurementRows::Housekeeping(rows) => {
                insert_housekeeping(&mut tx, rows, &provenance).await?
            }
            MeasurementRows::Attitude(rows) => insert_attitude(&mut tx, rows, &provenance).await?,
        }

        tx.commit().await.map_err(store_error)?;
        Ok(CommitOutcome::Committed {
            rows: batch.rows.len() as u64,
        })
    }
}
