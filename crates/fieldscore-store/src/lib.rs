//! Postgres batch store: idempotent upserts with timeout bisection,
//! window-scoped deletes, participant resolution, score-entry rebuilds,
//! and the run ledger.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldscore_core::{
    Observation, ParticipantLink, QualityTier, RunCounts, ScorableRecord, ScoreEntry, UpsertTuning,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fieldscore-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serializing score breakdown: {0}")]
    Json(#[from] serde_json::Error),
    #[error("batch write gave up: {written} rows written, {failed} rows failed ({source})")]
    Partial {
        written: usize,
        failed: usize,
        #[source]
        source: Box<StoreError>,
    },
}

/// Write-timeout class of errors: the only class that triggers the
/// retry-then-bisect path.
pub fn is_timeout(err: &StoreError) -> bool {
    match err {
        StoreError::Sqlx(sqlx::Error::PoolTimedOut) => true,
        StoreError::Sqlx(sqlx::Error::Io(io)) => io.kind() == std::io::ErrorKind::TimedOut,
        // 57014: statement cancelled, the shape a server-side
        // statement_timeout surfaces as.
        StoreError::Sqlx(sqlx::Error::Database(db)) => db.code().as_deref() == Some("57014"),
        _ => false,
    }
}

/// Seam between the bisection executor and a concrete batch write, so
/// the retry policy is testable without a database.
#[async_trait]
pub trait BatchWrite<T: Sync>: Sync {
    async fn write_batch(&self, rows: &[T]) -> Result<(), StoreError>;
}

/// Write `rows` in batches of at most `tuning.max_batch`. Timeout-class
/// failures get `immediate_retries` full-slice retries, then the slice
/// is bisected and each half retried independently; below
/// `tuning.min_batch` the failure is terminal for that sub-batch. The
/// returned error still accounts for every row that did land, so
/// partial success is reported rather than hidden.
pub async fn write_with_bisection<T, W>(
    writer: &W,
    rows: &[T],
    tuning: &UpsertTuning,
) -> Result<usize, StoreError>
where
    T: Sync,
    W: BatchWrite<T> + ?Sized,
{
    let mut written = 0usize;
    for chunk in rows.chunks(tuning.max_batch.max(1)) {
        match write_chunk(writer, chunk, tuning).await {
            Ok(count) => written += count,
            Err(StoreError::Partial {
                written: chunk_written,
                failed,
                source,
            }) => {
                return Err(StoreError::Partial {
                    written: written + chunk_written,
                    failed,
                    source,
                })
            }
            Err(other) => return Err(other),
        }
    }
    Ok(written)
}

fn write_chunk<'a, T, W>(
    writer: &'a W,
    rows: &'a [T],
    tuning: &'a UpsertTuning,
) -> Pin<Box<dyn Future<Output = Result<usize, StoreError>> + Send + 'a>>
where
    T: Sync,
    W: BatchWrite<T> + ?Sized,
{
    Box::pin(async move {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut last_err = None;
        for attempt in 0..=tuning.immediate_retries {
            match writer.write_batch(rows).await {
                Ok(()) => return Ok(rows.len()),
                Err(err) if is_timeout(&err) => {
                    warn!(size = rows.len(), attempt, "batch write timeout");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        let err = last_err.unwrap_or(StoreError::Sqlx(sqlx::Error::PoolTimedOut));

        if rows.len() <= tuning.min_batch {
            return Err(StoreError::Partial {
                written: 0,
                failed: rows.len(),
                source: Box::new(err),
            });
        }

        let mid = rows.len() / 2;
        let left = write_chunk(writer, &rows[..mid], tuning).await;
        let right = write_chunk(writer, &rows[mid..], tuning).await;

        // Normalize each half to (written, failed, source) so the error
        // that surfaces accounts for every row, whichever half (and
        // whichever error shape) failed.
        let (lw, lf, lsrc) = half_outcome(left, mid);
        let (rw, rf, rsrc) = half_outcome(right, rows.len() - mid);
        match lsrc.or(rsrc) {
            None => Ok(lw + rw),
            Some(source) => Err(StoreError::Partial {
                written: lw + rw,
                failed: lf + rf,
                source,
            }),
        }
    })
}

fn half_outcome(
    result: Result<usize, StoreError>,
    len: usize,
) -> (usize, usize, Option<Box<StoreError>>) {
    match result {
        Ok(written) => (written, 0, None),
        Err(StoreError::Partial {
            written,
            failed,
            source,
        }) => (written, failed, Some(source)),
        Err(other) => (0, len, Some(Box::new(other))),
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }

    /// Conflict-free merge keyed by the immutable `external_id`: a
    /// matching row is replaced wholesale, so replaying a batch is a
    /// no-op.
    pub async fn upsert_observations(&self, rows: &[Observation]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO observations (external_id, observer_login, taxon_id, taxon_rank, \
             observed_at, created_at, updated_at, latitude, longitude, quality_grade, raw_payload) ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(row.external_id)
                .push_bind(&row.observer_login)
                .push_bind(row.taxon_id)
                .push_bind(&row.taxon_rank)
                .push_bind(row.observed_at)
                .push_bind(row.created_at)
                .push_bind(row.updated_at)
                .push_bind(row.latitude)
                .push_bind(row.longitude)
                .push_bind(row.quality_grade.as_str())
                .push_bind(&row.raw_payload);
        });
        qb.push(
            " ON CONFLICT (external_id) DO UPDATE SET \
             observer_login = EXCLUDED.observer_login, \
             taxon_id = EXCLUDED.taxon_id, \
             taxon_rank = EXCLUDED.taxon_rank, \
             observed_at = EXCLUDED.observed_at, \
             created_at = EXCLUDED.created_at, \
             updated_at = EXCLUDED.updated_at, \
             latitude = EXCLUDED.latitude, \
             longitude = EXCLUDED.longitude, \
             quality_grade = EXCLUDED.quality_grade, \
             raw_payload = EXCLUDED.raw_payload",
        );
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_links(&self, rows: &[ParticipantLink]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO participant_links (scope_id, external_id, participant_id, included, novelty_key) ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(row.scope_id)
                .push_bind(row.external_id)
                .push_bind(row.participant_id)
                .push_bind(row.included)
                .push_bind(&row.novelty_key);
        });
        qb.push(
            " ON CONFLICT (scope_id, external_id) DO UPDATE SET \
             participant_id = EXCLUDED.participant_id, \
             included = EXCLUDED.included, \
             novelty_key = EXCLUDED.novelty_key",
        );
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    pub async fn delete_observations(&self, ids: &[i64]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM observations WHERE external_id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Drop the scope's links for observations removed upstream, so the
    /// links table does not accumulate rows pointing at nothing.
    pub async fn delete_links(&self, scope_id: Uuid, ids: &[i64]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "DELETE FROM participant_links WHERE scope_id = $1 AND external_id = ANY($2)",
        )
        .bind(scope_id)
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Locally stored ids whose watermark falls inside the synced
    /// window; the reconciliation universe.
    pub async fn local_ids_updated_between(
        &self,
        since: DateTime<Utc>,
        through: DateTime<Utc>,
    ) -> Result<Vec<i64>, StoreError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT external_id FROM observations \
             WHERE updated_at >= $1 AND updated_at <= $2 \
             ORDER BY external_id",
        )
        .bind(since)
        .bind(through)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Map observer logins to participant ids. Logins with no mapping
    /// are simply absent from the result.
    pub async fn resolve_participants(
        &self,
        logins: &[String],
    ) -> Result<HashMap<String, Uuid>, StoreError> {
        if logins.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query("SELECT login, id FROM participants WHERE login = ANY($1)")
            .bind(logins)
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let login: String = row.try_get("login")?;
            let id: Uuid = row.try_get("id")?;
            out.insert(login, id);
        }
        Ok(out)
    }

    /// The joined record set the scoring engine consumes: included,
    /// resolved links only.
    pub async fn scorable_rows(&self, scope_id: Uuid) -> Result<Vec<ScorableRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT o.external_id, l.participant_id, o.taxon_id, o.taxon_rank, \
                    o.quality_grade, o.latitude, o.longitude, o.observed_at \
               FROM participant_links l \
               JOIN observations o ON o.external_id = l.external_id \
              WHERE l.scope_id = $1 AND l.included AND l.participant_id IS NOT NULL \
              ORDER BY o.external_id",
        )
        .bind(scope_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let quality: String = row.try_get("quality_grade")?;
            out.push(ScorableRecord {
                external_id: row.try_get("external_id")?,
                participant_id: row.try_get("participant_id")?,
                taxon_id: row.try_get("taxon_id")?,
                taxon_rank: row.try_get("taxon_rank")?,
                quality: QualityTier::from_upstream(Some(&quality)),
                latitude: row.try_get("latitude")?,
                longitude: row.try_get("longitude")?,
                observed_at: row.try_get("observed_at")?,
            });
        }
        Ok(out)
    }

    /// Wipe-and-rebuild for one run, as a single atomic unit: scoped
    /// delete plus fresh inserts in one transaction.
    pub async fn replace_entries(
        &self,
        run_id: Uuid,
        entries: &[ScoreEntry],
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM score_entries WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        for chunk in entries.chunks(200) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO score_entries (run_id, participant_id, breakdown, total_points) ",
            );
            let mut serialized = Vec::with_capacity(chunk.len());
            for entry in chunk {
                serialized.push(serde_json::to_value(entry.breakdown)?);
            }
            qb.push_values(chunk.iter().zip(serialized), |mut b, (entry, breakdown)| {
                b.push_bind(entry.run_id)
                    .push_bind(entry.participant_id)
                    .push_bind(breakdown)
                    .push_bind(entry.total_points);
            });
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(entries.len())
    }

    pub async fn open_run(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO score_runs (run_id, started_at, status) VALUES ($1, $2, 'running')")
            .bind(run_id)
            .bind(started_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Closing a run is the only thing that advances the checkpoint the
    /// next sync resumes from.
    pub async fn close_run(
        &self,
        run_id: Uuid,
        watermark_through: Option<DateTime<Utc>>,
        counts: RunCounts,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE score_runs SET status = 'closed', ended_at = $2, watermark_through = $3, \
             observations_upserted = $4, observations_deleted = $5, entries_written = $6 \
             WHERE run_id = $1",
        )
        .bind(run_id)
        .bind(Utc::now())
        .bind(watermark_through)
        .bind(counts.upserted)
        .bind(counts.deleted)
        .bind(counts.entries_written)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_run_failed(&self, run_id: Uuid, message: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE score_runs SET status = 'failed', ended_at = $2, error_message = $3 \
             WHERE run_id = $1",
        )
        .bind(run_id)
        .bind(Utc::now())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// High-water mark over closed runs only; a failed or abandoned run
    /// never advances the resume point.
    pub async fn last_watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let watermark: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(watermark_through) FROM score_runs WHERE status = 'closed'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(watermark)
    }
}

/// [`BatchWrite`] adapters so the bisection executor drives the store's
/// concrete upserts.
pub struct ObservationWriter<'a>(pub &'a Store);

#[async_trait]
impl BatchWrite<Observation> for ObservationWriter<'_> {
    async fn write_batch(&self, rows: &[Observation]) -> Result<(), StoreError> {
        self.0.upsert_observations(rows).await
    }
}

pub struct LinkWriter<'a>(pub &'a Store);

#[async_trait]
impl BatchWrite<ParticipantLink> for LinkWriter<'_> {
    async fn write_batch(&self, rows: &[ParticipantLink]) -> Result<(), StoreError> {
        self.0.upsert_links(rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct ScriptedWriter<F> {
        calls: Mutex<Vec<usize>>,
        fail_when: F,
    }

    impl<F> ScriptedWriter<F>
    where
        F: Fn(&[i64]) -> bool + Send + Sync,
    {
        fn new(fail_when: F) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_when,
            }
        }
    }

    #[async_trait]
    impl<F> BatchWrite<i64> for ScriptedWriter<F>
    where
        F: Fn(&[i64]) -> bool + Send + Sync,
    {
        async fn write_batch(&self, rows: &[i64]) -> Result<(), StoreError> {
            self.calls.lock().await.push(rows.len());
            if (self.fail_when)(rows) {
                Err(StoreError::Sqlx(sqlx::Error::PoolTimedOut))
            } else {
                Ok(())
            }
        }
    }

    fn tuning() -> UpsertTuning {
        UpsertTuning {
            max_batch: 200,
            min_batch: 10,
            immediate_retries: 2,
        }
    }

    #[tokio::test]
    async fn timeout_retries_twice_then_bisects() {
        let rows: Vec<i64> = (0..100).collect();
        let writer = ScriptedWriter::new(|batch: &[i64]| batch.len() == 100);

        let written = write_with_bisection(&writer, &rows, &tuning())
            .await
            .expect("halves succeed");
        assert_eq!(written, 100);
        let calls = writer.calls.lock().await.clone();
        assert_eq!(calls, vec![100, 100, 100, 50, 50]);
    }

    #[tokio::test]
    async fn floor_failure_is_terminal_and_counted() {
        let rows: Vec<i64> = (0..20).collect();
        let writer = ScriptedWriter::new(|_: &[i64]| true);

        let err = write_with_bisection(&writer, &rows, &tuning())
            .await
            .expect_err("all writes time out");
        match err {
            StoreError::Partial {
                written, failed, ..
            } => {
                assert_eq!(written, 0);
                assert_eq!(failed, 20);
            }
            other => panic!("expected Partial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_success_is_reported_not_hidden() {
        // Any batch containing row 13 times out, so bisection narrows
        // the failure down to one minimum-size sub-batch while every
        // other row still lands.
        let rows: Vec<i64> = (0..100).collect();
        let writer = ScriptedWriter::new(|batch: &[i64]| batch.contains(&13));

        let err = write_with_bisection(&writer, &rows, &tuning())
            .await
            .expect_err("the sub-batch with 13 fails");
        match err {
            StoreError::Partial {
                written, failed, ..
            } => {
                assert_eq!(written + failed, 100);
                assert_eq!(failed, 6);
                assert_eq!(written, 94);
            }
            other => panic!("expected Partial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn half_that_fails_outright_still_accounts_the_other_half() {
        // The full slice times out, then the left half degenerates into
        // a non-timeout error while the right half lands; the surfaced
        // error must still report the right half's rows as written.
        struct SplitWriter;

        #[async_trait]
        impl BatchWrite<i64> for SplitWriter {
            async fn write_batch(&self, rows: &[i64]) -> Result<(), StoreError> {
                if rows.len() == 100 {
                    Err(StoreError::Sqlx(sqlx::Error::PoolTimedOut))
                } else if rows.first() == Some(&0) {
                    Err(StoreError::Sqlx(sqlx::Error::RowNotFound))
                } else {
                    Ok(())
                }
            }
        }

        let rows: Vec<i64> = (0..100).collect();
        let err = write_with_bisection(&SplitWriter, &rows, &tuning())
            .await
            .expect_err("left half fails");
        match err {
            StoreError::Partial {
                written,
                failed,
                source,
            } => {
                assert_eq!(written, 50);
                assert_eq!(failed, 50);
                assert!(!is_timeout(&source));
            }
            other => panic!("expected Partial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_timeout_error_fails_immediately() {
        let rows: Vec<i64> = (0..50).collect();
        struct PoisonWriter {
            calls: Mutex<usize>,
        }

        #[async_trait]
        impl BatchWrite<i64> for PoisonWriter {
            async fn write_batch(&self, _rows: &[i64]) -> Result<(), StoreError> {
                *self.calls.lock().await += 1;
                Err(StoreError::Sqlx(sqlx::Error::RowNotFound))
            }
        }

        let writer = PoisonWriter {
            calls: Mutex::new(0),
        };
        let err = write_with_bisection(&writer, &rows, &tuning())
            .await
            .expect_err("terminal error");
        assert!(!is_timeout(&err));
        assert_eq!(*writer.calls.lock().await, 1);
    }

    #[tokio::test]
    async fn oversized_input_is_chunked_to_max_batch() {
        let rows: Vec<i64> = (0..450).collect();
        let writer = ScriptedWriter::new(|_: &[i64]| false);
        let written = write_with_bisection(&writer, &rows, &tuning())
            .await
            .expect("all writes succeed");
        assert_eq!(written, 450);
        let calls = writer.calls.lock().await.clone();
        assert_eq!(calls, vec![200, 200, 50]);
    }

    #[test]
    fn timeout_classification() {
        assert!(is_timeout(&StoreError::Sqlx(sqlx::Error::PoolTimedOut)));
        assert!(is_timeout(&StoreError::Sqlx(sqlx::Error::Io(
            std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out")
        ))));
        assert!(!is_timeout(&StoreError::Sqlx(sqlx::Error::RowNotFound)));
    }
}
