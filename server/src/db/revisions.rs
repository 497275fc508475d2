//! PostgreSQL-backed revision store.

use async_trait::async_trait;
use mend_engine::{
    revision, BulkResult, ConflictScanner, EntityKind, Error, IdAndRev, ItemFailure, Record,
    RecordId, ReplicaWriter, Result, VersionedStore,
};
use sqlx::{PgPool, Postgres, Row, Transaction};

/// A stored revision row from the database.
#[derive(Debug)]
pub struct StoredRevision {
    pub doc_id: String,
    pub rev: String,
    #[allow(dead_code)]
    pub generation: i64,
    #[allow(dead_code)]
    pub kind: String,
    pub body: serde_json::Value,
    #[allow(dead_code)]
    pub leaf: bool,
    #[allow(dead_code)]
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRevision {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(StoredRevision {
            doc_id: row.try_get("doc_id")?,
            rev: row.try_get("rev")?,
            generation: row.try_get("generation")?,
            kind: row.try_get("kind")?,
            body: row.try_get("body")?,
            leaf: row.try_get("leaf")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl StoredRevision {
    /// Convert database row to an engine Record.
    pub fn to_record(&self) -> Result<Record> {
        let mut record: Record = serde_json::from_value(self.body.clone())?;
        record.id = self.doc_id.clone();
        record.rev = Some(self.rev.clone());
        record.conflicts.clear();
        Ok(record)
    }
}

const SELECT_COLUMNS: &str = "doc_id, rev, generation, kind, body, leaf, created_at";

fn store_error(err: sqlx::Error) -> Error {
    Error::Store(err.to_string())
}

/// Generations are stored as BIGINT.
fn stored_generation(generation: u64) -> Result<i64> {
    i64::try_from(generation)
        .map_err(|_| Error::InvalidRequest(format!("generation {generation} is out of range")))
}

/// Body column content: the record without its revision bookkeeping.
fn body_of(record: &Record) -> Result<serde_json::Value> {
    let mut content = record.clone().without_conflicts();
    content.rev = None;
    Ok(serde_json::to_value(&content)?)
}

/// Revision store over the `revisions` table.
///
/// Every write goes through a transaction that locks the document's leaf
/// rows, so two saves against the same parent cannot both succeed.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Leaf revisions of a document, winner first.
    async fn leaves(&self, id: &str) -> Result<Vec<StoredRevision>> {
        sqlx::query_as::<_, StoredRevision>(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM revisions
            WHERE doc_id = $1 AND leaf
            ORDER BY generation DESC, rev DESC
            "#
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn save_in_tx(tx: &mut Transaction<'_, Postgres>, record: Record) -> Result<Record> {
        let record = record.without_conflicts();

        let leaves: Vec<(String,)> = sqlx::query_as(
            r#"SELECT rev FROM revisions WHERE doc_id = $1 AND leaf FOR UPDATE"#,
        )
        .bind(&record.id)
        .fetch_all(&mut **tx)
        .await
        .map_err(store_error)?;

        match &record.rev {
            None if leaves.is_empty() => {}
            None => {
                return Err(Error::RevisionConflict {
                    id: record.id.clone(),
                    message: "document already exists".into(),
                })
            }
            Some(rev) if leaves.iter().any(|(leaf,)| leaf == rev) => {}
            Some(_) if leaves.is_empty() => return Err(Error::RecordNotFound(record.id.clone())),
            Some(rev) => {
                return Err(Error::RevisionConflict {
                    id: record.id.clone(),
                    message: format!("revision {rev} is not current"),
                })
            }
        }

        let parent = record.rev.clone();
        let new_rev = revision::next_revision(parent.as_deref(), &record)?;
        let generation = revision::replica_generation(&new_rev)?;

        sqlx::query(
            r#"
            INSERT INTO revisions (doc_id, rev, generation, kind, body, leaf)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            ON CONFLICT (doc_id, rev) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&new_rev)
        .bind(stored_generation(generation)?)
        .bind(record.kind.as_str())
        .bind(body_of(&record)?)
        .execute(&mut **tx)
        .await
        .map_err(store_error)?;

        if let Some(parent) = &parent {
            sqlx::query(r#"UPDATE revisions SET leaf = FALSE WHERE doc_id = $1 AND rev = $2"#)
                .bind(&record.id)
                .bind(parent)
                .execute(&mut **tx)
                .await
                .map_err(store_error)?;
        }

        Ok(Record {
            rev: Some(new_rev),
            ..record
        })
    }

    async fn write_replica(&self, record: Record) -> Result<IdAndRev> {
        let record = record.without_conflicts();
        let rev = record
            .rev
            .clone()
            .ok_or_else(|| Error::InvalidRequest("replicated revisions must carry a revision token".into()))?;
        let generation = revision::replica_generation(&rev)?;

        sqlx::query(
            r#"
            INSERT INTO revisions (doc_id, rev, generation, kind, body, leaf)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            ON CONFLICT (doc_id, rev) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&rev)
        .bind(stored_generation(generation)?)
        .bind(record.kind.as_str())
        .bind(body_of(&record)?)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(IdAndRev::new(record.id, rev))
    }
}

#[async_trait]
impl VersionedStore for PgStore {
    async fn get(&self, id: &str) -> Result<Option<Record>> {
        self.leaves(id)
            .await?
            .first()
            .map(StoredRevision::to_record)
            .transpose()
    }

    async fn get_with_conflicts(&self, id: &str) -> Result<Option<Record>> {
        let leaves = self.leaves(id).await?;
        let Some((winner, siblings)) = leaves.split_first() else {
            return Ok(None);
        };
        let mut record = winner.to_record()?;
        record.conflicts = siblings.iter().map(|s| s.rev.clone()).collect();
        Ok(Some(record))
    }

    async fn get_at_revision(&self, id: &str, rev: &str) -> Result<Option<Record>> {
        let stored = sqlx::query_as::<_, StoredRevision>(&format!(
            r#"SELECT {SELECT_COLUMNS} FROM revisions WHERE doc_id = $1 AND rev = $2"#
        ))
        .bind(id)
        .bind(rev)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        stored.as_ref().map(StoredRevision::to_record).transpose()
    }

    async fn save(&self, record: Record) -> Result<Record> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let saved = Self::save_in_tx(&mut tx, record).await?;
        tx.commit().await.map_err(store_error)?;
        Ok(saved)
    }

    async fn bulk_save(&self, records: Vec<Record>) -> Result<Vec<BulkResult<Record>>> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id.clone();
            results.push(
                self.save(record)
                    .await
                    .map_err(|err| ItemFailure::from_error(id, &err)),
            );
        }
        Ok(results)
    }

    async fn purge(&self, targets: Vec<IdAndRev>) -> Result<Vec<BulkResult<IdAndRev>>> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let deleted = sqlx::query(r#"DELETE FROM revisions WHERE doc_id = $1 AND rev = $2"#)
                .bind(&target.id)
                .bind(&target.rev)
                .execute(&self.pool)
                .await;

            results.push(match deleted {
                Ok(done) if done.rows_affected() > 0 => Ok(target),
                Ok(_) => Err(ItemFailure::new(
                    target.id,
                    "not_found",
                    format!("revision {} is not stored", target.rev),
                )),
                Err(err) => Err(ItemFailure::new(target.id, "internal", err.to_string())),
            });
        }
        Ok(results)
    }
}

#[async_trait]
impl ConflictScanner for PgStore {
    async fn conflicted_ids(
        &self,
        kind: EntityKind,
        limit: Option<usize>,
    ) -> Result<Vec<RecordId>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT doc_id
            FROM revisions
            WHERE kind = $1 AND leaf
            GROUP BY doc_id
            HAVING COUNT(*) > 1
            ORDER BY doc_id
            LIMIT $2
            "#,
        )
        .bind(kind.as_str())
        .bind(limit.map(|limit| limit as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl ReplicaWriter for PgStore {
    async fn write_replicas(&self, records: Vec<Record>) -> Result<Vec<BulkResult<IdAndRev>>> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id.clone();
            results.push(
                self.write_replica(record)
                    .await
                    .map_err(|err| ItemFailure::from_error(id, &err)),
            );
        }
        Ok(results)
    }
}
