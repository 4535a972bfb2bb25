//! `PostgreSQL` implementation of [`DurableStore`].
//!
//! Semantic content, derived payloads and workflow records are stored as
//! JSONB. Snapshots run in a `REPEATABLE READ, READ ONLY` transaction so
//! entity views and relationship tallies come from the same point in time.
//! Transactional commits lock the guarded registry rows (`FOR UPDATE`, in id
//! order) before re-verifying their guards. Closing a workflow locks its row
//! the same way and only writes while it is still `resolving`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;
use weft_types::{
    DerivedPayload, DerivedState, EntityContent, EntityId, EntityType, EntityView, RegistryRecord,
    RelationshipKind, SemanticVersion, WorkflowId, WorkflowRecord, WorkflowStatus,
};

use crate::error::DbError;
use crate::postgres::PostgresPool;
use crate::store::{
    CommitBatch, CommitGuard, DerivedFilter, DurableStore, StoreSnapshot, TallyMap, UpsertOutcome,
};

/// Current version per entity joined with registry and derived rows.
const VIEW_QUERY: &str = r"SELECT r.entity_id, r.entity_type, r.created_at,
       s.version_number, s.effective_at, s.created_at AS version_created_at,
       s.content, s.change_reason,
       d.version_number AS derived_version, d.payload, d.last_updated
  FROM registry r
  LEFT JOIN LATERAL (
      SELECT sl.version_number, sl.effective_at, sl.created_at, sl.content, sl.change_reason
        FROM semantic_log sl
       WHERE sl.entity_id = r.entity_id
       ORDER BY sl.version_number DESC
       LIMIT 1
  ) s ON TRUE
  LEFT JOIN derived_state d ON d.entity_id = r.entity_id
 WHERE r.entity_id = ANY($1)";

/// Active (non-retired) current bonds per endpoint and kind.
const TALLY_QUERY: &str = r"WITH current_bonds AS (
      SELECT DISTINCT ON (entity_id) entity_id, content
        FROM semantic_log
       WHERE content ->> 'category' = 'bond'
       ORDER BY entity_id, version_number DESC
  )
  SELECT e.endpoint::UUID AS endpoint, c.content ->> 'kind' AS kind, COUNT(*)::BIGINT AS tally
    FROM current_bonds c
   CROSS JOIN LATERAL jsonb_array_elements_text(c.content -> 'endpoints') AS e(endpoint)
   WHERE COALESCE(c.content -> 'fields' ->> 'status', '') <> 'retired'
     AND e.endpoint::UUID = ANY($1)
   GROUP BY e.endpoint, c.content ->> 'kind'";

/// Derived rows filtered by partition and bounding box.
///
/// The partition hash is the last four bytes of the id, read big-endian,
/// matching `EntityId::stable_hash`. Rows without a position never match a
/// bounding box.
const DERIVED_QUERY: &str = r"SELECT entity_id, version_number, payload, last_updated
  FROM derived_state
 WHERE ($1::BIGINT <= 1
        OR ('x' || right(replace(entity_id::TEXT, '-', ''), 8))::BIT(32)::BIGINT % $1::BIGINT = $2::BIGINT)
   AND ($3::FLOAT8[] IS NULL
        OR (jsonb_typeof(payload -> 'position') = 'array'
            AND (payload -> 'position' ->> 0)::FLOAT8 BETWEEN $3[1] AND $4[1]
            AND (payload -> 'position' ->> 1)::FLOAT8 BETWEEN $3[2] AND $4[2]
            AND (payload -> 'position' ->> 2)::FLOAT8 BETWEEN $3[3] AND $4[3]))
 ORDER BY entity_id";

/// Row shape of [`VIEW_QUERY`].
#[derive(Debug, sqlx::FromRow)]
struct ViewRow {
    entity_id: Uuid,
    entity_type: String,
    created_at: DateTime<Utc>,
    version_number: Option<i64>,
    effective_at: Option<DateTime<Utc>>,
    version_created_at: Option<DateTime<Utc>>,
    content: Option<serde_json::Value>,
    change_reason: Option<String>,
    derived_version: Option<i64>,
    payload: Option<serde_json::Value>,
    last_updated: Option<DateTime<Utc>>,
}

impl ViewRow {
    fn into_view(self) -> Result<EntityView, DbError> {
        let entity_id = EntityId::from(self.entity_id);
        let entity_type = EntityType::from_tag(&self.entity_type)
            .ok_or_else(|| DbError::Corrupt(format!("unknown entity type '{}'", self.entity_type)))?;
        let current = match (self.version_number, self.content) {
            (Some(version), Some(content)) => Some(SemanticVersion {
                entity_id,
                version_number: version_from_db(version)?,
                effective_at: self.effective_at.unwrap_or(self.created_at),
                created_at: self.version_created_at.unwrap_or(self.created_at),
                content: serde_json::from_value(content)?,
                change_reason: self.change_reason.unwrap_or_default(),
            }),
            _ => None,
        };
        let derived = match (self.derived_version, self.payload) {
            (Some(version), Some(payload)) => Some(DerivedState {
                entity_id,
                version_number: version_from_db(version)?,
                payload: serde_json::from_value(payload)?,
                last_updated: self.last_updated.unwrap_or(self.created_at),
            }),
            _ => None,
        };
        Ok(EntityView {
            registry: RegistryRecord {
                entity_id,
                entity_type,
                created_at: self.created_at,
            },
            current,
            derived,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TallyRow {
    endpoint: Uuid,
    kind: String,
    tally: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DerivedRow {
    entity_id: Uuid,
    version_number: i64,
    payload: serde_json::Value,
    last_updated: DateTime<Utc>,
}

impl DerivedRow {
    fn into_state(self) -> Result<DerivedState, DbError> {
        Ok(DerivedState {
            entity_id: EntityId::from(self.entity_id),
            version_number: version_from_db(self.version_number)?,
            payload: serde_json::from_value::<DerivedPayload>(self.payload)?,
            last_updated: self.last_updated,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct VersionRow {
    version_number: i64,
    effective_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    content: serde_json::Value,
    change_reason: String,
}

fn version_to_db(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn version_from_db(version: i64) -> Result<u64, DbError> {
    u64::try_from(version).map_err(|e| DbError::Corrupt(format!("version {version}: {e}")))
}

fn ids_to_db(ids: &[EntityId]) -> Vec<Uuid> {
    ids.iter().map(|id| id.into_inner()).collect()
}

/// Map unique and foreign-key violations onto the store's domain errors.
fn classify(e: sqlx::Error, on_unique: DbError, on_missing: DbError) -> DbError {
    if let Some(db) = e.as_database_error() {
        if db.is_unique_violation() {
            return on_unique;
        }
        if db.is_foreign_key_violation() {
            return on_missing;
        }
    }
    DbError::Postgres(e)
}

async fn insert_registry(conn: &mut PgConnection, record: &RegistryRecord) -> Result<(), DbError> {
    sqlx::query(
        r"INSERT INTO registry (entity_id, entity_type, created_at)
          VALUES ($1, $2, $3)",
    )
    .bind(record.entity_id.into_inner())
    .bind(record.entity_type.as_str())
    .bind(record.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        classify(
            e,
            DbError::DuplicateEntity(record.entity_id),
            DbError::Corrupt("registry insert violated a foreign key".to_owned()),
        )
    })?;
    Ok(())
}

async fn insert_version(conn: &mut PgConnection, version: &SemanticVersion) -> Result<(), DbError> {
    let content = serde_json::to_value(&version.content)?;
    sqlx::query(
        r"INSERT INTO semantic_log
          (entity_id, version_number, effective_at, created_at, content, change_reason)
          VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(version.entity_id.into_inner())
    .bind(version_to_db(version.version_number))
    .bind(version.effective_at)
    .bind(version.created_at)
    .bind(&content)
    .bind(&version.change_reason)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        classify(
            e,
            DbError::DuplicateVersion {
                entity_id: version.entity_id,
                version_number: version.version_number,
            },
            DbError::NotFound(version.entity_id),
        )
    })?;
    Ok(())
}

async fn upsert_derived(
    conn: &mut PgConnection,
    state: &DerivedState,
) -> Result<UpsertOutcome, DbError> {
    let payload = serde_json::to_value(&state.payload)?;
    let inserted: Option<bool> = sqlx::query_scalar(
        r"INSERT INTO derived_state (entity_id, version_number, payload, last_updated)
          VALUES ($1, $2, $3, $4)
          ON CONFLICT (entity_id) DO UPDATE SET
            version_number = EXCLUDED.version_number,
            payload = EXCLUDED.payload,
            last_updated = EXCLUDED.last_updated
          WHERE derived_state.version_number < EXCLUDED.version_number
             OR (derived_state.version_number = EXCLUDED.version_number
                 AND derived_state.payload <> EXCLUDED.payload)
          RETURNING (xmax = 0) AS inserted",
    )
    .bind(state.entity_id.into_inner())
    .bind(version_to_db(state.version_number))
    .bind(&payload)
    .bind(state.last_updated)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| {
        classify(
            e,
            DbError::Corrupt("derived upsert raced on primary key".to_owned()),
            DbError::NotFound(state.entity_id),
        )
    })?;

    match inserted {
        Some(true) => Ok(UpsertOutcome::Inserted),
        Some(false) => Ok(UpsertOutcome::Replaced),
        None => {
            let stored: i64 = sqlx::query_scalar(
                "SELECT version_number FROM derived_state WHERE entity_id = $1",
            )
            .bind(state.entity_id.into_inner())
            .fetch_one(&mut *conn)
            .await?;
            if version_from_db(stored)? > state.version_number {
                Ok(UpsertOutcome::Stale)
            } else {
                Ok(UpsertOutcome::Unchanged)
            }
        }
    }
}

async fn fetch_views(
    conn: &mut PgConnection,
    ids: &[EntityId],
) -> Result<Vec<EntityView>, DbError> {
    let rows = sqlx::query_as::<_, ViewRow>(VIEW_QUERY)
        .bind(ids_to_db(ids))
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(ViewRow::into_view).collect()
}

async fn fetch_tallies(conn: &mut PgConnection, ids: &[EntityId]) -> Result<TallyMap, DbError> {
    let rows = sqlx::query_as::<_, TallyRow>(TALLY_QUERY)
        .bind(ids_to_db(ids))
        .fetch_all(&mut *conn)
        .await?;
    let mut tallies = TallyMap::new();
    for row in rows {
        let count = u32::try_from(row.tally).unwrap_or(u32::MAX);
        tallies.insert(
            (EntityId::from(row.endpoint), RelationshipKind::new(row.kind)),
            count,
        );
    }
    Ok(tallies)
}

async fn current_version(conn: &mut PgConnection, entity_id: EntityId) -> Result<u64, DbError> {
    let version: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(version_number), 0)::BIGINT FROM semantic_log WHERE entity_id = $1",
    )
    .bind(entity_id.into_inner())
    .fetch_one(&mut *conn)
    .await?;
    version_from_db(version)
}

async fn verify_guard(conn: &mut PgConnection, guard: &CommitGuard) -> Result<(), DbError> {
    match guard {
        CommitGuard::Version {
            entity_id,
            expected,
        } => {
            let found = current_version(conn, *entity_id).await?;
            if found != *expected {
                return Err(DbError::GuardFailed {
                    entity_id: *entity_id,
                    detail: format!("version moved from {expected} to {found}"),
                });
            }
        }
        CommitGuard::Tally {
            entity_id,
            kind,
            expected,
        } => {
            let tallies = fetch_tallies(conn, &[*entity_id]).await?;
            let found = tallies
                .get(&(*entity_id, kind.clone()))
                .copied()
                .unwrap_or(0);
            if found != *expected {
                return Err(DbError::GuardFailed {
                    entity_id: *entity_id,
                    detail: format!("'{kind}' tally moved from {expected} to {found}"),
                });
            }
        }
    }
    Ok(())
}

/// Lock a workflow row and fail unless it is still `resolving`.
async fn lock_open_workflow(conn: &mut PgConnection, id: WorkflowId) -> Result<(), DbError> {
    let tag: Option<String> =
        sqlx::query_scalar("SELECT status FROM workflows WHERE workflow_id = $1 FOR UPDATE")
            .bind(id.into_inner())
            .fetch_optional(&mut *conn)
            .await?;
    let Some(tag) = tag else {
        return Err(DbError::WorkflowNotFound(id));
    };
    let status = WorkflowStatus::from_tag(&tag)
        .ok_or_else(|| DbError::Corrupt(format!("workflow {id}: unknown status '{tag}'")))?;
    if status != WorkflowStatus::Resolving {
        return Err(DbError::WorkflowClosed { id, status });
    }
    Ok(())
}

async fn write_workflow(conn: &mut PgConnection, record: &WorkflowRecord) -> Result<(), DbError> {
    let body = serde_json::to_value(record)?;
    sqlx::query(
        r"UPDATE workflows
          SET status = $2, record = $3, updated_at = $4
          WHERE workflow_id = $1",
    )
    .bind(record.id.into_inner())
    .bind(record.status.as_str())
    .bind(&body)
    .bind(record.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// [`DurableStore`] backed by `PostgreSQL`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap a connected pool.
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }
}

#[async_trait]
impl DurableStore for PgStore {
    async fn register_entity(&self, record: &RegistryRecord) -> Result<(), DbError> {
        let mut conn = self.pool.acquire().await?;
        insert_registry(&mut conn, record).await
    }

    async fn append_version(&self, version: &SemanticVersion) -> Result<(), DbError> {
        let mut conn = self.pool.acquire().await?;
        insert_version(&mut conn, version).await?;
        tracing::debug!(
            entity_id = %version.entity_id,
            version_number = version.version_number,
            "Appended semantic version"
        );
        Ok(())
    }

    async fn upsert_derived_state(&self, state: &DerivedState) -> Result<UpsertOutcome, DbError> {
        let mut conn = self.pool.acquire().await?;
        upsert_derived(&mut conn, state).await
    }

    async fn point_read(&self, entity_id: EntityId) -> Result<Option<EntityView>, DbError> {
        let mut conn = self.pool.acquire().await?;
        let views = fetch_views(&mut conn, &[entity_id]).await?;
        Ok(views.into_iter().next())
    }

    async fn bulk_read_derived(
        &self,
        filter: &DerivedFilter,
    ) -> Result<Vec<DerivedState>, DbError> {
        let rows = sqlx::query_as::<_, DerivedRow>(DERIVED_QUERY)
            .bind(i64::from(filter.partition.count))
            .bind(i64::from(filter.partition.index))
            .bind(filter.bounds.map(|b| b.min.0.to_vec()))
            .bind(filter.bounds.map(|b| b.max.0.to_vec()))
            .fetch_all(&self.pool)
            .await?;

        let states = rows
            .into_iter()
            .map(DerivedRow::into_state)
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(
            count = states.len(),
            partition = filter.partition.index,
            bounded = filter.bounds.is_some(),
            "Bulk-read derived state"
        );
        Ok(states)
    }

    async fn read_snapshot(&self, ids: &[EntityId]) -> Result<StoreSnapshot, DbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        let views = fetch_views(&mut tx, ids).await?;
        let tallies = fetch_tallies(&mut tx, ids).await?;
        tx.commit().await?;

        Ok(StoreSnapshot {
            entities: views
                .into_iter()
                .map(|view| (view.registry.entity_id, view))
                .collect(),
            tallies,
        })
    }

    async fn relationship_tallies(&self, ids: &[EntityId]) -> Result<TallyMap, DbError> {
        let mut conn = self.pool.acquire().await?;
        fetch_tallies(&mut conn, ids).await
    }

    async fn commit_atomic(&self, batch: &CommitBatch) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;

        let mut locked: Vec<Uuid> = batch
            .guards
            .iter()
            .map(|g| g.entity_id().into_inner())
            .collect();
        locked.sort_unstable();
        locked.dedup();
        if !locked.is_empty() {
            sqlx::query("SELECT entity_id FROM registry WHERE entity_id = ANY($1) ORDER BY entity_id FOR UPDATE")
                .bind(&locked)
                .fetch_all(&mut *tx)
                .await?;
        }

        for guard in &batch.guards {
            verify_guard(&mut tx, guard).await?;
        }
        if let Some(workflow) = &batch.workflow {
            lock_open_workflow(&mut tx, workflow.id).await?;
        }
        if let Some(record) = &batch.registry {
            insert_registry(&mut tx, record).await?;
        }
        insert_version(&mut tx, &batch.version).await?;
        if let Some(derived) = &batch.derived {
            upsert_derived(&mut tx, derived).await?;
        }
        if let Some(workflow) = &batch.workflow {
            write_workflow(&mut tx, workflow).await?;
        }

        tx.commit().await?;
        tracing::debug!(
            entity_id = %batch.version.entity_id,
            version_number = batch.version.version_number,
            guards = batch.guards.len(),
            "Committed transactional batch"
        );
        Ok(())
    }

    async fn version_history(&self, entity_id: EntityId) -> Result<Vec<SemanticVersion>, DbError> {
        let rows = sqlx::query_as::<_, VersionRow>(
            r"SELECT version_number, effective_at, created_at, content, change_reason
              FROM semantic_log
              WHERE entity_id = $1
              ORDER BY version_number",
        )
        .bind(entity_id.into_inner())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok::<_, DbError>(SemanticVersion {
                    entity_id,
                    version_number: version_from_db(row.version_number)?,
                    effective_at: row.effective_at,
                    created_at: row.created_at,
                    content: serde_json::from_value::<EntityContent>(row.content)?,
                    change_reason: row.change_reason,
                })
            })
            .collect()
    }

    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), DbError> {
        let body = serde_json::to_value(record)?;
        sqlx::query(
            r"INSERT INTO workflows (workflow_id, workflow_type, status, record, created_at, updated_at)
              VALUES ($1, $2, $3, $4, $5, $6)
              ON CONFLICT (workflow_id) DO UPDATE SET
                status = EXCLUDED.status,
                record = EXCLUDED.record,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(record.id.into_inner())
        .bind(&record.workflow_type)
        .bind(record.status.as_str())
        .bind(&body)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn advance_workflow(&self, record: &WorkflowRecord) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;
        lock_open_workflow(&mut tx, record.id).await?;
        write_workflow(&mut tx, record).await?;
        tx.commit().await?;
        tracing::debug!(
            workflow_id = %record.id,
            status = record.status.as_str(),
            "Advanced workflow"
        );
        Ok(())
    }

    async fn load_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>, DbError> {
        let body: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT record FROM workflows WHERE workflow_id = $1")
                .bind(id.into_inner())
                .fetch_optional(&self.pool)
                .await?;
        body.map(serde_json::from_value)
            .transpose()
            .map_err(DbError::from)
    }

    async fn resolving_workflows_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRecord>, DbError> {
        let bodies: Vec<serde_json::Value> = sqlx::query_scalar(
            r"SELECT record FROM workflows
              WHERE status = 'resolving' AND created_at < $1
              ORDER BY created_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        bodies
            .into_iter()
            .map(|body| serde_json::from_value(body).map_err(DbError::from))
            .collect()
    }
}
