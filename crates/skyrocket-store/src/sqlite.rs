use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use skyrocket_workflow::{FwId, LaunchId, State, Workflow};
use tracing::debug;

use crate::types::index;
use crate::{FireworkRecord, LaunchRecord, Store, StoreError, StoredWorkflow};

/// SQLite-based store implementation.
pub struct SqliteStore {
  pool: SqlitePool,
}

#[derive(FromRow)]
struct WorkflowRow {
  document: String,
  version: i64,
}

#[derive(FromRow)]
struct FireworkRow {
  fw_id: i64,
  wf_id: String,
  name: String,
  state: String,
  priority: f64,
  spec: String,
}

#[derive(FromRow)]
struct LaunchRow {
  launch_id: i64,
  fw_id: i64,
  wf_id: String,
  state: String,
  archived: bool,
}

fn parse_state(s: &str) -> Result<State, StoreError> {
  s.parse::<State>().map_err(|e| StoreError::Corrupt(e.to_string()))
}

impl TryFrom<FireworkRow> for FireworkRecord {
  type Error = StoreError;

  fn try_from(row: FireworkRow) -> Result<Self, Self::Error> {
    Ok(Self {
      fw_id: row.fw_id,
      wf_id: row.wf_id,
      name: row.name,
      state: parse_state(&row.state)?,
      priority: row.priority,
      spec: serde_json::from_str::<Map<String, Value>>(&row.spec)?,
    })
  }
}

impl TryFrom<LaunchRow> for LaunchRecord {
  type Error = StoreError;

  fn try_from(row: LaunchRow) -> Result<Self, Self::Error> {
    Ok(Self {
      launch_id: row.launch_id,
      fw_id: row.fw_id,
      wf_id: row.wf_id,
      state: parse_state(&row.state)?,
      archived: row.archived,
    })
  }
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }

  /// Connect to `url` and run the migrations.
  pub async fn connect(url: &str) -> Result<Self, StoreError> {
    let pool = SqlitePool::connect(url).await?;
    let store = Self::new(pool);
    store
      .migrate()
      .await
      .map_err(|e| StoreError::Backend(format!("migration failed: {e}")))?;
    Ok(store)
  }

  async fn bump_counter(&self, name: &str, by: i64) -> Result<i64, StoreError> {
    let value = sqlx::query_scalar::<_, i64>(
      r#"
            UPDATE counters SET value = value + ?
            WHERE name = ?
            RETURNING value
            "#,
    )
    .bind(by)
    .bind(name)
    .fetch_one(&self.pool)
    .await?;
    Ok(value)
  }
}

/// Rewrite the firework and launch index rows of `wf`.
async fn write_index(conn: &mut SqliteConnection, wf: &Workflow) -> Result<(), StoreError> {
  let (fireworks, launches) = index(wf);

  sqlx::query("DELETE FROM fireworks WHERE wf_id = ?")
    .bind(&wf.wf_id)
    .execute(&mut *conn)
    .await?;
  for fw in fireworks {
    sqlx::query(
      r#"
            INSERT INTO fireworks (fw_id, wf_id, name, state, priority, spec)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(fw.fw_id)
    .bind(&fw.wf_id)
    .bind(&fw.name)
    .bind(fw.state.as_str())
    .bind(fw.priority)
    .bind(serde_json::to_string(&fw.spec)?)
    .execute(&mut *conn)
    .await?;
  }

  sqlx::query("DELETE FROM launches WHERE wf_id = ?")
    .bind(&wf.wf_id)
    .execute(&mut *conn)
    .await?;
  for launch in launches {
    sqlx::query(
      r#"
            INSERT INTO launches (launch_id, wf_id, fw_id, state, archived)
            VALUES (?, ?, ?, ?, ?)
            "#,
    )
    .bind(launch.launch_id)
    .bind(&launch.wf_id)
    .bind(launch.fw_id)
    .bind(launch.state.as_str())
    .bind(launch.archived)
    .execute(&mut *conn)
    .await?;
  }
  Ok(())
}

/// Append `col IN (...)` for the given states, or nothing when empty.
fn push_state_filter(qb: &mut QueryBuilder<'_, Sqlite>, prefix: &str, states: &[State]) {
  if states.is_empty() {
    return;
  }
  qb.push(prefix);
  qb.push("state IN (");
  let mut separated = qb.separated(", ");
  for state in states {
    separated.push_bind(state.as_str());
  }
  separated.push_unseparated(")");
}

#[async_trait]
impl Store for SqliteStore {
  async fn insert_workflow(&self, wf: &Workflow) -> Result<(), StoreError> {
    let mut tx = self.pool.begin().await?;

    let exists: Option<String> = sqlx::query_scalar("SELECT wf_id FROM workflows WHERE wf_id = ?")
      .bind(&wf.wf_id)
      .fetch_optional(&mut *tx)
      .await?;
    if exists.is_some() {
      return Err(StoreError::AlreadyExists(format!("workflow {}", wf.wf_id)));
    }
    for fw_id in wf.fw_ids() {
      let taken: Option<i64> = sqlx::query_scalar("SELECT fw_id FROM fireworks WHERE fw_id = ?")
        .bind(fw_id)
        .fetch_optional(&mut *tx)
        .await?;
      if taken.is_some() {
        return Err(StoreError::AlreadyExists(format!("firework {fw_id}")));
      }
    }

    sqlx::query(
      r#"
            INSERT INTO workflows (wf_id, name, state, document, version, created_on, updated_on)
            VALUES (?, ?, ?, ?, 1, ?, ?)
            "#,
    )
    .bind(&wf.wf_id)
    .bind(&wf.name)
    .bind(wf.state().as_str())
    .bind(serde_json::to_string(wf)?)
    .bind(wf.created_on)
    .bind(wf.updated_on)
    .execute(&mut *tx)
    .await?;
    write_index(&mut tx, wf).await?;

    tx.commit().await?;
    debug!(wf_id = %wf.wf_id, "inserted workflow");
    Ok(())
  }

  async fn get_workflow(&self, wf_id: &str) -> Result<StoredWorkflow, StoreError> {
    let row: Option<WorkflowRow> = sqlx::query_as("SELECT document, version FROM workflows WHERE wf_id = ?")
      .bind(wf_id)
      .fetch_optional(&self.pool)
      .await?;
    let row = row.ok_or_else(|| StoreError::NotFound(format!("workflow {wf_id}")))?;
    Ok(StoredWorkflow {
      workflow: serde_json::from_str(&row.document)?,
      version: row.version,
    })
  }

  async fn commit_workflow(&self, wf: &Workflow, expected_version: i64) -> Result<i64, StoreError> {
    let mut tx = self.pool.begin().await?;

    let result = sqlx::query(
      r#"
            UPDATE workflows
            SET name = ?, state = ?, document = ?, version = version + 1, updated_on = ?
            WHERE wf_id = ? AND version = ?
            "#,
    )
    .bind(&wf.name)
    .bind(wf.state().as_str())
    .bind(serde_json::to_string(wf)?)
    .bind(wf.updated_on)
    .bind(&wf.wf_id)
    .bind(expected_version)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
      let current: Option<i64> = sqlx::query_scalar("SELECT version FROM workflows WHERE wf_id = ?")
        .bind(&wf.wf_id)
        .fetch_optional(&mut *tx)
        .await?;
      return Err(match current {
        Some(_) => StoreError::ConcurrentConflict {
          wf_id: wf.wf_id.clone(),
          expected: expected_version,
        },
        None => StoreError::NotFound(format!("workflow {}", wf.wf_id)),
      });
    }

    write_index(&mut tx, wf).await?;
    tx.commit().await?;
    Ok(expected_version + 1)
  }

  async fn wf_id_for_fw(&self, fw_id: FwId) -> Result<String, StoreError> {
    let wf_id: Option<String> = sqlx::query_scalar("SELECT wf_id FROM fireworks WHERE fw_id = ?")
      .bind(fw_id)
      .fetch_optional(&self.pool)
      .await?;
    wf_id.ok_or_else(|| StoreError::NotFound(format!("firework {fw_id}")))
  }

  async fn wf_id_for_launch(&self, launch_id: LaunchId) -> Result<String, StoreError> {
    let wf_id: Option<String> = sqlx::query_scalar("SELECT wf_id FROM launches WHERE launch_id = ?")
      .bind(launch_id)
      .fetch_optional(&self.pool)
      .await?;
    wf_id.ok_or_else(|| StoreError::NotFound(format!("launch {launch_id}")))
  }

  async fn find_fireworks(&self, states: &[State]) -> Result<Vec<FireworkRecord>, StoreError> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT fw_id, wf_id, name, state, priority, spec FROM fireworks");
    push_state_filter(&mut qb, " WHERE ", states);
    qb.push(" ORDER BY priority DESC, fw_id ASC");

    let rows: Vec<FireworkRow> = qb.build_query_as().fetch_all(&self.pool).await?;
    rows.into_iter().map(FireworkRecord::try_from).collect()
  }

  async fn find_launches(&self, states: &[State]) -> Result<Vec<LaunchRecord>, StoreError> {
    let mut qb =
      QueryBuilder::<Sqlite>::new("SELECT launch_id, fw_id, wf_id, state, archived FROM launches WHERE archived = 0");
    push_state_filter(&mut qb, " AND ", states);
    qb.push(" ORDER BY launch_id ASC");

    let rows: Vec<LaunchRow> = qb.build_query_as().fetch_all(&self.pool).await?;
    rows.into_iter().map(LaunchRecord::try_from).collect()
  }

  async fn wf_ids(&self) -> Result<Vec<String>, StoreError> {
    let ids: Vec<String> = sqlx::query_scalar("SELECT wf_id FROM workflows ORDER BY created_on ASC, rowid ASC")
      .fetch_all(&self.pool)
      .await?;
    Ok(ids)
  }

  async fn allocate_fw_ids(&self, count: usize) -> Result<Vec<FwId>, StoreError> {
    if count == 0 {
      return Ok(Vec::new());
    }
    let count = count as i64;
    let last = self.bump_counter("fw_id", count).await?;
    Ok((last - count + 1..=last).collect())
  }

  async fn allocate_launch_id(&self) -> Result<LaunchId, StoreError> {
    self.bump_counter("launch_id", 1).await
  }

  async fn reset(&self) -> Result<(), StoreError> {
    let mut tx = self.pool.begin().await?;
    for statement in [
      "DELETE FROM launches",
      "DELETE FROM fireworks",
      "DELETE FROM workflows",
      "UPDATE counters SET value = 0",
    ] {
      sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
  }
}
