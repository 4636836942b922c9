//! SQLite durable store
//!
//! Schema:
//! - `entities`: one row per stored version, the wire encoding in `body`
//! - `vector_clock`: the replica's knowledge and last-synced vectors
//! - `sync_metadata`: key/value facts about the replica (its id)

use super::{replica_mismatch, ChangeSet, DurableStore, Snapshot};
use crate::config::StoreConfig;
use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};
use crate::knowledge::KnowledgeVector;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

const KNOWLEDGE: &str = "knowledge";
const LAST_SYNCED: &str = "last_synced";
const REPLICA_ID_KEY: &str = "replica_id";

/// Durable store backed by a SQLite file
pub struct SqliteDurableStore {
    pool: SqlitePool,
}

impl SqliteDurableStore {
    /// Open (creating if needed) the database at `config.db_path`
    pub async fn open(config: &StoreConfig) -> StoreResult<Self> {
        let mut options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.db_path))?
            .create_if_missing(true)
            .foreign_keys(true);

        // WAL lets readers proceed while a sync transaction commits
        if config.enable_wal {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        if config.enable_secure_delete {
            options = options.pragma("secure_delete", "ON");
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;

        tracing::debug!(db_path = %config.db_path, "Opened SQLite store");
        Ok(store)
    }

    async fn initialize_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                uuid TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                logical_id TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_chain ON entities(kind, logical_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_created ON entities(created_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vector_clock (
                vector TEXT NOT NULL,
                replica_id TEXT NOT NULL,
                counter INTEGER NOT NULL DEFAULT 0,
                last_updated TEXT NOT NULL,
                PRIMARY KEY (vector, replica_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_vector(&self, vector: &str) -> StoreResult<KnowledgeVector> {
        let rows = sqlx::query("SELECT replica_id, counter FROM vector_clock WHERE vector = ?")
            .bind(vector)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> StoreResult<(Uuid, i64)> {
                let replica_id: String = row.try_get("replica_id")?;
                let counter: i64 = row.try_get("counter")?;
                Ok((parse_uuid(&replica_id)?, counter))
            })
            .collect()
    }

    /// Get database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connection
    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn parse_uuid(value: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| StoreError::Internal(format!("Invalid UUID: {}", e)))
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn bind_replica(&self, requested: Option<Uuid>) -> StoreResult<Uuid> {
        let stored = sqlx::query("SELECT value FROM sync_metadata WHERE key = ?")
            .bind(REPLICA_ID_KEY)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = stored {
            let value: String = row.try_get("value")?;
            let stored = parse_uuid(&value)?;
            return match requested {
                Some(requested) if requested != stored => Err(replica_mismatch(stored, requested)),
                _ => Ok(stored),
            };
        }

        let replica_id = requested.unwrap_or_else(Uuid::new_v4);
        sqlx::query("INSERT INTO sync_metadata (key, value, updated_at) VALUES (?, ?, ?)")
            .bind(REPLICA_ID_KEY)
            .bind(replica_id.to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

        tracing::info!(replica_id = %replica_id, "Initialized replica");
        Ok(replica_id)
    }

    async fn load(&self) -> StoreResult<Snapshot> {
        let rows = sqlx::query("SELECT body FROM entities ORDER BY created_at ASC, uuid ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.try_get("body")?;
            entities.push(serde_json::from_str::<Entity>(&body)?);
        }

        Ok(Snapshot {
            entities,
            knowledge: self.load_vector(KNOWLEDGE).await?,
            last_synced: self.load_vector(LAST_SYNCED).await?,
        })
    }

    async fn apply(&self, changes: &ChangeSet) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        if changes.reset {
            sqlx::query("DELETE FROM entities").execute(&mut *tx).await?;
        }

        for entity in &changes.upserts {
            let header = entity.header();
            sqlx::query(
                r#"
                INSERT INTO entities (uuid, kind, logical_id, deleted, created_at, body)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(uuid) DO UPDATE SET
                    deleted = excluded.deleted,
                    body = excluded.body
                "#,
            )
            .bind(header.uuid.to_string())
            .bind(entity.kind().as_str())
            .bind(&header.id)
            .bind(header.is_tombstoned())
            .bind(header.created_date.to_rfc3339())
            .bind(serde_json::to_string(entity)?)
            .execute(&mut *tx)
            .await?;
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query("DELETE FROM vector_clock").execute(&mut *tx).await?;
        for (vector, clocks) in [(KNOWLEDGE, &changes.knowledge), (LAST_SYNCED, &changes.last_synced)] {
            for (replica_id, counter) in clocks.replicas() {
                sqlx::query(
                    "INSERT INTO vector_clock (vector, replica_id, counter, last_updated) VALUES (?, ?, ?, ?)",
                )
                .bind(vector)
                .bind(replica_id.to_string())
                .bind(*counter)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        tracing::debug!(
            upserts = changes.upserts.len(),
            reset = changes.reset,
            "Applied change set"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Patient, PersonName, Versioned};
    use tempfile::TempDir;

    async fn create_test_db() -> (TempDir, SqliteDurableStore) {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            db_path: dir.path().join("carestore.db").to_str().unwrap().to_string(),
            ..StoreConfig::default()
        };
        let store = SqliteDurableStore::open(&config).await.unwrap();
        (dir, store)
    }

    fn patient(id: &str) -> Entity {
        let mut version = Versioned::new(id, Patient::new(PersonName::new("Jane", "Doe")));
        version.header.uuid = Uuid::new_v4();
        version.into_entity()
    }

    #[tokio::test]
    async fn test_database_creation() {
        let (_dir, store) = create_test_db().await;
        let snapshot = store.load().await.unwrap();
        assert!(snapshot.entities.is_empty());
        assert!(snapshot.knowledge.is_zero());
    }

    #[tokio::test]
    async fn test_replica_id_is_persisted() {
        let (_dir, store) = create_test_db().await;
        let replica = store.bind_replica(None).await.unwrap();
        assert_eq!(store.bind_replica(None).await.unwrap(), replica);
        assert!(store.bind_replica(Some(Uuid::new_v4())).await.is_err());
    }

    #[tokio::test]
    async fn test_apply_round_trip() {
        let (_dir, store) = create_test_db().await;
        let replica = Uuid::new_v4();
        let remote = Uuid::new_v4();
        let mut entity = patient("p1");

        store
            .apply(&ChangeSet {
                upserts: vec![entity.clone()],
                knowledge: KnowledgeVector::single(replica, 2).merged(&KnowledgeVector::single(remote, 5)),
                last_synced: KnowledgeVector::single(remote, 5),
                ..Default::default()
            })
            .await
            .unwrap();

        // Upserting the same UUID replaces the row
        entity.header_mut().deleted_date = Some(Utc::now());
        store
            .apply(&ChangeSet {
                upserts: vec![entity.clone()],
                knowledge: KnowledgeVector::single(replica, 3),
                ..Default::default()
            })
            .await
            .unwrap();

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.entities, vec![entity]);
        assert_eq!(snapshot.knowledge.clock(replica), 3);
        assert_eq!(snapshot.knowledge.clock(remote), 0);
        assert!(snapshot.last_synced.is_zero());
    }

    #[tokio::test]
    async fn test_reset_clears_entities() {
        let (_dir, store) = create_test_db().await;
        store
            .apply(&ChangeSet {
                upserts: vec![patient("p1"), patient("p2")],
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .apply(&ChangeSet {
                reset: true,
                upserts: vec![patient("p3")],
                ..Default::default()
            })
            .await
            .unwrap();

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.entities.len(), 1);
        assert_eq!(snapshot.entities[0].id(), "p3");
    }

    #[tokio::test]
    async fn test_secure_delete_enabled() {
        let (_dir, store) = create_test_db().await;
        let row = sqlx::query("PRAGMA secure_delete")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let secure_delete: i64 = row.try_get(0).unwrap();
        assert_eq!(secure_delete, 1);
    }
}
