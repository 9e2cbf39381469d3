//! SQLite-backed storage.
//!
//! Durable single-node backend. Coarse columns (id, job, status, shard) are
//! kept relational for inspection; the full records travel as JSON blobs.
//! Queries are evaluated against deserialized rows with
//! [`TaskQuery::matches`], which keeps the backend honest to the same
//! predicate semantics as the in-memory store.

use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error};

use super::{
    AttributeStore, HostAttributes, SchedulerStore, ShardUpdateConfiguration, Storage,
    StorageResult, StoreProvider, TaskStore, UpdateStore,
};
use crate::query::TaskQuery;
use crate::task::ScheduledTask;

/// SQLite [`Storage`].
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        // WAL for concurrent readers against the single writer.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StorageResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                job_name TEXT NOT NULL,
                shard_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                record TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks(role, job_name);

            CREATE TABLE IF NOT EXISTS framework (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                framework_id TEXT
            );

            INSERT OR IGNORE INTO framework (id, framework_id) VALUES (1, NULL);

            CREATE TABLE IF NOT EXISTS shard_updates (
                role TEXT NOT NULL,
                job_name TEXT NOT NULL,
                shard_id INTEGER NOT NULL,
                record TEXT NOT NULL,
                PRIMARY KEY (role, job_name, shard_id)
            );

            CREATE TABLE IF NOT EXISTS host_attributes (
                host TEXT PRIMARY KEY,
                record TEXT NOT NULL
            );
            "#,
        )?;

        debug!("sqlite storage schema initialized");
        Ok(())
    }

    fn all_tasks(&self) -> StorageResult<Vec<ScheduledTask>> {
        let mut stmt = self.conn.prepare("SELECT record FROM tasks ORDER BY task_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut tasks = Vec::new();
        for record in rows {
            tasks.push(serde_json::from_str(&record?)?);
        }
        Ok(tasks)
    }

    fn upsert_task(&mut self, task: &ScheduledTask) -> StorageResult<()> {
        let record = serde_json::to_string(task)?;
        self.conn.execute(
            r#"
            INSERT INTO tasks (task_id, role, job_name, shard_id, status, record)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(task_id) DO UPDATE SET
                role = excluded.role,
                job_name = excluded.job_name,
                shard_id = excluded.shard_id,
                status = excluded.status,
                record = excluded.record
            "#,
            params![
                task.id(),
                task.config().role,
                task.config().job_name,
                task.config().shard_id,
                task.status.as_str(),
                record,
            ],
        )?;
        Ok(())
    }
}

impl TaskStore for SqliteStorage {
    fn fetch_tasks(&self, query: &TaskQuery) -> StorageResult<Vec<ScheduledTask>> {
        Ok(self
            .all_tasks()?
            .into_iter()
            .filter(|task| query.matches(task))
            .collect())
    }

    fn fetch_task_ids(&self, query: &TaskQuery) -> StorageResult<BTreeSet<String>> {
        Ok(self
            .fetch_tasks(query)?
            .into_iter()
            .map(|task| task.id().to_string())
            .collect())
    }

    fn save_tasks(&mut self, tasks: &[ScheduledTask]) -> StorageResult<()> {
        for task in tasks {
            self.upsert_task(task)?;
        }
        Ok(())
    }

    fn mutate_tasks(
        &mut self,
        query: &TaskQuery,
        mutator: &mut dyn FnMut(&mut ScheduledTask),
    ) -> StorageResult<Vec<ScheduledTask>> {
        let mut mutated = Vec::new();
        for mut task in self.fetch_tasks(query)? {
            mutator(&mut task);
            self.upsert_task(&task)?;
            mutated.push(task);
        }
        Ok(mutated)
    }

    fn remove_tasks(&mut self, task_ids: &BTreeSet<String>) -> StorageResult<()> {
        for id in task_ids {
            self.conn
                .execute("DELETE FROM tasks WHERE task_id = ?1", params![id])?;
        }
        Ok(())
    }
}

impl SchedulerStore for SqliteStorage {
    fn fetch_framework_id(&self) -> StorageResult<Option<String>> {
        let id: Option<String> = self
            .conn
            .query_row("SELECT framework_id FROM framework WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        Ok(id)
    }

    fn save_framework_id(&mut self, framework_id: &str) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE framework SET framework_id = ?1 WHERE id = 1",
            params![framework_id],
        )?;
        Ok(())
    }
}

impl UpdateStore for SqliteStorage {
    fn fetch_shard_update_config(
        &self,
        role: &str,
        job: &str,
        shard_id: u32,
    ) -> StorageResult<Option<ShardUpdateConfiguration>> {
        let record: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM shard_updates
                 WHERE role = ?1 AND job_name = ?2 AND shard_id = ?3",
                params![role, job, shard_id],
                |row| row.get(0),
            )
            .optional()?;

        match record {
            Some(record) => Ok(Some(serde_json::from_str(&record)?)),
            None => Ok(None),
        }
    }

    fn fetch_shard_update_configs(
        &self,
        role: &str,
        job: &str,
    ) -> StorageResult<Vec<ShardUpdateConfiguration>> {
        let mut stmt = self.conn.prepare(
            "SELECT record FROM shard_updates
             WHERE role = ?1 AND job_name = ?2 ORDER BY shard_id",
        )?;
        let rows = stmt.query_map(params![role, job], |row| row.get::<_, String>(0))?;

        let mut configs = Vec::new();
        for record in rows {
            configs.push(serde_json::from_str(&record?)?);
        }
        Ok(configs)
    }

    fn fetch_shard_update_configs_for(
        &self,
        role: &str,
        job: &str,
        shard_ids: &BTreeSet<u32>,
    ) -> StorageResult<Vec<ShardUpdateConfiguration>> {
        Ok(self
            .fetch_shard_update_configs(role, job)?
            .into_iter()
            .filter(|config| config.shard_id().is_some_and(|id| shard_ids.contains(&id)))
            .collect())
    }

    fn save_shard_update_configs(
        &mut self,
        role: &str,
        job: &str,
        configs: &[ShardUpdateConfiguration],
    ) -> StorageResult<()> {
        for config in configs {
            let Some(shard_id) = config.shard_id() else {
                continue;
            };
            let record = serde_json::to_string(config)?;
            self.conn.execute(
                r#"
                INSERT INTO shard_updates (role, job_name, shard_id, record)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(role, job_name, shard_id) DO UPDATE SET
                    record = excluded.record
                "#,
                params![role, job, shard_id, record],
            )?;
        }
        Ok(())
    }

    fn remove_shard_update_configs(&mut self, role: &str, job: &str) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM shard_updates WHERE role = ?1 AND job_name = ?2",
            params![role, job],
        )?;
        Ok(())
    }
}

impl AttributeStore for SqliteStorage {
    fn host_attributes(&self, host: &str) -> StorageResult<Option<HostAttributes>> {
        let record: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM host_attributes WHERE host = ?1",
                params![host],
                |row| row.get(0),
            )
            .optional()?;

        match record {
            Some(record) => Ok(Some(serde_json::from_str(&record)?)),
            None => Ok(None),
        }
    }

    fn save_host_attributes(&mut self, attributes: HostAttributes) -> StorageResult<()> {
        let record = serde_json::to_string(&attributes)?;
        self.conn.execute(
            r#"
            INSERT INTO host_attributes (host, record)
            VALUES (?1, ?2)
            ON CONFLICT(host) DO UPDATE SET record = excluded.record
            "#,
            params![attributes.host, record],
        )?;
        Ok(())
    }
}

impl StoreProvider for SqliteStorage {
    fn task_store(&mut self) -> &mut dyn TaskStore {
        self
    }

    fn scheduler_store(&mut self) -> &mut dyn SchedulerStore {
        self
    }

    fn update_store(&mut self) -> &mut dyn UpdateStore {
        self
    }

    fn attribute_store(&self) -> &dyn AttributeStore {
        self
    }
}

impl Storage for SqliteStorage {
    fn prepare(&mut self) -> StorageResult<()> {
        self.init_schema()
    }

    fn begin(&mut self) -> StorageResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) {
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            error!(error = %e, "failed to roll back sqlite transaction");
        }
    }

    fn provider(&mut self) -> &mut dyn StoreProvider {
        self
    }

    fn stop(&mut self) {}
}
