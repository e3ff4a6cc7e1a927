//! SQLite-backed state store.
//!
//! This module is feature-gated behind `sqlite-persistence`. Records are
//! stored as JSON documents with the key columns lifted out for indexing;
//! the conditional lock acquire is a guarded upsert so the condition check
//! and the write are one statement.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::KernelError;
use crate::models::{LockRecord, OrderEvent, OrderRecord, OrderStatus};
use crate::state::{LockAcquire, LockRequest, OrderStatusUpdate, StateStore};

fn map_err(prefix: &str, err: impl std::fmt::Display) -> KernelError {
    KernelError::State(format!("{prefix}: {err}"))
}

/// SQLite-backed [`StateStore`].
pub struct SqliteStateStore {
    db_path: PathBuf,
    lock: Mutex<()>,
}

impl SqliteStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn open_connection(&self) -> Result<Connection, KernelError> {
        if let Some(parent) = Path::new(&self.db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| map_err("create parent dir", e))?;
        }
        let conn = Connection::open(&self.db_path).map_err(|e| map_err("open sqlite db", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| map_err("set journal_mode", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| map_err("set synchronous", e))?;
        self.ensure_schema(&conn)?;
        Ok(conn)
    }

    fn ensure_schema(&self, conn: &Connection) -> Result<(), KernelError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS orders (
                pk TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                order_num TEXT NOT NULL,
                record_json TEXT NOT NULL,
                ttl INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_run ON orders (run_id, order_num);

            CREATE TABLE IF NOT EXISTS order_events (
                trace_id TEXT NOT NULL,
                sort_key TEXT NOT NULL,
                order_name TEXT NOT NULL,
                epoch_ms INTEGER NOT NULL,
                event_json TEXT NOT NULL,
                PRIMARY KEY (trace_id, sort_key)
            );
            CREATE INDEX IF NOT EXISTS idx_events_order
            ON order_events (trace_id, order_name, epoch_ms);

            CREATE TABLE IF NOT EXISTS run_locks (
                pk TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                holder_id TEXT NOT NULL,
                state TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                flow_id TEXT NOT NULL,
                trace_id TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| map_err("ensure schema", e))?;
        Ok(())
    }

    fn with_conn<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, KernelError>,
    ) -> Result<T, KernelError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| map_err("lock poisoned", "mutex poisoned"))?;
        let conn = self.open_connection()?;
        op(&conn)
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn put_order(&self, record: &OrderRecord) -> Result<(), KernelError> {
        let json =
            serde_json::to_string(record).map_err(|e| map_err("serialise order", e))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO orders (pk, run_id, order_num, record_json, ttl)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(pk) DO UPDATE SET record_json = excluded.record_json,
                                               ttl = excluded.ttl",
                params![record.pk(), record.run_id, record.order_num, json, record.ttl],
            )
            .map_err(|e| map_err("put order", e))?;
            Ok(())
        })
    }

    async fn get_order(
        &self,
        run_id: &str,
        order_num: &str,
    ) -> Result<Option<OrderRecord>, KernelError> {
        self.with_conn(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT record_json FROM orders WHERE pk = ?1",
                    params![format!("{run_id}:{order_num}")],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| map_err("get order", e))?;
            json.map(|j| serde_json::from_str(&j).map_err(|e| map_err("decode order", e)))
                .transpose()
        })
    }

    async fn orders_for_run(&self, run_id: &str) -> Result<Vec<OrderRecord>, KernelError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT record_json FROM orders WHERE run_id = ?1 ORDER BY order_num",
                )
                .map_err(|e| map_err("prepare orders query", e))?;
            let rows = stmt
                .query_map(params![run_id], |row| row.get::<_, String>(0))
                .map_err(|e| map_err("query orders", e))?;
            let mut orders = Vec::new();
            for row in rows {
                let json = row.map_err(|e| map_err("read order row", e))?;
                orders.push(
                    serde_json::from_str(&json).map_err(|e| map_err("decode order", e))?,
                );
            }
            Ok(orders)
        })
    }

    async fn update_order_status(
        &self,
        run_id: &str,
        order_num: &str,
        status: OrderStatus,
        update: OrderStatusUpdate,
    ) -> Result<(), KernelError> {
        let mut record = self
            .get_order(run_id, order_num)
            .await?
            .ok_or_else(|| KernelError::State(format!("unknown order {run_id}:{order_num}")))?;
        record.status = status;
        record.last_update = Utc::now().timestamp();
        if let Some(log) = update.log {
            record.log = Some(log);
        }
        if let Some(reason) = update.failure_reason {
            record.failure_reason = Some(reason);
        }
        if let Some(url) = update.execution_url {
            record.execution_url = Some(url);
        }
        if let Some(handle) = update.watchdog_handle {
            record.watchdog_handle = Some(handle);
        }
        self.put_order(&record).await
    }

    async fn put_event(&self, event: &OrderEvent) -> Result<(), KernelError> {
        let json = serde_json::to_string(event).map_err(|e| map_err("serialise event", e))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO order_events
                 (trace_id, sort_key, order_name, epoch_ms, event_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![event.trace_id, event.sort_key, event.order_name, event.epoch_ms, json],
            )
            .map_err(|e| map_err("put event", e))?;
            Ok(())
        })
    }

    async fn events_for_trace(
        &self,
        trace_id: &str,
        order_name_prefix: Option<&str>,
    ) -> Result<Vec<OrderEvent>, KernelError> {
        self.with_conn(|conn| {
            // Order names are validated identifiers; no LIKE escaping needed.
            let pattern = order_name_prefix
                .map(|prefix| format!("{prefix}:%"))
                .unwrap_or_else(|| "%".to_string());
            let mut stmt = conn
                .prepare(
                    "SELECT event_json FROM order_events
                     WHERE trace_id = ?1 AND sort_key LIKE ?2 ORDER BY sort_key",
                )
                .map_err(|e| map_err("prepare events query", e))?;
            let rows = stmt
                .query_map(params![trace_id, pattern], |row| row.get::<_, String>(0))
                .map_err(|e| map_err("query events", e))?;
            let mut events = Vec::new();
            for row in rows {
                let json = row.map_err(|e| map_err("read event row", e))?;
                events.push(serde_json::from_str(&json).map_err(|e| map_err("decode event", e))?);
            }
            Ok(events)
        })
    }

    async fn latest_event(
        &self,
        trace_id: &str,
        order_name: &str,
    ) -> Result<Option<OrderEvent>, KernelError> {
        self.with_conn(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT event_json FROM order_events
                     WHERE trace_id = ?1 AND order_name = ?2
                     ORDER BY epoch_ms DESC LIMIT 1",
                    params![trace_id, order_name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| map_err("latest event", e))?;
            json.map(|j| serde_json::from_str(&j).map_err(|e| map_err("decode event", e)))
                .transpose()
        })
    }

    async fn acquire_lock(&self, request: &LockRequest) -> Result<LockAcquire, KernelError> {
        let now = Utc::now().timestamp();
        let expires_at = now + request.ttl_s as i64;
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "INSERT INTO run_locks
                     (pk, run_id, holder_id, state, acquired_at, expires_at, flow_id, trace_id)
                     VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?7)
                     ON CONFLICT(pk) DO UPDATE SET
                         holder_id = excluded.holder_id,
                         state = 'active',
                         acquired_at = excluded.acquired_at,
                         expires_at = excluded.expires_at,
                         flow_id = excluded.flow_id,
                         trace_id = excluded.trace_id
                     WHERE run_locks.state = 'completed' OR run_locks.expires_at <= ?4",
                    params![
                        LockRecord::pk(&request.run_id),
                        request.run_id,
                        request.holder_id,
                        now,
                        expires_at,
                        request.flow_id,
                        request.trace_id
                    ],
                )
                .map_err(|e| map_err("acquire lock", e))?;
            Ok(if changed > 0 {
                LockAcquire::Acquired
            } else {
                LockAcquire::Contended
            })
        })
    }

    async fn release_lock(&self, run_id: &str) -> Result<(), KernelError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE run_locks SET state = 'completed' WHERE pk = ?1",
                params![LockRecord::pk(run_id)],
            )
            .map_err(|e| map_err("release lock", e))?;
            Ok(())
        })
    }

    async fn get_lock(&self, run_id: &str) -> Result<Option<LockRecord>, KernelError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT run_id, holder_id, state, acquired_at, expires_at, flow_id, trace_id
                 FROM run_locks WHERE pk = ?1",
                params![LockRecord::pk(run_id)],
                |row| {
                    Ok(LockRecord {
                        run_id: row.get(0)?,
                        holder_id: row.get(1)?,
                        state: row.get(2)?,
                        acquired_at: row.get(3)?,
                        expires_at: row.get(4)?,
                        flow_id: row.get(5)?,
                        trace_id: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(|e| map_err("get lock", e))
        })
    }
}
