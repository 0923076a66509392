use crate::errors::{AppError, AppResult};
use crate::keys;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Profile,
    Category,
    Task,
    Insight,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Profile => "profile",
            ItemKind::Category => "category",
            ItemKind::Task => "task",
            ItemKind::Insight => "insight",
        }
    }
}

/// One row of the item store. `body` is the JSON entity; `expires_at` is set
/// only for kinds with bounded retention (insights).
#[derive(Debug, Clone)]
pub struct ItemRecord {
    pub pk: String,
    pub sk: String,
    pub kind: ItemKind,
    pub body: serde_json::Value,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ItemRecord {
    pub fn new(pk: String, sk: String, kind: ItemKind, body: serde_json::Value) -> Self {
        Self {
            pk,
            sk,
            kind,
            body,
            expires_at: None,
        }
    }

    pub fn expiring(
        pk: String,
        sk: String,
        kind: ItemKind,
        body: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            pk,
            sk,
            kind,
            body,
            expires_at: Some(expires_at),
        }
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> AppResult<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Internal(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ─── Item store ─────────────────────────────────────────────────────────

    /// Upsert an item. When `index_id` is given the task index row for
    /// `(pk, index_id)` is repointed at the item's sort key in the same
    /// transaction, so the index never references a missing item.
    pub fn put_item(&self, item: &ItemRecord, index_id: Option<&str>) -> AppResult<()> {
        let body_json = serde_json::to_string(&item.body)?;
        let expires = item.expires_at.map(time_str);
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;

        match index_id {
            Some(task_id) => {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO items (pk, sk, kind, body, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(pk, sk) DO UPDATE SET
                       kind = excluded.kind,
                       body = excluded.body,
                       expires_at = excluded.expires_at",
                    params![item.pk, item.sk, item.kind.as_str(), body_json, expires],
                )?;
                tx.execute(
                    "INSERT INTO task_index (pk, task_id, sk) VALUES (?1, ?2, ?3)
                     ON CONFLICT(pk, task_id) DO UPDATE SET sk = excluded.sk",
                    params![item.pk, task_id, item.sk],
                )?;
                tx.commit()?;
            }
            None => {
                conn.execute(
                    "INSERT INTO items (pk, sk, kind, body, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(pk, sk) DO UPDATE SET
                       kind = excluded.kind,
                       body = excluded.body,
                       expires_at = excluded.expires_at",
                    params![item.pk, item.sk, item.kind.as_str(), body_json, expires],
                )?;
            }
        }
        Ok(())
    }

    /// Conditional create: returns false without touching anything when an
    /// item already holds the key.
    pub fn insert_item(&self, item: &ItemRecord, index_id: Option<&str>) -> AppResult<bool> {
        let body_json = serde_json::to_string(&item.body)?;
        let expires = item.expires_at.map(time_str);
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;

        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO items (pk, sk, kind, body, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![item.pk, item.sk, item.kind.as_str(), body_json, expires],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        if let Some(task_id) = index_id {
            tx.execute(
                "INSERT INTO task_index (pk, task_id, sk) VALUES (?1, ?2, ?3)
                 ON CONFLICT(pk, task_id) DO UPDATE SET sk = excluded.sk",
                params![item.pk, task_id, item.sk],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn get_item(&self, pk: &str, sk: &str) -> AppResult<Option<ItemRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.query_row(
            "SELECT pk, sk, kind, body, expires_at FROM items WHERE pk = ?1 AND sk = ?2",
            params![pk, sk],
            parse_item_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Delete an item; with `index_id` the task index row goes in the same
    /// transaction. Returns whether an item row was actually removed.
    pub fn delete_item(&self, pk: &str, sk: &str, index_id: Option<&str>) -> AppResult<bool> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;

        match index_id {
            Some(task_id) => {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "DELETE FROM items WHERE pk = ?1 AND sk = ?2",
                    params![pk, sk],
                )?;
                tx.execute(
                    "DELETE FROM task_index WHERE pk = ?1 AND task_id = ?2",
                    params![pk, task_id],
                )?;
                tx.commit()?;
                Ok(changed > 0)
            }
            None => {
                let changed = conn.execute(
                    "DELETE FROM items WHERE pk = ?1 AND sk = ?2",
                    params![pk, sk],
                )?;
                Ok(changed > 0)
            }
        }
    }

    // ─── Scans ──────────────────────────────────────────────────────────────

    /// All items of one partition whose sort key starts with `prefix`,
    /// ascending. Lexicographic order on the sort key is date order for
    /// tasks and id order for categories.
    pub fn list_prefix(&self, pk: &str, prefix: &str) -> AppResult<Vec<ItemRecord>> {
        self.scan(pk, prefix, &keys::prefix_upper_bound(prefix), false)
    }

    /// Descending prefix scan; insights list newest first through this.
    pub fn list_prefix_desc(&self, pk: &str, prefix: &str) -> AppResult<Vec<ItemRecord>> {
        self.scan(pk, prefix, &keys::prefix_upper_bound(prefix), true)
    }

    /// Bounded scan over `lower <= sk < upper`, ascending.
    pub fn list_range(&self, pk: &str, lower: &str, upper: &str) -> AppResult<Vec<ItemRecord>> {
        self.scan(pk, lower, upper, false)
    }

    fn scan(&self, pk: &str, lower: &str, upper: &str, descending: bool) -> AppResult<Vec<ItemRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let query = if descending {
            "SELECT pk, sk, kind, body, expires_at FROM items
             WHERE pk = ?1 AND sk >= ?2 AND sk < ?3 ORDER BY sk DESC"
        } else {
            "SELECT pk, sk, kind, body, expires_at FROM items
             WHERE pk = ?1 AND sk >= ?2 AND sk < ?3 ORDER BY sk ASC"
        };
        let mut stmt = conn.prepare(query)?;
        let rows = stmt.query_map(params![pk, lower, upper], parse_item_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Resolve a task's current sort key through the secondary index.
    pub fn find_task_sk(&self, pk: &str, task_id: &str) -> AppResult<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.query_row(
            "SELECT sk FROM task_index WHERE pk = ?1 AND task_id = ?2",
            params![pk, task_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    /// System-scope scan for recurring templates across all partitions.
    /// Instances carry a baseTaskId and are excluded.
    pub fn list_recurring_templates(&self) -> AppResult<Vec<ItemRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT pk, sk, kind, body, expires_at FROM items
             WHERE kind = 'task'
               AND json_extract(body, '$.recurring.enabled') = 1
               AND json_extract(body, '$.recurring.baseTaskId') IS NULL
             ORDER BY pk ASC, sk ASC",
        )?;
        let rows = stmt.query_map([], parse_item_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Partitions holding tasks stuck in a pending reminder transition,
    /// for the maintenance sweep.
    pub fn list_pending_schedule_partitions(&self) -> AppResult<Vec<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT pk FROM items
             WHERE kind = 'task'
               AND json_extract(body, '$.reminders.scheduleState') IN ('pending-retire', 'pending-install')
             ORDER BY pk ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // ─── Expiry ─────────────────────────────────────────────────────────────

    pub fn purge_expired_prefix(&self, pk: &str, prefix: &str, now: DateTime<Utc>) -> AppResult<u64> {
        let upper = keys::prefix_upper_bound(prefix);
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "DELETE FROM items
             WHERE pk = ?1 AND sk >= ?2 AND sk < ?3
               AND expires_at IS NOT NULL AND expires_at <= ?4",
            params![pk, prefix, upper, time_str(now)],
        )?;
        Ok(changed as u64)
    }

    pub fn purge_expired_items(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "DELETE FROM items WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![time_str(now)],
        )?;
        Ok(changed as u64)
    }

    // ─── Window counters ────────────────────────────────────────────────────

    /// Bump the fixed-window counter for `(username, action)` and return the
    /// count inside the current window. A row from an older window is reset
    /// rather than carried over.
    pub fn bump_window_counter(
        &self,
        username: &str,
        action: &str,
        window_start: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> AppResult<u32> {
        let window = time_str(window_start);
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO rate_counters (username, action, window_start, count, expires_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(username, action) DO UPDATE SET
               count = CASE WHEN rate_counters.window_start = excluded.window_start
                            THEN rate_counters.count + 1 ELSE 1 END,
               window_start = excluded.window_start,
               expires_at = excluded.expires_at",
            params![username, action, window, time_str(expires_at)],
        )?;
        let count: u32 = conn.query_row(
            "SELECT count FROM rate_counters WHERE username = ?1 AND action = ?2",
            params![username, action],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn evict_stale_counters(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "DELETE FROM rate_counters WHERE expires_at <= ?1",
            params![time_str(now)],
        )?;
        Ok(changed as u64)
    }
}

fn time_str(at: DateTime<Utc>) -> String {
    // Fixed-width so string comparison in SQL equals chronological comparison.
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRecord> {
    let body_raw: String = row.get(3)?;
    let body = serde_json::from_str(&body_raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                error.to_string(),
            )),
        )
    })?;
    Ok(ItemRecord {
        pk: row.get(0)?,
        sk: row.get(1)?,
        kind: parse_kind(&row.get::<_, String>(2)?)?,
        body,
        expires_at: row
            .get::<_, Option<String>>(4)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
    })
}

fn parse_kind(raw: &str) -> rusqlite::Result<ItemKind> {
    match raw {
        "profile" => Ok(ItemKind::Profile),
        "category" => Ok(ItemKind::Category),
        "task" => Ok(ItemKind::Task),
        "insight" => Ok(ItemKind::Insight),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unknown item kind '{}'", other),
            )),
        )),
    }
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    error.to_string(),
                )),
            )
        })
}
