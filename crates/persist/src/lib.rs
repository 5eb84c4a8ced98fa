//! Keel persistence: SQLite-backed inventory store.
//! One row per inventory plus one row per owned object.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use keel_core::client::DryRunStrategy;
use keel_core::inventory::{InventoryClient, InventoryInfo};
use keel_core::object::ObjectIdentifier;
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use tracing::debug;

/// SQLite-backed inventory. Simple, synchronous; calls are short and the
/// engine touches the inventory twice per run.
pub struct SqliteInventory {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteInventory {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(&db)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(&db)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn init(db: &rusqlite::Connection) -> Result<()> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS inventories (
                namespace  TEXT NOT NULL,
                name       TEXT NOT NULL,
                inv_id     TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, name)
            );
            CREATE TABLE IF NOT EXISTS inventory_objects (
                namespace TEXT NOT NULL,
                name      TEXT NOT NULL,
                object    TEXT NOT NULL,
                PRIMARY KEY (namespace, name, object)
            );",
        )
        .context("creating inventory tables")
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> { self.db.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Stored id for `inv`, `None` when the inventory was never written.
    fn stored_id(db: &rusqlite::Connection, inv: &InventoryInfo) -> Result<Option<String>> {
        db.query_row(
            "SELECT inv_id FROM inventories WHERE namespace = ?1 AND name = ?2",
            (&inv.namespace, &inv.name),
            |row| row.get(0),
        )
        .optional()
        .context("reading inventory row")
    }

    /// Id recorded for the inventory `namespace/name`, if it was ever stored.
    pub fn lookup_id(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let db = self.conn();
        Self::stored_id(&db, &InventoryInfo::new(name, namespace, ""))
    }

    /// Unix time of the last store, `None` for an unknown inventory.
    pub fn updated_at(&self, inv: &InventoryInfo) -> Result<Option<i64>> {
        let db = self.conn();
        db.query_row(
            "SELECT updated_at FROM inventories WHERE namespace = ?1 AND name = ?2",
            (&inv.namespace, &inv.name),
            |row| row.get(0),
        )
        .optional()
        .context("reading inventory row")
    }
}

fn check_id(inv: &InventoryInfo, stored: Option<&str>) -> Result<()> {
    match stored {
        Some(id) if id != inv.id => {
            Err(anyhow!("inventory {}/{} has id {:?}, expected {:?}", inv.namespace, inv.name, id, inv.id))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl InventoryClient for SqliteInventory {
    async fn load(&self, inv: &InventoryInfo) -> Result<Vec<ObjectIdentifier>> {
        let started = std::time::Instant::now();
        let db = self.conn();
        let Some(id) = Self::stored_id(&db, inv)? else { return Ok(Vec::new()) };
        check_id(inv, Some(&id))?;
        let mut stmt = db.prepare("SELECT object FROM inventory_objects WHERE namespace = ?1 AND name = ?2")?;
        let mut rows = stmt.query((&inv.namespace, &inv.name))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            out.push(ObjectIdentifier::parse(&raw).with_context(|| format!("inventory {}/{}: bad entry", inv.namespace, inv.name))?);
        }
        out.sort();
        histogram!("persist_load_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    async fn store(&self, inv: &InventoryInfo, ids: &[ObjectIdentifier], dry_run: DryRunStrategy) -> Result<()> {
        if dry_run.is_dry_run() {
            debug!(inventory = %inv.name, "persist: dry run, store skipped");
            return Ok(());
        }
        let started = std::time::Instant::now();
        let mut db = self.conn();
        let tx = db.transaction()?;
        check_id(inv, Self::stored_id(&tx, inv)?.as_deref())?;
        tx.execute(
            "INSERT INTO inventories(namespace, name, inv_id, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, name) DO UPDATE SET updated_at = excluded.updated_at",
            (&inv.namespace, &inv.name, &inv.id, now_ts()),
        )?;
        tx.execute("DELETE FROM inventory_objects WHERE namespace = ?1 AND name = ?2", (&inv.namespace, &inv.name))?;
        {
            let mut insert =
                tx.prepare("INSERT OR IGNORE INTO inventory_objects(namespace, name, object) VALUES (?1, ?2, ?3)")?;
            for id in ids {
                insert.execute((&inv.namespace, &inv.name, id.to_string()))?;
            }
        }
        tx.commit()?;
        histogram!("persist_store_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_store_total", 1u64);
        Ok(())
    }

    async fn delete(&self, inv: &InventoryInfo, dry_run: DryRunStrategy) -> Result<()> {
        if dry_run.is_dry_run() {
            return Ok(());
        }
        let mut db = self.conn();
        let tx = db.transaction()?;
        check_id(inv, Self::stored_id(&tx, inv)?.as_deref())?;
        tx.execute("DELETE FROM inventory_objects WHERE namespace = ?1 AND name = ?2", (&inv.namespace, &inv.name))?;
        tx.execute("DELETE FROM inventories WHERE namespace = ?1 AND name = ?2", (&inv.namespace, &inv.name))?;
        tx.commit()?;
        counter!("persist_delete_total", 1u64);
        Ok(())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("keel.db");
        return p.to_string_lossy().to_string();
    }
    "keel.db".to_string()
}

fn now_ts() -> i64 { time::OffsetDateTime::now_utc().unix_timestamp() }
