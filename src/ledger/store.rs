use super::{LedgerEntry, NewEntry};
use crate::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

pub const LEDGER_TABLE: &str = "__migrun_ledger";

/// SQLite-backed record of every script the runner has applied or staged.
///
/// Each write is committed before the call returns, so a run that is killed
/// midway leaves a ledger describing exactly the work that finished.
pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    pub fn new(conn: Connection) -> Result<Self> {
        let store = Self { conn };
        store.ensure_ledger_table()?;
        Ok(store)
    }

    fn ensure_ledger_table(&self) -> Result<()> {
        self.conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                content_fingerprint TEXT NOT NULL,
                text TEXT,
                applied_at REAL NOT NULL,
                kind TEXT NOT NULL CHECK(kind IN ('commit', 'rollback')),
                status TEXT NOT NULL CHECK(status IN ('executed', 'not_executed', 'executed_with_errors', 'runner_unavailable'))
            );
            "#
        ))?;
        Ok(())
    }

    /// True when nothing was ever recorded, i.e. this is the first run.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {LEDGER_TABLE}"),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Full snapshot keyed by script name.
    pub fn read_all(&self) -> Result<BTreeMap<String, LedgerEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, name, content_fingerprint, text, applied_at, kind, status
             FROM {LEDGER_TABLE} ORDER BY name"
        ))?;

        let entries = stmt
            .query_map([], entry_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect())
    }

    pub fn get(&self, name: &str) -> Result<Option<LedgerEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, name, content_fingerprint, text, applied_at, kind, status
             FROM {LEDGER_TABLE} WHERE name = ?1"
        ))?;
        let mut rows = stmt.query_map(params![name], entry_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn insert_one(&mut self, entry: &NewEntry) -> Result<LedgerEntry> {
        let now = now_seconds();
        insert_entry(&self.conn, entry, now)?;
        let id = self.conn.last_insert_rowid();
        debug!("Recorded {} as {} (id {})", entry.name, entry.status, id);

        Ok(LedgerEntry {
            id,
            name: entry.name.clone(),
            fingerprint: entry.fingerprint.clone(),
            text: entry.text.clone(),
            applied_at: from_seconds(now),
            kind: entry.kind,
            status: entry.status,
        })
    }

    pub fn insert_many(&mut self, entries: &[NewEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let now = now_seconds();
        let tx = self.conn.transaction()?;
        for entry in entries {
            insert_entry(&tx, entry, now)?;
        }
        tx.commit()?;

        debug!("Recorded {} ledger entries", entries.len());
        Ok(entries.len())
    }

    /// Refresh fingerprint and text of existing rows in place, matched by id.
    pub fn update_fingerprints(&mut self, entries: &[LedgerEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "UPDATE {LEDGER_TABLE} SET content_fingerprint = ?1, text = ?2 WHERE id = ?3"
            ))?;
            for entry in entries {
                updated += stmt.execute(params![entry.fingerprint, entry.text, entry.id])?;
            }
        }
        tx.commit()?;

        debug!("Refreshed {} ledger fingerprints", updated);
        Ok(updated)
    }

    pub fn delete_by_ids(&mut self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare(&format!("DELETE FROM {LEDGER_TABLE} WHERE id = ?1"))?;
            for id in ids {
                deleted += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;

        debug!("Removed {} ledger entries", deleted);
        Ok(deleted)
    }
}

fn insert_entry(conn: &Connection, entry: &NewEntry, applied_at: f64) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "INSERT INTO {LEDGER_TABLE}
             (name, content_fingerprint, text, applied_at, kind, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        ),
        params![
            entry.name,
            entry.fingerprint,
            entry.text,
            applied_at,
            entry.kind,
            entry.status
        ],
    )
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        fingerprint: row.get(2)?,
        text: row.get(3)?,
        applied_at: from_seconds(row.get(4)?),
        kind: row.get(5)?,
        status: row.get(6)?,
    })
}

fn now_seconds() -> f64 {
    Utc::now().timestamp() as f64
}

fn from_seconds(seconds: f64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(seconds as i64, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ScriptStatus;
    use crate::script::{ScriptFile, ScriptKind};
    use crate::MigrunError;
    use std::path::PathBuf;

    fn script(name: &str, text: &str) -> ScriptFile {
        ScriptFile::from_text(name, PathBuf::from(name), text)
    }

    #[test]
    fn test_fresh_ledger_is_empty() {
        let store = LedgerStore::in_memory().unwrap();
        assert!(store.is_empty().unwrap());
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_insert_and_read_back() {
        let mut store = LedgerStore::in_memory().unwrap();
        let rollback = script("0001_a_rollback.sql", "drop table a;");
        let inserted = store.insert_one(&NewEntry::recorded(&rollback)).unwrap();

        assert!(!store.is_empty().unwrap());
        let all = store.read_all().unwrap();
        let entry = &all["0001_a_rollback.sql"];
        assert_eq!(entry.id, inserted.id);
        assert_eq!(entry.kind, ScriptKind::Rollback);
        assert_eq!(entry.status, ScriptStatus::NotExecuted);
        assert_eq!(entry.text.as_deref(), Some("drop table a;"));
        assert_eq!(entry.fingerprint, rollback.fingerprint);
        assert_eq!(entry.applied_at, inserted.applied_at);
    }

    #[test]
    fn test_names_are_unique() {
        let mut store = LedgerStore::in_memory().unwrap();
        let commit = script("0001_a.sql", "create table a (x int);");
        store.insert_one(&NewEntry::recorded(&commit)).unwrap();

        let result = store.insert_one(&NewEntry::recorded(&commit));
        assert!(matches!(result, Err(MigrunError::Ledger(_))));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_insert_many_is_atomic() {
        let mut store = LedgerStore::in_memory().unwrap();
        let a = script("0001_a.sql", "a");
        let b = script("0002_b.sql", "b");

        let batch = vec![NewEntry::recorded(&a), NewEntry::recorded(&b), NewEntry::recorded(&a)];
        assert!(store.insert_many(&batch).is_err());
        assert!(store.is_empty().unwrap());

        assert_eq!(store.insert_many(&batch[..2]).unwrap(), 2);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_update_fingerprint_in_place() {
        let mut store = LedgerStore::in_memory().unwrap();
        let original = script("0001_a_rollback.sql", "drop table a;");
        let entry = store.insert_one(&NewEntry::recorded(&original)).unwrap();

        let edited = script("0001_a_rollback.sql", "drop table a purge;");
        let refreshed = entry.refreshed_from(&edited);
        assert_eq!(store.update_fingerprints(&[refreshed]).unwrap(), 1);

        let stored = store.get("0001_a_rollback.sql").unwrap().unwrap();
        assert_eq!(stored.id, entry.id);
        assert_eq!(stored.fingerprint, edited.fingerprint);
        assert_eq!(stored.text.as_deref(), Some("drop table a purge;"));
    }

    #[test]
    fn test_delete_by_ids_leaves_others() {
        let mut store = LedgerStore::in_memory().unwrap();
        let a = store.insert_one(&NewEntry::recorded(&script("0001_a.sql", "a"))).unwrap();
        let b = store.insert_one(&NewEntry::recorded(&script("0002_b.sql", "b"))).unwrap();
        let c = store.insert_one(&NewEntry::recorded(&script("0003_c.sql", "c"))).unwrap();

        assert_eq!(store.delete_by_ids(&[a.id, c.id]).unwrap(), 2);
        let remaining: Vec<i64> = store.read_all().unwrap().values().map(|e| e.id).collect();
        assert_eq!(remaining, vec![b.id]);
    }

    #[test]
    fn test_ledger_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");

        let mut store = LedgerStore::open(&path).unwrap();
        store.insert_one(&NewEntry::recorded(&script("0001_a.sql", "a"))).unwrap();
        drop(store);

        let store = LedgerStore::open(&path).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }
}
