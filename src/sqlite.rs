use chrono::NaiveDate;
use rusqlite::{params, Connection, OpenFlags};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::error::{RankError, Result};
use crate::store::{DomainHistory, RankCell, TimeSeriesStore};

const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: &str = "
    CREATE TABLE domains (
        domain TEXT PRIMARY KEY,
        first_seen TEXT NOT NULL
    );
    CREATE TABLE snapshot_dates (
        date TEXT PRIMARY KEY
    );
    CREATE TABLE rankings (
        domain TEXT NOT NULL,
        date TEXT NOT NULL,
        rank INTEGER NOT NULL,
        PRIMARY KEY (domain, date)
    ) WITHOUT ROWID;
    CREATE INDEX rankings_by_date ON rankings (date);
";

/// Durable home of a [`TimeSeriesStore`].
pub trait StorePersistence {
    fn load(&self) -> Result<TimeSeriesStore>;
    fn save(&self, store: &TimeSeriesStore) -> Result<()>;
}

impl<P: StorePersistence + ?Sized> StorePersistence for &P {
    fn load(&self) -> Result<TimeSeriesStore> {
        (**self).load()
    }

    fn save(&self, store: &TimeSeriesStore) -> Result<()> {
        (**self).save(store)
    }
}

/// Single-file SQLite store. Saves are full rewrites into a sibling temp
/// file that is renamed over the live file once committed.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "store.db".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_all(conn: &mut Connection, store: &TimeSeriesStore) -> rusqlite::Result<usize> {
        conn.pragma_update(None, "synchronous", "FULL")?;
        let tx = conn.transaction()?;
        tx.execute_batch(SCHEMA)?;

        let mut cells = 0;
        {
            let mut insert_date = tx.prepare("INSERT INTO snapshot_dates (date) VALUES (?1)")?;
            for date in store.dates() {
                insert_date.execute(params![format_date(*date)])?;
            }

            let mut insert_domain =
                tx.prepare("INSERT INTO domains (domain, first_seen) VALUES (?1, ?2)")?;
            let mut insert_rank =
                tx.prepare("INSERT INTO rankings (domain, date, rank) VALUES (?1, ?2, ?3)")?;
            for (name, history) in store.domains() {
                insert_domain.execute(params![name, format_date(history.first_seen())])?;
                for (date, cell) in history.ranks() {
                    insert_rank.execute(params![name, format_date(*date), cell.to_raw()])?;
                    cells += 1;
                }
            }
        }

        tx.commit()?;
        Ok(cells)
    }

    fn read_all(conn: &Connection) -> Result<TimeSeriesStore> {
        let mut dates = BTreeSet::new();
        let mut stmt = conn.prepare("SELECT date FROM snapshot_dates")?;
        for row in stmt.query_map([], |row| row.get::<_, String>(0))? {
            dates.insert(parse_date(&row?)?);
        }

        let mut domains = BTreeMap::new();
        let mut stmt = conn.prepare("SELECT domain, first_seen FROM domains")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (name, first_seen) = row?;
            domains.insert(name, DomainHistory::new(parse_date(&first_seen)?));
        }

        let mut stmt = conn.prepare("SELECT domain, date, rank FROM rankings")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
            ))
        })?;
        for row in rows {
            let (name, date, rank) = row?;
            let history: &mut DomainHistory = domains.get_mut(&name).ok_or_else(|| {
                RankError::PersistenceFailure(format!("ranking row for unknown domain {}", name))
            })?;
            history.record(parse_date(&date)?, RankCell::from_raw(rank));
        }

        Ok(TimeSeriesStore::restore(domains, dates))
    }
}

impl StorePersistence for SqliteStore {
    fn load(&self) -> Result<TimeSeriesStore> {
        let start_time = Instant::now();
        if !self.path.exists() {
            info!(action = "load", component = "sqlite_store", path = ?self.path, "No store on disk, starting empty");
            return Ok(TimeSeriesStore::new());
        }

        let conn = Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let store = Self::read_all(&conn)?;

        info!(
            action = "load",
            component = "sqlite_store",
            path = ?self.path,
            domains = store.len(),
            dates = store.dates().len(),
            duration_ms = start_time.elapsed().as_millis(),
            "Store loaded"
        );
        Ok(store)
    }

    fn save(&self, store: &TimeSeriesStore) -> Result<()> {
        let start_time = Instant::now();
        let temp_path = self.temp_path();

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(persistence)?;
        }
        if temp_path.exists() {
            warn!(action = "discard", component = "sqlite_store", path = ?temp_path, "Removing stale temporary store");
            fs::remove_file(&temp_path).map_err(persistence)?;
        }

        let written = Connection::open(&temp_path)
            .and_then(|mut conn| {
                let cells = Self::write_all(&mut conn, store)?;
                conn.close().map_err(|(_, e)| e)?;
                Ok(cells)
            });
        let cells = match written {
            Ok(cells) => cells,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e.into());
            }
        };

        fs::rename(&temp_path, &self.path).map_err(persistence)?;

        info!(
            action = "save",
            component = "sqlite_store",
            path = ?self.path,
            domains = store.len(),
            dates = store.dates().len(),
            cells,
            duration_ms = start_time.elapsed().as_millis(),
            "Store saved"
        );
        Ok(())
    }
}

fn persistence(err: std::io::Error) -> RankError {
    RankError::PersistenceFailure(err.to_string())
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| RankError::PersistenceFailure(format!("bad date {:?} in store: {}", raw, e)))
}
