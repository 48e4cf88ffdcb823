use chrono::NaiveDate;
use std::fs::{self, File};
use std::fmt;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{RankError, Result};
use crate::snapshot::{ParsedSnapshot, SnapshotParser};

const CSV_NAME: &str = "top-1m.csv";
const ZIP_NAME: &str = "tranco.zip";

/// Where daily snapshots come from.
pub trait FeedSource: Sync {
    /// Opens the raw feed for `date`.
    fn open(&self, date: NaiveDate) -> Result<Box<dyn BufRead + Send>>;

    /// Human readable location of the feed for `date`, for logs and errors.
    fn describe(&self, date: NaiveDate) -> PathBuf;

    /// Number of lines in the feed for `date`, header included.
    fn row_count(&self, date: NaiveDate) -> Result<usize> {
        let reader = self.open(date)?;
        let mut count = 0;
        for line in reader.split(b'\n') {
            line.map_err(|e| self.unavailable(date, &e))?;
            count += 1;
        }
        Ok(count)
    }

    fn load_snapshot(&self, date: NaiveDate) -> Result<ParsedSnapshot> {
        let reader = self.open(date)?;
        SnapshotParser::parse_reader(date, reader).map_err(|e| self.unavailable(date, &e))
    }

    fn unavailable(&self, date: NaiveDate, reason: &dyn fmt::Display) -> RankError {
        RankError::SourceUnavailable {
            date,
            path: self.describe(date),
            reason: reason.to_string(),
        }
    }
}

/// Feed laid out as one directory per date:
/// `<root>/<YYYY-MM-DD>/top-1m.csv`, `<root>/<YYYY-MM-DD>/tranco.zip`, or a
/// flat `<root>/<YYYY-MM-DD>.csv`.
#[derive(Debug, Clone)]
pub struct DirectoryFeed {
    root: PathBuf,
}

impl DirectoryFeed {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn candidates(&self, date: NaiveDate) -> [PathBuf; 3] {
        let key = date.format("%Y-%m-%d").to_string();
        let day_dir = self.root.join(&key);
        [
            day_dir.join(CSV_NAME),
            day_dir.join(ZIP_NAME),
            self.root.join(format!("{}.csv", key)),
        ]
    }

    pub fn locate(&self, date: NaiveDate) -> Option<PathBuf> {
        self.candidates(date).into_iter().find(|p| p.is_file())
    }

    /// Dates inside `[start, end]` that have a readable feed file, ascending.
    pub fn available_dates(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        let mut dates = self.scan_dates()?;
        dates.retain(|d| *d >= start && *d <= end);
        Ok(dates)
    }

    /// Every date with a feed file under the root, ascending.
    pub fn scan_dates(&self) -> Result<Vec<NaiveDate>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut dates = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let key = name.strip_suffix(".csv").unwrap_or(name);
            if let Ok(date) = NaiveDate::parse_from_str(key, "%Y-%m-%d") {
                if self.locate(date).is_some() {
                    dates.push(date);
                }
            }
        }
        dates.sort_unstable();
        dates.dedup();

        info!(action = "scan", component = "directory_feed", root = ?self.root, date_count = dates.len(), "Scanned feed directory");
        Ok(dates)
    }

    fn open_zip(&self, date: NaiveDate, path: &Path) -> Result<Box<dyn BufRead + Send>> {
        let file = File::open(path).map_err(|e| self.unavailable(date, &e))?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| self.unavailable(date, &e))?;

        let member = if archive.file_names().any(|n| n == CSV_NAME) {
            CSV_NAME.to_string()
        } else {
            archive
                .file_names()
                .find(|n| n.ends_with(".csv"))
                .map(str::to_string)
                .ok_or_else(|| self.unavailable(date, &"archive holds no csv member"))?
        };

        let mut entry = archive
            .by_name(&member)
            .map_err(|e| self.unavailable(date, &e))?;
        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .map_err(|e| self.unavailable(date, &e))?;

        debug!(action = "open", component = "directory_feed", date = %date, member = %member, bytes = buf.len(), "Read csv from archive");
        Ok(Box::new(Cursor::new(buf)))
    }
}

impl FeedSource for DirectoryFeed {
    fn open(&self, date: NaiveDate) -> Result<Box<dyn BufRead + Send>> {
        let path = self
            .locate(date)
            .ok_or_else(|| self.unavailable(date, &"no feed file found"))?;

        if path.extension().is_some_and(|ext| ext == "zip") {
            return self.open_zip(date, &path);
        }

        let file = File::open(&path).map_err(|e| self.unavailable(date, &e))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn describe(&self, date: NaiveDate) -> PathBuf {
        self.locate(date)
            .unwrap_or_else(|| self.root.join(date.format("%Y-%m-%d").to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn write_csv(root: &Path, date: &str, body: &str) {
        let dir = root.join(date);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(CSV_NAME), body).unwrap();
    }

    fn write_zip(root: &Path, date: &str, member: &str, body: &str) {
        let dir = root.join(date);
        fs::create_dir_all(&dir).unwrap();
        let file = File::create(dir.join(ZIP_NAME)).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file(member, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(body.as_bytes()).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_reads_plain_csv() {
        let tmp = TempDir::new().unwrap();
        write_csv(tmp.path(), "2024-06-08", "rank,domain\n1,a.com\n2,b.com\n");

        let feed = DirectoryFeed::new(tmp.path());
        let parsed = feed.load_snapshot(day("2024-06-08")).unwrap();
        assert_eq!(parsed.snapshot.len(), 2);
        assert_eq!(feed.row_count(day("2024-06-08")).unwrap(), 3);
    }

    #[test]
    fn test_reads_zip_archive() {
        let tmp = TempDir::new().unwrap();
        write_zip(tmp.path(), "2024-06-09", "list.csv", "1,b.com\n2,c.com\n");

        let feed = DirectoryFeed::new(tmp.path());
        let parsed = feed.load_snapshot(day("2024-06-09")).unwrap();
        assert_eq!(parsed.snapshot.rank_of("c.com"), Some(2));
    }

    #[test]
    fn test_missing_source_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let feed = DirectoryFeed::new(tmp.path());
        let err = feed.load_snapshot(day("2024-06-10")).unwrap_err();
        assert!(err.is_source_unavailable());
    }

    #[test]
    fn test_scan_dates_filters_and_sorts() {
        let tmp = TempDir::new().unwrap();
        write_csv(tmp.path(), "2024-06-10", "1,a.com\n");
        write_csv(tmp.path(), "2024-06-08", "1,a.com\n");
        fs::write(tmp.path().join("2024-06-09.csv"), "1,a.com\n").unwrap();
        fs::create_dir_all(tmp.path().join("2024-06-11")).unwrap();
        fs::create_dir_all(tmp.path().join("not-a-date")).unwrap();

        let feed = DirectoryFeed::new(tmp.path());
        assert_eq!(
            feed.scan_dates().unwrap(),
            vec![day("2024-06-08"), day("2024-06-09"), day("2024-06-10")]
        );
        assert_eq!(
            feed.available_dates(day("2024-06-09"), day("2024-06-20")).unwrap(),
            vec![day("2024-06-09"), day("2024-06-10")]
        );
    }
}
