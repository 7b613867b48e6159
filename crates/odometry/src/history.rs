//! Append-only odometry history.
//!
//! One JSON record per line. The file is only ever appended to, except by
//! `reset`, which truncates. Recovery reads the last complete line; a
//! torn final line from a crash mid-write is skipped.

use crate::OdometryError;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use types::HistoryRecord;

pub struct History {
    path: PathBuf,
    writer: BufWriter<File>,
    fsync: bool,
}

impl History {
    /// Open (creating if missing) and return the last recorded entry.
    pub fn open(path: &Path, fsync: bool) -> Result<(Self, Option<HistoryRecord>), OdometryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let last = Self::read_last(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if let Some(record) = &last {
            info!(
                path = %path.display(),
                x = record.pose.x_mm,
                y = record.pose.y_mm,
                theta = record.pose.theta_deg,
                "Restored pose from history"
            );
        }
        Ok((
            Self {
                path: path.to_path_buf(),
                writer: BufWriter::new(file),
                fsync,
            },
            last,
        ))
    }

    fn read_last(path: &Path) -> Result<Option<HistoryRecord>, OdometryError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut last = None;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(&line) {
                Ok(record) => last = Some(record),
                // Torn or corrupt line: keep whatever parsed before it.
                Err(e) => warn!(?e, "Skipping unparseable history line"),
            }
        }
        Ok(last)
    }

    /// Append one record and flush the line to the OS.
    pub fn append(&mut self, record: &HistoryRecord) -> Result<(), OdometryError> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        if self.fsync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Truncate the file and write a single record.
    pub fn reset(&mut self, record: &HistoryRecord) -> Result<(), OdometryError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.append(record)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
