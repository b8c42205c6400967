//! Durable state: an append-only command log plus periodic full snapshots.
//!
//! `registry.snapshot` holds the complete state as of some log sequence;
//! `registry.log` holds every command appended since. Sequence numbers keep
//! counting across snapshots, and the snapshot header records the last one it
//! covers, so a crash between renaming a new snapshot and resetting the log
//! only leaves records that replay skips.

mod framing;
mod log;
mod snapshot;

pub use log::LogRecord;
pub use snapshot::SnapshotHeader;

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::events::EventReg;
use crate::index::ServiceReg;
use snapshot::{Snapshot, SnapshotRecord};

const LOG_MAGIC: &[u8; 4] = b"LDSL";
const SNAPSHOT_MAGIC: &[u8; 4] = b"LDSS";

pub const LOG_FILE: &str = "registry.log";
pub const SNAPSHOT_FILE: &str = "registry.snapshot";
const SNAPSHOT_TMP_FILE: &str = "registry.snapshot.tmp";

/// Durability of log appends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// fsync after every append
    #[default]
    Immediate,
    /// Leave flushing to the OS
    OsManaged,
}

/// When to fold the log into a new snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    /// Log records per live registration tolerated before snapshotting
    #[serde(default = "default_snapshot_weight")]
    pub snapshot_weight: f64,

    /// Minimum log records before a snapshot is considered
    #[serde(default = "default_log_to_snapshot_threshold")]
    pub log_to_snapshot_threshold: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            snapshot_weight: default_snapshot_weight(),
            log_to_snapshot_threshold: default_log_to_snapshot_threshold(),
        }
    }
}

fn default_snapshot_weight() -> f64 {
    10.0
}

fn default_log_to_snapshot_threshold() -> u64 {
    200
}

impl SnapshotPolicy {
    pub fn is_due(&self, records_since_snapshot: u64, population: usize) -> bool {
        records_since_snapshot >= self.log_to_snapshot_threshold
            && records_since_snapshot as f64 >= self.snapshot_weight * population as f64
    }
}

/// Everything read back from disk at startup.
#[derive(Debug)]
pub(crate) struct Recovered {
    pub header: Option<SnapshotHeader>,
    pub services: Vec<ServiceReg>,
    pub events: Vec<EventReg>,
    /// Log records newer than the snapshot, in append order
    pub log: Vec<LogRecord>,
}

/// Owner of the on-disk files.
pub(crate) struct Store {
    dir: PathBuf,
    sync_mode: SyncMode,
    log: File,
    /// Length of the log up to its last complete record
    log_len: u64,
    /// Set when a failed append could not be cut back out of the log
    needs_snapshot: bool,
    last_sequence: u64,
    records_since_snapshot: u64,
}

impl Store {
    /// Open the data directory and read back its contents.
    ///
    /// A torn final log record is dropped; any other damage is an error.
    pub fn open(dir: &Path, sync_mode: SyncMode) -> Result<(Self, Recovered), StoreError> {
        std::fs::create_dir_all(dir)?;

        let snapshot = match read_file(&dir.join(SNAPSHOT_FILE))? {
            Some(bytes) => {
                let scan = framing::scan::<SnapshotRecord<'static>>(&bytes, SNAPSHOT_MAGIC, SNAPSHOT_FILE)?;
                Some(Snapshot::assemble(scan.frames, SNAPSHOT_FILE)?)
            }
            None => None,
        };
        let covered = snapshot.as_ref().map_or(0, |s| s.header.log_sequence);

        let mut last_sequence = covered;
        let mut log = Vec::new();
        let mut valid_len = None;
        if let Some(bytes) = read_file(&dir.join(LOG_FILE))? {
            let scan = framing::scan::<LogRecord>(&bytes, LOG_MAGIC, LOG_FILE)?;
            if let Some(offset) = scan.torn_at {
                warn!(
                    file = LOG_FILE,
                    offset,
                    discarded = bytes.len() as u64 - offset,
                    "Ignoring incomplete final log record"
                );
                valid_len = Some(offset);
            }
            for frame in scan.frames {
                last_sequence = last_sequence.max(frame.sequence);
                if frame.sequence > covered {
                    log.push(frame.record);
                }
            }
        }

        let log_path = dir.join(LOG_FILE);
        let writer = match valid_len {
            // a torn header leaves nothing worth keeping
            Some(0) => create_log(&log_path)?,
            Some(len) => {
                let file = OpenOptions::new().write(true).open(&log_path)?;
                file.set_len(len)?;
                file.sync_all()?;
                append_log(&log_path)?
            }
            None if log_path.exists() => append_log(&log_path)?,
            None => create_log(&log_path)?,
        };

        info!(
            dir = %dir.display(),
            snapshot = snapshot.is_some(),
            log_records = log.len(),
            last_sequence,
            "Registry store opened"
        );

        let log_len = writer.metadata()?.len();
        let records_since_snapshot = log.len() as u64;
        let recovered = match snapshot {
            Some(s) => Recovered {
                header: Some(s.header),
                services: s.services,
                events: s.events,
                log,
            },
            None => Recovered {
                header: None,
                services: Vec::new(),
                events: Vec::new(),
                log,
            },
        };

        Ok((
            Self {
                dir: dir.to_path_buf(),
                sync_mode,
                log: writer,
                log_len,
                needs_snapshot: false,
                last_sequence,
                records_since_snapshot,
            },
            recovered,
        ))
    }

    /// Append one record; returns the number of records since the last
    /// snapshot.
    ///
    /// A failed write is cut back out of the log so later records stay
    /// readable. If that fails too, appends are refused until the next
    /// snapshot rewrites the log.
    pub fn append(&mut self, record: &LogRecord) -> Result<u64, StoreError> {
        if self.needs_snapshot {
            return Err(StoreError::NeedsSnapshot);
        }
        let sequence = self.last_sequence + 1;
        let frame = framing::encode(sequence, record)?;
        if let Err(e) = self.write_frame(&frame) {
            self.rollback();
            return Err(e);
        }
        self.log_len += frame.len() as u64;
        self.last_sequence = sequence;
        self.records_since_snapshot += 1;
        debug!(sequence, record = record.kind(), "Log record appended");
        Ok(self.records_since_snapshot)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), StoreError> {
        self.log.write_all(frame)?;
        if self.sync_mode == SyncMode::Immediate {
            self.log.sync_data()?;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        let len = self.log_len;
        match truncate_to(&mut self.log, len) {
            Ok(()) => warn!(log_len = len, "Log rolled back to last complete record"),
            Err(e) => {
                error!(log_len = len, error = %e, "Log rollback failed, appends suspended until snapshot");
                self.needs_snapshot = true;
            }
        }
    }

    /// Write a complete snapshot and reset the log.
    pub fn write_snapshot<'a>(
        &mut self,
        mut header: SnapshotHeader,
        services: impl Iterator<Item = &'a ServiceReg>,
        events: impl Iterator<Item = &'a EventReg>,
    ) -> Result<(), StoreError> {
        header.log_sequence = self.last_sequence;
        let tmp = self.dir.join(SNAPSHOT_TMP_FILE);
        let mut out = BufWriter::new(File::create(&tmp)?);
        framing::write_header(&mut out, SNAPSHOT_MAGIC)?;

        let mut sequence = 0u64;
        put(&mut out, &mut sequence, &SnapshotRecord::Header(header))?;
        let mut service_count = 0usize;
        for reg in services {
            put(&mut out, &mut sequence, &SnapshotRecord::Service(Cow::Borrowed(reg)))?;
            service_count += 1;
        }
        put(&mut out, &mut sequence, &SnapshotRecord::ServicesEnd)?;
        let mut event_count = 0usize;
        for reg in events {
            put(&mut out, &mut sequence, &SnapshotRecord::Event(Cow::Borrowed(reg)))?;
            event_count += 1;
        }
        put(&mut out, &mut sequence, &SnapshotRecord::EventsEnd)?;

        let file = out.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))?;
        sync_dir(&self.dir)?;

        self.log = create_log(&self.dir.join(LOG_FILE))?;
        self.log_len = framing::HEADER_SIZE as u64;
        self.needs_snapshot = false;
        self.records_since_snapshot = 0;

        info!(
            services = service_count,
            events = event_count,
            log_sequence = self.last_sequence,
            "Snapshot written"
        );
        Ok(())
    }

    pub fn records_since_snapshot(&self) -> u64 {
        self.records_since_snapshot
    }

    /// Fsync the log regardless of sync mode.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.log.sync_all()?;
        Ok(())
    }
}

fn put(
    out: &mut BufWriter<File>,
    sequence: &mut u64,
    record: &SnapshotRecord<'_>,
) -> Result<(), StoreError> {
    *sequence += 1;
    out.write_all(&framing::encode(*sequence, record)?)?;
    Ok(())
}

fn read_file(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn create_log(path: &Path) -> Result<File, StoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    framing::write_header(&mut file, LOG_MAGIC)?;
    file.sync_all()?;
    Ok(file)
}

fn truncate_to(file: &mut File, len: u64) -> std::io::Result<()> {
    file.set_len(len)?;
    file.seek(SeekFrom::Start(len))?;
    file.sync_data()
}

fn append_log(path: &Path) -> Result<File, StoreError> {
    Ok(OpenOptions::new().append(true).open(path)?)
}

/// Run blocking file work, handing the worker thread's other tasks to the
/// rest of the pool when the runtime has one.
pub(crate) fn blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}
