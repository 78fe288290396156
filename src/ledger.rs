use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::types::{EntryStatus, LedgerEntry};

pub const HEADER: [&str; 7] = [
    "identity",
    "primary_style",
    "secondary_style",
    "description",
    "processed_at",
    "status",
    "failure_kind",
];

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger {} is corrupt at line {line}: {reason}", .path.display())]
    Corrupt {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    #[error("ledger {} I/O error: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode ledger row: {0}")]
    Encode(#[from] csv::Error),
}

/// Durable record of finished work items.
pub trait Ledger: Send + Sync + 'static {
    /// True once the item has a success or a terminal failure on record.
    fn has(&self, identity: &str) -> bool;

    /// Appends `entry`. When this returns `Ok`, the row is on disk.
    fn record(&self, entry: LedgerEntry) -> Result<(), LedgerError>;

    /// Every row currently in the durable store, in write order.
    fn load(&self) -> Result<Vec<LedgerEntry>, LedgerError>;
}

/// Append-only CSV ledger. Each row is written with one `write` call and
/// synced before `record` returns.
pub struct CsvLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

struct LedgerState {
    file: File,
    latest: HashMap<String, LedgerEntry>,
}

impl CsvLedger {
    /// Opens (or creates) the ledger, failing if the existing file does not
    /// parse cleanly.
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let entries = read_entries(path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| io_error(path, source))?;

        let len = file
            .metadata()
            .map_err(|source| io_error(path, source))?
            .len();
        if len == 0 {
            let header = encode_header()?;
            file.write_all(&header)
                .and_then(|_| file.sync_data())
                .map_err(|source| io_error(path, source))?;
            sync_parent_dir(path).map_err(|source| io_error(path, source))?;
            tracing::info!("Created new ledger");
        }

        let rows = entries.len();
        let latest: HashMap<_, _> = entries
            .into_iter()
            .map(|entry| (entry.identity.clone(), entry))
            .collect();
        tracing::info!(rows, identities = latest.len(), "Ledger loaded");

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(LedgerState { file, latest }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Ledger for CsvLedger {
    fn has(&self, identity: &str) -> bool {
        self.state().latest.contains_key(identity)
    }

    fn record(&self, entry: LedgerEntry) -> Result<(), LedgerError> {
        let row = encode_entry(&entry)?;
        let mut state = self.state();
        state
            .file
            .write_all(&row)
            .and_then(|_| state.file.sync_data())
            .map_err(|source| io_error(&self.path, source))?;
        tracing::debug!(identity = %entry.identity, status = ?entry.status, "Ledger row appended");
        state.latest.insert(entry.identity.clone(), entry);
        Ok(())
    }

    fn load(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        read_entries(&self.path)
    }
}

/// Reads every row of the ledger at `path`. A missing or empty file is an
/// empty ledger.
pub fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(io_error(path, source)),
    };
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let corrupt = |line: u64, reason: String| LedgerError::Corrupt {
        path: path.to_path_buf(),
        line,
        reason,
    };

    if !bytes.ends_with(b"\n") {
        let partial = last_row_start(&bytes);
        let offset = partial.byte();
        return Err(corrupt(
            partial.line(),
            format!(
                "final row is truncated at byte {offset}, \
                 truncating the file to {offset} bytes drops the partial row and recovers the ledger"
            ),
        ));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes.as_slice());
    let headers = reader
        .headers()
        .map_err(|err| corrupt(1, err.to_string()))?
        .clone();
    if !headers.iter().eq(HEADER.iter().copied()) {
        return Err(corrupt(
            1,
            format!("unexpected header {:?}", headers.iter().collect::<Vec<_>>()),
        ));
    }

    let mut entries = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|err| {
            let line = err.position().map(|pos| pos.line()).unwrap_or(0);
            corrupt(line, err.to_string())
        })?;
        let line = record.position().map(|pos| pos.line()).unwrap_or(0);
        let entry: LedgerEntry = record
            .deserialize(Some(&headers))
            .map_err(|err| corrupt(line, err.to_string()))?;
        check_entry(&entry).map_err(|reason| corrupt(line, reason.to_string()))?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Where the final row begins. Found with the CSV parser so newlines inside
/// quoted fields are not taken for row breaks.
fn last_row_start(bytes: &[u8]) -> csv::Position {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut record = csv::ByteRecord::new();
    let mut start = csv::Position::new();
    while let Ok(true) = reader.read_byte_record(&mut record) {
        if let Some(pos) = record.position() {
            start = pos.clone();
        }
    }
    start
}

fn check_entry(entry: &LedgerEntry) -> Result<(), &'static str> {
    if entry.identity.is_empty() {
        return Err("empty identity");
    }
    match (entry.status, entry.failure_kind) {
        (EntryStatus::Succeeded, None) | (EntryStatus::Failed, Some(_)) => Ok(()),
        (EntryStatus::Succeeded, Some(_)) => Err("succeeded row carries a failure kind"),
        (EntryStatus::Failed, None) => Err("failed row has no failure kind"),
    }
}

fn encode_header() -> Result<Vec<u8>, LedgerError> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(HEADER)?;
    finish(writer)
}

fn encode_entry(entry: &LedgerEntry) -> Result<Vec<u8>, LedgerError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.serialize(entry)?;
    finish(writer)
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, LedgerError> {
    writer
        .into_inner()
        .map_err(|err| LedgerError::Encode(csv::Error::from(err.into_error())))
}

fn io_error(path: &Path, source: std::io::Error) -> LedgerError {
    LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
