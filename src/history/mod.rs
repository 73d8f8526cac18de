//! Write-once call history.
//!
//! Layout: `{root}/{server}/{caller}/{timestamp}.json`. A record is written to
//! a temp file in the caller directory and then persisted without clobbering,
//! so readers never see a partial file and nothing is overwritten. A second
//! record for the same caller and second lands in `{timestamp}-{n}.json`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::telemetry::{log_security_event, SecurityEvent};

/// Upper bound on same-second collisions for one caller.
const MAX_SUFFIX: u32 = 100_000;

/// Directory name used for callers without a usable address.
const ANONYMOUS: &str = "anonymous";

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("History I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("History encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("No free history slot for timestamp {0}")]
    Exhausted(i64),
}

/// One completed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub module: String,
    #[serde(rename = "fn")]
    pub function: String,
    pub address: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub success: bool,
    /// Access decision the call was admitted under.
    #[serde(default)]
    pub user: Value,
    /// Request timestamp (unix seconds).
    pub timestamp: i64,
    pub result: Value,
    /// Invocation latency in seconds.
    pub latency: f64,
}

/// A record read back from disk.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub path: PathBuf,
    /// Collision suffix; 0 for the first record of a second.
    pub sequence: u32,
    pub record: HistoryRecord,
}

impl HistoryEntry {
    pub fn seconds_ago(&self, now: i64) -> i64 {
        now.saturating_sub(self.record.timestamp)
    }

    fn order_key(&self) -> (i64, u32) {
        (self.record.timestamp, self.sequence)
    }
}

/// History of one server.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    root: PathBuf,
    server: String,
}

impl HistoryStore {
    pub fn new(root: impl Into<PathBuf>, server: &str) -> Self {
        Self {
            root: root.into(),
            server: sanitize_component(server),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn server_dir(&self) -> PathBuf {
        self.root.join(&self.server)
    }

    pub fn caller_dir(&self, caller: &str) -> PathBuf {
        self.server_dir().join(sanitize_component(caller))
    }

    /// Persist a record. Blocking; run it off the async workers.
    pub fn append(&self, record: &HistoryRecord) -> Result<PathBuf, HistoryError> {
        let dir = self.caller_dir(&record.address);
        fs::create_dir_all(&dir)?;

        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer(&mut file, record)?;
        file.flush()?;

        for sequence in 0..MAX_SUFFIX {
            let path = dir.join(file_name(record.timestamp, sequence));
            match file.persist_noclobber(&path) {
                Ok(_) => return Ok(path),
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => file = e.file,
                Err(e) => return Err(HistoryError::Io(e.error)),
            }
        }
        Err(HistoryError::Exhausted(record.timestamp))
    }

    /// Records of one caller, or of every caller, in arrival order.
    ///
    /// Unreadable files are skipped with a warning.
    pub fn list(&self, caller: Option<&str>) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut entries = Vec::new();
        match caller {
            Some(caller) => read_caller_dir(&self.caller_dir(caller), &mut entries)?,
            None => {
                let server_dir = self.server_dir();
                if !server_dir.is_dir() {
                    return Ok(entries);
                }
                for dir in fs::read_dir(&server_dir)? {
                    let dir = dir?.path();
                    if dir.is_dir() {
                        read_caller_dir(&dir, &mut entries)?;
                    }
                }
            }
        }
        entries.sort_by_key(HistoryEntry::order_key);
        Ok(entries)
    }

    /// Newest `n` records across all callers, oldest first.
    pub fn recent(&self, n: usize) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut entries = self.list(None)?;
        let skip = entries.len().saturating_sub(n);
        Ok(entries.split_off(skip))
    }

    /// Delete one caller's records. Returns how many were removed.
    pub fn purge_caller(&self, caller: &str) -> Result<usize, HistoryError> {
        let removed = remove_tree(&self.caller_dir(caller))?;
        log_purge(&self.server, Some(caller), removed);
        Ok(removed)
    }

    /// Delete every record of this server.
    pub fn purge_server(&self) -> Result<usize, HistoryError> {
        let removed = remove_tree(&self.server_dir())?;
        log_purge(&self.server, None, removed);
        Ok(removed)
    }

    /// Delete every record of every server under `root`.
    pub fn purge_all(root: &Path) -> Result<usize, HistoryError> {
        let removed = remove_tree(root)?;
        log_purge("*", None, removed);
        Ok(removed)
    }
}

fn file_name(timestamp: i64, sequence: u32) -> String {
    if sequence == 0 {
        format!("{}.json", timestamp)
    } else {
        format!("{}-{}.json", timestamp, sequence)
    }
}

/// `"{ts}"` or `"{ts}-{n}"`. Negative timestamps keep their sign.
fn parse_stem(stem: &str) -> Option<(i64, u32)> {
    let (digits, offset) = match stem.strip_prefix('-') {
        Some(rest) => (rest, 1),
        None => (stem, 0),
    };
    match digits.split_once('-') {
        Some((ts, seq)) => {
            let ts = stem[..offset + ts.len()].parse().ok()?;
            Some((ts, seq.parse().ok()?))
        }
        None => Some((stem.parse().ok()?, 0)),
    }
}

fn read_caller_dir(dir: &Path, entries: &mut Vec<HistoryEntry>) -> Result<(), HistoryError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for file in fs::read_dir(dir)? {
        let path = file?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some((_, sequence)) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(parse_stem)
        else {
            continue;
        };
        let record = fs::read(&path)
            .map_err(HistoryError::from)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(HistoryError::from));
        match record {
            Ok(record) => entries.push(HistoryEntry {
                path,
                sequence,
                record,
            }),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable history record"),
        }
    }
    Ok(())
}

/// Remove a directory tree, counting the records in it.
fn remove_tree(dir: &Path) -> Result<usize, HistoryError> {
    if !dir.exists() {
        return Ok(0);
    }
    let count = count_records(dir)?;
    fs::remove_dir_all(dir)?;
    Ok(count)
}

fn count_records(dir: &Path) -> Result<usize, HistoryError> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            count += count_records(&path)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            count += 1;
        }
    }
    Ok(count)
}

fn log_purge(server: &str, caller: Option<&str>, removed: usize) {
    let removed = removed.to_string();
    log_security_event(
        SecurityEvent::HistoryPurged,
        "History records deleted",
        &[
            ("server", server),
            ("caller", caller.unwrap_or("*")),
            ("removed", removed.as_str()),
        ],
    );
}

/// Make a caller or server name safe to use as one path component.
///
/// SECURITY: Separators and dot-only names would escape the history root.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        ANONYMOUS.to_string()
    } else {
        cleaned
    };
    if cleaned != raw && !raw.is_empty() {
        log_security_event(
            SecurityEvent::PathSanitized,
            "Unsafe history path component rewritten",
            &[("raw", raw), ("sanitized", cleaned.as_str())],
        );
    }
    cleaned
}
