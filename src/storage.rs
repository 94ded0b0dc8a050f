//! File-backed event streams.
//!
//! Each stream is a JSONL log, one [`EventEnvelope`] per line. Appends take
//! an exclusive `fs2` lock on the log file, so the compare-and-append is
//! atomic across threads and processes sharing the directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;

use crate::backend::{BackendError, StreamBackend};
use crate::event::{EventEnvelope, ProposedEvent};
use crate::identity::{StreamIdentity, validate_segment};

/// File name of the event log inside a stream directory.
const LOG_FILE: &str = "events.jsonl";

/// Manages the on-disk directory layout for event streams.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     streams/
///         <domain>/
///             <entity_type>/
///                 <instance_key>/
///                     events.jsonl
///     meta/
///         streams.jsonl           -- stream registry
/// ```
#[derive(Debug, Clone)]
pub struct StreamLayout {
    base_dir: PathBuf,
}

impl StreamLayout {
    /// Create a new `StreamLayout` rooted at the given base directory.
    ///
    /// The directory does not need to exist yet; stream directories are
    /// created on first append.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the directory holding all instances of an entity type.
    pub fn entity_dir(&self, domain: &str, entity_type: &str) -> PathBuf {
        self.base_dir.join("streams").join(domain).join(entity_type)
    }

    /// Returns the path to a stream's directory.
    ///
    /// `<base_dir>/streams/<domain>/<entity_type>/<instance_key>`
    pub fn stream_dir(&self, identity: &StreamIdentity) -> PathBuf {
        self.entity_dir(&identity.domain, &identity.entity_type)
            .join(&identity.instance_key)
    }

    /// Returns the path to a stream's JSONL log.
    pub fn log_path(&self, identity: &StreamIdentity) -> PathBuf {
        self.stream_dir(identity).join(LOG_FILE)
    }

    /// Returns the path to the metadata directory.
    pub fn meta_dir(&self) -> PathBuf {
        self.base_dir.join("meta")
    }

    /// Record a stream in `meta/streams.jsonl`.
    ///
    /// Idempotent: an identity already present is not added twice.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if directory creation or file I/O fails.
    pub fn register_stream(&self, identity: &StreamIdentity) -> io::Result<()> {
        let meta = self.meta_dir();
        fs::create_dir_all(&meta)?;
        let registry_path = meta.join("streams.jsonl");

        let already_registered = registry_path
            .exists()
            .then(|| -> io::Result<bool> {
                let reader = BufReader::new(File::open(&registry_path)?);
                for line in reader.lines() {
                    let line = line?;
                    if line.is_empty() {
                        continue;
                    }
                    // Compare structurally rather than by string matching.
                    if let Ok(entry) = serde_json::from_str::<serde_json::Value>(&line)
                        && entry.get("domain").and_then(|v| v.as_str())
                            == Some(identity.domain.as_str())
                        && entry.get("type").and_then(|v| v.as_str())
                            == Some(identity.entity_type.as_str())
                        && entry.get("key").and_then(|v| v.as_str())
                            == Some(identity.instance_key.as_str())
                    {
                        return Ok(true);
                    }
                }
                Ok(false)
            })
            .transpose()?
            .unwrap_or(false);

        if !already_registered {
            let entry = serde_json::json!({
                "domain": identity.domain,
                "type": identity.entity_type,
                "key": identity.instance_key,
                "stream_id": identity.stream_id(),
                "ts": Utc::now().timestamp(),
            });
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&registry_path)?;
            writeln!(file, "{entry}")?;
        }
        Ok(())
    }

    /// Lists instance keys of an entity type whose log holds any data.
    ///
    /// Returns a sorted vector, empty if the entity directory does not exist.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if reading the directory fails for a reason
    /// other than the directory not existing.
    pub fn list_streams(&self, domain: &str, entity_type: &str) -> io::Result<Vec<String>> {
        let entries = match fs::read_dir(self.entity_dir(domain, entity_type)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut keys: Vec<String> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let has_events = fs::metadata(entry.path().join(LOG_FILE))
                    .map(|m| m.len() > 0)
                    .unwrap_or(false);
                has_events.then(|| entry.file_name().to_string_lossy().into_owned())
            })
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Parsed contents of a log file.
struct LogScan {
    events: Vec<EventEnvelope>,
    /// Sequence number of the last complete envelope, 0 if none.
    tail: u64,
    /// Byte length covered by complete lines.
    valid_len: u64,
}

/// Parse a JSONL log.
///
/// A final line without a terminating newline is a torn write from an
/// interrupted append; it is ignored. Complete lines must parse and carry
/// contiguous sequence numbers.
fn scan_log(bytes: &[u8], path: &Path, from_sequence: u64) -> io::Result<LogScan> {
    let mut events = Vec::new();
    let mut offset = 0usize;
    let mut expected_sequence = 1u64;

    while let Some(newline) = bytes[offset..].iter().position(|b| *b == b'\n') {
        let line = &bytes[offset..offset + newline];
        offset += newline + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let envelope: EventEnvelope = serde_json::from_slice(line).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("corrupt event at {}: {e}", path.display()),
            )
        })?;
        if envelope.sequence_number != expected_sequence {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "sequence gap at {}: expected {expected_sequence}, found {}",
                    path.display(),
                    envelope.sequence_number
                ),
            ));
        }
        expected_sequence += 1;
        if envelope.sequence_number >= from_sequence {
            events.push(envelope);
        }
    }

    if offset < bytes.len() {
        tracing::warn!(
            path = %path.display(),
            torn_bytes = bytes.len() - offset,
            "ignoring torn trailing line in event log"
        );
    }

    Ok(LogScan {
        events,
        tail: expected_sequence - 1,
        valid_len: offset as u64,
    })
}

/// Read a log file, treating a missing file as an empty stream.
fn read_log(path: &Path, from_sequence: u64) -> io::Result<LogScan> {
    match fs::read(path) {
        Ok(bytes) => scan_log(&bytes, path, from_sequence),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LogScan {
            events: Vec::new(),
            tail: 0,
            valid_len: 0,
        }),
        Err(e) => Err(e),
    }
}

/// Durable [`StreamBackend`] storing one JSONL log per stream.
///
/// File I/O runs on tokio's blocking pool. Once started, an append runs to
/// completion even if the awaiting future is dropped. An append is only
/// acknowledged after its line is synced; a failed sync truncates the line
/// away again and reports the I/O error.
#[derive(Debug, Clone)]
pub struct FileBackend {
    layout: StreamLayout,
}

impl FileBackend {
    /// Create a backend rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: StreamLayout::new(base_dir),
        }
    }

    /// The directory layout used by this backend.
    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    fn checked(identity: &StreamIdentity) -> Result<(), BackendError> {
        identity.validate().map_err(BackendError::InvalidIdentity)
    }
}

/// Run blocking file work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, BackendError>
where
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackendError::Io(io::Error::other(e)))?
}

fn append_locked(
    file: &mut File,
    path: &Path,
    expected_tail: Option<u64>,
    event: ProposedEvent,
    logged_at: DateTime<Utc>,
) -> Result<EventEnvelope, BackendError> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut bytes)?;
    let scan = scan_log(&bytes, path, u64::MAX)?;

    // Last line has no newline, so it was never acknowledged.
    if scan.valid_len < bytes.len() as u64 {
        file.set_len(scan.valid_len)?;
    }

    let actual = scan.tail;
    if let Some(expected) = expected_tail
        && expected != actual
    {
        return Err(BackendError::TailMismatch { actual });
    }

    let envelope = EventEnvelope::commit(event, actual + 1, logged_at);
    let mut line = serde_json::to_vec(&envelope).map_err(io::Error::other)?;
    line.push(b'\n');
    write_line(file, scan.valid_len, &line)?;
    Ok(envelope)
}

/// File operations needed to commit one line.
trait LogFile: Write + Seek {
    fn sync_data(&mut self) -> io::Result<()>;
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

/// Write `line` at `valid_len` and sync it.
///
/// If either step fails the log is cut back to `valid_len`: a line whose
/// append reported an error must never be read back as committed.
fn write_line(file: &mut impl LogFile, valid_len: u64, line: &[u8]) -> io::Result<()> {
    let written = file
        .seek(SeekFrom::Start(valid_len))
        .and_then(|_| file.write_all(line))
        .and_then(|()| file.sync_data());
    if let Err(e) = written {
        if let Err(undo) = file.set_len(valid_len) {
            tracing::warn!(error = %undo, "could not roll back unsynced event line");
        }
        return Err(e);
    }
    Ok(())
}

#[async_trait]
impl StreamBackend for FileBackend {
    async fn tail(&self, identity: &StreamIdentity) -> Result<u64, BackendError> {
        Self::checked(identity)?;
        let path = self.layout.log_path(identity);
        blocking(move || Ok(read_log(&path, u64::MAX)?.tail)).await
    }

    async fn read_from(
        &self,
        identity: &StreamIdentity,
        from_sequence: u64,
    ) -> Result<Vec<EventEnvelope>, BackendError> {
        Self::checked(identity)?;
        let path = self.layout.log_path(identity);
        blocking(move || Ok(read_log(&path, from_sequence)?.events)).await
    }

    async fn append(
        &self,
        identity: &StreamIdentity,
        expected_tail: Option<u64>,
        event: ProposedEvent,
        logged_at: DateTime<Utc>,
    ) -> Result<EventEnvelope, BackendError> {
        Self::checked(identity)?;
        let layout = self.layout.clone();
        let identity = identity.clone();
        blocking(move || {
            let dir = layout.stream_dir(&identity);
            fs::create_dir_all(&dir)?;
            let path = dir.join(LOG_FILE);
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            // Released when `file` is dropped.
            file.lock_exclusive()?;
            let envelope = append_locked(&mut file, &path, expected_tail, event, logged_at)?;
            // The event is committed at this point; a registry failure must
            // not turn it into a reported failure.
            if envelope.sequence_number == 1
                && let Err(e) = layout.register_stream(&identity)
            {
                tracing::warn!(stream = %identity, error = %e, "stream registry update failed");
            }
            Ok(envelope)
        })
        .await
    }

    async fn list_instances(
        &self,
        domain: &str,
        entity_type: &str,
    ) -> Result<Vec<String>, BackendError> {
        validate_segment("domain", domain).map_err(BackendError::InvalidIdentity)?;
        validate_segment("entity_type", entity_type).map_err(BackendError::InvalidIdentity)?;
        let layout = self.layout.clone();
        let (domain, entity_type) = (domain.to_owned(), entity_type.to_owned());
        blocking(move || Ok(layout.list_streams(&domain, &entity_type)?)).await
    }
}
