//! Bounded per-service log store with live fan-out and an optional file sink
//!
//! The entry store, the subscriber set and the file sink sit behind three
//! independent locks. A slow disk write never holds up subscriber delivery,
//! and registering a live tail never waits on a store mutation.

use super::entry::{LogEntry, LogLevel};
use super::filter::LogFilter;
use chrono::{DateTime, Local};
use std::collections::{HashMap, VecDeque};
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Default number of entries kept per service
pub const DEFAULT_CAPACITY: usize = 1000;
/// Default channel size for each live subscriber
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;
/// Size at which the sink file is rotated (1 MiB)
pub const MAX_LOG_FILE_SIZE: u64 = 1024 * 1024;
/// Number of rotated files kept next to the active one
pub const MAX_LOG_FILE_BACKUPS: usize = 2;
/// Sink directory, relative to the project root
pub const LOGS_DIR: &str = ".azure/logs";

/// Path of a service's sink file under a project directory
pub fn log_file_path(project_dir: &Path, service: &str) -> PathBuf {
    project_dir.join(LOGS_DIR).join(format!("{}.log", service))
}

/// Errors raised while setting up or tearing down a log buffer
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("Failed to create log directory '{}': {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open log file '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to flush log file '{}': {source}", path.display())]
    Flush {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No log buffer for service '{0}'")]
    UnknownService(String),
}

/// A live tail registered on a [`LogBuffer`]
///
/// Delivery is best-effort: entries that arrive while the channel is full are
/// dropped for this subscriber only. `recv` returns `None` once the buffer is
/// closed or the subscription is removed and the channel is drained.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<LogEntry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next entry
    pub async fn recv(&mut self) -> Option<LogEntry> {
        self.rx.recv().await
    }

    /// Take the next queued entry without waiting
    pub fn try_recv(&mut self) -> Option<LogEntry> {
        self.rx.try_recv().ok()
    }

    /// Whether the sending side has been torn down
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }
}

/// Append-only file sink with size-based rotation
struct LogSink {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
}

impl LogSink {
    fn open(path: PathBuf) -> Result<Self, LogError> {
        if let Some(dir) = path.parent() {
            let mut builder = DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(0o700);
            }
            builder.create(dir).map_err(|e| LogError::CreateDir {
                path: dir.to_path_buf(),
                source: e,
            })?;
        }

        let file = open_sink_file(&path, false).map_err(|e| LogError::Open {
            path: path.clone(),
            source: e,
        })?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            size,
        })
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        if self.size >= MAX_LOG_FILE_SIZE {
            self.rotate()?;
        }
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.size += line.len() as u64 + 1;
        Ok(())
    }

    /// Shift `<file>.1` to `<file>.2`, move the active file to `<file>.1`,
    /// and start a fresh one
    fn rotate(&mut self) -> io::Result<()> {
        self.writer.flush()?;

        for i in (1..MAX_LOG_FILE_BACKUPS).rev() {
            let from = backup_path(&self.path, i);
            let to = backup_path(&self.path, i + 1);
            // missing backups are expected on the first rotations
            let _ = std::fs::rename(from, to);
        }
        if let Err(e) = std::fs::rename(&self.path, backup_path(&self.path, 1)) {
            log::debug!("Failed to rotate {}: {}", self.path.display(), e);
        }

        let file = open_sink_file(&self.path, true)?;
        self.writer = BufWriter::new(file);
        self.size = 0;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", index));
    PathBuf::from(name)
}

fn open_sink_file(path: &Path, truncate: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true);
    if truncate {
        options.write(true).truncate(true);
    } else {
        options.append(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bounded, queryable log history for one service
pub struct LogBuffer {
    service: String,
    capacity: usize,
    subscriber_capacity: usize,
    entries: RwLock<VecDeque<LogEntry>>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<LogEntry>>>,
    sink: Mutex<Option<LogSink>>,
    file_path: Option<PathBuf>,
    filter: Option<Arc<LogFilter>>,
    next_subscriber: AtomicU64,
    closed: AtomicBool,
}

impl LogBuffer {
    /// Create an in-memory buffer holding at most `capacity` entries
    pub fn new(service: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            service: service.into(),
            capacity,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            subscribers: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
            file_path: None,
            filter: None,
            next_subscriber: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a buffer that also appends every entry to
    /// `<project_dir>/.azure/logs/<service>.log`
    pub fn with_file_sink(
        service: impl Into<String>,
        capacity: usize,
        project_dir: &Path,
    ) -> Result<Self, LogError> {
        let mut buffer = Self::new(service, capacity);
        let path = log_file_path(project_dir, &buffer.service);
        let sink = LogSink::open(path.clone())?;
        buffer.sink = Mutex::new(Some(sink));
        buffer.file_path = Some(path);
        Ok(buffer)
    }

    /// Set the channel size handed to each new subscriber
    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity.max(1);
        self
    }

    /// Drop entries whose message matches `filter`
    pub fn with_filter(mut self, filter: Arc<LogFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sink file, if file logging is enabled
    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Append an entry, evicting the oldest one when full, then persist it
    /// to the sink and hand it to every live subscriber. Filtered entries
    /// are dropped.
    pub fn add(&self, entry: LogEntry) {
        if self.is_closed() {
            return;
        }
        if self
            .filter
            .as_ref()
            .is_some_and(|f| f.should_filter(&entry.message))
        {
            return;
        }

        {
            let mut entries = self
                .entries
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        self.write_to_sink(&entry);
        self.broadcast(entry);
    }

    fn write_to_sink(&self, entry: &LogEntry) {
        let mut sink = lock(&self.sink);
        if let Some(sink) = sink.as_mut() {
            if let Err(e) = sink.write_line(&entry.format_line()) {
                log::warn!(
                    "[{}] Failed to write log entry to {}: {}",
                    self.service,
                    sink.path.display(),
                    e
                );
            }
        }
    }

    /// Non-blocking send to every subscriber; full channels drop the entry,
    /// dropped receivers are pruned
    fn broadcast(&self, entry: LogEntry) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|id, tx| match tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::trace!(
                    "[{}] Dropped log entry for slow subscriber {}",
                    self.service,
                    id
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Register a live tail
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);

        if !self.is_closed() {
            let mut subscribers = lock(&self.subscribers);
            // re-check under the lock so close() cannot miss this sender
            if !self.is_closed() {
                subscribers.insert(id, tx);
            }
        }

        Subscription { id, rx }
    }

    /// Remove a live tail and close its channel. Unknown ids are ignored.
    pub fn unsubscribe(&self, subscription_id: u64) {
        lock(&self.subscribers).remove(&subscription_id);
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Terminate every subscription and flush the sink. Later calls to
    /// `add` are ignored.
    pub fn close(&self) -> Result<(), LogError> {
        let mut subscribers = lock(&self.subscribers);
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let senders: Vec<_> = subscribers.drain().map(|(_, tx)| tx).collect();
        drop(subscribers);
        drop(senders);

        if let Some(mut sink) = lock(&self.sink).take() {
            sink.flush().map_err(|e| LogError::Flush {
                path: sink.path.clone(),
                source: e,
            })?;
        }

        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, VecDeque<LogEntry>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Last `n` entries in insertion order; `0` or an oversized `n` returns
    /// everything
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.read();
        let n = if n == 0 || n > entries.len() {
            entries.len()
        } else {
            n
        };
        entries.iter().skip(entries.len() - n).cloned().collect()
    }

    /// Entries stamped at or after `since`
    pub fn since(&self, since: DateTime<Local>) -> Vec<LogEntry> {
        self.read()
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect()
    }

    pub fn by_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.read()
            .iter()
            .filter(|e| e.level == level)
            .cloned()
            .collect()
    }

    /// Whether any stored message contains `pattern`
    pub fn contains(&self, pattern: &str) -> bool {
        if pattern.is_empty() {
            return false;
        }
        self.read().iter().any(|e| e.message.contains(pattern))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop all stored entries; subscribers and the sink are untouched
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl std::fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffer")
            .field("service", &self.service)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("file_path", &self.file_path)
            .field("filtered", &self.filter.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(msg: &str) -> LogEntry {
        LogEntry::new("api", msg, false)
    }

    #[test]
    fn test_eviction_keeps_last_entries_in_order() {
        let buffer = LogBuffer::new("api", 3);
        for i in 0..5 {
            buffer.add(entry(&format!("line {}", i)));
        }

        let recent: Vec<_> = buffer.recent(3).into_iter().map(|e| e.message).collect();
        assert_eq!(recent, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_recent_bounds() {
        let buffer = LogBuffer::new("api", 10);
        for i in 0..4 {
            buffer.add(entry(&format!("line {}", i)));
        }

        assert_eq!(buffer.recent(0).len(), 4);
        assert_eq!(buffer.recent(100).len(), 4);
        let last: Vec<_> = buffer.recent(2).into_iter().map(|e| e.message).collect();
        assert_eq!(last, vec!["line 2", "line 3"]);
    }

    #[test]
    fn test_recent_returns_independent_copy() {
        let buffer = LogBuffer::new("api", 10);
        buffer.add(entry("first"));
        let snapshot = buffer.recent(0);
        buffer.clear();
        assert_eq!(snapshot.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_since_and_by_level() {
        let buffer = LogBuffer::new("api", 10);
        let now = Local::now();
        buffer.add(entry("old info").at(now - Duration::seconds(10)));
        buffer.add(entry("Error: boom").at(now));
        buffer.add(entry("warning: slow").at(now + Duration::seconds(1)));

        let since: Vec<_> = buffer.since(now).into_iter().map(|e| e.message).collect();
        assert_eq!(since, vec!["Error: boom", "warning: slow"]);

        assert_eq!(buffer.by_level(LogLevel::Error).len(), 1);
        assert_eq!(buffer.by_level(LogLevel::Warn).len(), 1);
        assert_eq!(buffer.by_level(LogLevel::Debug).len(), 0);
    }

    #[tokio::test]
    async fn test_filtered_entries_are_dropped() {
        let filter = LogFilter::with_builtins(["^GET /health"]).unwrap();
        let buffer = LogBuffer::new("web", 10).with_filter(Arc::new(filter));
        let mut sub = buffer.subscribe();

        buffer.add(entry("Debugger listening on ws://127.0.0.1:9229"));
        buffer.add(entry("GET /health 200"));
        buffer.add(entry("ready"));

        assert_eq!(buffer.len(), 1);
        assert_eq!(sub.recv().await.unwrap().message, "ready");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_contains() {
        let buffer = LogBuffer::new("api", 10);
        buffer.add(entry("Server started on :8080"));
        assert!(buffer.contains("Server started"));
        assert!(!buffer.contains("Listening"));
        assert!(!buffer.contains(""));
    }

    #[tokio::test]
    async fn test_subscriber_receives_live_entries() {
        let buffer = LogBuffer::new("api", 10);
        let mut sub = buffer.subscribe();

        buffer.add(entry("hello"));
        buffer.add(entry("world"));

        assert_eq!(sub.recv().await.unwrap().message, "hello");
        assert_eq!(sub.recv().await.unwrap().message, "world");
    }

    #[test]
    fn test_slow_subscriber_does_not_block_producer() {
        let buffer = LogBuffer::new("api", 1000).with_subscriber_capacity(5);
        let mut stalled = buffer.subscribe();

        for i in 0..500 {
            buffer.add(entry(&format!("line {}", i)));
        }

        let mut received = 0;
        while stalled.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, 5);
        assert_eq!(buffer.len(), 500);
    }

    #[test]
    fn test_full_subscriber_does_not_starve_peers() {
        let buffer = LogBuffer::new("api", 100).with_subscriber_capacity(2);
        let _stalled = buffer.subscribe();
        let mut reader = buffer.subscribe();

        for i in 0..6 {
            buffer.add(entry(&format!("line {}", i)));
            assert_eq!(reader.try_recv().unwrap().message, format!("line {}", i));
        }
    }

    #[test]
    fn test_unsubscribe_closes_channel() {
        let buffer = LogBuffer::new("api", 10);
        let mut sub = buffer.subscribe();
        buffer.unsubscribe(sub.id());
        buffer.unsubscribe(sub.id());

        buffer.add(entry("after"));
        assert!(sub.try_recv().is_none());
        assert!(sub.is_closed());
        assert_eq!(buffer.subscriber_count(), 0);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let buffer = LogBuffer::new("api", 10);
        let sub = buffer.subscribe();
        drop(sub);
        buffer.add(entry("ping"));
        assert_eq!(buffer.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_close_terminates_every_subscription() {
        let buffer = LogBuffer::new("api", 10);
        let mut subs: Vec<_> = (0..3).map(|_| buffer.subscribe()).collect();
        buffer.add(entry("last"));

        buffer.close().unwrap();
        buffer.close().unwrap();

        for sub in subs.iter_mut() {
            assert_eq!(sub.recv().await.unwrap().message, "last");
            assert!(sub.recv().await.is_none());
        }
        assert_eq!(buffer.subscriber_count(), 0);

        buffer.add(entry("ignored"));
        assert_eq!(buffer.len(), 1);

        let mut late = buffer.subscribe();
        assert!(late.recv().await.is_none());
    }

    #[test]
    fn test_file_sink_format_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = LogBuffer::with_file_sink("api", 10, dir.path()).unwrap();
        let path = buffer.file_path().unwrap().to_path_buf();
        assert_eq!(path, dir.path().join(".azure/logs/api.log"));

        buffer.add(entry("listening on :8080"));
        buffer.add(LogEntry::new("api", "Error: boom", true));
        buffer.close().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] [INFO] [OUT] listening on :8080"));
        assert!(lines[1].ends_with("] [ERROR] [ERR] Error: boom"));
    }

    #[test]
    fn test_file_sink_appends_across_buffers() {
        let dir = tempfile::tempdir().unwrap();
        {
            let buffer = LogBuffer::with_file_sink("api", 10, dir.path()).unwrap();
            buffer.add(entry("first run"));
            buffer.close().unwrap();
        }
        let buffer = LogBuffer::with_file_sink("api", 10, dir.path()).unwrap();
        buffer.add(entry("second run"));
        buffer.close().unwrap();

        let contents = std::fs::read_to_string(log_file_path(dir.path(), "api")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_sink_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let buffer = LogBuffer::with_file_sink("api", 10, dir.path()).unwrap();
        let mode = std::fs::metadata(buffer.file_path().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_file_sink_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_file_path(dir.path(), "api");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![b'x'; MAX_LOG_FILE_SIZE as usize]).unwrap();

        let buffer = LogBuffer::with_file_sink("api", 10, dir.path()).unwrap();
        buffer.add(entry("fresh"));
        buffer.close().unwrap();

        let active = std::fs::read_to_string(&path).unwrap();
        assert!(active.ends_with("fresh\n"));
        assert_eq!(active.lines().count(), 1);
        let backup = std::fs::metadata(backup_path(&path, 1)).unwrap();
        assert_eq!(backup.len(), MAX_LOG_FILE_SIZE);
    }
}
