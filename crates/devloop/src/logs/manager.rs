//! Per-run registry of service log buffers

use super::buffer::{LogBuffer, LogError, DEFAULT_CAPACITY, DEFAULT_SUBSCRIBER_CAPACITY};
use super::entry::LogEntry;
use super::filter::LogFilter;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Settings applied to every buffer a manager creates
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Entries kept per service
    pub capacity: usize,
    /// Channel size for each live tail
    pub subscriber_capacity: usize,
    /// Mirror entries to `<project>/.azure/logs/<service>.log`
    pub file_logging: bool,
    /// Noise filter shared by every buffer
    pub filter: Option<Arc<LogFilter>>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            file_logging: true,
            filter: None,
        }
    }
}

/// Owns the log buffers of one project for the length of a run.
///
/// Created at run start and handed to the lifecycle controller;
/// [`LogManager::close_all`] tears everything down at run end.
#[derive(Debug)]
pub struct LogManager {
    project_dir: PathBuf,
    config: LogConfig,
    buffers: RwLock<HashMap<String, Arc<LogBuffer>>>,
}

impl LogManager {
    pub fn new(project_dir: impl Into<PathBuf>, config: LogConfig) -> Self {
        let project_dir = project_dir.into();
        let project_dir = std::path::absolute(&project_dir).unwrap_or(project_dir);
        Self {
            project_dir,
            config,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Return the service's buffer, creating it on first use
    pub fn create_buffer(&self, service: &str) -> Result<Arc<LogBuffer>, LogError> {
        let mut buffers = self
            .buffers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(buffer) = buffers.get(service) {
            return Ok(Arc::clone(buffer));
        }

        let mut buffer = if self.config.file_logging {
            LogBuffer::with_file_sink(service, self.config.capacity, &self.project_dir)?
        } else {
            LogBuffer::new(service, self.config.capacity)
        }
        .with_subscriber_capacity(self.config.subscriber_capacity);
        if let Some(filter) = &self.config.filter {
            buffer = buffer.with_filter(Arc::clone(filter));
        }

        let buffer = Arc::new(buffer);
        buffers.insert(service.to_string(), Arc::clone(&buffer));
        log::debug!("[{}] Log buffer created", service);
        Ok(buffer)
    }

    pub fn buffer(&self, service: &str) -> Option<Arc<LogBuffer>> {
        self.read().get(service).cloned()
    }

    /// Names of every service with a buffer, sorted
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Up to `n` recent entries per service, merged by timestamp
    pub fn recent_all(&self, n: usize) -> Vec<LogEntry> {
        let mut all: Vec<LogEntry> = self.read().values().flat_map(|b| b.recent(n)).collect();
        sort_entries(&mut all);
        all
    }

    /// Entries from every service stamped at or after `since`, merged by
    /// timestamp
    pub fn since_all(&self, since: DateTime<Local>) -> Vec<LogEntry> {
        let mut all: Vec<LogEntry> = self.read().values().flat_map(|b| b.since(since)).collect();
        sort_entries(&mut all);
        all
    }

    /// Close and forget one service's buffer
    pub fn remove_buffer(&self, service: &str) -> Result<(), LogError> {
        let buffer = self
            .buffers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(service)
            .ok_or_else(|| LogError::UnknownService(service.to_string()))?;
        buffer.close()
    }

    /// Close every buffer. All buffers are closed even if some fail; the
    /// first failure is returned.
    pub fn close_all(&self) -> Result<(), LogError> {
        let buffers: Vec<_> = self
            .buffers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .collect();

        let mut first_error = None;
        for (name, buffer) in buffers {
            if let Err(e) = buffer.close() {
                log::warn!("[{}] Failed to close log buffer: {}", name, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<LogBuffer>>> {
        self.buffers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Sort entries oldest first
pub fn sort_entries(entries: &mut [LogEntry]) {
    entries.sort_by_key(|e| e.timestamp);
}
