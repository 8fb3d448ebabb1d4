use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::RepoError;
use crate::repo::now_secs;
use crate::state::lock;
use crate::storage::{load_json, save_json};
use crate::telemetry::EventLog;

pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub created: u64,
    pub props: serde_json::Value,
}

/// Append-only event log that writes to disk one batch at a time.
pub struct Analytics {
    path: PathBuf,
    batch_size: usize,
    batch: Mutex<Vec<Event>>,
}

impl Analytics {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_batch_size(path, DEFAULT_BATCH_SIZE)
    }

    /// A batch size of 0 or 1 writes every event immediately.
    pub fn with_batch_size(path: impl Into<PathBuf>, batch_size: usize) -> Self {
        Self {
            path: path.into(),
            batch_size: batch_size.max(1),
            batch: Mutex::new(Vec::new()),
        }
    }

    pub fn track_event(&self, name: &str, props: serde_json::Value) -> Result<(), RepoError> {
        let full = {
            let mut batch = lock(&self.batch);
            batch.push(Event {
                name: name.to_string(),
                created: now_secs(),
                props,
            });
            batch.len() >= self.batch_size
        };
        if full {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes buffered events to disk. On failure they stay buffered.
    pub fn flush(&self) -> Result<(), RepoError> {
        let mut batch = lock(&self.batch);
        if batch.is_empty() {
            return Ok(());
        }
        let mut events: Vec<Event> = load_json(&self.path)?;
        events.extend(batch.iter().cloned());
        save_json(&self.path, &events)?;
        batch.clear();
        Ok(())
    }

    /// Buffered events first, then persisted ones, optionally filtered by name.
    pub fn query(&self, name: Option<&str>) -> Result<Vec<Event>, RepoError> {
        let mut events = lock(&self.batch).clone();
        let persisted: Vec<Event> = load_json(&self.path)?;
        events.extend(persisted);
        if let Some(name) = name {
            events.retain(|e| e.name == name);
        }
        Ok(events)
    }
}

impl EventLog for Analytics {
    fn track(&self, event: &str, props: serde_json::Value) -> Result<(), RepoError> {
        self.track_event(event, props)
    }
}
