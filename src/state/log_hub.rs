//! Run log channels
//!
//! One broadcast channel per pipeline run plus a bounded replay buffer, so an
//! SSE subscriber that connects late still sees the start of the run.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch, RwLock};

use crate::domain::pipeline::LogLine;
use crate::infra::LogSink;

const LOG_CHANNEL_CAPACITY: usize = 256;

/// Lines kept for replay per run
const LOG_REPLAY_LINES: usize = 2000;

/// Log channel of a single run
pub struct RunLog {
    sender: broadcast::Sender<LogLine>,
    backlog: Mutex<VecDeque<LogLine>>,
    created_at: DateTime<Utc>,
    finished: watch::Sender<bool>,
}

impl RunLog {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            sender,
            backlog: Mutex::new(VecDeque::new()),
            created_at: Utc::now(),
            finished: watch::channel(false).0,
        }
    }

    /// Record and broadcast a line
    pub fn emit(&self, line: LogLine) {
        // send under the lock so subscribe() sees each line exactly once
        if let Ok(mut backlog) = self.backlog.lock() {
            backlog.push_back(line.clone());
            while backlog.len() > LOG_REPLAY_LINES {
                backlog.pop_front();
            }
            let _ = self.sender.send(line);
        }
    }

    /// Buffered lines plus a receiver for everything after them
    ///
    /// Both are taken under the backlog lock so no line is lost or doubled.
    pub fn subscribe(&self) -> (Vec<LogLine>, broadcast::Receiver<LogLine>) {
        match self.backlog.lock() {
            Ok(backlog) => (backlog.iter().cloned().collect(), self.sender.subscribe()),
            Err(_) => (Vec::new(), self.sender.subscribe()),
        }
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Resolves once the run's log is complete
    pub fn watch_finished(&self) -> watch::Receiver<bool> {
        self.finished.subscribe()
    }

    fn mark_finished(&self) {
        self.finished.send_replace(true);
    }
}

/// Log hub keyed by run id
pub struct LogHub {
    channels: RwLock<HashMap<String, Arc<RunLog>>>,
}

impl LogHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Create the channel for `run_id`, returning the existing one if present
    pub async fn create(&self, run_id: &str) -> Arc<RunLog> {
        let mut channels = self.channels.write().await;
        channels
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(RunLog::new()))
            .clone()
    }

    pub async fn get(&self, run_id: &str) -> Option<Arc<RunLog>> {
        self.channels.read().await.get(run_id).cloned()
    }

    /// Sink feeding the run's channel, for command output
    pub async fn sink(&self, run_id: &str) -> LogSink {
        let log = self.create(run_id).await;
        Arc::new(move |line| log.emit(line))
    }

    /// Mark the run's channel finished; it stays for late subscribers until cleanup
    pub async fn finish(&self, run_id: &str) {
        if let Some(log) = self.channels.read().await.get(run_id) {
            log.mark_finished();
        }
    }

    pub async fn exists(&self, run_id: &str) -> bool {
        self.channels.read().await.contains_key(run_id)
    }

    /// Remove finished channels older than `max_age_hours` with no subscribers
    pub async fn cleanup_expired(&self, max_age_hours: i64) {
        let now = Utc::now();
        let mut channels = self.channels.write().await;
        channels.retain(|_, log| {
            let expired = (now - log.created_at).num_hours() >= max_age_hours;
            !expired || !log.is_finished() || log.sender.receiver_count() > 0
        });
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}
