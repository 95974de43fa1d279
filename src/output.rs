//! Output log: the latest human readable status line
//!
//! Only the most recent record is retained. Consumers that need every line
//! (a terminal renderer, tests) take a [`OutputLog::subscribe`] receiver and
//! capture emissions as they happen.

use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::{broadcast, watch};

/// Buffered emissions per subscriber before it starts lagging
const SUBSCRIBER_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub time: DateTime<Local>,
    pub text: String,
}

impl OutputRecord {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            time: Local::now(),
            text: text.into(),
        }
    }
}

struct Inner {
    latest: watch::Sender<OutputRecord>,
    emitted: broadcast::Sender<OutputRecord>,
}

/// Single-slot status sink, cheap to clone
#[derive(Clone)]
pub struct OutputLog {
    inner: Arc<Inner>,
}

impl OutputLog {
    pub fn new(initial: impl Into<String>) -> Self {
        let (latest, _) = watch::channel(OutputRecord::new(initial));
        let (emitted, _) = broadcast::channel(SUBSCRIBER_CAPACITY);

        Self {
            inner: Arc::new(Inner { latest, emitted }),
        }
    }

    /// Replace the current record
    pub fn append(&self, text: impl Into<String>) {
        let record = OutputRecord::new(text);

        let _ = self.inner.emitted.send(record.clone());
        self.inner.latest.send_replace(record);
    }

    pub fn latest(&self) -> OutputRecord {
        self.inner.latest.borrow().clone()
    }

    /// Observe the current record, skipping intermediate values
    pub fn watch(&self) -> watch::Receiver<OutputRecord> {
        self.inner.latest.subscribe()
    }

    /// Receive every record appended from now on
    pub fn subscribe(&self) -> broadcast::Receiver<OutputRecord> {
        self.inner.emitted.subscribe()
    }
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new("Click connect to start")
    }
}

/// Drain everything currently buffered in a subscription
#[cfg(test)]
pub(crate) fn drain(rx: &mut broadcast::Receiver<OutputRecord>) -> Vec<String> {
    let mut lines = vec![];
    while let Ok(r) = rx.try_recv() {
        lines.push(r.text);
    }
    lines
}
