//! Keyed, updatable status notifications
//!
//! Each notification occupies a slot keyed by id. Every write replaces the
//! slot's value atomically; a timed notification removes itself once its
//! timeout elapses unless the slot was written again in the meantime.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Default,
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub text: String,
    /// Completion fraction in `[0, 1]` for progress notifications
    pub progress: Option<f64>,
    /// `None` keeps the notification until it is replaced or dismissed
    pub auto_close: Option<Duration>,
    revision: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    Shown(Notification),
    Dismissed(String),
}

pub type Slots = BTreeMap<String, Notification>;

struct Inner {
    slots: watch::Sender<Slots>,
    events: broadcast::Sender<NotificationEvent>,
}

#[derive(Clone)]
pub struct Notifier {
    inner: Arc<Inner>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (slots, _) = watch::channel(Slots::new());
        let (events, _) = broadcast::channel(SUBSCRIBER_CAPACITY);

        Self {
            inner: Arc::new(Inner { slots, events }),
        }
    }

    /// Show a persistent notification, replacing any with the same id
    pub fn show(&self, id: &str, kind: NotificationKind, text: impl Into<String>) {
        self.write(id, |n| {
            n.kind = kind;
            n.text = text.into();
            n.progress = None;
            n.auto_close = None;
        });
    }

    /// Show a notification that dismisses itself after `timeout`
    pub fn show_timed(&self, id: &str, kind: NotificationKind, text: impl Into<String>, timeout: Duration) {
        self.write(id, |n| {
            n.kind = kind;
            n.text = text.into();
            n.progress = None;
            n.auto_close = Some(timeout);
        });
    }

    /// Show a persistent progress notification starting at `progress`
    pub fn show_progress(&self, id: &str, text: impl Into<String>, progress: f64) {
        self.write(id, |n| {
            n.kind = NotificationKind::Default;
            n.text = text.into();
            n.progress = Some(progress.clamp(0.0, 1.0));
            n.auto_close = None;
        });
    }

    /// Change kind and text of a notification, keeping its progress value.
    /// Creates the notification if it is not currently shown.
    pub fn update(
        &self,
        id: &str,
        kind: NotificationKind,
        text: impl Into<String>,
        auto_close: Option<Duration>,
    ) {
        self.write(id, |n| {
            n.kind = kind;
            n.text = text.into();
            n.auto_close = auto_close;
        });
    }

    /// Replace the progress value of a notification
    pub fn set_progress(&self, id: &str, progress: f64) {
        self.write(id, |n| n.progress = Some(progress.clamp(0.0, 1.0)));
    }

    pub fn dismiss(&self, id: &str) {
        self.remove_if(id, None);
    }

    pub fn get(&self, id: &str) -> Option<Notification> {
        self.inner.slots.borrow().get(id).cloned()
    }

    pub fn snapshot(&self) -> Slots {
        self.inner.slots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Slots> {
        self.inner.slots.subscribe()
    }

    /// Receive every show / dismiss from now on
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.inner.events.subscribe()
    }

    fn write<F>(&self, id: &str, f: F)
    where
        F: FnOnce(&mut Notification),
    {
        let mut written = None;

        self.inner.slots.send_modify(|slots| {
            let n = slots.entry(id.to_string()).or_insert_with(|| Notification {
                id: id.to_string(),
                kind: NotificationKind::Default,
                text: String::new(),
                progress: None,
                auto_close: None,
                revision: 0,
            });
            f(n);
            n.revision += 1;
            written = Some(n.clone());
        });

        let Some(n) = written else { return };

        if let Some(timeout) = n.auto_close {
            self.schedule_dismiss(n.id.clone(), n.revision, timeout);
        }

        let _ = self.inner.events.send(NotificationEvent::Shown(n));
    }

    fn schedule_dismiss(&self, id: String, revision: u64, timeout: Duration) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                warn!("No runtime available, notification '{}' will not auto-dismiss", id);
                return;
            }
        };

        let notifier = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            notifier.remove_if(&id, Some(revision));
        });
    }

    fn remove_if(&self, id: &str, revision: Option<u64>) {
        let mut removed = false;

        self.inner.slots.send_if_modified(|slots| {
            let current = match slots.get(id) {
                Some(n) => n.revision,
                None => return false,
            };
            if revision.map_or(true, |r| r == current) {
                slots.remove(id);
                removed = true;
            }
            removed
        });

        if removed {
            let _ = self.inner.events.send(NotificationEvent::Dismissed(id.to_string()));
        }
    }
}
