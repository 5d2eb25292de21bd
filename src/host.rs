use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time;
use tracing::info;

#[derive(Debug, Error)]
#[error("background registration unavailable: {0}")]
pub struct ScheduleError(pub String);

/// Host capability: register a background-retry trigger under a tag. The
/// host fires the trigger at a time of its own choosing, possibly long
/// after the registering context is gone.
pub trait RetryScheduler: Send + Sync {
    fn register(&self, tag: &str) -> Result<(), ScheduleError>;
}

/// Host capability: show a user-visible message with the given title.
/// Fire-and-forget, no delivery guarantee.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str);
}

/// In-process stand-in for the host's background-sync facility: fires each
/// registered tag once after a fixed delay. Re-registering an armed tag
/// coalesces into the pending trigger.
pub struct TokioRetryScheduler {
    delay: Duration,
    tx: mpsc::UnboundedSender<String>,
    armed: Arc<Mutex<HashSet<String>>>,
}

impl TokioRetryScheduler {
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                delay,
                tx,
                armed: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
        )
    }
}

impl RetryScheduler for TokioRetryScheduler {
    fn register(&self, tag: &str) -> Result<(), ScheduleError> {
        {
            let mut armed = self.armed.lock().expect("armed set lock poisoned");
            if !armed.insert(tag.to_string()) {
                return Ok(());
            }
        }
        let tx = self.tx.clone();
        let armed = Arc::clone(&self.armed);
        let tag = tag.to_string();
        let delay = self.delay;
        tokio::spawn(async move {
            time::sleep(delay).await;
            armed.lock().expect("armed set lock poisoned").remove(&tag);
            let _ = tx.send(tag);
        });
        Ok(())
    }
}

/// Logs the notification; a real deployment would surface it to the user.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str) {
        info!(target: "notification", "{title}");
    }
}
