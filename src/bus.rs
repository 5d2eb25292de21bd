use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::error::UploadError;
use crate::protocol::Message;

const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
struct Envelope {
    origin: Uuid,
    msg: Message,
}

/// In-process-group publish/subscribe bus. Each named channel fans every
/// published message out to all attached subscribers; delivery is
/// best-effort only, so anything that must survive a detached context
/// belongs in the store instead.
#[derive(Default)]
pub struct MessageBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a context to a named channel. The returned publisher and
    /// subscriber share an origin id; the subscriber drops messages that
    /// origin published itself.
    pub fn attach(&self, channel: &str) -> (Publisher, Subscriber) {
        let mut channels = self.channels.lock().expect("bus registry lock poisoned");
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        let origin = Uuid::new_v4();
        let rx = tx.subscribe();
        (Publisher { origin, tx }, Subscriber { origin, rx })
    }
}

#[derive(Clone)]
pub struct Publisher {
    origin: Uuid,
    tx: broadcast::Sender<Envelope>,
}

impl Publisher {
    /// Publish to every other attached subscriber. A channel with no
    /// receivers swallows the message; delivery is best-effort and losing
    /// traffic on an empty channel is part of the bus contract.
    pub fn publish(&self, msg: Message) -> Result<(), UploadError> {
        let _ = self.tx.send(Envelope {
            origin: self.origin,
            msg,
        });
        Ok(())
    }
}

pub struct Subscriber {
    origin: Uuid,
    rx: broadcast::Receiver<Envelope>,
}

impl Subscriber {
    /// Receive the next message published by any other attached context.
    /// A lagged receiver skips the gap and keeps going; lost messages are
    /// part of the bus contract.
    pub async fn recv(&mut self) -> Result<Message, UploadError> {
        loop {
            match self.rx.recv().await {
                Ok(env) if env.origin == self.origin => continue,
                Ok(env) => return Ok(env.msg),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("bus subscriber lagged, {n} messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(UploadError::BusClosed),
            }
        }
    }
}
