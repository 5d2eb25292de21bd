use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{MessageBus, Publisher, Subscriber};
use crate::error::UploadError;
use crate::host::{Notifier, RetryScheduler};
use crate::protocol::config::Config;
use crate::protocol::{Message, RETRY_TAG, STATUS_DONE, STATUS_FAILED, STATUS_RETRYING};
use crate::store::{self, KeyValueStore};
use crate::transport::UploadTransport;

pub struct CoordinatorHandle {
    task: JoinHandle<Result<(), UploadError>>,
}

impl CoordinatorHandle {
    pub async fn join(self) -> Result<(), UploadError> {
        match self.task.await {
            Ok(res) => res,
            Err(e) => Err(UploadError::TaskFailed(e.to_string())),
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

enum Input {
    Bus(Message),
    Trigger(String),
    TriggerClosed,
}

/// The long-lived supervisory context. Arms the host's background-retry
/// trigger when the executor reports a failed transfer, and when the
/// trigger fires runs the liveness protocol to decide between letting the
/// executor resume and uploading the persisted file itself. Must assume
/// nothing else is alive when the trigger fires.
pub struct Coordinator {
    publisher: Publisher,
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn UploadTransport>,
    scheduler: Arc<dyn RetryScheduler>,
    notifier: Arc<dyn Notifier>,
    cfg: Config,
    lease_owner: String,
    retry_cycles: u32,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        bus: &MessageBus,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn UploadTransport>,
        scheduler: Arc<dyn RetryScheduler>,
        notifier: Arc<dyn Notifier>,
        trigger_rx: mpsc::UnboundedReceiver<String>,
        cfg: Config,
    ) -> CoordinatorHandle {
        let (publisher, subscriber) = bus.attach(&cfg.channel);
        let coordinator = Coordinator {
            publisher,
            store,
            transport,
            scheduler,
            notifier,
            cfg,
            lease_owner: format!("coordinator-{}", Uuid::new_v4()),
            retry_cycles: 0,
        };
        let task = tokio::spawn(coordinator.run(subscriber, trigger_rx));
        CoordinatorHandle { task }
    }

    async fn run(
        mut self,
        mut subscriber: Subscriber,
        mut trigger_rx: mpsc::UnboundedReceiver<String>,
    ) -> Result<(), UploadError> {
        loop {
            let input = tokio::select! {
                msg = subscriber.recv() => Input::Bus(msg?),
                tag = trigger_rx.recv() => match tag {
                    Some(tag) => Input::Trigger(tag),
                    None => Input::TriggerClosed,
                },
            };

            match input {
                Input::Bus(Message::Status { retry: true, .. }) => {
                    info!("retry requested over the bus");
                    self.request_retry();
                    self.publish_status(STATUS_RETRYING, false);
                }
                // a probe the coordinator receives cannot be its own (the
                // subscriber filters those); treat it as a forwarded retry
                // condition. The authoritative check stays probe-and-wait.
                Input::Bus(Message::HeartBeat) => {
                    debug!("forwarded heartbeat received");
                    self.request_retry();
                    self.publish_status(STATUS_RETRYING, false);
                }
                Input::Bus(_) => {}
                Input::Trigger(tag) if tag == RETRY_TAG => {
                    if let Err(e) = self.on_background_trigger().await {
                        error!("background trigger handling failed: {e}");
                    }
                }
                Input::Trigger(tag) => debug!(%tag, "ignoring unknown trigger"),
                Input::TriggerClosed => return Ok(()),
            }
        }
    }

    /// Arm the background-retry trigger. Registration failure is retried
    /// on a fixed backoff until it sticks, never dropped silently.
    fn request_retry(&self) {
        let scheduler = Arc::clone(&self.scheduler);
        let delay = self.cfg.register_retry();
        tokio::spawn(async move {
            loop {
                match scheduler.register(RETRY_TAG) {
                    Ok(()) => {
                        debug!("background retry registered");
                        return;
                    }
                    Err(e) => {
                        warn!("background retry registration failed: {e}, retrying in {delay:?}");
                        time::sleep(delay).await;
                    }
                }
            }
        });
    }

    /// The liveness protocol: reset the flag, probe, wait the fixed
    /// window, then read once. "Flag observed true at read time" wins no
    /// matter which write caused it.
    async fn on_background_trigger(&mut self) -> Result<(), UploadError> {
        store::write_liveness(&*self.store, false).await?;
        self.publisher.publish(Message::HeartBeat)?;
        time::sleep(self.cfg.liveness_wait()).await;

        if store::read_liveness(&*self.store).await? {
            info!("executor answered the probe, letting it resume");
            self.publisher.publish(Message::ResumeUpload)?;
            return Ok(());
        }

        info!("executor presumed dead, starting failover upload");
        self.failover().await
    }

    /// Upload the persisted file in the executor's stead. No `ready` or
    /// `progress` is narrated here; the bus only sees the terminal status.
    async fn failover(&mut self) -> Result<(), UploadError> {
        let Some(file) = store::load_pending(&*self.store).await? else {
            debug!("no pending file, nothing to fail over");
            return Ok(());
        };
        if !store::acquire_lease(&*self.store, &self.lease_owner, self.cfg.lease_ttl()).await? {
            warn!("pending file is leased elsewhere, skipping failover");
            return Ok(());
        }

        self.notifier.notify("Resuming upload in the background");
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        let result = self.transport.upload(&file, progress_tx).await;

        match result {
            Ok(()) => {
                info!(file_name = %file.name, "failover upload complete");
                self.notifier.notify("Upload successful");
                store::clear_pending(&*self.store).await?;
                store::release_lease(&*self.store, &self.lease_owner).await?;
                self.retry_cycles = 0;
                self.publish_status(STATUS_DONE, false);
            }
            Err(e) => {
                warn!("failover upload failed: {e}");
                self.notifier.notify("Upload failed");
                store::release_lease(&*self.store, &self.lease_owner).await?;
                self.retry_cycles += 1;
                if self.retry_cycles < self.cfg.max_retry_cycles {
                    self.request_retry();
                } else {
                    warn!(
                        "giving up after {} failover attempts",
                        self.retry_cycles
                    );
                    self.publish_status(STATUS_FAILED, false);
                }
            }
        }
        Ok(())
    }

    fn publish_status(&self, status: &str, retry: bool) {
        if let Err(e) = self.publisher.publish(Message::Status {
            status: status.into(),
            retry,
        }) {
            warn!("status publish failed: {e}");
        }
    }
}
