use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, Publisher, Subscriber};
use crate::error::UploadError;
use crate::protocol::config::Config;
use crate::protocol::{Message, STATUS_DONE, STATUS_FAILED, UploadFile};
use crate::store::{self, KeyValueStore};
use crate::transport::UploadTransport;

/// Lease owner id used by the executor's resume path.
pub const EXECUTOR_LEASE_OWNER: &str = "executor";

#[derive(Debug, Clone, Copy, PartialEq)]
enum TransferOutcome {
    Done,
    Failed,
    Terminated,
    Skipped,
}

enum Input {
    Submit(UploadFile),
    SubmitClosed,
    Bus(Message),
}

enum TransferEvent {
    Finished(Result<(), crate::error::TransportError>),
    Progress(f64),
    Bus(Message),
}

pub struct ExecutorHandle {
    submit_tx: mpsc::Sender<UploadFile>,
    task: JoinHandle<Result<(), UploadError>>,
}

impl ExecutorHandle {
    /// Begin an upload session. Submissions are handled one at a time; a
    /// second submit queues behind the in-flight session rather than
    /// running concurrently.
    pub async fn submit(&self, file: UploadFile) -> Result<(), UploadError> {
        self.submit_tx
            .send(file)
            .await
            .map_err(|_| UploadError::ExecutorStopped)
    }

    /// Wait for the executor task to exit (it does so on `terminate`).
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

/// The detachable background context owning the actual network transfer.
/// Narrates the session over the bus, answers liveness probes through the
/// store, and persists the file before giving up on a failed transfer.
pub struct UploadExecutor {
    publisher: Publisher,
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn UploadTransport>,
    cfg: Config,
}

impl UploadExecutor {
    pub fn spawn(
        bus: &MessageBus,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn UploadTransport>,
        cfg: Config,
    ) -> ExecutorHandle {
        let (publisher, subscriber) = bus.attach(&cfg.channel);
        let (submit_tx, submit_rx) = mpsc::channel(1);
        let executor = UploadExecutor {
            publisher,
            store,
            transport,
            cfg,
        };
        let task = tokio::spawn(executor.run(subscriber, submit_rx));
        ExecutorHandle { submit_tx, task }
    }

    async fn run(
        self,
        mut subscriber: Subscriber,
        mut submit_rx: mpsc::Receiver<UploadFile>,
    ) -> Result<(), UploadError> {
        let heartbeat = spawn_self_assertion(self.store.clone(), self.cfg.heartbeat_interval());
        let res = self.event_loop(&mut subscriber, &mut submit_rx).await;
        heartbeat.abort();
        res
    }

    async fn event_loop(
        &self,
        subscriber: &mut Subscriber,
        submit_rx: &mut mpsc::Receiver<UploadFile>,
    ) -> Result<(), UploadError> {
        let mut submit_closed = false;
        loop {
            let input = if submit_closed {
                Input::Bus(subscriber.recv().await?)
            } else {
                tokio::select! {
                    file = submit_rx.recv() => match file {
                        Some(file) => Input::Submit(file),
                        None => Input::SubmitClosed,
                    },
                    msg = subscriber.recv() => Input::Bus(msg?),
                }
            };

            match input {
                Input::Submit(file) => {
                    info!(file_name = %file.name, "upload submitted");
                    if self.run_transfer(subscriber, file).await? == TransferOutcome::Terminated {
                        return Ok(());
                    }
                }
                // the spawning context went away; keep serving the bus
                Input::SubmitClosed => submit_closed = true,
                Input::Bus(Message::HeartBeat) => {
                    debug!("heartbeat probe received");
                    self.assert_alive().await;
                }
                Input::Bus(Message::ResumeUpload) => {
                    if self.resume(subscriber).await? == TransferOutcome::Terminated {
                        return Ok(());
                    }
                }
                Input::Bus(Message::Terminate) => {
                    info!("terminate received, executor exiting");
                    return Ok(());
                }
                Input::Bus(_) => {}
            }
        }
    }

    /// Continue the pending transfer, if any. An absent pending file or a
    /// lease held elsewhere is a silent no-op; the pending file is deleted
    /// only after the transfer fully completes.
    async fn resume(&self, subscriber: &mut Subscriber) -> Result<TransferOutcome, UploadError> {
        let file = match store::load_pending(&*self.store).await {
            Ok(Some(file)) => file,
            Ok(None) => {
                debug!("resume requested with no pending file");
                return Ok(TransferOutcome::Skipped);
            }
            Err(e) => {
                warn!("failed to load pending file: {e}");
                return Ok(TransferOutcome::Skipped);
            }
        };
        match store::acquire_lease(&*self.store, EXECUTOR_LEASE_OWNER, self.cfg.lease_ttl()).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("pending file is leased elsewhere, skipping resume");
                return Ok(TransferOutcome::Skipped);
            }
            Err(e) => {
                warn!("failed to acquire upload lease: {e}");
                return Ok(TransferOutcome::Skipped);
            }
        }

        let outcome = self.run_transfer(subscriber, file).await?;
        if outcome == TransferOutcome::Terminated {
            // deliberate abort: the pending file and lease stay untouched.
            // The lease goes stale after lease_ttl_ms, at which point a
            // failover (or a fresh resume) can claim the file again.
            return Ok(outcome);
        }
        if outcome == TransferOutcome::Done {
            store::clear_pending(&*self.store).await?;
        }
        store::release_lease(&*self.store, EXECUTOR_LEASE_OWNER).await?;
        Ok(outcome)
    }

    /// One transfer attempt: `ready`, a stream of `progress`, then a
    /// terminal `status`. On a transport error the file is persisted and
    /// responsibility moves to the coordinator via `retry = true`; no local
    /// retry happens.
    async fn run_transfer(
        &self,
        subscriber: &mut Subscriber,
        file: UploadFile,
    ) -> Result<TransferOutcome, UploadError> {
        self.publisher.publish(Message::Ready {
            file_name: file.name.clone(),
        })?;

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut last = 0.0f64;

        let outcome = {
            let transport = Arc::clone(&self.transport);
            let fut = transport.upload(&file, progress_tx);
            tokio::pin!(fut);
            loop {
                let event = tokio::select! {
                    res = &mut fut => TransferEvent::Finished(res),
                    Some(p) = progress_rx.recv() => TransferEvent::Progress(p),
                    msg = subscriber.recv() => TransferEvent::Bus(msg?),
                };
                match event {
                    TransferEvent::Finished(Ok(())) => break TransferOutcome::Done,
                    TransferEvent::Finished(Err(e)) => {
                        warn!("transfer failed: {e}");
                        break TransferOutcome::Failed;
                    }
                    TransferEvent::Progress(p) => self.publish_progress(p, &mut last)?,
                    TransferEvent::Bus(Message::HeartBeat) => self.assert_alive().await,
                    TransferEvent::Bus(Message::Terminate) => {
                        info!("terminate received mid-transfer, abandoning");
                        return Ok(TransferOutcome::Terminated);
                    }
                    TransferEvent::Bus(_) => {}
                }
            }
        };

        // progress reported just before completion may still be queued
        while let Ok(p) = progress_rx.try_recv() {
            self.publish_progress(p, &mut last)?;
        }

        match outcome {
            TransferOutcome::Done => {
                info!(file_name = %file.name, "upload complete");
                self.publisher.publish(Message::Status {
                    status: STATUS_DONE.into(),
                    retry: false,
                })?;
            }
            TransferOutcome::Failed => {
                if let Err(e) = store::save_pending(&*self.store, &file).await {
                    // fatal to this resume cycle only; the failure still
                    // goes out as a retry request
                    warn!("failed to persist pending upload: {e}");
                }
                self.publisher.publish(Message::Status {
                    status: STATUS_FAILED.into(),
                    retry: true,
                })?;
            }
            _ => {}
        }
        Ok(outcome)
    }

    fn publish_progress(&self, progress: f64, last: &mut f64) -> Result<(), UploadError> {
        let progress = progress.clamp(0.0, 1.0);
        if progress >= *last {
            *last = progress;
            self.publisher.publish(Message::Progress { progress })?;
        }
        Ok(())
    }

    async fn assert_alive(&self) {
        if let Err(e) = store::write_liveness(&*self.store, true).await {
            warn!("liveness flag write failed: {e}");
        }
    }
}

/// Periodic self-assertion: while the executor lives, the liveness flag
/// keeps getting set, so a coordinator probe-and-wait observes `true`
/// even if the probe message itself is lost.
fn spawn_self_assertion(store: Arc<dyn KeyValueStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = time::interval(interval);
        loop {
            tick.tick().await;
            if let Err(e) = store::write_liveness(&*store, true).await {
                warn!("liveness self-assertion failed: {e}");
            }
        }
    })
}
