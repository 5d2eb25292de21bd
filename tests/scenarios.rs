//! End-to-end protocol scenarios: the executor, coordinator, and a
//! foreground controller (the test body) attached to one bus, with the
//! host capabilities replaced by synchronously-driven doubles.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use uplink::Config;
use uplink::MessageBus;
use uplink::bus::Subscriber;
use uplink::coordinator::Coordinator;
use uplink::error::TransportError;
use uplink::executor::{ExecutorHandle, UploadExecutor};
use uplink::host::{Notifier, RetryScheduler, ScheduleError};
use uplink::protocol::{
    Message, RETRY_TAG, STATUS_DONE, STATUS_FAILED, STATUS_RETRYING, UploadFile,
};
use uplink::store::{self, FsStore, KeyValueStore};
use uplink::transport::{ProgressSink, UploadTransport};

#[derive(Clone)]
enum Outcome {
    Succeed { steps: Vec<f64> },
    Fail { after: Vec<f64> },
    Hang,
}

/// Scripted transport: each upload attempt consumes the next outcome;
/// once the script runs out every further attempt hangs.
struct MockTransport {
    script: Mutex<VecDeque<Outcome>>,
}

impl MockTransport {
    fn new(outcomes: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into()),
        })
    }
}

#[async_trait]
impl UploadTransport for MockTransport {
    async fn upload(&self, _file: &UploadFile, progress: ProgressSink) -> Result<(), TransportError> {
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Hang);
        match outcome {
            Outcome::Succeed { steps } => {
                for step in steps {
                    let _ = progress.send(step);
                }
                Ok(())
            }
            Outcome::Fail { after } => {
                for step in after {
                    let _ = progress.send(step);
                }
                Err(TransportError::Other("connection reset".into()))
            }
            Outcome::Hang => {
                futures::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// Scheduler double: records registrations, can fail the first N of them,
/// and fires triggers only when the test says so.
struct ManualScheduler {
    tx: mpsc::UnboundedSender<String>,
    fail_first: AtomicUsize,
    registrations: Mutex<Vec<String>>,
}

impl ManualScheduler {
    fn new(fail_first: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                fail_first: AtomicUsize::new(fail_first),
                registrations: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    fn fire(&self, tag: &str) {
        self.tx.send(tag.to_string()).unwrap();
    }

    fn registration_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }
}

impl RetryScheduler for ManualScheduler {
    fn register(&self, tag: &str) -> Result<(), ScheduleError> {
        if self.fail_first.load(Ordering::SeqCst) > 0 {
            self.fail_first.fetch_sub(1, Ordering::SeqCst);
            return Err(ScheduleError("sync manager unavailable".into()));
        }
        self.registrations.lock().unwrap().push(tag.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    titles: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn titles(&self) -> Vec<String> {
        self.titles.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str) {
        self.titles.lock().unwrap().push(title.to_string());
    }
}

fn test_config(root: &Path) -> Config {
    Config {
        endpoint: "http://127.0.0.1:9/api/upload/file".into(),
        store_root: root.join("store").to_string_lossy().into_owned(),
        channel: "workerChannel".into(),
        heartbeat_interval_ms: 25,
        liveness_wait_ms: 150,
        register_retry_ms: 25,
        trigger_delay_ms: 25,
        lease_ttl_ms: 10_000,
        max_retry_cycles: 5,
    }
}

fn sample_file() -> UploadFile {
    UploadFile {
        name: "a.mp4".into(),
        bytes: vec![0u8; 4096],
    }
}

async fn next_message(sub: &mut Subscriber) -> Message {
    timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("timed out waiting for a bus message")
        .expect("bus closed")
}

/// Receive until a status with the given text arrives, returning everything
/// seen on the way (the status included).
async fn collect_until_status(sub: &mut Subscriber, status: &str) -> Vec<Message> {
    let mut seen = Vec::new();
    loop {
        let msg = next_message(sub).await;
        let done = matches!(&msg, Message::Status { status: s, .. } if s == status);
        seen.push(msg);
        if done {
            return seen;
        }
    }
}

async fn expect_silence(sub: &mut Subscriber, window: Duration) {
    if let Ok(msg) = timeout(window, sub.recv()).await {
        panic!("unexpected message: {:?}", msg.unwrap());
    }
}

async fn wait_for_registration(scheduler: &ManualScheduler, count: usize) {
    timeout(Duration::from_secs(5), async {
        while scheduler.registration_count() < count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for trigger registration");
}

struct Rig {
    _dir: tempfile::TempDir,
    cfg: Config,
    bus: MessageBus,
    store: Arc<dyn KeyValueStore>,
}

impl Rig {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let store: Arc<dyn KeyValueStore> = Arc::new(FsStore::new(&cfg.store_root));
        Rig {
            _dir: dir,
            cfg,
            bus: MessageBus::new(),
            store,
        }
    }

    fn spawn_executor(&self, transport: Arc<dyn UploadTransport>) -> ExecutorHandle {
        UploadExecutor::spawn(&self.bus, self.store.clone(), transport, self.cfg.clone())
    }
}

// Scenario A: a clean session narrates ready, rising progress, then Done.
#[tokio::test]
async fn happy_path_narrates_a_full_session() {
    let rig = Rig::new();
    let transport = MockTransport::new(vec![Outcome::Succeed {
        steps: vec![0.25, 0.5, 1.0],
    }]);
    let (_fg_pub, mut fg_sub) = rig.bus.attach(&rig.cfg.channel);
    let executor = rig.spawn_executor(transport);

    executor.submit(sample_file()).await.unwrap();

    assert_eq!(
        next_message(&mut fg_sub).await,
        Message::Ready {
            file_name: "a.mp4".into()
        }
    );

    let mut last = 0.0f64;
    let mut progress_count = 0;
    loop {
        match next_message(&mut fg_sub).await {
            Message::Progress { progress } => {
                assert!((0.0..=1.0).contains(&progress), "progress out of range");
                assert!(progress >= last, "progress went backwards");
                last = progress;
                progress_count += 1;
            }
            Message::Status { status, retry } => {
                assert_eq!(status, STATUS_DONE);
                assert!(!retry);
                break;
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
    assert_eq!(progress_count, 3);
    assert!(store::load_pending(&*rig.store).await.unwrap().is_none());
}

// Scenario B: transfer fails, coordinator arms the trigger, the probe finds
// the executor alive, and the executor resumes; no failover happens.
#[tokio::test]
async fn failed_transfer_resumes_on_live_executor() {
    let rig = Rig::new();
    let transport = MockTransport::new(vec![
        Outcome::Fail { after: vec![0.3] },
        Outcome::Succeed { steps: vec![1.0] },
    ]);
    let (scheduler, trigger_rx) = ManualScheduler::new(0);
    let notifier = Arc::new(RecordingNotifier::default());
    let (_fg_pub, mut fg_sub) = rig.bus.attach(&rig.cfg.channel);

    let executor = rig.spawn_executor(transport.clone());
    let _coordinator = Coordinator::spawn(
        &rig.bus,
        rig.store.clone(),
        transport,
        scheduler.clone(),
        notifier.clone(),
        trigger_rx,
        rig.cfg.clone(),
    );

    executor.submit(sample_file()).await.unwrap();

    let first_attempt = collect_until_status(&mut fg_sub, STATUS_FAILED).await;
    assert!(matches!(
        first_attempt.last(),
        Some(Message::Status { retry: true, .. })
    ));
    assert!(store::load_pending(&*rig.store).await.unwrap().is_some());

    // the coordinator reacts with a UI status and a trigger registration
    let retrying = collect_until_status(&mut fg_sub, STATUS_RETRYING).await;
    assert_eq!(retrying.len(), 1);
    wait_for_registration(&scheduler, 1).await;

    scheduler.fire(RETRY_TAG);

    let resumed = collect_until_status(&mut fg_sub, STATUS_DONE).await;
    assert!(
        resumed.contains(&Message::HeartBeat),
        "expected a probe before resume: {resumed:?}"
    );
    assert!(
        resumed.contains(&Message::ResumeUpload),
        "expected the executor to be told to resume: {resumed:?}"
    );
    assert!(
        resumed.contains(&Message::Ready {
            file_name: "a.mp4".into()
        }),
        "expected a second session from the executor: {resumed:?}"
    );

    assert!(store::load_pending(&*rig.store).await.unwrap().is_none());
    assert!(notifier.titles().is_empty(), "no failover should have run");
}

// Scenario C: same failure, but the executor dies before the trigger
// fires; the coordinator uploads the persisted file itself.
#[tokio::test]
async fn dead_executor_triggers_failover_upload() {
    let rig = Rig::new();
    let transport = MockTransport::new(vec![
        Outcome::Fail { after: vec![] },
        Outcome::Succeed { steps: vec![] },
    ]);
    let (scheduler, trigger_rx) = ManualScheduler::new(0);
    let notifier = Arc::new(RecordingNotifier::default());
    let (fg_pub, mut fg_sub) = rig.bus.attach(&rig.cfg.channel);

    let executor = rig.spawn_executor(transport.clone());
    let _coordinator = Coordinator::spawn(
        &rig.bus,
        rig.store.clone(),
        transport,
        scheduler.clone(),
        notifier.clone(),
        trigger_rx,
        rig.cfg.clone(),
    );

    executor.submit(sample_file()).await.unwrap();
    collect_until_status(&mut fg_sub, STATUS_FAILED).await;
    collect_until_status(&mut fg_sub, STATUS_RETRYING).await;
    wait_for_registration(&scheduler, 1).await;

    // page closes: the executor is gone before the trigger fires
    fg_pub.publish(Message::Terminate).unwrap();
    executor.join().await.unwrap();

    scheduler.fire(RETRY_TAG);

    let failover = collect_until_status(&mut fg_sub, STATUS_DONE).await;
    assert!(
        failover.contains(&Message::HeartBeat),
        "expected a probe first: {failover:?}"
    );
    assert!(
        !failover.iter().any(|m| matches!(m, Message::Ready { .. })),
        "failover must not look like an executor session: {failover:?}"
    );
    assert!(
        !failover.contains(&Message::ResumeUpload),
        "resume and failover are mutually exclusive: {failover:?}"
    );

    assert_eq!(
        notifier.titles(),
        vec![
            "Resuming upload in the background".to_string(),
            "Upload successful".to_string(),
        ]
    );
    assert!(store::load_pending(&*rig.store).await.unwrap().is_none());
}

// Scenario D: terminate mid-transfer abandons the session with no terminal
// status and no persisted file.
#[tokio::test]
async fn terminate_mid_transfer_abandons_silently() {
    let rig = Rig::new();
    let transport = MockTransport::new(vec![Outcome::Hang]);
    let (fg_pub, mut fg_sub) = rig.bus.attach(&rig.cfg.channel);
    let executor = rig.spawn_executor(transport);

    executor.submit(sample_file()).await.unwrap();
    assert!(matches!(
        next_message(&mut fg_sub).await,
        Message::Ready { .. }
    ));

    fg_pub.publish(Message::Terminate).unwrap();
    executor.join().await.unwrap();

    expect_silence(&mut fg_sub, Duration::from_millis(300)).await;
    assert!(store::load_pending(&*rig.store).await.unwrap().is_none());
}

// Idempotence: resumeUpload with nothing pending produces no traffic.
#[tokio::test]
async fn resume_with_no_pending_file_is_a_no_op() {
    let rig = Rig::new();
    let transport = MockTransport::new(vec![]);
    let (fg_pub, mut fg_sub) = rig.bus.attach(&rig.cfg.channel);
    let _executor = rig.spawn_executor(transport);

    fg_pub.publish(Message::ResumeUpload).unwrap();
    expect_silence(&mut fg_sub, Duration::from_millis(300)).await;
}

// Failover with nothing pending is equally silent.
#[tokio::test]
async fn failover_with_no_pending_file_is_a_no_op() {
    let rig = Rig::new();
    let transport = MockTransport::new(vec![]);
    let (scheduler, trigger_rx) = ManualScheduler::new(0);
    let notifier = Arc::new(RecordingNotifier::default());
    let (_fg_pub, mut fg_sub) = rig.bus.attach(&rig.cfg.channel);

    let _coordinator = Coordinator::spawn(
        &rig.bus,
        rig.store.clone(),
        transport,
        scheduler.clone(),
        notifier.clone(),
        trigger_rx,
        rig.cfg.clone(),
    );

    scheduler.fire(RETRY_TAG);

    // the probe goes out, then nothing: no executor, no pending file
    assert_eq!(next_message(&mut fg_sub).await, Message::HeartBeat);
    expect_silence(&mut fg_sub, Duration::from_millis(300)).await;
    assert!(notifier.titles().is_empty());
}

// Registration failure is retried on the fixed backoff until it sticks.
#[tokio::test]
async fn registration_failure_is_retried_until_it_sticks() {
    let rig = Rig::new();
    let transport = MockTransport::new(vec![]);
    let (scheduler, trigger_rx) = ManualScheduler::new(1);
    let notifier = Arc::new(RecordingNotifier::default());
    let (fg_pub, _fg_sub) = rig.bus.attach(&rig.cfg.channel);

    let _coordinator = Coordinator::spawn(
        &rig.bus,
        rig.store.clone(),
        transport,
        scheduler.clone(),
        notifier,
        trigger_rx,
        rig.cfg.clone(),
    );

    fg_pub
        .publish(Message::Status {
            status: STATUS_FAILED.into(),
            retry: true,
        })
        .unwrap();

    // first attempt fails, the backoff retry succeeds
    wait_for_registration(&scheduler, 1).await;
    assert_eq!(scheduler.registration_count(), 1);
}

// Exhausting the retry budget ends the session with a terminal failure
// instead of re-arming the trigger forever.
#[tokio::test]
async fn exhausted_retry_budget_fails_terminally() {
    let rig = Rig::new();
    let mut cfg = rig.cfg.clone();
    cfg.max_retry_cycles = 1;
    let transport = MockTransport::new(vec![Outcome::Fail { after: vec![] }]);
    let (scheduler, trigger_rx) = ManualScheduler::new(0);
    let notifier = Arc::new(RecordingNotifier::default());
    let (_fg_pub, mut fg_sub) = rig.bus.attach(&cfg.channel);

    store::save_pending(&*rig.store, &sample_file())
        .await
        .unwrap();

    let _coordinator = Coordinator::spawn(
        &rig.bus,
        rig.store.clone(),
        transport,
        scheduler.clone(),
        notifier.clone(),
        trigger_rx,
        cfg,
    );

    scheduler.fire(RETRY_TAG);

    let outcome = collect_until_status(&mut fg_sub, STATUS_FAILED).await;
    assert!(matches!(
        outcome.last(),
        Some(Message::Status { retry: false, .. })
    ));
    assert_eq!(
        notifier.titles(),
        vec![
            "Resuming upload in the background".to_string(),
            "Upload failed".to_string(),
        ]
    );
    assert_eq!(scheduler.registration_count(), 0);
    // the file stays persisted for a future foreground session
    assert!(store::load_pending(&*rig.store).await.unwrap().is_some());
}

// A fresh lease held by another owner turns failover into a no-op.
#[tokio::test]
async fn foreign_lease_blocks_failover() {
    let rig = Rig::new();
    let transport = MockTransport::new(vec![Outcome::Succeed { steps: vec![] }]);
    let (scheduler, trigger_rx) = ManualScheduler::new(0);
    let notifier = Arc::new(RecordingNotifier::default());
    let (_fg_pub, mut fg_sub) = rig.bus.attach(&rig.cfg.channel);

    store::save_pending(&*rig.store, &sample_file())
        .await
        .unwrap();
    assert!(
        store::acquire_lease(&*rig.store, "executor", Duration::from_secs(60))
            .await
            .unwrap()
    );

    let _coordinator = Coordinator::spawn(
        &rig.bus,
        rig.store.clone(),
        transport,
        scheduler.clone(),
        notifier.clone(),
        trigger_rx,
        rig.cfg.clone(),
    );

    scheduler.fire(RETRY_TAG);

    assert_eq!(next_message(&mut fg_sub).await, Message::HeartBeat);
    expect_silence(&mut fg_sub, Duration::from_millis(300)).await;
    assert!(notifier.titles().is_empty());
    assert!(store::load_pending(&*rig.store).await.unwrap().is_some());
}
