use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use uplink::coordinator::Coordinator;
use uplink::executor::UploadExecutor;
use uplink::host::{TokioRetryScheduler, TracingNotifier};
use uplink::protocol::{Message, STATUS_DONE, STATUS_FAILED, UploadFile};
use uplink::store::{FsStore, KeyValueStore};
use uplink::transport::HttpTransport;
use uplink::{Config, MessageBus, load_config};

#[derive(Parser)]
#[command(name = "uplink")]
#[command(about = "Resumable background upload client", long_about = None)]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Upload a file using ./uplink upload video.mp4")]
    Upload {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => load_config(&path.to_string_lossy())?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Upload { file } => upload(cfg, file).await,
    }
}

/// The foreground controller: spawns the executor and coordinator, hands
/// the executor a file, and renders the session from bus traffic.
async fn upload(cfg: Config, path: PathBuf) -> anyhow::Result<()> {
    let file = UploadFile::from_path(&path).await?;

    let bus = MessageBus::new();
    let store: Arc<dyn KeyValueStore> = Arc::new(FsStore::new(&cfg.store_root));
    let transport = Arc::new(HttpTransport::new(&cfg.endpoint));
    let (scheduler, trigger_rx) = TokioRetryScheduler::new(cfg.trigger_delay());
    let (fg_publisher, mut fg_subscriber) = bus.attach(&cfg.channel);

    let executor = UploadExecutor::spawn(&bus, store.clone(), transport.clone(), cfg.clone());
    let _coordinator = Coordinator::spawn(
        &bus,
        store,
        transport,
        Arc::new(scheduler),
        Arc::new(TracingNotifier),
        trigger_rx,
        cfg,
    );

    executor.submit(file).await?;

    loop {
        tokio::select! {
            msg = fg_subscriber.recv() => match msg? {
                Message::Ready { file_name } => info!("uploading {file_name}"),
                Message::Progress { progress } => info!("progress: {:.0}%", progress * 100.0),
                Message::Status { status, retry } => {
                    info!("status: {status}");
                    if status == STATUS_DONE || (status == STATUS_FAILED && !retry) {
                        break;
                    }
                }
                _ => {}
            },
            _ = signal::ctrl_c() => {
                info!("interrupted, terminating upload");
                fg_publisher.publish(Message::Terminate)?;
                break;
            }
        }
    }
    Ok(())
}
