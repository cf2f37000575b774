mod providers;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use minbar_bus::InProcessBus;
use minbar_core::pubsub::{
    ConsumerConfig, PubSub, StreamConfig, CONTEXT_STREAM, STREAM_MAX_AGE, SUBJECT_SYNC,
    SUBJECT_SYNC_COMMIT,
};
use minbar_engine::{
    probe_pair, AskSvc, ContextManager, FnRegistry, Memorizer, SearchFn, SearchSvc, Summarizer,
    Syncer, ACK_WAIT_OFFSET, MEMORIZE_IDLE, SUMMARIZE_IDLE, SYNC_IDLE_FLUSH,
};
use minbar_llm::AgentRegistry;
use minbar_server::{AppState, ServerConfig};
use minbar_store::{Database, MemoryCache};
use minbar_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "minbar", about = "Retrieval-augmented conversational Q&A backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server and the background workers.
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Data directory for the database and telemetry sinks.
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let data_dir = args.db.unwrap_or_else(|| dirs_home().join(".minbar"));
    std::fs::create_dir_all(&data_dir)?;

    let log_level: Level = args
        .log_level
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid log level: {}", args.log_level))?;
    let guard = init_telemetry(TelemetryConfig {
        log_level,
        json_logs: args.json_logs,
        log_db_path: data_dir.join("logs.db"),
        metrics_db_path: data_dir.join("metrics.db"),
        ..Default::default()
    });
    let metrics = guard.metrics();

    let db = Database::open(&data_dir.join("minbar.db"))?;
    info!(path = %data_dir.display(), "database opened");

    let bus = Arc::new(InProcessBus::new());
    bus.create_stream(StreamConfig {
        name: CONTEXT_STREAM.into(),
        subjects: vec![SUBJECT_SYNC.into(), SUBJECT_SYNC_COMMIT.into()],
        max_age: STREAM_MAX_AGE,
    })
    .await?;

    let cache = Arc::new(MemoryCache::new());
    let context = Arc::new(ContextManager::new(cache, bus.clone(), db.clone()));
    let agents = Arc::new(AgentRegistry::new());

    // Provider seams. Real embedding, index, rerank, and model clients
    // replace `Unconfigured` at deployment time.
    let retrieval = Arc::new(providers::Unconfigured);
    let gateway = Arc::new(providers::Unconfigured);
    warn!("no providers configured, asks will answer unavailable");

    let mut search = SearchSvc::new(retrieval.clone(), retrieval.clone(), retrieval);
    if let Some(m) = &metrics {
        search = search.with_metrics(Arc::clone(m));
    }
    let functions = Arc::new(FnRegistry::new().register(Arc::new(SearchFn::new(Arc::new(search)))));

    let mut ask = AskSvc::new(context, gateway.clone(), agents.clone(), functions);
    if let Some(m) = &metrics {
        ask = ask.with_metrics(Arc::clone(m));
    }
    let ask = Arc::new(ask);

    let cancel = CancellationToken::new();
    let mut probes = Vec::new();
    let mut workers = Vec::new();

    let consumer = bus
        .create_consumer(ConsumerConfig {
            stream: CONTEXT_STREAM.into(),
            durable_name: "syncer".into(),
            filter_subject: SUBJECT_SYNC.into(),
            ack_wait: SYNC_IDLE_FLUSH + ACK_WAIT_OFFSET,
        })
        .await?;
    let (probe, responder) = probe_pair("syncer");
    let mut syncer = Syncer::new(db.clone(), bus.clone(), consumer, responder, cancel.clone());
    if let Some(m) = &metrics {
        syncer = syncer.with_metrics(Arc::clone(m));
    }
    probes.push(probe);
    workers.push(tokio::spawn(syncer.run()));

    let consumer = bus
        .create_consumer(ConsumerConfig {
            stream: CONTEXT_STREAM.into(),
            durable_name: "summarizer".into(),
            filter_subject: SUBJECT_SYNC_COMMIT.into(),
            ack_wait: SUMMARIZE_IDLE + ACK_WAIT_OFFSET,
        })
        .await?;
    let (probe, responder) = probe_pair("summarizer");
    let mut summarizer = Summarizer::new(
        db.clone(),
        gateway.clone(),
        agents.clone(),
        consumer,
        responder,
        cancel.clone(),
    );
    if let Some(m) = &metrics {
        summarizer = summarizer.with_metrics(Arc::clone(m));
    }
    probes.push(probe);
    workers.push(tokio::spawn(summarizer.run()));

    let consumer = bus
        .create_consumer(ConsumerConfig {
            stream: CONTEXT_STREAM.into(),
            durable_name: "memorizer".into(),
            filter_subject: SUBJECT_SYNC_COMMIT.into(),
            ack_wait: MEMORIZE_IDLE + ACK_WAIT_OFFSET,
        })
        .await?;
    let (probe, responder) = probe_pair("memorizer");
    let mut memorizer = Memorizer::new(db, gateway, agents, consumer, responder, cancel.clone());
    if let Some(m) = &metrics {
        memorizer = memorizer.with_metrics(Arc::clone(m));
    }
    probes.push(probe);
    workers.push(tokio::spawn(memorizer.run()));

    let state = AppState {
        ask,
        probes: Arc::new(probes),
    };
    let handle = minbar_server::start(ServerConfig { port: args.port }, state, cancel.clone())
        .await?;
    info!(port = handle.port, "minbar ready");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();

    // Workers drain their buffers on cancellation before returning.
    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "worker exited with error"),
            Err(e) => error!(error = %e, "worker task panicked"),
        }
    }
    Ok(())
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
