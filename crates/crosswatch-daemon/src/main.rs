//! Crosswatch daemon: wire the store, LLM adapter, authority tracker,
//! dispatcher, pipeline, and fan-in together and run until SIGINT/SIGTERM.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crosswatch_core::clock::{Clock, SystemClock};
use crosswatch_core::config::{load_channel_list, CrosswatchConfig};
use crosswatch_core::types::ChannelClass;
use crosswatch_ingest::{ChatTransport, FanIn, MessageFilter, WatchedChannel};
use crosswatch_llm::LlmClient;
use crosswatch_pipeline::{AuthorityTracker, Dispatcher, Pipeline};
use crosswatch_store::Store;
use crosswatch_telegram::TelegramTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crosswatch=info".into()),
        )
        .init();

    // Config: explicit path via CROSSWATCH_CONFIG, else ./crosswatch.toml.
    // Missing credentials are fatal (exit code 1).
    let config_path = std::env::var("CROSSWATCH_CONFIG").ok();
    let config = match CrosswatchConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("config load failed: {e}");
            return Err(e.into());
        }
    };

    let source_channels = load_channel_list(&config.channels.source_list)?;
    let smart_channels = load_channel_list(&config.channels.smart_list)?;
    info!(
        source = source_channels.len(),
        smart = smart_channels.len(),
        "channel lists loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(Store::open(&config.database.db_path())?);

    let authority = Arc::new(AuthorityTracker::new(
        Arc::clone(&store),
        config.pipeline.source_default_authority,
        config.pipeline.smart_default_authority,
    ));
    authority.load(&source_channels, &smart_channels, clock.now())?;

    let llm = Arc::new(LlmClient::new(&config.llm, Arc::clone(&clock))?);

    // Session 0 is send-capable; readers come from the JSON list. A broken
    // main session is fatal, a broken reader only costs throughput.
    let token = config.telegram.bot_token.clone().unwrap_or_default();
    let main_session: Arc<dyn ChatTransport> =
        Arc::new(TelegramTransport::connect("main", &token).await?);
    let mut sessions = vec![main_session];
    for (i, reader) in config.telegram.load_readers()?.iter().enumerate() {
        let Some(reader_token) = reader.token.as_deref() else {
            warn!(index = i, "reader entry has no token, skipped");
            continue;
        };
        let name = format!("reader-{}", i + 1);
        match TelegramTransport::connect(&name, reader_token).await {
            Ok(session) => sessions.push(Arc::new(session)),
            Err(e) => warn!(session = %name, "reader connect failed, skipped: {e}"),
        }
    }

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&sessions[0]),
        Arc::clone(&authority),
        config.output.output_chat,
        config.output.summary_chat(),
    ));
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&store),
        llm,
        Arc::clone(&authority),
        dispatcher,
        config.pipeline.clone(),
        Arc::clone(&clock),
    ));
    let restored = pipeline.restore()?;
    if restored > 0 {
        info!(events = restored, "pool restored from store");
    }

    let watched: Vec<WatchedChannel> = source_channels
        .iter()
        .map(|c| WatchedChannel {
            username: c.clone(),
            class: ChannelClass::Source,
        })
        .chain(smart_channels.iter().map(|c| WatchedChannel {
            username: c.clone(),
            class: ChannelClass::Smart,
        }))
        .collect();

    let (post_tx, post_rx) = mpsc::channel(config.ingest.queue_capacity);
    let filter = MessageFilter::new(clock.now(), config.ingest.block_phrases.clone());
    let fanin = FanIn::new(
        sessions.clone(),
        watched,
        config.ingest.clone(),
        config.output.smart_chat,
        filter,
        post_tx,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = fanin.spawn(shutdown_rx.clone());
    handles.push(tokio::spawn(
        Arc::clone(&pipeline).run_consumer(post_rx, shutdown_rx.clone()),
    ));
    handles.push(tokio::spawn(
        Arc::clone(&pipeline).run_aggregator(shutdown_rx.clone()),
    ));
    handles.push(tokio::spawn(
        Arc::clone(&pipeline).run_maintenance(shutdown_rx.clone()),
    ));

    info!("crosswatch running");
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
    }
    for session in &sessions {
        if let Err(e) = session.disconnect().await {
            warn!(session = session.name(), "disconnect failed: {e}");
        }
    }
    store.close();
    info!("goodbye");
    Ok(())
}
