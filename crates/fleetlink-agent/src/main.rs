//! fleetlink-agent - on-vehicle telemetry agent
//!
//! Wires the collection & inspection core together: signal pipeline,
//! campaign manager, inspection worker, checkin reporter, uploader and
//! persistence, all driven from a single JSON configuration file.
//!
//! The broker transport is an external integration consumed through the
//! `Transport` trait; this binary runs with the offline implementation,
//! persisting what campaigns allow and dropping the rest until a broker
//! module is wired in at deployment.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 unrecoverable
//! subsystem failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use fleetlink_core::campaign::manager::{
    CampaignManager, CampaignManagerOutputs, ControlDocument,
};
use fleetlink_core::checkin::CheckinSender;
use fleetlink_core::clock::{Clock, SystemClock};
use fleetlink_core::config::AgentConfig;
use fleetlink_core::dictionary::DecoderDictionary;
use fleetlink_core::inspection::custom::{
    CustomFunctionRegistry, MultiRisingEdgeTrigger, MULTI_RISING_EDGE_FUNCTION_NAME,
};
use fleetlink_core::inspection::{InspectionEngine, InspectionMatrix, InspectionWorker};
use fleetlink_core::persistency::BlobStore;
use fleetlink_core::pipeline::{SignalDistributor, SignalQueue};
use fleetlink_core::rawdata::BufferManager;
use fleetlink_core::transport::{Transport, TransportError};
use fleetlink_core::uploader::Uploader;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// fleetlink on-vehicle telemetry agent
#[derive(Parser, Debug)]
#[command(name = "fleetlink-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the agent configuration file
    #[arg(short, long, default_value = "fleetlink.json")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Transport used until a broker integration is wired in: every send
/// fails as not-connected, so persistent campaigns fall back to disk.
struct OfflineTransport;

#[async_trait]
impl Transport for OfflineTransport {
    async fn send_checkin(&self, _payload: Bytes) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }

    async fn send_vehicle_data(&self, _payload: Bytes) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(error) = init_tracing(&args) {
        eprintln!("failed to initialize logging: {error:#}");
        return ExitCode::from(2);
    }

    let config = match AgentConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(path = %args.config.display(), %error, "configuration error");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(%error, "failed to create runtime");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %format!("{error:#}"), "unrecoverable failure");
            ExitCode::from(2)
        }
    }
}

async fn run(config: AgentConfig) -> Result<()> {
    info!(
        sources = config.sources.len(),
        endpoint = %config.transport.endpoint,
        "starting fleetlink agent"
    );
    for source in &config.sources {
        info!(
            interface_id = %source.interface_id,
            kind = %source.kind,
            device = %source.device,
            "configured signal source"
        );
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    let persistency = match &config.persistency {
        Some(persistency_config) => Some(Arc::new(
            BlobStore::new(&persistency_config.path, persistency_config.max_bytes)
                .context("failed to initialize persistency store")?,
        )),
        None => {
            info!("persistency disabled");
            None
        }
    };

    let raw_data = BufferManager::new(&config.raw_data);

    // Data path: decoders -> distributor -> inspection queue.
    let distributor = Arc::new(SignalDistributor::new());
    let inspection_queue = SignalQueue::new(config.pipeline.signal_queue_size, "inspection");
    distributor.register(Arc::clone(&inspection_queue));

    let (matrix_tx, matrix_rx) = watch::channel(InspectionMatrix::empty());
    let (dictionary_tx, dictionary_rx) = watch::channel(DecoderDictionary::empty());
    let (triggered_tx, triggered_rx) =
        mpsc::channel(config.pipeline.triggered_data_queue_size);
    let (documents_tx, documents_rx) = mpsc::channel::<ControlDocument>(8);

    let transport: Arc<dyn Transport> = Arc::new(OfflineTransport);
    if config.transport.endpoint.is_empty() {
        info!("no broker endpoint configured, running offline");
    } else {
        warn!(
            endpoint = %config.transport.endpoint,
            "broker integration not linked into this build, running offline"
        );
    }

    let mut custom_functions = CustomFunctionRegistry::new().with_math_functions();
    custom_functions.register(
        MULTI_RISING_EDGE_FUNCTION_NAME,
        Box::new(MultiRisingEdgeTrigger::new(
            dictionary_rx.clone(),
            Some(Arc::clone(&raw_data)),
        )),
    );

    let checkin = CheckinSender::new(
        Arc::clone(&transport),
        Arc::clone(&clock),
        config.checkin.interval_ms,
    );
    let checkin_handle = checkin.spawn();

    let engine = InspectionEngine::new(Some(Arc::clone(&raw_data)), custom_functions);
    let worker_handle = InspectionWorker::new(
        Arc::clone(&inspection_queue),
        matrix_rx,
        triggered_tx,
        Arc::clone(&clock),
        engine,
    )
    .spawn();

    let uploader_handle = Uploader::new(
        Arc::clone(&transport),
        Arc::clone(&clock),
        Some(Arc::clone(&raw_data)),
        persistency.clone(),
        triggered_rx,
    )
    .spawn();

    let manager_handle = CampaignManager::new(
        Arc::clone(&clock),
        persistency,
        documents_rx,
        CampaignManagerOutputs {
            matrix_tx,
            dictionary_tx,
            checkin: Arc::clone(&checkin),
            raw_data: Some(Arc::clone(&raw_data)),
        },
        config.raw_data.clone(),
        config.campaign_manager.idle_time_ms,
    )
    .spawn();

    info!("fleetlink agent started");

    // The control-plane sender stays alive here; the broker integration
    // pushes documents through it once one is wired in.
    let _documents_tx = documents_tx;

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    info!("shutting down");
    manager_handle.disconnect().await;
    worker_handle.disconnect().await;
    uploader_handle.disconnect().await;
    checkin_handle.disconnect().await;
    info!(
        dropped_frames = inspection_queue.dropped(),
        "fleetlink agent stopped"
    );
    Ok(())
}
