//! Daemon wiring: builds the engine from configuration and runs it until
//! interrupted.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use uplift_control::{ControlDefaults, ControlServer};
use uplift_dedup::DuplicateDetector;
use uplift_manager::{HistoryStore, UploadEvent, UploadManager};
use uplift_signer::{CredentialProvider, EnvCredentialProvider};
use uplift_throttle::BandwidthThrottler;
use uplift_transfer::{HttpObjectStore, ObjectStore, ResumeStore, TransferClient};

use crate::config::Config;

const RESUME_FILE: &str = "multipart.json";
const HISTORY_FILE: &str = "history.jsonl";

/// How long running jobs get to park after an interrupt.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Builds the upload manager described by `config`.
pub fn build_manager(config: &Config, config_file: &Path) -> anyhow::Result<UploadManager> {
    let credentials: Arc<dyn CredentialProvider> = Arc::new(EnvCredentialProvider);
    if credentials.credentials().is_none() {
        warn!("no credentials in the environment, uploads will fail until they are set");
    }

    let store: Arc<dyn ObjectStore> =
        Arc::new(HttpObjectStore::new(config.store_config(), credentials.clone())?);
    let throttle = Arc::new(BandwidthThrottler::new(config.throttle.bytes_per_sec));

    let state_dir = config.state_dir(config_file);
    let resume = Arc::new(ResumeStore::open(state_dir.join(RESUME_FILE))?);
    let history = HistoryStore::open(state_dir.join(HISTORY_FILE), config.manager.retain_finished)?;
    info!(
        state_dir = %state_dir.display(),
        resumable = resume.records().len(),
        "state loaded"
    );

    let client = TransferClient::new(store.clone(), throttle, config.transfer_options())
        .with_resume_store(resume);
    let detector = DuplicateDetector::new(Some(store), config.detector_options());

    Ok(UploadManager::new(
        config.manager_config(),
        client,
        detector,
        history,
        Some(credentials),
    ))
}

/// Runs the engine and control server until Ctrl-C.
pub async fn run(config: Config, config_file: &Path) -> anyhow::Result<()> {
    let manager = build_manager(&config, config_file)?;
    let cancel = CancellationToken::new();

    if let Some(events) = manager.take_events() {
        tokio::spawn(log_events(events));
    }
    manager.start();

    let server_task = if config.control.enabled {
        let listener = ControlServer::bind(config.control.port).await?;
        let defaults = ControlDefaults {
            bucket: config.defaults.bucket.clone(),
            key_prefix: config.defaults.key_prefix.clone(),
        };
        let server = Arc::new(ControlServer::new(manager.clone(), defaults));
        Some(tokio::spawn(server.serve(listener, cancel.clone())))
    } else {
        info!("control server disabled");
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    cancel.cancel();
    manager.shutdown();
    let mut status = manager.subscribe_status();
    if tokio::time::timeout(SHUTDOWN_GRACE, status.wait_for(|s| s.active == 0))
        .await
        .is_err()
    {
        warn!("jobs still running at exit, they resume from their last acknowledged part");
    }
    if let Some(task) = server_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "control server failed"),
            Err(e) => warn!(error = %e, "control server task panicked"),
        }
    }
    Ok(())
}

async fn log_events(mut events: mpsc::Receiver<UploadEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            UploadEvent::Progress {
                id,
                bytes_uploaded,
                total_bytes,
                speed_bps,
            } => debug!(job = %id, bytes_uploaded, total_bytes, speed_bps, "progress"),
            UploadEvent::DuplicateDetected { id, check } => debug!(
                job = %id,
                kind = ?check.duplicate_type,
                existing = ?check.existing_uri,
                "duplicate detected"
            ),
            other => debug!(event = ?other, "upload event"),
        }
    }
}
