//! Supervisor: wires queues and shared state, spawns the workers, watches
//! for a fault or Ctrl+C and tears everything down.

use std::{
    sync::{Arc, Once},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::unbounded;
use fieldbus::S7Client;
use tracing::{error, info, warn};

use crate::inspection::{
    capture::{CaptureSettings, open_source, spawn_capture_worker},
    catalog::{FileCatalog, ThresholdCatalog},
    channel::Channel,
    command::Decision,
    config::PlantConfig,
    evidence::EvidenceSink,
    frame_buffer::ChannelFrames,
    inference::{
        ChannelInspector, HeadPass, InspectorParts, labels_for, load_detector,
        spawn_inference_worker,
    },
    plc::{FieldbusWorker, PlcLayout, spawn_fieldbus_worker},
    reporter::{ReporterPaths, spawn_reporter},
    slot_control::{SlotController, spawn_slot_worker},
    status::StatusStore,
    telemetry::{self, TelemetryOptions},
};

const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Run the line until Ctrl+C or the first fault. A fault is returned as an
/// error so the process exits non-zero.
pub fn run(config: PlantConfig) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&TelemetryOptions {
        chrome_trace_path: config.telemetry.chrome_trace.clone(),
        metrics_addr: config.telemetry.metrics_addr,
    });
    if let Some(addr) = config.telemetry.metrics_addr {
        telemetry::install_metrics_exporter(addr)?;
    }
    let _span = tracing::info_span!(
        "inspection",
        plc = %config.plc.endpoint().address(),
        evidence = %config.evidence_root.display(),
        archive_all = config.archive_all
    )
    .entered();

    let store = Arc::new(StatusStore::new(config.archive_all));
    install_interrupt_handler(store.clone());

    let catalog: Arc<dyn ThresholdCatalog> = match &config.catalog {
        Some(path) => Arc::new(FileCatalog::load(path)?),
        None => {
            warn!("no threshold catalog configured, using built-in defaults");
            Arc::new(FileCatalog::default())
        }
    };

    let mut handles = spawn_workers(&config, catalog, store.clone())?;
    supervise(&store, &mut handles);

    store.request_shutdown();
    for (name, handle) in handles {
        if handle.join().is_err() {
            warn!(worker = %name, "worker panicked during shutdown");
        }
    }

    match store.fault() {
        Some(fault) => {
            error!(worker = %fault.worker, at = %fault.at, "stopped on fault: {}", fault.message);
            Err(anyhow!("{} failed: {}", fault.worker, fault.message))
        }
        None => {
            info!("shutdown complete");
            Ok(())
        }
    }
}

fn install_interrupt_handler(store: Arc<StatusStore>) {
    static CTRL_HANDLER: Once = Once::new();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            store.request_shutdown();
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
}

/// Block until stop. A worker that exits on its own while the line should
/// still be running counts as a fault.
fn supervise(store: &StatusStore, handles: &mut [(String, JoinHandle<()>)]) {
    while !store.should_stop() {
        if let Some((name, _)) = handles.iter().find(|(_, h)| h.is_finished()) {
            if !store.should_stop() {
                store.raise_fault(name, "worker exited unexpectedly");
            }
            break;
        }
        thread::sleep(WATCH_INTERVAL);
    }
    if store.shutdown_requested() && !store.has_fault() {
        info!("interrupt received, stopping workers");
    }
}

fn spawn_workers(
    config: &PlantConfig,
    catalog: Arc<dyn ThresholdCatalog>,
    store: Arc<StatusStore>,
) -> Result<Vec<(String, JoinHandle<()>)>> {
    let mut handles = Vec::new();
    let (command_tx, command_rx) = unbounded();

    for channel in Channel::ALL {
        let cfg = config.channel(channel).clone();
        let roles = config.roles(channel);
        let frames = Arc::new(ChannelFrames::new(cfg.width, cfg.height));
        let (decision_tx, decision_rx) = unbounded::<Decision>();
        let tag = channel.label().to_lowercase();

        let settings = CaptureSettings {
            channel,
            flip: cfg.flip,
            read_backoff: config.read_backoff(channel),
        };
        let source = cfg.source.clone();
        let size = (cfg.width, cfg.height);
        let handle = spawn_capture_worker(
            move || open_source(&source, size),
            frames.clone(),
            store.clone(),
            settings,
        )
        .context("failed to spawn capture worker")?;
        handles.push((format!("capture-{tag}"), handle));

        let build = inspector_builder(config, channel, catalog.clone());
        let handle = spawn_inference_worker(
            build,
            cfg.warmup_image.clone(),
            frames,
            store.clone(),
            decision_tx,
            channel,
        )
        .context("failed to spawn inference worker")?;
        handles.push((format!("inference-{tag}"), handle));

        let handle = spawn_slot_worker(
            SlotController::new(channel, roles.gate),
            store.clone(),
            decision_rx,
            command_tx.clone(),
        )
        .context("failed to spawn slot worker")?;
        handles.push((format!("slot-{tag}"), handle));
    }
    drop(command_tx);

    let link = S7Client::new(config.plc.endpoint());
    let worker = FieldbusWorker::new(
        link,
        PlcLayout::plant_default(config.plc.db),
        store.clone(),
        command_rx,
        config.plc.poll_interval(),
    );
    let handle = spawn_fieldbus_worker(worker).context("failed to spawn fieldbus worker")?;
    handles.push(("fieldbus".to_string(), handle));

    let paths = ReporterPaths {
        status_file: config.status_file.clone(),
        control_file: config.control_file.clone(),
    };
    if !paths.is_empty() {
        let interval = Duration::from_millis(config.status_interval_ms);
        let handle = spawn_reporter(store, paths, interval)
            .context("failed to spawn status reporter")?;
        handles.push(("status-reporter".to_string(), handle));
    }

    Ok(handles)
}

/// Closure run on the inference thread: loads the models and fetches the
/// thresholds once.
fn inspector_builder(
    config: &PlantConfig,
    channel: Channel,
    catalog: Arc<dyn ThresholdCatalog>,
) -> impl FnOnce() -> Result<ChannelInspector> + Send + 'static {
    let model = config.channel(channel).model.clone();
    let head = match channel {
        Channel::Bf => config.head.clone(),
        Channel::Od => None,
    };
    let profile = config.profile.clone();
    let roles = config.roles(channel);
    let evidence = EvidenceSink::new(config.evidence_root.clone(), config.jpeg_quality);

    move || {
        let thresholds = catalog
            .class_thresholds(&model.catalog_key())
            .with_context(|| format!("thresholds for {}", model.catalog_key()))?;
        let detector = load_detector(&model)?;
        let head = match head {
            Some(head) => Some(HeadPass {
                detector: load_detector(&head.model)?,
                limits: catalog.head_limits(&profile)?,
                trigger: head.trigger_bit,
            }),
            None => None,
        };
        info!(
            %channel,
            model = %model.path.display(),
            model_confidence = thresholds.model_confidence(),
            head_pass = head.is_some(),
            "inspector configured"
        );
        Ok(ChannelInspector::new(InspectorParts {
            channel,
            detector,
            head,
            labels: labels_for(&model),
            thresholds,
            roles,
            evidence,
        }))
    }
}
