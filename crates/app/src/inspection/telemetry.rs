//! Tracing subscriber setup, the Prometheus exporter and dispatcher-aware threads.

use std::{io, net::SocketAddr, path::Path, path::PathBuf, thread};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::Subscriber;
use tracing_subscriber::{
    Layer,
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    registry::LookupSpan,
};

#[derive(Debug, Clone, Default)]
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file with worker spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Serve Prometheus metrics on this address.
    pub metrics_addr: Option<SocketAddr>,
}

/// Keeps the subscriber installed and the chrome trace flushing.
pub struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    _chrome_guard: Option<tracing_chrome::FlushGuard>,
}

/// Install the subscriber for the current thread. Workers started with
/// [`spawn_thread`] inherit it.
pub fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_deref().map(build_chrome_layer)
    {
        Some(Ok((layer, guard))) => (Some(layer), Some(guard)),
        Some(Err(err)) => {
            eprintln!("failed to initialise chrome trace writer: {err}");
            (None, None)
        }
        None => (None, None),
    };

    let default_guard = match chrome_layer {
        Some(chrome) => tracing::subscriber::set_default(
            tracing_subscriber::registry()
                .with(chrome.with_filter(filter_fn(|metadata| metadata.is_span())))
                .with(fmt_layer(env_filter)),
        ),
        None => tracing::subscriber::set_default(
            tracing_subscriber::registry().with(fmt_layer(env_filter)),
        ),
    };

    TelemetryGuard {
        _default_guard: default_guard,
        _chrome_guard: chrome_guard,
    }
}

fn fmt_layer<S>(filter: EnvFilter) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_target(false)
        .with_timer(fmt::time::uptime())
        .with_filter(filter)
}

/// Install the global Prometheus recorder with its HTTP listener.
pub fn install_metrics_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("failed to start Prometheus exporter on {addr}"))?;
    describe_metrics();
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!("inspect_rollers_finalized_total", "Rollers popped at finalization");
    metrics::describe_counter!(
        "inspect_detections_dropped_total",
        "Detections removed by the confidence or size gate"
    );
    metrics::describe_counter!("inspect_commands_total", "Actuator commands queued");
    metrics::describe_counter!("inspect_capture_failures_total", "Failed camera reads");
    metrics::describe_histogram!(
        "inspect_inference_latency_seconds",
        "Detector call duration per cycle"
    );
    metrics::describe_counter!("fieldbus_pulses_total", "Actuator pulses written to the PLC");
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> Result<
    (
        tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
        tracing_chrome::FlushGuard,
    ),
    io::Error,
> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawned_thread_is_named() {
        let handle = spawn_thread("inference-bf", || {
            thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("inference-bf"));
    }

    #[test]
    fn test_chrome_trace_file_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");
        {
            let _guard = enter_runtime(&TelemetryOptions {
                chrome_trace_path: Some(path.clone()),
                metrics_addr: None,
            });
            let _span = tracing::info_span!("cycle").entered();
        }
        assert!(path.exists());
    }
}
