use anyhow::Context;
use gstreamer as gst;
use log::info;
use std::sync::Arc;

use mediaplane::supervisor::FleetSupervisor;
use mediaplane::utils::logging;
use mediaplane::utils::metrics::MediaMetrics;
use mediaplane::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    logging::init(&config.log_level);

    gst::init().context("failed to initialize GStreamer")?;

    let metrics = Arc::new(
        MediaMetrics::with_default_registry().context("failed to build metrics registry")?,
    );

    info!("starting media plane service");
    info!("gRPC address: {}", config.grpc_addr);
    info!("metrics address: {}", config.metrics_addr);

    let supervisor = Arc::new(FleetSupervisor::new(&config, metrics));
    supervisor.start_workers();

    // The RPC layer mounts on `supervisor` and the exporter on the metrics
    // registry; both are separate processes-facing crates. This binary only
    // keeps the fleet alive and drains it on SIGINT/SIGTERM.
    let sos = supervisor.shutdown_signal();
    ctrlc::set_handler({
        let sos = sos.clone();
        move || sos.cancel()
    })
    .context("failed to install signal handler")?;

    sos.wait().await;

    supervisor.shutdown().await;
    info!("media plane service stopped");

    Ok(())
}
