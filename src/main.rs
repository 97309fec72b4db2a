//! Serves the latest frame of a V4L2 capture device over HTTP

use std::net::SocketAddr;

use camsnap::capture::V4l2Device;
use camsnap::{server, utils, Config, FramePublisher, FramePump};
use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camsnap=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camsnap launching...");

    // Load configuration
    let config_path = std::env::var("CAMSNAP_CONFIG").unwrap_or_else(|_| "camsnap.toml".into());
    let mut config = Config::load(&config_path)
        .wrap_err_with(|| format!("loading configuration from {}", config_path))?;

    // Auto-detect capture device if needed
    if config.capture.device.is_empty() {
        let found = utils::auto_detect_device()?;
        config.capture.device = found.path;
        config.capture.format = found.format;
    }
    info!("Using capture device: {}", config.capture.device);

    // Negotiate, allocate, map and arm the single buffer
    let mut device = V4l2Device::new(&config.capture)?;
    let format = device
        .format()
        .ok_or_else(|| eyre!("capture format was not negotiated"))?;
    device.start_stream()?;

    let publisher = FramePublisher::new();
    let pump = FramePump::new(device, publisher.clone())?;
    let stop = pump.stop_signal();
    let mut pump_task = tokio::task::spawn_blocking(move || pump.run());

    let addr = SocketAddr::new(config.server.bind, config.server.port);
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {}", addr))?;
    let app = server::router(publisher, &config.server.path, format.format);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut server_task = tokio::spawn(server::serve(listener, app, async move {
        let _ = shutdown_rx.await;
    }));

    let mut served = None;
    let pump_joined = tokio::select! {
        joined = &mut pump_task => Some(joined),
        _ = shutdown_signal() => {
            info!("Shutdown requested");
            None
        }
        result = &mut server_task => {
            error!("HTTP server exited unexpectedly");
            served = Some(result);
            None
        }
    };

    info!("camsnap shutting down");

    // The pump owns the device; the buffer is unmapped when it returns
    stop.stop();
    let pump_result = match pump_joined {
        Some(joined) => joined,
        None => pump_task.await,
    };

    let _ = shutdown_tx.send(());
    let served = match served {
        Some(result) => result,
        None => server_task.await,
    };

    let report = pump_result??;
    served??;

    info!(
        "Published {} frames, skipped {}",
        report.frames_published, report.frames_skipped
    );
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
