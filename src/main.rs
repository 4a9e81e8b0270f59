//! astrocam: DSLR live view and bulb scheduling over gphoto2

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use astrocam::{CaptureController, Config, Gphoto2Camera};
use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "astrocam", about = "DSLR live view and bulb scheduling over gphoto2")]
struct Args {
    /// TOML configuration file, layered over the defaults
    #[arg(long, short, env = "ASTROCAM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Debug, Clone, Copy, Default)]
enum Mode {
    /// Stream live view and log frame statistics (default)
    #[default]
    Live,
    /// Run repeated bulb exposures with the configured timing
    Schedule,
    /// Take one exposure with the current settings and exit
    Capture,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("astrocam=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("astrocam launching...");

    let config = Config::load(args.config.as_deref())?;

    let camera = Gphoto2Camera::new(config.camera.clone());
    let devices = camera.detect()?;
    match devices.first() {
        Some(device) => info!(model = %device.model, port = %device.port, "Using camera"),
        None => warn!("No camera detected"),
    }

    let controller = Arc::new(CaptureController::new(Arc::new(camera), &config));

    match args.mode.unwrap_or_default() {
        Mode::Capture => {
            let id = blocking(&controller, |c| c.capture_once()).await?;
            info!(file = %id, "Capture complete");
            return Ok(());
        }
        Mode::Live => blocking(&controller, |c| c.start_stream()).await?,
        Mode::Schedule => blocking(&controller, |c| c.start_schedule_from_settings()).await?,
    }

    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }
            _ = ticker.tick() => log_status(&controller),
        }
    }

    let shutdown = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || shutdown.shutdown()).await?;

    info!("astrocam shutting down");
    Ok(())
}

/// Run a blocking controller call off the async runtime.
async fn blocking<T, F>(controller: &Arc<CaptureController>, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&CaptureController) -> astrocam::Result<T> + Send + 'static,
{
    let controller = Arc::clone(controller);
    Ok(tokio::task::spawn_blocking(move || call(&controller)).await??)
}

fn log_status(controller: &CaptureController) {
    if let Some(status) = controller.schedule_status() {
        info!(
            exposures = status.exposures,
            elapsed_s = status.elapsed.as_secs(),
            last = ?status.last_exposure,
            error = ?status.last_error,
            "Schedule status"
        );
        return;
    }

    let stats = controller.stream().stats();
    let frame = controller.get_latest_frame();
    info!(
        frames = stats.frames_decoded,
        dropped = stats.queue.dropped,
        bytes = stats.bytes_read,
        shape = ?frame.as_ref().map(|f| f.shape()),
        "Stream status"
    );
}
