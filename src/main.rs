//! camstream - single-camera MJPEG streaming appliance

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camstream::capture::CaptureService;
use camstream::illuminator::Illuminator;
use camstream::link::{wait_for_link, InterfaceLink, NetworkLink, StaticLink};
use camstream::sensor::{self, SensorBackend, SensorState};
use camstream::server::{self, AppState};
use camstream::settings::SettingsController;
use camstream::status::StatusReporter;
use camstream::stream::SessionManager;
use camstream::watchdog::ConnectivityWatchdog;
use camstream::Config;
use clap::Parser;
use color_eyre::Result;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "camstream")]
#[command(about = "Single-camera MJPEG streaming appliance", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `server.bind`
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Use the synthetic test-pattern sensor instead of hardware
    #[arg(long)]
    synthetic: bool,

    /// List V4L2 capture devices and exit
    #[cfg(feature = "v4l2")]
    #[arg(long)]
    list_devices: bool,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camstream=info"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());

    let registry = tracing_subscriber::registry().with(filter).with(fmt);
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    let args = Args::parse();
    info!("camstream launching...");

    #[cfg(feature = "v4l2")]
    {
        if args.list_devices {
            for device in camstream::utils::list_devices() {
                println!(
                    "{}\t{}\t{}",
                    device.path,
                    device.card,
                    if device.mjpeg { "mjpeg" } else { "-" }
                );
            }
            return Ok(());
        }
    }

    // Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if args.synthetic {
        config.capture.backend = SensorBackend::Synthetic;
    }

    // Auto-detect capture device if needed
    #[cfg(feature = "v4l2")]
    {
        if config.capture.backend == SensorBackend::V4l2 && config.device.path.is_empty() {
            config.device.path = camstream::utils::auto_detect_device()?.path;
        }
    }
    info!("Using capture device: {:?}", config.device);

    // Sensor bring-up failure is fatal: exit and let the supervisor restart us.
    let sensor_state = Arc::new(SensorState::new(config.sensor));
    let sensor = sensor::open(config.capture.backend, &config.device, &sensor_state)?;

    let link: Arc<dyn NetworkLink> = match &config.link.interface {
        Some(name) => Arc::new(InterfaceLink::new(name.clone())),
        None => Arc::new(StaticLink::new(true)),
    };
    wait_for_link(
        link.as_ref(),
        config.link.startup_attempts,
        Duration::from_millis(config.link.startup_step_ms),
    )
    .await?;

    let capture = Arc::new(CaptureService::new(sensor.clone(), config.capture.miss_delay()));
    let illuminator = Arc::new(Illuminator::new(&config.illuminator)?);
    let sessions = Arc::new(SessionManager::new(config.stream.exclusive));
    if config.stream.exclusive {
        warn!("Exclusive streaming enabled: a second /stream client is refused while one is active");
    }

    let state = AppState {
        capture,
        sessions: sessions.clone(),
        settings: Arc::new(SettingsController::new(
            sensor_state,
            illuminator.clone(),
            sensor.descriptor().max_frame_size,
        )),
        status: Arc::new(StatusReporter::new(sessions)),
        stream: config.stream.clone(),
        shutdown: CancellationToken::new(),
    };

    let watchdog = ConnectivityWatchdog::new(
        link,
        Duration::from_millis(config.watchdog.interval_ms),
    )
    .spawn();

    let listener = TcpListener::bind(config.server.bind).await?;
    server::serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    })
    .await?;

    watchdog.abort();
    if let Err(e) = illuminator.set(false) {
        warn!("Failed to switch illuminator off: {}", e);
    }
    info!("camstream shutting down");
    Ok(())
}
