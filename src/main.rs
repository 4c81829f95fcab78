// Third Party
use anyhow::Context;
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};

// Local
use kube_logbook::{
    config::{self, Cli, Loaded},
    error::{BootstrapError, ConfigError},
    shutdown::ShutdownCoordinator,
    sink::RecordFormat,
    utils::init_tracing,
};

async fn start(
    coordinator: std::io::Result<ShutdownCoordinator>,
    loaded: Result<Loaded, ConfigError>,
) -> anyhow::Result<i32> {
    let coordinator = coordinator
        .map_err(BootstrapError::Signals)
        .context("Logbook failed to start")?;
    let loaded = loaded
        .map_err(BootstrapError::Config)
        .context("Logbook failed to start")?;

    for warning in &loaded.warnings {
        warn!("{}", warning);
    }
    match &loaded.source {
        Some(path) => info!("Using config file: {}", path.display()),
        None => info!("No config file found, using defaults"),
    }
    info!("Settings: {:?}", loaded.settings);

    kube_logbook::run(&loaded.settings, &coordinator)
        .await
        .context("Logbook failed to start")
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    // Handlers go in before the configuration is acted on.
    let coordinator = ShutdownCoordinator::install();
    let loaded = config::load(&cli);
    match &loaded {
        Ok(loaded) => init_tracing(loaded.settings.log.level, loaded.settings.log.format),
        Err(_) => init_tracing(LevelFilter::INFO, RecordFormat::Text),
    }

    let code = match start(coordinator, loaded).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}
