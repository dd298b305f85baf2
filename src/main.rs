use color_eyre::{eyre::eyre, Result};
use deskrelay::cloud::BambuCloud;
use deskrelay::mqtt::RumqttTransport;
use deskrelay::persistence::{FileStorage, PrinterConfig};
use deskrelay::{server, RelayDeps, RelayService, RelaySettings};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let settings = RelaySettings::load().await?;
    setup_logging_env(&settings.log_level);
    info!(
        "Starting deskrelay, data in {}",
        settings.data_dir.display()
    );

    let relay = Arc::new(build_relay(&settings)?);
    let link = relay
        .start()
        .await
        .map_err(|e| eyre!("Failed to start relay: {}", e))?;
    info!("Device link: {:?}", link.state);

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let result = server::serve(relay.clone(), settings.socket_addr()?, shutdown).await;
    if let Err(e) = &result {
        error!("HTTP server failed: {}", e);
    }

    relay.shutdown().await;
    result
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

/// `RUST_LOG` wins over the settings file; anything unparseable means `info`.
fn log_filter(rust_log: Option<String>, level: &str) -> EnvFilter {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn setup_logging_env(level: &str) {
    let filter = log_filter(std::env::var("RUST_LOG").ok(), level);

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

fn build_relay(settings: &RelaySettings) -> Result<RelayService> {
    let cloud = BambuCloud::new(settings.cloud_api_base.clone())
        .map_err(|e| eyre!("Failed to build cloud client: {}", e))?;

    Ok(RelayService::new(RelayDeps {
        config_storage: Arc::new(FileStorage::new(settings.config_path())),
        token_storage: Arc::new(FileStorage::new(settings.token_path())),
        transport: Arc::new(RumqttTransport::new()),
        cloud: Arc::new(cloud),
        defaults: PrinterConfig::from_env(),
        link_options: settings.link_options(),
    }))
}

async fn wait_for_signal(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, shutting down"),
        Err(e) => {
            warn!("Could not listen for Ctrl-C: {}", e);
            return;
        }
    }
    shutdown.cancel();
}
