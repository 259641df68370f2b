use anyhow::{Context, Result};
use clap::Parser;
use locfuse_core::config::LogFormat;
use locfuse_core::types::{BackendKind, CallerIdentity};
use locfuse_core::{AppConfig, BackendStore, FileBackendStore, GeocodeRequest, MemoryBackendStore};
use locfuse_plugin_api::{LocalTransport, RegistryResolver};
use locfuse_pool::MetricsExporter;
use locfuse_service::{AllowAll, ChannelListener, LocationRequest, LocationService, ServiceDeps};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod sample;

/// locfuse - network location fusion broker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/locfuse.yaml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, env = "LOCFUSE_LOG")]
    log_level: Option<String>,

    /// Register a periodic request and log every fused location
    #[arg(long)]
    watch_interval_ms: Option<i64>,

    /// Run a forward geocode for this name once the service is up
    #[arg(long)]
    geocode: Option<String>,

    /// Seconds between status summaries; 0 disables them
    #[arg(long, default_value_t = 60)]
    status_interval_secs: u64,

    /// Do not install the built-in sample backends
    #[arg(long)]
    no_samples: bool,
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if args.config.exists() {
        AppConfig::from_config_builder(&args.config)
            .with_context(|| format!("Failed to load config file: {:?}", args.config))?
    } else {
        AppConfig::default()
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_tracing(config: &AppConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.logging.level)
            .with_context(|| format!("Invalid log filter: {}", config.logging.level))?,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.logging.file_line)
        .with_line_number(config.logging.file_line);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

fn open_store(config: &AppConfig) -> Result<Arc<dyn BackendStore>> {
    Ok(match &config.preferences.path {
        Some(path) => Arc::new(
            FileBackendStore::open(path)
                .with_context(|| format!("Failed to open backend store: {:?}", path))?,
        ),
        None => Arc::new(MemoryBackendStore::new()),
    })
}

fn seed_samples(store: &dyn BackendStore, samples: &sample::SampleBackends) -> Result<()> {
    if store.enabled_backends(BackendKind::Location).is_empty() {
        store.set_enabled_backends(BackendKind::Location, &samples.location)?;
    }
    if store.enabled_backends(BackendKind::Geocoder).is_empty() {
        store.set_enabled_backends(BackendKind::Geocoder, &samples.geocoder)?;
    }
    Ok(())
}

fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

async fn watch(service: &LocationService, caller: &CallerIdentity, interval_ms: i64) -> Result<()> {
    let (listener, positions) = ChannelListener::channel(16);
    let id = format!("watch-{}", uuid::Uuid::new_v4());
    service
        .update_location_request(caller, LocationRequest::periodic(id.clone(), interval_ms, listener))
        .await?;
    info!(id = %id, interval_ms, "Watching fused locations");

    tokio::spawn(async move {
        while let Ok(position) = positions.recv_async().await {
            info!(
                latitude = position.latitude,
                longitude = position.longitude,
                accuracy = ?position.accuracy,
                source = ?position.backend_component,
                at = %format_timestamp(position.timestamp),
                "Fused location"
            );
        }
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config)?;

    info!("Starting locfuse");
    info!("Configuration loaded from {:?}", args.config);

    let mut exporter = MetricsExporter::new(config.metrics.clone());
    exporter.init()?;

    let resolver = Arc::new(RegistryResolver::new());
    let transport = Arc::new(LocalTransport::new());
    let store = open_store(&config)?;
    if !args.no_samples {
        let samples = sample::install(&resolver, &transport);
        seed_samples(store.as_ref(), &samples)?;
    }

    let deps = ServiceDeps {
        store,
        resolver,
        transport,
        authorizer: Arc::new(AllowAll),
    };
    let service = LocationService::start(deps, &config).await?;

    let caller = CallerIdentity::new(std::process::id(), 0, env!("CARGO_PKG_NAME"));
    if let Some(interval_ms) = args.watch_interval_ms {
        watch(&service, &caller, interval_ms).await?;
    }
    if let Some(name) = &args.geocode {
        match service.request_geocode(&caller, GeocodeRequest::new(name.as_str(), 5)).await {
            Ok(addresses) => {
                for address in addresses {
                    info!(query = %name, feature = ?address.feature_name, location = ?address.location, "Geocode result");
                }
            }
            Err(e) => warn!(query = %name, error = %e, "Geocode failed"),
        }
    }

    let status_service = service.clone();
    let status_every = args.status_interval_secs;
    let status_task = tokio::spawn(async move {
        if status_every == 0 {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(status_every));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let status = status_service.status();
            info!(
                interval_ms = ?status.interval_ms,
                sessions = status.sessions,
                requests = status.requests.len(),
                cycles = status.fusion.cycles,
                published = status.fusion.published,
                deliveries = status.deliveries,
                "Service status"
            );
        }
    });

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal, stopping service...");

    status_task.abort();
    service.disconnect(&caller).await;
    service.shutdown().await;
    Ok(())
}
