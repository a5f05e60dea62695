use stasis_ivr::application::Dispatcher;
use stasis_ivr::config::{Config, LoggingConfig};
use stasis_ivr::domain::call::{CallScript, StepScript};
use stasis_ivr::infrastructure::ari::{AriClient, AriSettings};
use stasis_ivr::infrastructure::metrics::init_metrics;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--print-config") {
        println!("{}", Config::default().to_toml_string()?);
        return Ok(());
    }

    // Load configuration
    let path = args
        .first()
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("IVR_CONFIG").map(PathBuf::from));
    let config = Config::load(path.as_deref())?;

    init_tracing(&config.logging);
    info!("Starting stasis-ivr");
    info!(
        url = %config.bus.url,
        application = %config.bus.application,
        "Configuration loaded"
    );

    if let Some(listen) = config.metrics.listen {
        init_metrics(listen)?;
        info!("Prometheus metrics on http://{}/metrics", listen);
    }

    let script: Arc<dyn CallScript> = Arc::new(StepScript::new(
        config.script.name.clone(),
        config.script.steps.clone(),
    ));
    info!(script = script.name(), steps = config.script.steps.len(), "Script loaded");

    let settings = AriSettings::from_config(&config.bus)?;
    let client = match AriClient::connect(settings).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to connect to ARI");
            return Err(e.into());
        }
    };

    let calls = CancellationToken::new();
    let dispatcher = Dispatcher::new(Arc::new(client.clone()), script)
        .with_max_concurrent_calls(config.dispatcher.max_concurrent_calls)
        .with_calls_token(calls.clone());

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutting down..."),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
            }
            shutdown.cancel();
        });
    }

    let stats = dispatcher.run(shutdown.clone()).await?;
    info!(
        dispatched = stats.dispatched,
        rejected = stats.rejected,
        "Stopped accepting calls"
    );

    let grace = Duration::from_secs(config.dispatcher.shutdown_grace_secs);
    if tokio::time::timeout(grace, dispatcher.drain()).await.is_err() {
        warn!(
            remaining = dispatcher.active_calls(),
            "Grace period over, stopping remaining calls"
        );
        calls.cancel();
        dispatcher.drain().await;
    }

    client.close();

    if !shutdown.is_cancelled() {
        anyhow::bail!("ARI event stream closed unexpectedly");
    }

    info!("All calls finished");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
