use idlegate::app::App;
use idlegate::config::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Optional TOML file; IDLEGATE_* variables override it
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::resolve(config_path.as_deref());

    // The debug flag decides the default level, so logging starts after the
    // configuration has been read
    let debug = config.as_ref().map(|c| c.server.debug).unwrap_or(false);
    let directive = if debug { "idlegate=debug" } else { "idlegate=info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    let config = config.map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    if let Some(ref path) = config_path {
        info!(path = %path.display(), "Configuration loaded");
    }

    print_startup_banner(&config);

    let app = App::new(config)?;
    let listener = app.bind().await?;

    let exit_code = app.run(listener, shutdown_signal()?).await;
    Ok(ExitCode::from(exit_code as u8))
}

/// Resolves on SIGINT or SIGTERM
#[cfg(unix)]
fn shutdown_signal() -> anyhow::Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> anyhow::Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C, initiating graceful shutdown");
    })
}

fn print_startup_banner(config: &Config) {
    info!("========================================");
    info!("  {} v{}", PKG_NAME, VERSION);
    info!("========================================");
    info!(
        listen = %format!("{}:{}", config.server.host, config.server.port),
        backend = %config.server.backend_url,
        idle_timeout_secs = config.server.idle_timeout.as_secs(),
        "Proxy configuration"
    );
    if config.process.enabled() {
        info!(
            command = %config.process.command,
            working_dir = ?config.process.working_dir,
            start_delay_ms = config.process.start_delay.as_millis() as u64,
            "Daemon starts on first connection and stops when idle"
        );
    } else {
        info!("No daemon configured");
    }
    info!("========================================");
}
