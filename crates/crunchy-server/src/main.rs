//! `crunchy`: sandboxed command-execution honeypot.

use anyhow::{Context, bail};
use clap::Parser;
use crunchy_config::{CrunchyConfig, LayeredConfigOptions};
use crunchy_sandbox::build_runtime;
use crunchy_server::connection::ConnectionContext;
use crunchy_server::{Server, resolve_hostname};
use crunchy_shell::{AuthLog, SessionContext};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Command-line options.
#[derive(Parser)]
#[command(name = "crunchy", version)]
struct Cli {
    /// Config file applied on top of the system, user, and cwd layers
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen address, e.g. 0.0.0.0:2222
    #[arg(long)]
    listen: Option<String>,
    /// Sandbox provider (docker or bubblewrap)
    #[arg(long)]
    provider: Option<String>,
    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(cli: &Cli) -> anyhow::Result<CrunchyConfig> {
    let cwd = std::env::current_dir().context("failed to resolve current working directory")?;
    let mut options = LayeredConfigOptions::new(&cwd);
    if let Some(path) = cli.config.as_ref() {
        options = options.with_runtime_path(path);
    }
    let layered = CrunchyConfig::load_layered_with_options(options)
        .context("failed to load layered config")?;
    debug!("layered config loaded (layers={})", layered.layers.len());
    let mut config = layered.config;
    if let Some(listen) = cli.listen.as_ref() {
        config.server.listen = listen.clone();
    }
    if let Some(provider) = cli.provider.as_ref() {
        config.sandbox.provider = provider.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Entry point for the honeypot server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _ = env_logger::builder()
        .format_timestamp_millis()
        .parse_filters(&cli.log_level)
        .parse_default_env()
        .try_init();

    info!(
        "starting crunchy (config_set={}, listen_set={}, provider_set={})",
        cli.config.is_some(),
        cli.listen.is_some(),
        cli.provider.is_some()
    );
    let config = load_config(&cli)?;

    let runtime = build_runtime(&config).context("failed to build sandbox runtime")?;
    let report = runtime.dependency_report();
    for warning in &report.warnings {
        warn!(
            "sandbox dependency warning (runtime={}, detail={})",
            runtime.name(),
            warning
        );
    }
    if !report.errors.is_empty() {
        bail!(
            "sandbox runtime {} is unusable: {}",
            runtime.name(),
            report.errors.join("; ")
        );
    }

    info!("pulling image (reference={})", config.sandbox.image);
    let image = runtime
        .pull(&config.sandbox.image)
        .await
        .with_context(|| format!("failed to pull image {}", config.sandbox.image))?;
    info!("image ready (reference={}, id={})", image.reference, image.id);

    std::fs::create_dir_all(&config.audit.dir)
        .with_context(|| format!("failed to create log directory {}", config.audit.dir))?;

    let hostname = resolve_hostname(&config.shell);
    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;
    let auth_log = AuthLog::from_config(&config.audit);
    let config = Arc::new(config);
    let server = Server::new(
        listener,
        ConnectionContext {
            session: Arc::new(SessionContext {
                runtime,
                image,
                config: config.clone(),
                hostname,
            }),
            auth_log,
        },
    );
    info!(
        "listening (addr={}, runtime={}, strategy={:?})",
        server.local_addr().context("listener address")?,
        config.sandbox.provider,
        config.shell.strategy
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => warn!("failed to listen for interrupt (error={})", err),
        }
    });
    server.run(shutdown_rx).await;
    info!("crunchy stopped");
    Ok(())
}
