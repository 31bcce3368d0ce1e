use anyhow::{Context, Result};
use clap::Parser;
use contentctl::cluster::{ControllerConfig, FileTopologySource};
use contentctl::controller::ClusterController;
use contentctl::server::Server;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Command-line arguments for the cluster controller
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Controller configuration file (JSON)
    #[clap(short, long, default_value = "controller.json")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[clap(long, default_value = "info")]
    log_level: String,

    /// Address of the admin server, overrides the configuration
    #[clap(long)]
    admin_addr: Option<String>,

    /// Act as master without an election (single controller deployments)
    #[clap(long)]
    assume_master: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting contentctl v{}", env!("CARGO_PKG_VERSION"));
    info!("Using controller configuration from: {}", args.config);

    let config = ControllerConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load controller configuration from {}", args.config))?;
    let admin_addr = args.admin_addr.clone().unwrap_or_else(|| config.admin_addr.clone());
    info!(
        cluster = %config.cluster_name,
        controller = config.controller_index,
        nodes = config.nodes.len(),
        "Loaded cluster topology"
    );

    let handle = ClusterController::spawn(&config)?;
    if args.assume_master {
        info!("Assuming mastership");
        handle.set_master(true, Some(config.controller_index)).await?;
    }

    // Reload the topology on SIGHUP
    #[cfg(unix)]
    {
        let handle = handle.clone();
        let source = FileTopologySource::new(&args.config);
        let mut hangups = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
        tokio::spawn(async move {
            while hangups.recv().await.is_some() {
                match handle.reload_from(&source).await {
                    Ok(()) => info!("Reloaded cluster topology"),
                    Err(e) => warn!("Failed to reload cluster topology: {}", e),
                }
            }
        });
    }

    let server = Server::new(handle.clone(), admin_addr);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Admin server failed: {}", e);
            }
            handle.shutdown().await?;
            result.map_err(Into::into)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            handle.shutdown().await?;
            Ok(())
        }
    }
}
