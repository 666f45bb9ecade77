mod config;
mod server;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use idr_core::{RecordId, Signature, audit};
use idr_store::Store;
use tokio_util::sync::CancellationToken;

use config::{Config, Overrides};

#[derive(Parser)]
#[command(name = "idr", about = "Contact identity reconciliation service and CLI")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config and IDR_DB / IDR_DATA_DIR)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Listen address (overrides config and IDR_BIND)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },

    /// Reconcile one signature and print the consolidated contact
    Identify {
        #[arg(long)]
        email: Option<String>,

        #[arg(long = "phone")]
        phone_number: Option<String>,
    },

    /// Show the consolidated contact containing a record
    Show {
        /// Any record id in the cluster
        id: RecordId,
    },

    /// Show record counts
    Stats,

    /// Export all records to a JSON file
    Export {
        /// Output file path
        path: PathBuf,
    },

    /// Audit the store for cluster invariant violations
    Check,
}

fn init_tracing(verbose: bool, floor: tracing::Level) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(floor.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn load_config(cli: &Cli, bind: Option<SocketAddr>) -> Result<Config> {
    Config::load(
        cli.config.as_deref(),
        Overrides {
            database: cli.db.clone(),
            bind,
        },
    )
}

fn open_store(config: &Config) -> Result<Store> {
    if let Some(parent) = config.database.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Store::open(&config.database)
        .with_context(|| format!("failed to open store {}", config.database.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let floor = match cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };
    init_tracing(cli.verbose, floor);

    match &cli.command {
        Commands::Serve { bind } => cmd_serve(&cli, *bind).await,
        Commands::Identify {
            email,
            phone_number,
        } => cmd_identify(&cli, email.as_deref(), phone_number.as_deref()),
        Commands::Show { id } => cmd_show(&cli, *id),
        Commands::Stats => cmd_stats(&cli),
        Commands::Export { path } => cmd_export(&cli, path),
        Commands::Check => cmd_check(&cli),
    }
}

async fn cmd_serve(cli: &Cli, bind: Option<SocketAddr>) -> Result<()> {
    let config = load_config(cli, bind)?;
    let store = open_store(&config)?;
    let state = server::AppState::new(store);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(
        "listening on http://{} (database {})",
        listener.local_addr()?,
        config.database.display()
    );

    server::run(listener, state.clone(), shutdown)
        .await
        .context("HTTP server failed")?;

    state.checkpoint_wal().await;
    tracing::info!("shut down cleanly");
    Ok(())
}

/// Cancel `token` on Ctrl-C or SIGTERM.
///
/// The SIGTERM handler is registered before this returns, so a signal that
/// arrives while the listener starts up is not lost.
fn shutdown_on_signal(token: CancellationToken) -> impl std::future::Future<Output = ()> {
    #[cfg(unix)]
    let sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .inspect_err(|e| tracing::warn!("failed to listen for SIGTERM: {e}"))
        .ok();

    async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            match sigterm {
                Some(mut sig) => {
                    sig.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("received Ctrl-C, shutting down"),
            _ = terminate => tracing::info!("received SIGTERM, shutting down"),
        }
        token.cancel();
    }
}

fn cmd_identify(cli: &Cli, email: Option<&str>, phone_number: Option<&str>) -> Result<()> {
    let config = load_config(cli, None)?;
    let signature = Signature::new(email, phone_number).validate()?;
    let mut store = open_store(&config)?;

    let outcome = store.reconcile(&signature).map_err(|e| {
        if e.is_client_error() {
            anyhow::anyhow!("{e}")
        } else {
            anyhow::anyhow!("reconciliation failed: {e}")
        }
    })?;

    let response = server::IdentifyResponse {
        contact: outcome.view,
    };
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn cmd_show(cli: &Cli, id: RecordId) -> Result<()> {
    let config = load_config(cli, None)?;
    let store = open_store(&config)?;
    let view = store
        .view_for(id)
        .context("failed to load contact")?
        .ok_or_else(|| anyhow::anyhow!("no live contact with id {id}"))?;

    let response = server::IdentifyResponse { contact: view };
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn cmd_stats(cli: &Cli) -> Result<()> {
    let config = load_config(cli, None)?;
    let store = open_store(&config)?;
    let stats = store.stats().context("failed to count records")?;

    println!("database:    {}", config.database.display());
    println!("records:     {}", stats.total);
    println!("primaries:   {}", stats.primaries);
    println!("secondaries: {}", stats.secondaries);
    println!("deleted:     {}", stats.deleted);
    Ok(())
}

fn cmd_export(cli: &Cli, path: &Path) -> Result<()> {
    let config = load_config(cli, None)?;
    let store = open_store(&config)?;

    let json = store.export_json().context("failed to serialize records")?;
    std::fs::write(path, &json).with_context(|| format!("failed to write {}", path.display()))?;

    let count = store.stats().context("failed to count records")?.total;
    println!("exported {count} records to {}", path.display());
    Ok(())
}

fn cmd_check(cli: &Cli) -> Result<()> {
    let config = load_config(cli, None)?;
    let store = open_store(&config)?;
    let records = store.records().context("failed to load records")?;
    let report = audit(&records);

    println!(
        "checked {} live records in {} clusters",
        report.records, report.clusters
    );
    for finding in &report.findings {
        println!("  {finding}");
    }
    if !report.is_clean() {
        anyhow::bail!("{} invariant violation(s) found", report.findings.len());
    }
    println!("ok");
    Ok(())
}
