//! subsync daemon.
//!
//! Serves the payment webhook and the account API, or prepares and inspects
//! the database:
//!
//! ```text
//! subsync-daemon --config subsync.toml            # serve (default)
//! subsync-daemon --config subsync.toml init-db    # create the schema
//! subsync-daemon --config subsync.toml check-db   # print row counts
//! ```
//!
//! The webhook signing secret is read from the environment variable named by
//! `webhook.secret_env`; it never appears in the config file.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use subsync_core::{SqliteBackend, SubscriptionBackend, SubsyncConfig, SystemClock};
use subsync_daemon::{AppState, router};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// subsync daemon - payment reconciliation service
#[derive(Parser, Debug)]
#[command(name = "subsync-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding `server.bind`
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Database file, overriding `database.path`
    #[arg(long)]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run the HTTP server
    Serve,
    /// Create the database and schema, then exit
    InitDb,
    /// Open the database and print row counts
    CheckDb,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = load_config(&args)?;
    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let runtime =
                tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
            runtime.block_on(serve(config))
        },
        Command::InitDb => init_db(&config),
        Command::CheckDb => check_db(&config),
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<SubsyncConfig> {
    let mut config = match &args.config {
        Some(path) => SubsyncConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SubsyncConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(database) = &args.database {
        config.database.path.clone_from(database);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn open_backend(config: &SubsyncConfig) -> Result<SqliteBackend> {
    SqliteBackend::open(&config.database.path).with_context(|| {
        format!(
            "failed to open database at {}",
            config.database.path.display()
        )
    })
}

fn init_db(config: &SubsyncConfig) -> Result<()> {
    let backend = open_backend(config)?;
    let tables = backend.table_names().context("failed to list tables")?;
    info!(
        path = %config.database.path.display(),
        tables = ?tables,
        "database initialized"
    );
    println!(
        "initialized {} ({})",
        config.database.path.display(),
        tables.join(", ")
    );
    Ok(())
}

fn check_db(config: &SubsyncConfig) -> Result<()> {
    let backend = open_backend(config)?;
    let stats = backend.stats().context("failed to read database stats")?;
    println!("database:        {}", config.database.path.display());
    println!("schema version:  {}", stats.schema_version);
    println!("accounts:        {}", stats.account_count);
    println!("  flagged active: {}", stats.active_flag_count);
    println!("pending:         {}", stats.pending_count);
    println!("  unclaimed:     {}", stats.unclaimed_count);
    println!("deliveries:      {}", stats.delivery_count);
    Ok(())
}

async fn serve(config: SubsyncConfig) -> Result<()> {
    let secret = config
        .webhook_secret()
        .context("webhook signing secret unavailable")?;
    let backend: Arc<dyn SubscriptionBackend> = Arc::new(open_backend(&config)?);
    let state = AppState::with_default_hasher(&config, backend, secret, Arc::new(SystemClock))
        .context("failed to initialize services")?;

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;

    info!(
        addr = %config.server.bind,
        database = %config.database.path.display(),
        "subsync daemon listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("subsync daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to register SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}
