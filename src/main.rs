use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use rmcp::{ServiceExt, transport::stdio};
use tracing::info;

use crate::config::Config;
use crate::memory::MemoryEngine;
use crate::server::MemoryServer;
use crate::store::SqliteStore;

mod config;
mod logging;
mod memory;
mod response;
mod server;
mod store;
mod tools;
mod transfer;

use logging::{TransportMode, init_logging};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// SQLite database file (must end in .db). Overrides config and MEMORY_MCP_DB_PATH.
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// TOML config file (default: <binary>.toml next to the executable, if present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable streamable HTTP mode (default: stdio)
    #[arg(short = 's', long = "stream")]
    stream_mode: bool,

    /// HTTP port for stream mode
    #[arg(short = 'p', long, default_value = "8000")]
    port: u16,

    /// Bind address for stream mode
    #[arg(short = 'b', long, default_value = "127.0.0.1")]
    bind: String,

    /// Enable file logging. Optionally specify log file name (default: sqlite-memory-mcp-rs.log)
    #[arg(short = 'l', long, value_name = "FILE", num_args = 0..=1, default_missing_value = "sqlite-memory-mcp-rs.log")]
    log: Option<String>,
}

/// Run server in stdio mode (default)
async fn run_stdio_mode(server: MemoryServer) -> Result<()> {
    let svc = server.serve(stdio()).await?;
    svc.waiting().await?;
    Ok(())
}

/// Run server in streamable HTTP mode
async fn run_stream_mode(server: MemoryServer, bind: &str, port: u16) -> Result<()> {
    use rmcp::transport::StreamableHttpService;
    use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;

    let addr = format!("{}:{}", bind, port);
    info!("Starting MCP HTTP server on http://{}/mcp", addr);

    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let router = axum::Router::new()
        .nest_service("/mcp", service)
        .route("/health", axum::routing::get(|| async { "OK" }));

    let tcp_listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}

/// Opens the store and prepares the memory schema. Schema failure is fatal.
async fn open_engine(config: &Config) -> Result<MemoryEngine<SqliteStore>> {
    let path = config.database_path.clone();
    let options = config.pool_options();
    tokio::task::spawn_blocking(move || -> Result<MemoryEngine<SqliteStore>> {
        let store = SqliteStore::open(&path, options)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        let engine = MemoryEngine::new(store);
        engine
            .initialize()
            .context("failed to initialize memory schema")?;
        Ok(engine)
    })
    .await?
}

/// Import/export files are confined to the database's directory.
fn transfer_root(database_path: &Path) -> Result<PathBuf> {
    let dir = match database_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    dir.canonicalize()
        .with_context(|| format!("failed to resolve database directory {}", dir.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mode = if args.stream_mode {
        TransportMode::Stream
    } else {
        TransportMode::Stdio
    };

    // stdio mode must stay silent on stderr, see logging module
    init_logging(mode, args.log.as_deref().map(Path::new))?;

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.database_path = db;
    }

    let engine = open_engine(&config).await?;
    info!(
        "memory: serving {} (pool size {})",
        config.database_path.display(),
        config.pool_size
    );
    let transfer_root = transfer_root(&config.database_path)?;
    let server = MemoryServer::new(engine, transfer_root);

    match mode {
        TransportMode::Stdio => run_stdio_mode(server).await,
        TransportMode::Stream => run_stream_mode(server, &args.bind, args.port).await,
    }
}
