use clap::Parser;
use ether_core::{EtherConfig, SqliteEther};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use ether_server::server;

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve an Ether store to remote agents", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "ether.toml")]
    config: String,

    /// Address to listen on (overrides proxy.listen_addr)
    #[arg(long)]
    listen: Option<String>,

    /// Database URL (overrides database.url)
    #[arg(long)]
    database: Option<String>,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = match EtherConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };
    if let Some(url) = args.database {
        config.database.url = url;
    }
    if let Some(addr) = args.listen {
        config.proxy.listen_addr = addr;
    }

    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    let ether = match SqliteEther::open(&config.database).await {
        Ok(e) => e.with_poll_interval(config.polling.interval()),
        Err(e) => {
            eprintln!("Failed to open database {}: {}", config.database.url, e);
            std::process::exit(1);
        }
    };

    if args.health {
        match ether_core::db::health_check(ether.pool()).await {
            Ok(v) => println!("✅ SQLite {} at {}", v, config.database.url),
            Err(e) => {
                println!("❌ SQLite health check failed: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    tracing::info!(
        "Proxying {} on {}, use CTRL+C to quit",
        config.database.url,
        config.proxy.listen_addr
    );
    server::run_proxy_server(&config.proxy.listen_addr, ether, tx.subscribe()).await?;

    Ok(())
}
