//! ether: command-line access to an Ether bus
//!
//! Talks to the store directly (`--database`) or through an `ether-proxy` (`--proxy`).
//!
//! # Subcommands
//! - `send <type> [contents]` - begin a trace with one message, optionally wait for replies
//! - `tail`                   - print messages arriving on a channel
//! - `channels`               - list channels known to a local store

use clap::{Parser, Subcommand};
use ether_core::config::{DatabaseConfig, DEFAULT_POLL_INTERVAL_MS};
use ether_core::{
    until_shutdown, AsyncMessage, Channel, Ether, EtherConfig, MessageStream, ProxyEther,
    RecvQuery, SqliteEther,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_SENDER: &str = "ether-cli";
const DEFAULT_DURATION_SECS: u64 = 300;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "ether", version, about = "Send and tail messages on an Ether bus")]
struct Cli {
    /// SQLite database URL for direct access
    #[arg(long, env = "ETHER_DATABASE_URL", conflicts_with = "proxy")]
    database: Option<String>,

    /// Address of an ether-proxy to dial
    #[arg(long, env = "ETHER_PROXY_ADDR")]
    proxy: Option<String>,

    /// Config file whose proxy.dial_addr is used when neither --database nor --proxy is given
    #[arg(short, long, default_value = "ether.toml")]
    config: String,

    /// Poll interval for blocking receives, in milliseconds [default: polling.interval_ms, or 1000]
    #[arg(long)]
    poll_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Begin a trace with a single message
    Send {
        /// Message type
        message_type: String,

        /// Message contents
        contents: Option<String>,

        #[arg(long, default_value = Channel::PROD)]
        channel: String,

        #[arg(long, default_value = DEFAULT_SENDER)]
        sender: String,

        #[arg(long, default_value = "send")]
        trace_name: String,

        #[arg(long, default_value_t = DEFAULT_DURATION_SECS)]
        duration_secs: u64,

        /// Print replies arriving on this channel within the trace until Ctrl+C, then end it
        #[arg(long)]
        wait: Option<String>,
    },

    /// Print messages arriving on a channel
    Tail {
        #[arg(long, default_value = Channel::PROD)]
        channel: String,

        /// Only messages of this type (repeatable)
        #[arg(long = "type")]
        types: Vec<String>,

        /// Only messages from this sender (repeatable)
        #[arg(long = "sender")]
        senders: Vec<String>,

        /// Only messages of this trace, including ended ones
        #[arg(long)]
        trace: Option<i64>,

        /// Poll once and exit
        #[arg(long)]
        once: bool,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// List channels known to a local store
    Channels,
}

// ============================================================================
// Output
// ============================================================================

fn format_message(msg: &AsyncMessage) -> String {
    let sent = msg
        .sent_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "-".to_string());
    let trace = msg
        .trace
        .as_ref()
        .and_then(|t| t.id)
        .map_or_else(|| "-".to_string(), |id| id.to_string());
    format!(
        "[{}] #{} trace={} {} <{}>: {}",
        sent,
        msg.id.unwrap_or_default(),
        trace,
        msg.message_type,
        msg.sender,
        msg.contents_or_empty()
    )
}

fn message_json(msg: &AsyncMessage) -> serde_json::Value {
    serde_json::json!({
        "id": msg.id,
        "channel": msg.channel.name(),
        "type": msg.message_type,
        "sender": msg.sender,
        "contents": msg.contents,
        "trace_id": msg.trace.as_ref().and_then(|t| t.id),
        "sent_at": msg.sent_at,
        "starts_trace": msg.starts_trace,
    })
}

fn build_tail_query(
    channel: &str,
    types: Vec<String>,
    senders: Vec<String>,
    trace: Option<i64>,
    once: bool,
) -> RecvQuery {
    let mut query = RecvQuery::new(Channel::new(channel));
    if !types.is_empty() {
        query = query.of_types(types);
    }
    if !senders.is_empty() {
        query = query.from_senders(senders);
    }
    if let Some(id) = trace {
        query = query.for_trace(id);
    }
    if once {
        query = query.non_blocking();
    }
    query
}

// ============================================================================
// Commands
// ============================================================================

fn shutdown_on_ctrl_c() -> broadcast::Receiver<()> {
    let (tx, rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Detected CTRL+C, shutting down recv loop");
        }
        let _ = tx.send(());
    });
    rx
}

fn poll_interval(flag: Option<u64>, config: Option<&EtherConfig>) -> Duration {
    match (flag, config) {
        (Some(ms), _) => Duration::from_millis(ms),
        (None, Some(config)) => config.polling.interval(),
        (None, None) => Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
    }
}

async fn connect(cli: &Cli) -> anyhow::Result<Arc<dyn Ether>> {
    let interval = poll_interval(cli.poll_ms, None);
    match (&cli.database, &cli.proxy) {
        (Some(url), _) => {
            let ether = SqliteEther::open(&DatabaseConfig::new(url.as_str())).await?;
            Ok(Arc::new(ether.with_poll_interval(interval)))
        }
        (None, Some(addr)) => {
            let ether = ProxyEther::connect(addr).await?;
            Ok(Arc::new(ether.with_poll_interval(interval)))
        }
        (None, None) => {
            let config = EtherConfig::load(&cli.config).map_err(|e| {
                anyhow::anyhow!(
                    "either --database or --proxy is required ({} unusable: {})",
                    cli.config,
                    e
                )
            })?;
            let ether = ProxyEther::connect(&config.proxy.dial_addr).await?;
            let interval = poll_interval(cli.poll_ms, Some(&config));
            Ok(Arc::new(ether.with_poll_interval(interval)))
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn do_send(
    ether: Arc<dyn Ether>,
    message_type: String,
    contents: Option<String>,
    channel: String,
    sender: String,
    trace_name: String,
    duration_secs: u64,
    wait: Option<String>,
) -> anyhow::Result<()> {
    let mut msg = AsyncMessage::new(Channel::new(channel), message_type, sender, contents);
    let mut trace = ether
        .begin_trace(&trace_name, &mut msg, Duration::from_secs(duration_secs))
        .await?;
    let trace_id = trace.require_id()?;
    println!("trace begun {} message {}", trace_id, msg.id.unwrap_or_default());

    let Some(reply_channel) = wait else {
        return Ok(());
    };

    let mut query = RecvQuery::new(Channel::new(reply_channel)).for_trace(trace_id);
    if let Some(sent) = msg.sent_at {
        query = query.since(sent);
    }
    let replies = until_shutdown(ether.recv(query), shutdown_on_ctrl_c());
    let failed = print_replies(replies).await;

    // The trace is ended even when tailing failed; the tail error wins.
    let ended = ether.end_trace(&mut trace).await;
    failed?;
    ended?;
    println!("trace ended {}", trace_id);
    Ok(())
}

async fn print_replies(mut replies: MessageStream) -> ether_core::Result<()> {
    while let Some(reply) = replies.next().await {
        println!("{}", reply?.contents_or_empty());
    }
    Ok(())
}

async fn do_tail(ether: Arc<dyn Ether>, query: RecvQuery, json: bool) -> anyhow::Result<()> {
    let mut messages = until_shutdown(ether.recv(query), shutdown_on_ctrl_c());
    while let Some(msg) = messages.next().await {
        let msg = msg?;
        if json {
            println!("{}", message_json(&msg));
        } else {
            println!("{}", format_message(&msg));
        }
    }
    Ok(())
}

async fn do_channels(cli: &Cli) -> anyhow::Result<()> {
    let Some(url) = &cli.database else {
        anyhow::bail!("channels requires --database");
    };
    let ether = SqliteEther::open(&DatabaseConfig::new(url.as_str())).await?;
    for channel in ether.channels().await? {
        println!("{}", channel.name());
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if matches!(cli.command, Commands::Channels) {
        return do_channels(&cli).await;
    }

    let ether = connect(&cli).await?;
    match cli.command {
        Commands::Send {
            message_type,
            contents,
            channel,
            sender,
            trace_name,
            duration_secs,
            wait,
        } => {
            do_send(
                ether,
                message_type,
                contents,
                channel,
                sender,
                trace_name,
                duration_secs,
                wait,
            )
            .await
        }
        Commands::Tail {
            channel,
            types,
            senders,
            trace,
            once,
            json,
        } => {
            let query = build_tail_query(&channel, types, senders, trace, once);
            do_tail(ether, query, json).await
        }
        Commands::Channels => unreachable!("handled above"),
    }
}

#[tokio::main]
async fn main() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("ether: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
