use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use chatrelay_core::UserId;
use chatrelay_server::{RelayClient, ServerConfig};
use chatrelay_store::{Database, SqliteStore};
use chatrelay_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "chatrelay", version, about = "Real-time messaging relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Default log level (RUST_LOG takes precedence).
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    /// Log one JSON object per line.
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server.
    Serve(ServeArgs),
    /// Log in and send one text message.
    Send(SendArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 5001)]
    port: u16,

    /// SQLite database file. Defaults to ~/.chatrelay/chatrelay.db.
    #[arg(long)]
    db: Option<PathBuf>,

    #[arg(long, default_value_t = 100)]
    max_frame_mb: usize,

    #[arg(long, default_value_t = 600)]
    idle_timeout_secs: u64,

    #[arg(long, default_value_t = 50)]
    response_delay_ms: u64,
}

#[derive(Args)]
struct SendArgs {
    /// Relay address.
    #[arg(long, default_value = "127.0.0.1:5001")]
    addr: String,

    #[arg(long)]
    email: String,

    #[arg(long)]
    password: String,

    /// Receiver user id.
    #[arg(long)]
    to: UserId,

    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: cli.json_logs,
        ..Default::default()
    })
    .context("failed to initialize logging")?;

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Send(args) => send(args).await,
    }
}

fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".chatrelay")
        .join("chatrelay.db")
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let db_path = args.db.unwrap_or_else(default_db_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        max_frame_len: args
            .max_frame_mb
            .checked_mul(1024 * 1024)
            .context("--max-frame-mb is too large")?,
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        response_delay: Duration::from_millis(args.response_delay_ms),
    };

    let handle = chatrelay_server::start(config, Arc::new(SqliteStore::new(db)))
        .await
        .context("failed to start relay server")?;
    tracing::info!(port = handle.port(), "chatrelay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!(online = handle.registry().online_count(), "shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn send(args: SendArgs) -> anyhow::Result<()> {
    let mut client = RelayClient::connect(args.addr.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.addr))?;

    let login = client.login(&args.email, &args.password).await?;
    if !login.is_success() {
        bail!("login failed: {}", login.message.unwrap_or_default());
    }

    let resp = client.send_text(args.to, &args.message).await?;
    println!("{}", serde_json::to_string(&resp)?);
    if !resp.is_success() {
        bail!("send failed");
    }
    Ok(())
}
