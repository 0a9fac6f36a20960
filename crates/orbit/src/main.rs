use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "orbitd", about = "Orbit — the control-plane relay between clients and anchors")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay hub's HTTP + WebSocket server.
    Gateway {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective configuration (file + environment overrides applied).
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Validate configuration and storage reachability without serving traffic.
    Doctor,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as JSON.
    Show,
    /// Print the path `discover_and_load` would read, if any.
    Path,
}

fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_thread_ids(false).with_ansi(true))
            .init();
    }
}

fn run_doctor() -> anyhow::Result<()> {
    let config = orbit_config::discover_and_load();
    println!("bind: {}:{}", config.bind, config.port);
    println!("auth mode: {}", config.auth.mode);
    println!("retention: {} messages/artifacts per thread", config.retention);
    println!("multi-dispatch timeout: {}ms", config.dispatch_timeout_ms);

    let db_path = std::path::Path::new(&config.database_path);
    match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent)?;
            println!("database directory: {} (ok)", parent.display());
        }
        _ => println!("database directory: . (ok)"),
    }

    if matches!(config.auth.mode.as_str(), "basic") {
        println!("note: auth mode \"basic\" treats any supplied name as the user id directly");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "orbit starting");

    match cli.command {
        Commands::Gateway { bind, port } => {
            orbit_gateway::start_gateway(bind.as_deref(), port).await
        }
        Commands::Config { action } => {
            let config = orbit_config::discover_and_load();
            match action {
                ConfigAction::Show => {
                    // auth.*_secret fields have no Serialize impl; listed
                    // explicitly here rather than via config.auth directly.
                    let redacted = serde_json::json!({
                        "bind": config.bind,
                        "port": config.port,
                        "retention": config.retention,
                        "dispatchTimeoutMs": config.dispatch_timeout_ms,
                        "databasePath": config.database_path,
                        "corsOrigins": config.cors_origins,
                        "auth": {
                            "mode": config.auth.mode,
                            "accessTtlSec": config.auth.access_ttl_sec,
                            "refreshTtlSec": config.auth.refresh_ttl_sec,
                            "anchorAccessTtlSec": config.auth.anchor_access_ttl_sec,
                            "anchorRefreshTtlSec": config.auth.anchor_refresh_ttl_sec,
                            "deviceCodeTtlSec": config.auth.device_code_ttl_sec,
                            "devicePollIntervalSec": config.auth.device_poll_interval_sec,
                            "deviceVerificationUrl": config.auth.device_verification_url,
                            "challengeTtlSec": config.auth.challenge_ttl_sec,
                        },
                    });
                    println!("{}", serde_json::to_string_pretty(&redacted)?);
                }
                ConfigAction::Path => match orbit_config::data_dir().join("orbit.db").to_str() {
                    Some(path) => println!("{path}"),
                    None => println!("(unrepresentable path)"),
                },
            }
            Ok(())
        }
        Commands::Doctor => run_doctor(),
    }
}
