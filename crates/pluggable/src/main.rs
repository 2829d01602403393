//! Pluggable Bot
//!
//! Connects to a chat server, reads commands from stdin and runs plugins for
//! tagged messages.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pluggable::{Bot, BotConfig, BotHandle, BotHooks, ConfigOverrides, EchoHooks, NoHooks};

/// Pluggable chat bot
#[derive(Parser, Debug)]
#[command(name = "pluggable")]
#[command(about = "Socket chat bot with hot-reloadable plugins", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Chat server URL
    #[arg(long)]
    server_url: Option<String>,

    /// Bot identifier
    #[arg(long)]
    bot_id: Option<String>,

    /// Bot display name
    #[arg(long)]
    bot_name: Option<String>,

    /// Channel joined after registration
    #[arg(long)]
    autojoin: Option<String>,

    /// Directory with `<tag>_handler.js` plugins
    #[arg(long)]
    plugins: Option<PathBuf>,

    /// Directory with `<name>_service.js` services
    #[arg(long)]
    services: Option<PathBuf>,

    /// Start in development mode (plugin hot reload)
    #[arg(long)]
    dev: bool,

    /// Reply `Echo: <content>` to untagged messages
    #[arg(long)]
    echo: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            server_url: self.server_url.clone(),
            bot_id: self.bot_id.clone(),
            bot_name: self.bot_name.clone(),
            autojoin_channel: self.autojoin.clone(),
            plugins_path: self.plugins.clone(),
            services_path: self.services.clone(),
            dev_mode: self.dev.then_some(true),
            ..ConfigOverrides::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    // Diagnostics go to stderr so they don't interleave with the prompt
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pluggable=info,plugin_runtime=info"));
    let (json_layer, text_layer) = if args.log_json {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (None, Some(fmt::layer().with_writer(std::io::stderr)))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();

    let config = BotConfig::load(args.config.as_deref(), &args.overrides())?;
    info!("Starting {} v{}", config.bot_name, env!("CARGO_PKG_VERSION"));

    let hooks: Arc<dyn BotHooks> = if args.echo {
        Arc::new(EchoHooks)
    } else {
        Arc::new(NoHooks)
    };
    let bot = Bot::builder(config).with_hooks(hooks).build()?;
    let handle = bot.handle();

    tokio::spawn(read_input(handle.clone()));
    tokio::spawn(shutdown_signal(handle));

    bot.run().await;

    // The stdin reader may still be parked in a blocking read
    std::process::exit(0)
}

/// Forward stdin lines until EOF
async fn read_input(handle: BotHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !handle.command(line) {
                    break;
                }
            }
            Ok(None) => {
                info!("Input closed, shutting down...");
                handle.shutdown();
                break;
            }
            Err(e) => {
                warn!("Failed to read input: {}", e);
                handle.shutdown();
                break;
            }
        }
    }
}

async fn shutdown_signal(handle: BotHandle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }

    handle.shutdown();
}
