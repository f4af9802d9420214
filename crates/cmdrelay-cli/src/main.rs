//! cmdrelay - command relay client
//!
//! Talks to a running relay the way a browser session would: reads the
//! identity through `/api/auth/me`, evaluates permission gates locally, and
//! consumes `/sse/commands/{area}` streams.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cmdrelay_core::SessionCredential;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

use commands::RelayTarget;

/// cmdrelay - command relay client
#[derive(Parser, Debug)]
#[command(name = "cmdrelay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Base URL of the relay
    #[arg(long, default_value = "http://127.0.0.1:8080", env = "CMDRELAY_URL")]
    relay_url: String,

    /// Name of the relay's session cookie
    #[arg(long, default_value = "auth_token")]
    cookie_name: String,

    /// Session cookie value; omitted means no session
    #[arg(long, env = "CMDRELAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load the session's permissions and print them
    Whoami {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Evaluate a permission gate (exit 0 allowed, 1 denied, 2 indeterminate)
    Can(commands::permissions::CanArgs),

    /// Print the raw event stream of an area until it ends
    Watch {
        /// Area to subscribe to
        area: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let credential = cli.token.as_deref().and_then(SessionCredential::new);
    let target = RelayTarget::new(&cli.relay_url, &cli.cookie_name, credential)
        .context("failed to build HTTP client")?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match cli.command {
        Commands::Whoami { json } => {
            // Exit codes: 0=ready, 1=identity endpoint failure.
            let exit_code = rt.block_on(commands::permissions::whoami(
                &target,
                json,
                &mut std::io::stdout().lock(),
            ))?;
            std::process::exit(i32::from(exit_code));
        },
        Commands::Can(args) => {
            let exit_code = rt.block_on(commands::permissions::can(
                &target,
                &args,
                &mut std::io::stdout().lock(),
            ))?;
            std::process::exit(i32::from(exit_code));
        },
        Commands::Watch { area } => rt
            .block_on(commands::watch::run(
                &target,
                &area,
                &mut std::io::stdout().lock(),
            ))
            .map(|_| ()),
    }
}
