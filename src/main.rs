//! Sikt CLI entry point.

use anyhow::Result;
use clap::{Parser, Subcommand};
use sikt::app::AppContext;
use sikt::config::Settings;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "sikt", about = "Local-first video analysis agent", version)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP backend and the job worker.
    Serve {
        /// Bind address.
        #[arg(long, env = "EDGE_VIDEO_AGENT_HOST")]
        host: Option<String>,
        /// Bind port.
        #[arg(long, env = "BACKEND_PORT")]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("sikt={}", log_level)),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Serve { host, port } => {
            let mut settings = Settings::from_env();
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }

            let ctx = AppContext::new(settings)?;
            sikt::server::serve(ctx).await?;
        }
    }

    Ok(())
}
