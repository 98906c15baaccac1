use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use stoic_runtime::config::Config;
use stoic_runtime::http::{build_router, AppState};
use stoic_runtime::Runtime;

#[derive(Parser)]
#[command(name = "stoic-runtime", about = "Persistent-memory conversational agent runtime")]
struct Cli {
    #[arg(long, env = "STOIC_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serves the illustrative HTTP surface.
    Serve {
        #[arg(long, env = "PORT", default_value_t = 8080)]
        port: u16,
    },
    /// Runs the background analysis pass for a single user and exits.
    Analyze {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    Config::load_env();
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let runtime = Runtime::build(&config).await?;

    match cli.command.unwrap_or(Command::Serve { port: 8080 }) {
        Command::Serve { port } => serve(runtime, port).await,
        Command::Analyze { user_id, force } => {
            let result = runtime.orchestrator.analyze(&user_id, force).await?;
            tracing::info!(
                messages_processed = result.messages_processed,
                new_summary = result.new_summary,
                profile_refreshed = result.profile_refreshed,
                "analysis pass complete"
            );
            Ok(())
        }
    }
}

async fn serve(runtime: Runtime, port: u16) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        store: runtime.store,
        retrieval: runtime.retrieval,
        orchestrator: runtime.orchestrator,
    });

    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
