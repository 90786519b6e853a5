// src/main.rs — agentdeck entry point

use clap::Parser;

use agentdeck::cli::send::SendArgs;
use agentdeck::cli::{doctor, send, sessions, Cli, Commands};
use agentdeck::infra::config::Config;
use agentdeck::infra::{logger, paths};
use agentdeck::memory::{self, store_server::SessionFlag};

#[tokio::main]
async fn main() {
    // Initialize logging (respects RUST_LOG / AGENTDECK_LOG)
    logger::init_logging("warn");

    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config (falls back to defaults if no config.toml)
    let config = if let Some(ref path) = cli.config {
        Config::load_from(std::path::Path::new(path))?
    } else {
        Config::load()?
    };

    if let Commands::Doctor = cli.command {
        return doctor::run_doctor(&config).await;
    }

    paths::ensure_dirs().await?;
    let store = memory::open_store(&paths::db_path())?;
    let (store, _server) = memory::store_server::spawn_store_server(store);

    match cli.command {
        Commands::Send {
            session,
            folder,
            json,
            message,
        } => {
            let args = SendArgs {
                session,
                folder,
                message: message.join(" "),
                json,
            };
            send::run_send(config, store, args).await
        }
        Commands::Fork { id, keep_parent } => sessions::fork(&store, &id, keep_parent).await,
        Commands::Rewind {
            id,
            checkpoint,
            message,
        } => sessions::rewind(&store, &id, &checkpoint, &message.join(" ")).await,
        Commands::Lineage { id } => sessions::show_lineage(&store, &id).await,
        Commands::Sessions { all } => sessions::list_sessions(&store, all).await,
        Commands::Show { id } => sessions::show_session(&store, &id).await,
        Commands::Hide { id } => sessions::set_flag(&store, &id, SessionFlag::Hidden, true).await,
        Commands::Unhide { id } => sessions::set_flag(&store, &id, SessionFlag::Hidden, false).await,
        Commands::Archive { id } => {
            sessions::set_flag(&store, &id, SessionFlag::Archived, true).await
        }
        Commands::Unarchive { id } => {
            sessions::set_flag(&store, &id, SessionFlag::Archived, false).await
        }
        Commands::Pin { id } => sessions::set_flag(&store, &id, SessionFlag::Pinned, true).await,
        Commands::Unpin { id } => sessions::set_flag(&store, &id, SessionFlag::Pinned, false).await,
        Commands::Doctor => Ok(()),
    }
}
