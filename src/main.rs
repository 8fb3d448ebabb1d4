use anyhow::{Context, Result};
use clap::Parser;

use datapeer_lib::cli::{self, Cli, Command, PeersCommand};
use datapeer_lib::config::resolve_repo_dir;
use datapeer_lib::logging::init_tracing;
use datapeer_lib::storage::FsRepo;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli.log_level, cli.log_dir.as_deref());
    let repo_dir = resolve_repo_dir(cli.repo.as_deref());

    match cli.command {
        Command::Serve(args) => {
            datapeer_lib::serve(&repo_dir, args.port, args.settings()).await?;
        }
        Command::Peers { command } => {
            let repo = FsRepo::open(&repo_dir)
                .with_context(|| format!("failed to open repo at {}", repo_dir.display()))?;
            match command {
                PeersCommand::List => {
                    for line in cli::peers_list(&repo)? {
                        println!("{}", line);
                    }
                }
                PeersCommand::Info { peername } => {
                    println!("{}", cli::peers_info(&repo, &peername)?);
                }
                PeersCommand::Connect { addr, timeout_secs } => {
                    drop(repo);
                    let timeout = PeersCommand::connect_timeout(timeout_secs);
                    let profile = datapeer_lib::connect(&repo_dir, addr, timeout).await?;
                    println!("{}", serde_json::to_string_pretty(&profile)?);
                }
            }
        }
        Command::Profile => {
            let repo = FsRepo::open(&repo_dir)
                .with_context(|| format!("failed to open repo at {}", repo_dir.display()))?;
            let profile = datapeer_lib::ensure_local_profile(&repo)?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
    }
    Ok(())
}
