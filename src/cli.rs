use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{
    NodeSettings, DEFAULT_ADDRESS_TTL, DEFAULT_SEND_TIMEOUT, MAX_ADDRESS_TTL, MAX_SEND_TIMEOUT,
};
use crate::logging::DEFAULT_LOG_LEVEL;
use crate::repo::{KnownPeer, Repo};

#[derive(Parser, Debug)]
#[command(name = "datapeer", version, about = "Discover peers on the local network and exchange profiles and dataset listings")]
pub struct Cli {
    /// Repo directory (defaults to ~/.datapeer)
    #[arg(long, env = "DATAPEER_REPO", global = true)]
    pub repo: Option<PathBuf>,

    #[arg(long, env = "DATAPEER_LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL, global = true)]
    pub log_level: String,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, env = "DATAPEER_LOG_DIR", global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the node: listen, announce over mDNS and onboard discovered peers
    Serve(ServeArgs),
    /// Commands for working with peers
    Peers {
        #[command(subcommand)]
        command: PeersCommand,
    },
    /// Print the local profile
    Profile,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// UDP port for the QUIC listener (0 picks a free one)
    #[arg(long, env = "DATAPEER_PORT", default_value_t = 0)]
    pub port: u16,

    /// Deadline for a single request/response exchange (capped at one hour)
    #[arg(
        long,
        env = "DATAPEER_TIMEOUT_SECS",
        default_value_t = DEFAULT_SEND_TIMEOUT.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub timeout_secs: u64,

    /// How long confirmed peer addresses stay cached (capped at seven days)
    #[arg(
        long,
        env = "DATAPEER_ADDRESS_TTL_SECS",
        default_value_t = DEFAULT_ADDRESS_TTL.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub address_ttl_secs: u64,
}

fn bounded_secs(secs: u64, max: Duration) -> Duration {
    Duration::from_secs(secs.max(1)).min(max)
}

impl ServeArgs {
    pub fn settings(&self) -> NodeSettings {
        NodeSettings {
            send_timeout: bounded_secs(self.timeout_secs, MAX_SEND_TIMEOUT),
            address_ttl: bounded_secs(self.address_ttl_secs, MAX_ADDRESS_TTL),
            ..NodeSettings::default()
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum PeersCommand {
    /// List peers this node has exchanged profiles with
    #[command(alias = "ls")]
    List,
    /// Show a known peer's profile
    Info {
        /// Peer name to look up
        peername: String,
    },
    /// Dial a peer directly, exchange profiles and print theirs
    Connect {
        /// Peer address, e.g. 192.168.1.20:4001
        addr: SocketAddr,

        /// Deadline for the profile exchange
        #[arg(
            long,
            env = "DATAPEER_TIMEOUT_SECS",
            default_value_t = DEFAULT_SEND_TIMEOUT.as_secs(),
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        timeout_secs: u64,
    },
}

impl PeersCommand {
    /// Exchange deadline for `connect`, bounded like `serve`'s.
    pub fn connect_timeout(timeout_secs: u64) -> Duration {
        bounded_secs(timeout_secs, MAX_SEND_TIMEOUT)
    }
}

pub fn format_peer_line(index: usize, peer: &KnownPeer) -> String {
    format!("{}.\t{}\t{}", index + 1, peer.profile.peername, peer.id)
}

pub fn peers_list(repo: &dyn Repo) -> Result<Vec<String>> {
    let peers = repo.known_peers().context("failed to read known peers")?;
    Ok(peers
        .iter()
        .enumerate()
        .map(|(i, p)| format_peer_line(i, p))
        .collect())
}

pub fn peers_info(repo: &dyn Repo, peername: &str) -> Result<String> {
    let peers = repo.known_peers().context("failed to read known peers")?;
    let peer = peers
        .into_iter()
        .find(|p| p.profile.peername == peername)
        .with_context(|| format!("no known peer named {}", peername))?;
    Ok(serde_json::to_string_pretty(&peer.profile)?)
}
