use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::PROTOCOL_ID;

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ADDRESS_TTL: Duration = Duration::from_secs(10 * 60);
/// Addresses of a peer that has not yet answered a profile exchange are only trusted briefly.
pub const PROVISIONAL_ADDRESS_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_DATASETS_LIMIT: usize = 30;

/// Upper bounds applied to user-supplied durations.
pub const MAX_SEND_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const MAX_ADDRESS_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const REPO_DIR_NAME: &str = ".datapeer";

/// Runtime knobs for a node.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub protocol_id: String,
    pub send_timeout: Duration,
    pub address_ttl: Duration,
    pub provisional_ttl: Duration,
    pub datasets_limit: usize,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            protocol_id: PROTOCOL_ID.to_string(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            address_ttl: DEFAULT_ADDRESS_TTL,
            provisional_ttl: PROVISIONAL_ADDRESS_TTL,
            datasets_limit: DEFAULT_DATASETS_LIMIT,
        }
    }
}

/// Explicit path, else `$HOME/.datapeer`, else `./.datapeer`.
pub fn resolve_repo_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(REPO_DIR_NAME),
        _ => PathBuf::from(REPO_DIR_NAME),
    }
}
