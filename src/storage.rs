use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::RepoError;
use crate::peer::PeerId;
use crate::protocol::{DatasetRef, PeerProfile};
use crate::repo::{now_secs, page, KnownPeer, Repo};
use crate::state::lock;

pub const FILE_PROFILE: &str = "profile.json";
pub const FILE_PEERS: &str = "peers.json";
pub const FILE_DATASETS: &str = "datasets.json";
pub const FILE_REMOTE_DATASETS: &str = "remote_datasets.json";
pub const FILE_ANALYTICS: &str = "analytics.json";

/// Reads a JSON file, treating a missing file as the default value.
pub(crate) fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, RepoError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(&content)?)
}

/// Writes through a temp file so readers never see half a document.
pub(crate) fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), RepoError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Repo stored as a handful of JSON documents in one directory.
pub struct FsRepo {
    root: PathBuf,
    // Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FsRepo {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, RepoError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    fn update<T, F>(&self, file: &str, f: F) -> Result<(), RepoError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T),
    {
        let _guard = lock(&self.write_lock);
        let path = self.path(file);
        let mut value: T = load_json(&path)?;
        f(&mut value);
        save_json(&path, &value)
    }
}

impl Repo for FsRepo {
    fn local_profile(&self) -> Result<PeerProfile, RepoError> {
        let profile: Option<PeerProfile> = load_json(&self.path(FILE_PROFILE))?;
        profile.ok_or_else(|| RepoError::NotFound("local profile".into()))
    }

    fn set_local_profile(&self, profile: PeerProfile) -> Result<(), RepoError> {
        let _guard = lock(&self.write_lock);
        save_json(&self.path(FILE_PROFILE), &Some(profile))
    }

    fn known_peer(&self, id: &PeerId) -> Result<Option<KnownPeer>, RepoError> {
        let mut peers: HashMap<PeerId, KnownPeer> = load_json(&self.path(FILE_PEERS))?;
        Ok(peers.remove(id))
    }

    fn put_known_peer(&self, id: &PeerId, profile: PeerProfile) -> Result<(), RepoError> {
        let peer = KnownPeer {
            id: id.clone(),
            profile,
            last_seen: now_secs(),
        };
        self.update(FILE_PEERS, |peers: &mut HashMap<PeerId, KnownPeer>| {
            peers.insert(id.clone(), peer);
        })
    }

    fn known_peers(&self) -> Result<Vec<KnownPeer>, RepoError> {
        let peers: HashMap<PeerId, KnownPeer> = load_json(&self.path(FILE_PEERS))?;
        let mut peers: Vec<_> = peers.into_values().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(peers)
    }

    fn list_datasets(&self, limit: usize, offset: usize) -> Result<Vec<DatasetRef>, RepoError> {
        let datasets: Vec<DatasetRef> = load_json(&self.path(FILE_DATASETS))?;
        Ok(page(&datasets, limit, offset))
    }

    fn put_dataset(&self, dataset: DatasetRef) -> Result<(), RepoError> {
        self.update(FILE_DATASETS, |datasets: &mut Vec<DatasetRef>| {
            datasets.push(dataset);
        })
    }

    fn record_remote_datasets(
        &self,
        id: &PeerId,
        listing: Vec<DatasetRef>,
    ) -> Result<(), RepoError> {
        self.update(
            FILE_REMOTE_DATASETS,
            |remote: &mut HashMap<PeerId, Vec<DatasetRef>>| {
                remote.insert(id.clone(), listing);
            },
        )
    }

    fn remote_datasets(&self, id: &PeerId) -> Result<Option<Vec<DatasetRef>>, RepoError> {
        let mut remote: HashMap<PeerId, Vec<DatasetRef>> =
            load_json(&self.path(FILE_REMOTE_DATASETS))?;
        Ok(remote.remove(id))
    }
}
