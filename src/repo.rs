//! Narrow repository interface the node persists profiles and listings through.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::RepoError;
use crate::peer::PeerId;
use crate::protocol::{DatasetRef, PeerProfile};
use crate::state::lock;

/// A peer we have exchanged profiles with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPeer {
    pub id: PeerId,
    pub profile: PeerProfile,
    pub last_seen: u64,
}

pub trait Repo: Send + Sync {
    fn local_profile(&self) -> Result<PeerProfile, RepoError>;
    fn set_local_profile(&self, profile: PeerProfile) -> Result<(), RepoError>;

    fn known_peer(&self, id: &PeerId) -> Result<Option<KnownPeer>, RepoError>;
    fn put_known_peer(&self, id: &PeerId, profile: PeerProfile) -> Result<(), RepoError>;
    fn known_peers(&self) -> Result<Vec<KnownPeer>, RepoError>;

    fn list_datasets(&self, limit: usize, offset: usize) -> Result<Vec<DatasetRef>, RepoError>;
    fn put_dataset(&self, dataset: DatasetRef) -> Result<(), RepoError>;

    fn record_remote_datasets(
        &self,
        id: &PeerId,
        listing: Vec<DatasetRef>,
    ) -> Result<(), RepoError>;
    fn remote_datasets(&self, id: &PeerId) -> Result<Option<Vec<DatasetRef>>, RepoError>;
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn page(datasets: &[DatasetRef], limit: usize, offset: usize) -> Vec<DatasetRef> {
    datasets.iter().skip(offset).take(limit).cloned().collect()
}

/// In-memory repo, handy for embedding and tests.
#[derive(Default)]
pub struct MemRepo {
    profile: Mutex<Option<PeerProfile>>,
    peers: Mutex<HashMap<PeerId, KnownPeer>>,
    datasets: Mutex<Vec<DatasetRef>>,
    remote: Mutex<HashMap<PeerId, Vec<DatasetRef>>>,
}

impl MemRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(profile: PeerProfile) -> Self {
        let repo = Self::default();
        *lock(&repo.profile) = Some(profile);
        repo
    }
}

impl Repo for MemRepo {
    fn local_profile(&self) -> Result<PeerProfile, RepoError> {
        lock(&self.profile)
            .clone()
            .ok_or_else(|| RepoError::NotFound("local profile".into()))
    }

    fn set_local_profile(&self, profile: PeerProfile) -> Result<(), RepoError> {
        *lock(&self.profile) = Some(profile);
        Ok(())
    }

    fn known_peer(&self, id: &PeerId) -> Result<Option<KnownPeer>, RepoError> {
        Ok(lock(&self.peers).get(id).cloned())
    }

    fn put_known_peer(&self, id: &PeerId, profile: PeerProfile) -> Result<(), RepoError> {
        let peer = KnownPeer {
            id: id.clone(),
            profile,
            last_seen: now_secs(),
        };
        lock(&self.peers).insert(id.clone(), peer);
        Ok(())
    }

    fn known_peers(&self) -> Result<Vec<KnownPeer>, RepoError> {
        let mut peers: Vec<_> = lock(&self.peers).values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(peers)
    }

    fn list_datasets(&self, limit: usize, offset: usize) -> Result<Vec<DatasetRef>, RepoError> {
        Ok(page(&lock(&self.datasets), limit, offset))
    }

    fn put_dataset(&self, dataset: DatasetRef) -> Result<(), RepoError> {
        lock(&self.datasets).push(dataset);
        Ok(())
    }

    fn record_remote_datasets(
        &self,
        id: &PeerId,
        listing: Vec<DatasetRef>,
    ) -> Result<(), RepoError> {
        lock(&self.remote).insert(id.clone(), listing);
        Ok(())
    }

    fn remote_datasets(&self, id: &PeerId) -> Result<Option<Vec<DatasetRef>>, RepoError> {
        Ok(lock(&self.remote).get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(name: &str) -> DatasetRef {
        DatasetRef {
            peername: "alpha".into(),
            name: name.into(),
            path: format!("/mem/{}", name),
        }
    }

    #[test]
    fn test_missing_local_profile_is_not_found() {
        let repo = MemRepo::new();
        assert!(matches!(repo.local_profile(), Err(RepoError::NotFound(_))));
    }

    #[test]
    fn test_list_datasets_pages() {
        let repo = MemRepo::new();
        for name in ["a", "b", "c", "d"] {
            repo.put_dataset(dataset(name)).unwrap();
        }
        let names: Vec<_> = repo
            .list_datasets(2, 1)
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["b", "c"]);
        assert!(repo.list_datasets(10, 9).unwrap().is_empty());
    }

    #[test]
    fn test_put_known_peer_overwrites_profile() {
        let repo = MemRepo::new();
        let id = PeerId::from("A1");
        let mut profile = PeerProfile {
            id: id.clone(),
            peername: "alpha".into(),
            created: 0,
            attributes: Default::default(),
        };
        repo.put_known_peer(&id, profile.clone()).unwrap();
        profile.peername = "alpha2".into();
        repo.put_known_peer(&id, profile).unwrap();

        let peers = repo.known_peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].profile.peername, "alpha2");
    }
}
