use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::error::RepoError;
use crate::peer::PeerId;
use crate::repo::Repo;

/// Locks a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// Roughly thirty years; far enough out to mean "never" for a running node.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `Instant::now() + after`, saturating instead of overflowing.
pub(crate) fn instant_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(Default)]
struct RegistryInner {
    // PeerId -> (addr -> expiry)
    addrs: HashMap<PeerId, HashMap<SocketAddr, Instant>>,
    support: HashMap<PeerId, bool>,
}

/// Known-peer lookups, the address cache and cached protocol-support flags.
///
/// Caches sit behind one coarse lock. Onboarding for a single identifier is
/// serialized through [`PeerRegistry::lock_peer`].
pub struct PeerRegistry {
    repo: Arc<dyn Repo>,
    inner: Mutex<RegistryInner>,
    peer_locks: Mutex<HashMap<PeerId, Arc<tokio::sync::Mutex<()>>>>,
}

impl PeerRegistry {
    pub fn new(repo: Arc<dyn Repo>) -> Self {
        Self {
            repo,
            inner: Mutex::new(RegistryInner::default()),
            peer_locks: Mutex::new(HashMap::new()),
        }
    }

    /// True once a profile exchange with `id` has been persisted.
    ///
    /// A failed lookup counts as "not known"; use [`PeerRegistry::check_known`]
    /// to see the error.
    pub fn has_known_peer(&self, id: &PeerId) -> bool {
        match self.check_known(id) {
            Ok(known) => known,
            Err(e) => {
                tracing::warn!(peer = %id, error = %e, "known peer lookup failed");
                false
            }
        }
    }

    pub fn check_known(&self, id: &PeerId) -> Result<bool, RepoError> {
        Ok(self.repo.known_peer(id)?.is_some())
    }

    /// Merges `addrs` into the cache. An address keeps the later of its two expiries.
    pub fn record_addresses(&self, id: &PeerId, addrs: &[SocketAddr], ttl: Duration) {
        let expires = instant_after(ttl);
        let mut inner = lock(&self.inner);
        let entry = inner.addrs.entry(id.clone()).or_default();
        for addr in addrs {
            let slot = entry.entry(*addr).or_insert(expires);
            if *slot < expires {
                *slot = expires;
            }
        }
    }

    /// Unexpired addresses for `id`, sorted for stable dialing order.
    pub fn addresses(&self, id: &PeerId) -> Vec<SocketAddr> {
        let now = Instant::now();
        let inner = lock(&self.inner);
        let mut addrs: Vec<_> = inner
            .addrs
            .get(id)
            .map(|m| {
                m.iter()
                    .filter(|(_, exp)| **exp > now)
                    .map(|(a, _)| *a)
                    .collect()
            })
            .unwrap_or_default();
        addrs.sort();
        addrs
    }

    /// `None` means the peer has never been probed.
    pub fn cached_support(&self, id: &PeerId) -> Option<bool> {
        lock(&self.inner).support.get(id).copied()
    }

    /// Records a probe verdict. A `true` verdict is never downgraded.
    pub fn set_support_flag(&self, id: &PeerId, supported: bool) {
        let mut inner = lock(&self.inner);
        let slot = inner.support.entry(id.clone()).or_insert(supported);
        *slot = *slot || supported;
    }

    /// Serializes work on a single peer identifier across tasks.
    pub async fn lock_peer(&self, id: &PeerId) -> OwnedMutexGuard<()> {
        let peer_lock = {
            let mut locks = lock(&self.peer_locks);
            locks.entry(id.clone()).or_default().clone()
        };
        peer_lock.lock_owned().await
    }

    /// Drops expired addresses and per-peer locks nobody holds.
    pub fn prune(&self) {
        let now = Instant::now();
        {
            let mut inner = lock(&self.inner);
            inner.addrs.retain(|_, m| {
                m.retain(|_, exp| *exp > now);
                !m.is_empty()
            });
        }
        lock(&self.peer_locks).retain(|_, l| Arc::strong_count(l) > 1);
    }
}
