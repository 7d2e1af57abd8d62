//! The storage-server roster: registration, endpoint lookup, and the
//! `ReplicaId` newtype used everywhere else in the core instead of raw
//! socket addresses — the same opaque-small-identifier shape as
//! `nfs-mamont`'s `vfs::file::Uid` / `mount::Handle`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::RegistryError;
use crate::path::Path;

/// Opaque identifier for a registered storage replica, assigned in
/// registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaId(u64);

impl ReplicaId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        ReplicaId(raw)
    }
}

/// Endpoints of a registered storage replica.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaInfo {
    /// Address clients use for direct byte I/O.
    pub client_endpoint: SocketAddr,
    /// Address the naming core uses to issue `create`/`delete`/`copy`.
    pub command_endpoint: SocketAddr,
}

struct RegistryState {
    replicas: Vec<ReplicaInfo>,
}

impl RegistryState {
    fn endpoint_collides(&self, info: &ReplicaInfo) -> bool {
        self.replicas.iter().any(|r| {
            r.client_endpoint == info.client_endpoint || r.command_endpoint == info.command_endpoint
        })
    }
}

/// Roster of storage replicas and, transitively through [`crate::tree`],
/// the per-file owner/replica-set bookkeeping. Guarded by a single
/// mutex, per §5.
pub struct Registry {
    state: Mutex<RegistryState>,
    round_robin: AtomicUsize,
}

impl Default for Registry {
    fn default() -> Self {
        Registry {
            state: Mutex::new(RegistryState { replicas: Vec::new() }),
            round_robin: AtomicUsize::new(0),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Registers a new storage replica, rejecting a collision on either
    /// endpoint. Returns the freshly assigned [`ReplicaId`] for the
    /// caller to reconcile against the tree.
    pub fn register(&self, info: ReplicaInfo) -> Result<ReplicaId, RegistryError> {
        let mut state = self.state.lock().unwrap();
        if state.endpoint_collides(&info) {
            return Err(RegistryError::AlreadyRegistered);
        }
        let id = ReplicaId(state.replicas.len() as u64);
        state.replicas.push(info);
        Ok(id)
    }

    /// The client-facing endpoint of `replica`.
    pub fn client_endpoint(&self, replica: ReplicaId) -> Option<SocketAddr> {
        let state = self.state.lock().unwrap();
        state.replicas.get(replica.0 as usize).map(|r| r.client_endpoint)
    }

    /// The command endpoint the core uses to instruct `replica`.
    pub fn command_endpoint(&self, replica: ReplicaId) -> Option<SocketAddr> {
        let state = self.state.lock().unwrap();
        state.replicas.get(replica.0 as usize).map(|r| r.command_endpoint)
    }

    pub fn replica_count(&self) -> usize {
        self.state.lock().unwrap().replicas.len()
    }

    /// Every currently registered replica id, in registration order.
    pub fn all_replicas(&self) -> Vec<ReplicaId> {
        let state = self.state.lock().unwrap();
        (0..state.replicas.len() as u64).map(ReplicaId).collect()
    }

    /// Picks an owner for a newly created file, cycling through
    /// registered replicas in registration order. `None` if none are
    /// registered (`create_file` then fails with `IllegalState`, §6.1).
    pub fn pick_owner(&self) -> Option<ReplicaId> {
        let count = self.state.lock().unwrap().replicas.len();
        if count == 0 {
            return None;
        }
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % count;
        Some(ReplicaId(index as u64))
    }
}

/// Access-frequency counters live on the tree nodes themselves (§3); this
/// small helper type is what [`crate::service::NamingService::get_storage`]
/// hands back to callers once it has resolved a hosting replica.
#[derive(Debug, Clone, Copy)]
pub struct HostingReplica {
    pub replica: ReplicaId,
    pub client_endpoint: SocketAddr,
}

/// Looks up the first replica (by registration order) hosting `path`,
/// per the deterministic tie-break policy of §4.4.
pub fn first_hosting_replica(
    registry: &Registry,
    replicas: &[ReplicaId],
    _path: &Path,
) -> Option<HostingReplica> {
    replicas
        .iter()
        .min_by_key(|r| r.0)
        .and_then(|&replica| registry.client_endpoint(replica).map(|client_endpoint| HostingReplica {
            replica,
            client_endpoint,
        }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn info(client: u16, command: u16) -> ReplicaInfo {
        ReplicaInfo { client_endpoint: addr(client), command_endpoint: addr(command) }
    }

    #[test]
    fn registers_distinct_replicas_in_order() {
        let registry = Registry::new();
        let r1 = registry.register(info(1, 2)).unwrap();
        let r2 = registry.register(info(3, 4)).unwrap();
        assert_ne!(r1, r2);
        assert_eq!(registry.replica_count(), 2);
    }

    #[test]
    fn rejects_duplicate_endpoint() {
        let registry = Registry::new();
        registry.register(info(1, 2)).unwrap();
        assert_eq!(registry.register(info(1, 5)), Err(RegistryError::AlreadyRegistered));
        assert_eq!(registry.register(info(5, 2)), Err(RegistryError::AlreadyRegistered));
    }
}
