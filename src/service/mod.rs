//! The request gateway (§4.6): a stateless translator from the external
//! wire protocol to calls against [`Tree`], [`LockManager`], [`Registry`]
//! and [`ReplicationPolicy`]. Every handler follows the same four-step
//! shape — decode, validate the path, dispatch to the core, serialize
//! the result or typed error — mirroring the thin-handler style of
//! `nfs-mamont`'s RPC dispatch over its `Vfs` trait.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::{debug, instrument};

use crate::command::CommandClient;
use crate::error::NamingError;
use crate::lock::{LockHandle, LockManager, LockMode};
use crate::path::{self, Path};
use crate::registry::{first_hosting_replica, HostingReplica, Registry, ReplicaInfo};
use crate::replication::ReplicationPolicy;
use crate::tree::Tree;

/// The naming core's owned state, shared behind an `Arc` across every
/// transport handler (§9: "no ambient statics").
///
/// `lock`/`unlock` are independent wire requests carrying only `{path,
/// exclusive}` (§6.1) — no ticket travels over the wire — so granted but
/// not-yet-released handles are held here, keyed by `(path, exclusive)`,
/// until the matching `unlock` call claims one.
pub struct NamingCore {
    tree: Arc<Tree>,
    lock_manager: LockManager,
    registry: Arc<Registry>,
    replication: ReplicationPolicy,
    outstanding_locks: Mutex<HashMap<(Path, bool), Vec<LockHandle>>>,
}

impl NamingCore {
    pub fn new(command_client: Arc<dyn CommandClient>) -> Self {
        Self::with_threshold(command_client, crate::replication::DEFAULT_REPLICATION_THRESHOLD)
    }

    pub fn with_threshold(command_client: Arc<dyn CommandClient>, replication_threshold: u64) -> Self {
        let tree = Arc::new(Tree::new());
        let registry = Arc::new(Registry::new());
        let replication =
            ReplicationPolicy::with_threshold(tree.clone(), registry.clone(), command_client, replication_threshold);
        NamingCore {
            tree,
            lock_manager: LockManager::new(),
            registry,
            replication,
            outstanding_locks: Mutex::new(HashMap::new()),
        }
    }

    fn decode(raw: &str) -> Result<Path, NamingError> {
        path::decode(raw).map_err(NamingError::from)
    }

    #[instrument(skip(self))]
    pub fn is_valid_path(&self, raw: &str) -> bool {
        Self::decode(raw).map(|p| self.tree.exists(&p)).unwrap_or(false)
    }

    #[instrument(skip(self))]
    pub fn get_storage(&self, raw: &str) -> Result<HostingReplica, NamingError> {
        let path = Self::decode(raw)?;
        let state = self.tree.file_state(&path).ok_or(NamingError::FileNotFound)?;
        first_hosting_replica(&self.registry, &state.replicas, &path).ok_or(NamingError::FileNotFound)
    }

    #[instrument(skip(self))]
    pub fn is_directory(&self, raw: &str) -> Result<bool, NamingError> {
        let path = Self::decode(raw)?;
        Ok(self.tree.is_directory(&path)?)
    }

    #[instrument(skip(self))]
    pub fn list(&self, raw: &str) -> Result<Vec<String>, NamingError> {
        let path = Self::decode(raw)?;
        Ok(self.tree.list(&path)?)
    }

    #[instrument(skip(self))]
    pub fn create_directory(&self, raw: &str) -> Result<bool, NamingError> {
        let path = Self::decode(raw)?;
        Ok(self.tree.create_directory(&path)?)
    }

    /// Creates a file, assigning it to a replica chosen round-robin from
    /// the registered set, then dispatches a storage `create` to that
    /// replica (§6.1: "triggers a storage `create` on at least one
    /// replica and records it as owner").
    #[instrument(skip(self))]
    pub fn create_file(&self, raw: &str) -> Result<bool, NamingError> {
        let path = Self::decode(raw)?;
        let owner = self
            .registry
            .pick_owner()
            .ok_or(NamingError::IllegalState("no storage replica is registered"))?;
        let created = self.tree.create_file(&path, owner)?;
        if created {
            self.replication.on_file_created(&path, owner);
        }
        Ok(created)
    }

    /// Deletes a file or directory. For a directory, cascades a storage
    /// `delete` to every replica hosting any file in the removed
    /// subtree, not just a single top-level file (§4.2, §4.5).
    #[instrument(skip(self))]
    pub fn delete(&self, raw: &str) -> Result<bool, NamingError> {
        let path = Self::decode(raw)?;
        let removed_files = self.tree.file_states_under(&path);
        self.tree.delete(&path)?;
        for (file_path, state) in &removed_files {
            self.replication.on_file_deleted(file_path, &state.replicas);
        }
        Ok(true)
    }

    /// Acquires a lock on `raw` in the given mode, blocking the caller
    /// until granted (§4.3.2), then holds the resulting handle until a
    /// matching `unlock` call claims it.
    #[instrument(skip(self))]
    pub async fn lock(&self, raw: &str, exclusive: bool) -> Result<(), NamingError> {
        let path = Self::decode(raw)?;
        let mode = if exclusive { LockMode::Exclusive } else { LockMode::Shared };
        debug!(path = %path, ?mode, "acquiring lock");
        let handle = self.lock_manager.lock(&self.tree, &path, mode).await?;
        debug!(path = %path, ?mode, "lock granted");
        self.outstanding_locks
            .lock()
            .unwrap()
            .entry((path, exclusive))
            .or_default()
            .push(handle);
        Ok(())
    }

    /// Releases a lock previously granted to `raw` in the given mode and
    /// notifies the replication policy of the access (§4.3.5). Fails
    /// with `IllegalArgument` if no matching outstanding lock exists —
    /// the only error `unlock` can produce per §6.1.
    #[instrument(skip(self))]
    pub fn unlock(&self, raw: &str, exclusive: bool) -> Result<(), NamingError> {
        let path = Self::decode(raw)?;
        let handle = {
            let mut outstanding = self.outstanding_locks.lock().unwrap();
            let key = (path.clone(), exclusive);
            let handles = outstanding
                .get_mut(&key)
                .ok_or(NamingError::IllegalArgument("path is not locked"))?;
            let handle = handles.pop().ok_or(NamingError::IllegalArgument("path is not locked"))?;
            if handles.is_empty() {
                outstanding.remove(&key);
            }
            handle
        };
        let mode = handle.mode();
        self.lock_manager.unlock(handle);
        debug!(path = %path, ?mode, "lock released");
        self.replication.on_unlock(&path, mode);
        Ok(())
    }

    /// Registers a new storage replica and reconciles its reported file
    /// set against the tree (§6.2).
    #[instrument(skip(self))]
    pub fn register(
        &self,
        storage_ip: std::net::IpAddr,
        client_port: u16,
        command_port: u16,
        files: &[String],
    ) -> Result<Vec<String>, NamingError> {
        let mut decoded = Vec::with_capacity(files.len());
        for raw in files {
            decoded.push(Self::decode(raw)?);
        }

        let client_endpoint = SocketAddr::new(storage_ip, client_port);
        let command_endpoint = SocketAddr::new(storage_ip, command_port);
        let owner = self
            .registry
            .register(ReplicaInfo { client_endpoint, command_endpoint })
            .map_err(NamingError::from)?;

        let rejected = self.tree.merge_registration(owner, &decoded);
        Ok(rejected.iter().map(|p| p.encode()).collect())
    }

    pub fn replica_count(&self) -> usize {
        self.registry.replica_count()
    }
}
