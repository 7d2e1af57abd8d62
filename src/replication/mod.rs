//! Access-frequency-driven replication and exclusive-write invalidation
//! (§4.5). Commands to storage replicas are dispatched onto a background
//! task reachable over an unbounded channel, in the same
//! struct-owns-channel-halves-spawned-via-`spawn` shape as
//! `nfs-mamont`'s `VfsTask`/`ReadTask` actors, so the request that
//! triggered a replication decision never blocks on network I/O.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::command::CommandClient;
use crate::lock::LockMode;
use crate::path::Path;
use crate::registry::{ReplicaId, Registry};
use crate::tree::Tree;

/// Default access-count threshold at which a read-heavy file is
/// replicated to every replica not already hosting it. A configuration
/// constant per §9; overridable via [`crate::config::NamingConfig`].
pub const DEFAULT_REPLICATION_THRESHOLD: u64 = 20;

/// One outbound instruction for a single `(replica, path)` pair.
enum Instruction {
    Create { replica: ReplicaId, endpoint: std::net::SocketAddr, path: Path },
    Delete { replica: ReplicaId, endpoint: std::net::SocketAddr, path: Path },
    Copy {
        replica: ReplicaId,
        endpoint: std::net::SocketAddr,
        path: Path,
        source: std::net::SocketAddr,
        tree: Arc<Tree>,
    },
    DeleteNoTreeUpdate { endpoint: std::net::SocketAddr, path: Path },
}

/// Background actor draining replication/invalidation instructions and
/// issuing them via [`CommandClient`]. Failures are logged and dropped
/// (§4.7.2, §7): they never fail the client request that triggered them.
struct Dispatcher {
    receiver: mpsc::UnboundedReceiver<Instruction>,
    client: Arc<dyn CommandClient>,
}

impl Dispatcher {
    fn spawn(client: Arc<dyn CommandClient>) -> (mpsc::UnboundedSender<Instruction>, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Dispatcher { receiver, client }.run());
        (sender, handle)
    }

    async fn run(mut self) {
        while let Some(instruction) = self.receiver.recv().await {
            match instruction {
                Instruction::Create { endpoint, path, .. } => {
                    if let Err(err) = self.client.create(endpoint, &path).await {
                        warn!(%path, %err, "replica rejected create command");
                    }
                }
                Instruction::Delete { endpoint, path, .. } => {
                    if let Err(err) = self.client.delete(endpoint, &path).await {
                        warn!(%path, %err, "replica rejected delete command");
                    }
                }
                Instruction::DeleteNoTreeUpdate { endpoint, path } => {
                    if let Err(err) = self.client.delete(endpoint, &path).await {
                        warn!(%path, %err, "replica rejected delete command");
                    }
                }
                Instruction::Copy { replica, endpoint, path, source, tree } => {
                    match self.client.copy(endpoint, &path, source).await {
                        Ok(()) => tree.add_replica(&path, replica),
                        Err(err) => warn!(%path, %err, "replica rejected copy command"),
                    }
                }
            }
        }
    }
}

/// Stateful access-counter-driven replication policy (§4.5). Owns the
/// background [`Dispatcher`] and the shared [`Tree`]/[`Registry`] it
/// consults to decide which replicas to contact.
pub struct ReplicationPolicy {
    tree: Arc<Tree>,
    registry: Arc<Registry>,
    sender: mpsc::UnboundedSender<Instruction>,
    _dispatcher: JoinHandle<()>,
    threshold: u64,
}

impl ReplicationPolicy {
    pub fn new(tree: Arc<Tree>, registry: Arc<Registry>, client: Arc<dyn CommandClient>) -> Self {
        Self::with_threshold(tree, registry, client, DEFAULT_REPLICATION_THRESHOLD)
    }

    pub fn with_threshold(
        tree: Arc<Tree>,
        registry: Arc<Registry>,
        client: Arc<dyn CommandClient>,
        threshold: u64,
    ) -> Self {
        let (sender, dispatcher) = Dispatcher::spawn(client);
        ReplicationPolicy { tree, registry, sender, _dispatcher: dispatcher, threshold }
    }

    /// Called by the [`crate::lock::LockManager`] on every successful
    /// unlock of a file path (§4.3.5). Directories are ignored: only
    /// files carry an access counter.
    pub fn on_unlock(&self, path: &Path, mode: LockMode) {
        let Some(state) = self.tree.file_state(path) else { return };
        match mode {
            LockMode::Shared => self.on_shared_unlock(path, state.access_count, &state.replicas),
            LockMode::Exclusive => self.on_exclusive_unlock(path, state.owner, &state.replicas),
        }
    }

    fn on_shared_unlock(&self, path: &Path, access_count_before: u64, hosting: &[ReplicaId]) {
        let count = self.tree.increment_access_count(path).unwrap_or(access_count_before + 1);
        if count < self.threshold {
            return;
        }
        self.tree.reset_access_count(path);

        let Some(owner) = self.tree.file_state(path).map(|s| s.owner) else { return };
        let Some(source) = self.registry.client_endpoint(owner) else { return };

        for replica in self.registry.all_replicas() {
            if hosting.contains(&replica) {
                continue;
            }
            let Some(endpoint) = self.registry.command_endpoint(replica) else { continue };
            let _ = self.sender.send(Instruction::Copy {
                replica,
                endpoint,
                path: path.clone(),
                source,
                tree: self.tree.clone(),
            });
        }
    }

    fn on_exclusive_unlock(&self, path: &Path, owner: ReplicaId, hosting: &[ReplicaId]) {
        for &replica in hosting {
            if replica == owner {
                continue;
            }
            let Some(endpoint) = self.registry.command_endpoint(replica) else { continue };
            self.tree.remove_replica(path, replica);
            let _ = self.sender.send(Instruction::Delete { replica, endpoint, path: path.clone() });
        }
    }

    /// Called when a top-level client `delete` removes a file: every
    /// hosting replica is instructed to delete its local copy.
    pub fn on_file_deleted(&self, path: &Path, hosting: &[ReplicaId]) {
        for &replica in hosting {
            let Some(endpoint) = self.registry.command_endpoint(replica) else { continue };
            let _ = self
                .sender
                .send(Instruction::DeleteNoTreeUpdate { endpoint, path: path.clone() });
        }
    }

    /// Instructs `replica` to create `path`, used by
    /// [`crate::service::NamingService::create_file`] right after the
    /// tree records the new file (§6.1).
    pub fn on_file_created(&self, path: &Path, replica: ReplicaId) {
        let Some(endpoint) = self.registry.command_endpoint(replica) else { return };
        let _ = self.sender.send(Instruction::Create { replica, endpoint, path: path.clone() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommandError;
    use crate::path::decode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingClient {
        copies: Mutex<Vec<Path>>,
        deletes: Mutex<Vec<Path>>,
        creates: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CommandClient for RecordingClient {
        async fn create(&self, _endpoint: std::net::SocketAddr, _path: &Path) -> Result<(), CommandError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete(&self, _endpoint: std::net::SocketAddr, path: &Path) -> Result<(), CommandError> {
            self.deletes.lock().unwrap().push(path.clone());
            Ok(())
        }

        async fn copy(
            &self,
            _endpoint: std::net::SocketAddr,
            path: &Path,
            _source: std::net::SocketAddr,
        ) -> Result<(), CommandError> {
            self.copies.lock().unwrap().push(path.clone());
            Ok(())
        }
    }

    fn addr(port: u16) -> std::net::SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn shared_unlock_triggers_copy_at_threshold() {
        let tree = Arc::new(Tree::new());
        let registry = Arc::new(Registry::new());
        let r1 = registry
            .register(crate::registry::ReplicaInfo { client_endpoint: addr(1), command_endpoint: addr(2) })
            .unwrap();
        let r2 = registry
            .register(crate::registry::ReplicaInfo { client_endpoint: addr(3), command_endpoint: addr(4) })
            .unwrap();

        let path = decode("/f").unwrap();
        tree.create_file(&path, r1).unwrap();

        let client = Arc::new(RecordingClient::default());
        let policy = ReplicationPolicy::with_threshold(
            tree.clone(),
            registry.clone(),
            client.clone() as Arc<dyn CommandClient>,
            3,
        );

        policy.on_unlock(&path, LockMode::Shared);
        policy.on_unlock(&path, LockMode::Shared);
        assert!(client.copies.lock().unwrap().is_empty());

        policy.on_unlock(&path, LockMode::Shared);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(client.copies.lock().unwrap().len(), 1);

        let state = tree.file_state(&path).unwrap();
        assert!(state.replicas.contains(&r2));
        assert_eq!(state.access_count, 0);
    }

    #[tokio::test]
    async fn exclusive_unlock_invalidates_non_owner_replicas() {
        let tree = Arc::new(Tree::new());
        let registry = Arc::new(Registry::new());
        let r1 = registry
            .register(crate::registry::ReplicaInfo { client_endpoint: addr(1), command_endpoint: addr(2) })
            .unwrap();
        let r2 = registry
            .register(crate::registry::ReplicaInfo { client_endpoint: addr(3), command_endpoint: addr(4) })
            .unwrap();

        let path = decode("/f").unwrap();
        tree.create_file(&path, r1).unwrap();
        tree.add_replica(&path, r2);

        let client = Arc::new(RecordingClient::default());
        let policy =
            ReplicationPolicy::new(tree.clone(), registry.clone(), client.clone() as Arc<dyn CommandClient>);

        policy.on_unlock(&path, LockMode::Exclusive);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(client.deletes.lock().unwrap().len(), 1);
        let state = tree.file_state(&path).unwrap();
        assert_eq!(state.replicas, vec![r1]);
    }
}
