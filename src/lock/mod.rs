//! Per-node lock state ([`LockNode`]) and the fair hierarchical
//! read/write lock protocol ([`LockManager`]) built on top of it.
//!
//! Every node in the namespace tree owns one [`LockNode`]. Acquiring a
//! lock on a path walks from the root, taking a path-prefix Shared lock
//! on every strict ancestor, then enqueues the caller's own request on
//! the target node and waits for it to reach the head of that node's
//! FIFO queue under the fairness rules in `SPEC_FULL.md` §4.3.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::pin;

use crate::error::NamingError;
use crate::path::Path;
use crate::tree::Tree;

/// Shared (read) or Exclusive (write) lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Monotonically increasing identifier for a queued lock request.
pub type Ticket = u64;

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    ticket: Ticket,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockState {
    /// Currently granted holders: either empty, all Shared, or a single
    /// Exclusive.
    holders: Vec<(Ticket, LockMode)>,
    queue: VecDeque<QueueEntry>,
    exclusive_waiters: BTreeSet<Ticket>,
    next_ticket: Ticket,
    /// Set once the node this lock belongs to has been deleted. Queued
    /// and future waiters observe this and fail with `FileNotFound`
    /// instead of being granted.
    tombstoned: bool,
}

impl LockState {
    fn is_exclusively_held(&self) -> bool {
        matches!(self.holders.first(), Some((_, LockMode::Exclusive)))
    }

    fn min_exclusive_waiter(&self) -> Option<Ticket> {
        self.exclusive_waiters.iter().next().copied()
    }

    fn head_ticket(&self) -> Option<Ticket> {
        self.queue.front().map(|e| e.ticket)
    }

    fn remove_from_queue(&mut self, ticket: Ticket) {
        self.queue.retain(|e| e.ticket != ticket);
        self.exclusive_waiters.remove(&ticket);
    }
}

/// Outcome of a lock wait: either granted, or the node was deleted while
/// the request was queued.
enum WaitOutcome {
    Granted,
    Tombstoned,
}

/// Per-node lock: holders, FIFO queue, and the exclusive-waiter subset
/// used to forbid Shared requests from jumping ahead of older Exclusive
/// ones.
#[derive(Debug, Default)]
pub struct LockNode {
    state: Mutex<LockState>,
    notify: tokio::sync::Notify,
}

impl LockNode {
    pub fn new() -> Arc<LockNode> {
        Arc::new(LockNode::default())
    }

    /// Marks this node as deleted and wakes every queued waiter so it
    /// can observe the tombstone and fail with `FileNotFound`.
    pub(crate) fn tombstone(&self) {
        let mut state = self.state.lock().unwrap();
        state.tombstoned = true;
        drop(state);
        self.notify.notify_waiters();
    }

    fn enqueue(&self, mode: LockMode) -> Ticket {
        let mut state = self.state.lock().unwrap();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(QueueEntry { ticket, mode });
        if mode == LockMode::Exclusive {
            state.exclusive_waiters.insert(ticket);
        }
        ticket
    }

    /// Attempts to grant `ticket`. Returns `Some(outcome)` once the wait
    /// is over (granted or tombstoned), `None` if the caller must keep
    /// waiting.
    fn try_grant(&self, ticket: Ticket, mode: LockMode) -> Option<WaitOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.tombstoned {
            state.remove_from_queue(ticket);
            return Some(WaitOutcome::Tombstoned);
        }

        let granted = match mode {
            LockMode::Shared => {
                !state.is_exclusively_held()
                    && state.min_exclusive_waiter().map_or(true, |min| min > ticket)
            }
            LockMode::Exclusive => state.holders.is_empty() && state.head_ticket() == Some(ticket),
        };

        if !granted {
            return None;
        }

        state.remove_from_queue(ticket);
        state.holders.push((ticket, mode));
        Some(WaitOutcome::Granted)
    }

    /// Acquires this node's lock in `mode`, suspending until granted or
    /// until the node is tombstoned.
    ///
    /// If the returned future is dropped before it resolves (the caller
    /// was cancelled, e.g. a disconnecting client's handler future is
    /// torn down), `settle_guard` removes the still-queued ticket on
    /// drop and wakes the rest of the queue so no slot is ever wasted on
    /// a waiter that is no longer listening.
    async fn acquire(self: &Arc<Self>, mode: LockMode) -> Result<Ticket, NamingError> {
        let ticket = self.enqueue(mode);
        let mut settle_guard = QueuedTicketGuard { node: self.clone(), ticket, settled: false };
        loop {
            let notified = self.notify.notified();
            pin!(notified);
            notified.as_mut().enable();

            match self.try_grant(ticket, mode) {
                Some(WaitOutcome::Granted) => {
                    settle_guard.settled = true;
                    return Ok(ticket);
                }
                Some(WaitOutcome::Tombstoned) => {
                    settle_guard.settled = true;
                    return Err(NamingError::FileNotFound);
                }
                None => {}
            }

            notified.await;
        }
    }

    /// Releases the holder identified by `ticket`, then wakes whatever
    /// prefix of the queue is now grantable (the contiguous Shared
    /// prefix, or a lone Exclusive at the head).
    fn release(&self, ticket: Ticket) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.holders.iter().position(|(t, _)| *t == ticket) {
            state.holders.remove(pos);
        }
        drop(state);
        self.notify.notify_waiters();
    }
}

/// Deregisters a queued (not yet granted) ticket when dropped without
/// having settled into a grant or a tombstone error — the cancellation
/// path for a caller that stops polling the `acquire` future early.
struct QueuedTicketGuard {
    node: Arc<LockNode>,
    ticket: Ticket,
    settled: bool,
}

impl Drop for QueuedTicketGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.node.state.lock().unwrap();
        state.remove_from_queue(self.ticket);
        drop(state);
        self.node.notify.notify_waiters();
    }
}

/// Accumulates already-granted path-prefix Shared tickets while
/// [`LockManager::lock`] is still walking toward the target node.
///
/// If the enclosing `lock()` future is dropped before it resolves — a
/// client disconnecting while blocked on the target's queue, after
/// already being granted one or more ancestor prefix locks, is exactly
/// the scenario §5 calls out ("each lock acquire may suspend arbitrarily
/// long") — the granted ancestors would otherwise never be released:
/// each ancestor's own [`QueuedTicketGuard`] only cleans up a *queued*
/// ticket, and becomes a no-op once that ticket has moved into
/// `holders`. This guard's `Drop` releases every entry still held,
/// leaf-to-root, whenever it is dropped without first being [`take`]n.
///
/// [`take`]: PrefixGuard::take
struct PrefixGuard {
    entries: Vec<(Arc<LockNode>, Ticket)>,
}

impl PrefixGuard {
    fn new(capacity: usize) -> Self {
        PrefixGuard { entries: Vec::with_capacity(capacity) }
    }

    fn push(&mut self, node: Arc<LockNode>, ticket: Ticket) {
        self.entries.push((node, ticket));
    }

    /// Hands the accumulated entries to the caller without releasing
    /// them, leaving the guard empty (and therefore a no-op on drop).
    fn take(mut self) -> Vec<(Arc<LockNode>, Ticket)> {
        std::mem::take(&mut self.entries)
    }
}

impl Drop for PrefixGuard {
    fn drop(&mut self) {
        for (node, ticket) in self.entries.drain(..).rev() {
            node.release(ticket);
        }
    }
}

/// A held lock on a single path: one ticket on the target node, plus one
/// Shared prefix ticket per strict ancestor. Dropping this guard without
/// calling [`LockManager::unlock`] is a programming error in the same
/// sense unbalanced lock/unlock calls are in the source design (§4.3.3);
/// callers are expected to unlock explicitly.
pub struct LockHandle {
    path: Path,
    mode: LockMode,
    target: Arc<LockNode>,
    target_ticket: Ticket,
    prefix: Vec<(Arc<LockNode>, Ticket)>,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

/// Coordinates lock acquisition/release across the whole namespace,
/// walking root-to-leaf for path-prefix Shared locks and releasing
/// leaf-to-root, per §4.3.2/§4.3.3.
#[derive(Default)]
pub struct LockManager;

impl LockManager {
    pub fn new() -> Self {
        LockManager
    }

    /// Locks `path` in `mode`. Resolves the chain of ancestor lock nodes
    /// via `tree` (a short, synchronous lookup), then suspends until
    /// every prefix Shared lock and the target lock of `mode` are
    /// granted, in root-to-leaf order.
    ///
    /// Already-granted prefix locks are tracked in a [`PrefixGuard`] for
    /// the whole duration of this call, so that if this future is
    /// dropped before returning — whether because an ancestor acquire
    /// failed, the target acquire failed, or the caller itself was
    /// cancelled mid-suspension — every prefix lock already granted is
    /// released instead of leaking a phantom holder forever.
    pub async fn lock(
        &self,
        tree: &Tree,
        path: &Path,
        mode: LockMode,
    ) -> Result<LockHandle, NamingError> {
        let (ancestors, target) = tree.lock_chain(path)?;

        let mut prefix_guard = PrefixGuard::new(ancestors.len());
        for ancestor in ancestors {
            let ticket = ancestor.acquire(LockMode::Shared).await?;
            prefix_guard.push(ancestor, ticket);
        }

        let target_ticket = target.acquire(mode).await?;
        let prefix = prefix_guard.take();
        Ok(LockHandle { path: path.clone(), mode, target, target_ticket, prefix })
    }

    /// Releases a previously granted lock, leaf-to-root: the target
    /// first, then each ancestor's prefix Shared lock.
    pub fn unlock(&self, handle: LockHandle) {
        handle.target.release(handle.target_ticket);
        for (node, ticket) in handle.prefix.into_iter().rev() {
            node.release(ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn node() -> Arc<LockNode> {
        LockNode::new()
    }

    #[tokio::test]
    async fn shared_locks_are_compatible() {
        let n = node();
        let a = n.acquire(LockMode::Shared).await.unwrap();
        let b = n.acquire(LockMode::Shared).await.unwrap();
        assert_ne!(a, b);
        n.release(a);
        n.release(b);
    }

    #[tokio::test]
    async fn exclusive_excludes_shared() {
        let n = node();
        let excl = n.acquire(LockMode::Exclusive).await.unwrap();

        let n2 = n.clone();
        let blocked = tokio::spawn(async move { n2.acquire(LockMode::Shared).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        n.release(excl);
        let ticket = blocked.await.unwrap().unwrap();
        n.release(ticket);
    }

    #[tokio::test]
    async fn fairness_queue_scenario_s1() {
        let n = node();
        let a = n.acquire(LockMode::Shared).await.unwrap();
        let b = n.acquire(LockMode::Shared).await.unwrap();

        let n_c = n.clone();
        let c = tokio::spawn(async move { n_c.acquire(LockMode::Exclusive).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut dk = Vec::new();
        for _ in 0..8 {
            let n_d = n.clone();
            dk.push(tokio::spawn(async move { n_d.acquire(LockMode::Shared).await.unwrap() }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let n_l = n.clone();
        let l = tokio::spawn(async move { n_l.acquire(LockMode::Exclusive).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut mn = Vec::new();
        for _ in 0..2 {
            let n_m = n.clone();
            mn.push(tokio::spawn(async move { n_m.acquire(LockMode::Shared).await.unwrap() }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A, B release: only C should acquire.
        n.release(a);
        n.release(b);
        let c_ticket = c.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        for h in &dk {
            assert!(!h.is_finished());
        }
        assert!(!l.is_finished());

        // C releases: D..K acquire together.
        n.release(c_ticket);
        let mut dk_tickets = Vec::new();
        for h in dk {
            dk_tickets.push(h.await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!l.is_finished());

        // D..K release: L acquires alone.
        for t in dk_tickets {
            n.release(t);
        }
        let l_ticket = l.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        for h in &mn {
            assert!(!h.is_finished());
        }

        // L releases: M, N acquire together.
        n.release(l_ticket);
        for h in mn {
            let t = h.await.unwrap();
            n.release(t);
        }
    }

    #[tokio::test]
    async fn unlock_wakes_correct_set_scenario_s6() {
        let n = node();
        let excl0 = n.acquire(LockMode::Exclusive).await.unwrap();

        let n_x = n.clone();
        let x = tokio::spawn(async move { n_x.acquire(LockMode::Shared).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let n_y = n.clone();
        let y = tokio::spawn(async move { n_y.acquire(LockMode::Exclusive).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let n_z = n.clone();
        let z = tokio::spawn(async move { n_z.acquire(LockMode::Shared).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(10)).await;

        n.release(excl0);
        let x_ticket = x.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!y.is_finished());
        assert!(!z.is_finished());

        n.release(x_ticket);
        let y_ticket = y.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!z.is_finished());

        n.release(y_ticket);
        let z_ticket = z.await.unwrap();
        n.release(z_ticket);
    }

    #[tokio::test]
    async fn tombstoned_node_fails_queued_waiters() {
        let n = node();
        let excl = n.acquire(LockMode::Exclusive).await.unwrap();

        let n2 = n.clone();
        let blocked = tokio::spawn(async move { n2.acquire(LockMode::Shared).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        n.tombstone();
        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(NamingError::FileNotFound)));
        n.release(excl);
    }

    #[tokio::test]
    async fn dropping_a_queued_waiter_does_not_block_the_next_one() {
        let n = node();
        let excl = n.acquire(LockMode::Exclusive).await.unwrap();

        let n_cancelled = n.clone();
        let cancelled = tokio::spawn(async move { n_cancelled.acquire(LockMode::Exclusive).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancelled.abort();
        let _ = cancelled.await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let n_next = n.clone();
        let next = tokio::spawn(async move { n_next.acquire(LockMode::Exclusive).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!next.is_finished());

        n.release(excl);
        let next_ticket = next.await.unwrap();
        n.release(next_ticket);
    }

    #[tokio::test]
    async fn cancelling_a_blocked_target_acquire_releases_granted_prefix_locks() {
        use crate::path::decode;

        let tree = Arc::new(Tree::new());
        tree.create_directory(&decode("/a").unwrap()).unwrap();
        tree.create_directory(&decode("/a/b").unwrap()).unwrap();
        tree.create_directory(&decode("/a/b/c").unwrap()).unwrap();

        let manager = Arc::new(LockManager::new());
        let c_path = decode("/a/b/c").unwrap();

        // Hold the target exclusively so the second acquire below is
        // granted its ancestor prefix locks but then blocks on `c`.
        let blocker = manager.lock(&tree, &c_path, LockMode::Exclusive).await.unwrap();

        let tree2 = tree.clone();
        let manager2 = manager.clone();
        let c_path2 = c_path.clone();
        let cancelled =
            tokio::spawn(async move { manager2.lock(&tree2, &c_path2, LockMode::Exclusive).await });

        // Give the spawned task time to be granted its Shared prefix
        // locks on `/` and `/a/b` and start waiting on the contended `c`.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancelled.abort();
        let _ = cancelled.await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.unlock(blocker);

        // If the cancelled acquire's prefix locks leaked, this would
        // block forever; bound it so a regression fails instead of hangs.
        let ab_path = decode("/a/b").unwrap();
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            manager.lock(&tree, &ab_path, LockMode::Exclusive),
        )
        .await;
        let handle = result
            .expect("prefix locks granted to the cancelled acquire must have been released")
            .unwrap();
        manager.unlock(handle);
    }
}
