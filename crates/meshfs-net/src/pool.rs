//! Fixed-size pool of connection slots.
//!
//! Each slot carries a Diffie-Hellman keypair generated while the slot sits
//! idle, so a new handshake never waits on key generation. Acquisition never
//! blocks: a saturated pool returns `None` and the caller must close the
//! incoming socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use meshfs_crypto::DhKeyPair;

use crate::connection::ConnectionHandle;
use crate::messages::Message;

/// Lifecycle of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// In the pool, ready for use.
    Idle,
    /// Running the handshake.
    Handshaking,
    /// Listen, shout and worker tasks running.
    Active,
    /// Waiting for the three tasks to stop.
    Draining,
}

struct Slot {
    state: ConnectionState,
    dh: Option<DhKeyPair>,
    handle: Option<ConnectionHandle>,
}

/// Bounded set of reusable connection slots.
pub struct ConnectionPool {
    slots: Vec<Mutex<Slot>>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Create a pool of `size` slots, precomputing a keypair for each.
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: (0..size)
                .map(|_| {
                    Mutex::new(Slot {
                        state: ConnectionState::Idle,
                        dh: Some(DhKeyPair::generate()),
                        handle: None,
                    })
                })
                .collect(),
            next_id: AtomicU64::new(1),
        })
    }

    fn slot(&self, index: usize) -> MutexGuard<'_, Slot> {
        self.slots[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim an idle slot, or `None` if every slot is busy.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        for index in 0..self.slots.len() {
            let mut slot = self.slot(index);
            if slot.state == ConnectionState::Idle {
                slot.state = ConnectionState::Handshaking;
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                return Some(SlotGuard {
                    pool: Arc::clone(self),
                    index,
                    id,
                });
            }
        }
        None
    }

    /// Total slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots not currently in use.
    pub fn idle_count(&self) -> usize {
        self.states()
            .into_iter()
            .filter(|s| *s == ConnectionState::Idle)
            .count()
    }

    /// State of every slot.
    pub fn states(&self) -> Vec<ConnectionState> {
        (0..self.slots.len()).map(|i| self.slot(i).state).collect()
    }

    /// Handles of every active connection.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        (0..self.slots.len())
            .filter_map(|i| {
                let slot = self.slot(i);
                match slot.state {
                    ConnectionState::Active => slot.handle.clone(),
                    _ => None,
                }
            })
            .collect()
    }

    /// Handles of active connections to authenticated peers.
    pub fn peer_handles(&self) -> Vec<ConnectionHandle> {
        self.handles()
            .into_iter()
            .filter(|h| !h.remote().is_local())
            .collect()
    }

    /// Queue `message` on every active peer connection.
    ///
    /// Returns how many connections accepted it.
    pub async fn broadcast(&self, message: &Message) -> usize {
        self.broadcast_except(message, None).await
    }

    /// Like [`broadcast`](Self::broadcast), skipping connection `except`.
    pub async fn broadcast_except(&self, message: &Message, except: Option<u64>) -> usize {
        let mut sent = 0;
        for handle in self.peer_handles() {
            if Some(handle.id()) == except {
                continue;
            }
            match handle.send(message.clone()).await {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!(conn = handle.id(), "broadcast skipped: {}", e),
            }
        }
        sent
    }

    /// Cancel every active connection.
    pub fn close_all(&self) {
        for handle in self.handles() {
            handle.close();
        }
    }
}

/// Exclusive use of one pool slot. Returns the slot on drop.
pub struct SlotGuard {
    pool: Arc<ConnectionPool>,
    index: usize,
    id: u64,
}

impl SlotGuard {
    /// Unique id of the connection using this slot.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Take the precomputed keypair.
    pub fn take_dh(&mut self) -> DhKeyPair {
        self.pool
            .slot(self.index)
            .dh
            .take()
            .unwrap_or_else(DhKeyPair::generate)
    }

    /// Move the slot to `state`.
    pub fn set_state(&self, state: ConnectionState) {
        self.pool.slot(self.index).state = state;
    }

    /// Make the connection visible to [`ConnectionPool::handles`].
    pub fn publish(&self, handle: ConnectionHandle) {
        let mut slot = self.pool.slot(self.index);
        slot.handle = Some(handle);
        slot.state = ConnectionState::Active;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // Session secrets go with the handle; the next session gets fresh keys.
        let fresh = DhKeyPair::generate();
        let mut slot = self.pool.slot(self.index);
        slot.handle = None;
        slot.dh = Some(fresh);
        slot.state = ConnectionState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = ConnectionPool::new(2);
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.idle_count(), 0);

        drop(a);
        assert_eq!(pool.idle_count(), 1);
        let c = pool.try_acquire().unwrap();
        assert!(c.id() > b.id());
    }

    #[test]
    fn test_keys_regenerated_on_release() {
        let pool = ConnectionPool::new(1);
        let mut guard = pool.try_acquire().unwrap();
        let first = guard.take_dh().public();
        drop(guard);

        let mut guard = pool.try_acquire().unwrap();
        let second = guard.take_dh().public();
        assert_ne!(first, second);
    }

    #[test]
    fn test_state_transitions() {
        let pool = ConnectionPool::new(1);
        let guard = pool.try_acquire().unwrap();
        assert_eq!(pool.states(), vec![ConnectionState::Handshaking]);
        guard.set_state(ConnectionState::Draining);
        assert_eq!(pool.states(), vec![ConnectionState::Draining]);
        drop(guard);
        assert_eq!(pool.states(), vec![ConnectionState::Idle]);
    }

    #[test]
    fn test_empty_pool_rejects() {
        let pool = ConnectionPool::new(0);
        assert!(pool.try_acquire().is_none());
    }
}
