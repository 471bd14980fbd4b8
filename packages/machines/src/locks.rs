// ABOUTME: Per-machine leases serializing lifecycle transitions on the same id
// ABOUTME: Different machines never contend with each other

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Clone, Default)]
pub struct MachineLocks {
    locks: LockMap,
}

/// Exclusive access to one machine until dropped.
///
/// Dropping the last lease for an id with no waiters removes its map entry.
pub struct MachineLease {
    guard: Option<OwnedMutexGuard<()>>,
    machine_id: String,
    locks: LockMap,
}

impl Drop for MachineLease {
    fn drop(&mut self) {
        // Release first so the map's Arc is the only one left when idle
        drop(self.guard.take());

        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let idle = locks
            .get(&self.machine_id)
            .map(|lock| Arc::strong_count(lock) == 1)
            .unwrap_or(false);
        if idle {
            locks.remove(&self.machine_id);
        }
    }
}

impl MachineLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one machine. Held until the lease drops.
    pub async fn acquire(&self, machine_id: &str) -> MachineLease {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(machine_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        MachineLease {
            guard: Some(lock.lock_owned().await),
            machine_id: machine_id.to_string(),
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn is_held(&self, machine_id: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .get(machine_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_machine_is_serialized() {
        let locks = MachineLocks::new();
        let lease = locks.acquire("m1").await;
        assert!(locks.is_held("m1"));

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _lease = locks.acquire("m1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(lease);
        waiter.await.unwrap();
        assert!(!locks.is_held("m1"));
    }

    #[tokio::test]
    async fn test_different_machines_do_not_contend() {
        let locks = MachineLocks::new();
        let _first = locks.acquire("m1").await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.acquire("m2")).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_idle_entries_are_dropped() {
        let locks = MachineLocks::new();
        for n in 0..50 {
            let _lease = locks.acquire(&format!("machine-{}", n)).await;
        }
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_entry_survives_while_someone_waits() {
        let locks = MachineLocks::new();
        let lease = locks.acquire("m1").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _lease = locks.acquire("m1").await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(lease);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(locks.tracked(), 1);

        waiter.await.unwrap();
        assert_eq!(locks.tracked(), 0);
    }
}
