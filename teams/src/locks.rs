//! Per-team mutation locks.
//!
//! Every per-team mutation (role binding, contract activation, conflict and
//! convergence transitions) runs under the team's lock. Cross-team operations
//! acquire locks in lexicographic team-id order so two multi-team callers can
//! never deadlock each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default, Clone)]
pub struct TeamLocks {
    locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl TeamLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, team_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(team_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the lock for one team.
    pub async fn lock(&self, team_id: &str) -> OwnedMutexGuard<()> {
        self.entry(team_id).lock_owned().await
    }

    /// Acquire several team locks in lexicographic id order.
    pub async fn lock_many(&self, team_ids: &[&str]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids: Vec<&str> = team_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock(id).await);
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_team_serializes() {
        let locks = TeamLocks::new();
        let guard = locks.lock("t1").await;
        let locks2 = locks.clone();
        let second = tokio::spawn(async move { locks2.lock("t1").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());
        drop(guard);
        second.await.unwrap();
    }

    #[tokio::test]
    async fn multi_team_order_is_lexicographic() {
        let locks = TeamLocks::new();
        // Opposite declaration orders must not deadlock.
        let a = locks.clone();
        let b = locks.clone();
        let first = tokio::spawn(async move {
            for _ in 0..50 {
                let _guards = a.lock_many(&["t2", "t1"]).await;
            }
        });
        let second = tokio::spawn(async move {
            for _ in 0..50 {
                let _guards = b.lock_many(&["t1", "t2"]).await;
            }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            first.await.unwrap();
            second.await.unwrap();
        })
        .await
        .expect("lock ordering deadlocked");
    }
}
