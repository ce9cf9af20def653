//! Per-session mutual exclusion
//!
//! One async mutex per session id. Waiters are served in FIFO order
//! (tokio's mutex is fair), so work for a session runs in arrival order.
//! An entry lives only while someone holds or waits on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::SessionId;

type LockMap = HashMap<SessionId, Arc<Mutex<()>>>;

#[derive(Default)]
pub struct SessionLocks {
    locks: Arc<StdMutex<LockMap>>,
}

/// Exclusive access to one session. Dropping it releases the lock and
/// removes the map entry once no other caller is waiting.
pub struct SessionGuard {
    guard: Option<OwnedMutexGuard<()>>,
    session_id: SessionId,
    locks: Arc<StdMutex<LockMap>>,
}

fn lock_map(locks: &StdMutex<LockMap>) -> StdMutexGuard<'_, LockMap> {
    // The map is only touched in short sync sections, a poisoned map is still consistent.
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `session_id`. Other sessions are unaffected.
    pub async fn acquire(&self, session_id: &SessionId) -> SessionGuard {
        let lock = lock_map(&self.locks)
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        SessionGuard {
            guard: Some(lock.lock_owned().await),
            session_id: session_id.clone(),
            locks: self.locks.clone(),
        }
    }

    /// Sessions currently holding or waiting on a lock.
    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = lock_map(&self.locks);
        // Only the map still references the mutex: nobody holds or waits on it.
        if locks
            .get(&self.session_id)
            .map(|lock| Arc::strong_count(lock) == 1)
            .unwrap_or(false)
        {
            locks.remove(&self.session_id);
        }
    }
}
