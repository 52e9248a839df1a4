use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Instant};

/// Bookkeeping for the fixed set of pre-provisioned isolate boxes.
///
/// The pool never talks to the isolation tool itself; it only hands out
/// box ids in `[0, capacity)` and guarantees each id is held by at most
/// one runner at a time. Box provisioning lives in [`crate::sandbox`].
pub struct SlotPool {
    in_use: Mutex<Vec<bool>>,
    notify: Notify,
}

impl SlotPool {
    pub fn new(capacity: u32) -> Arc<Self> {
        Arc::new(Self {
            in_use: Mutex::new(vec![false; capacity as usize]),
            notify: Notify::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.in_use.lock().unwrap().len()
    }

    /// Snapshot of the free count, used only as a scheduling hint.
    pub fn available(&self) -> usize {
        self.in_use.lock().unwrap().iter().filter(|used| !**used).count()
    }

    /// Reserves any free slot, waiting up to `timeout` for one to be
    /// released. Returns `None` on expiry without side effect. No
    /// fairness among waiters.
    pub async fn reserve(self: &Arc<Self>, timeout: Duration) -> Option<SlotGuard> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(box_id) = self.try_reserve() {
                return Some(SlotGuard {
                    pool: Arc::clone(self),
                    box_id,
                });
            }
            if time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    fn try_reserve(&self) -> Option<u32> {
        let mut in_use = self.in_use.lock().unwrap();
        let free = in_use.iter().position(|used| !used)?;
        in_use[free] = true;
        Some(free as u32)
    }

    fn release(&self, box_id: u32) {
        let mut in_use = self.in_use.lock().unwrap();
        debug_assert!(in_use[box_id as usize], "double release of slot {box_id}");
        in_use[box_id as usize] = false;
        self.notify.notify_one();
    }
}

/// A reserved slot. Dropping the guard returns the slot to the pool, so
/// every exit path of a runner releases exactly once.
pub struct SlotGuard {
    pool: Arc<SlotPool>,
    box_id: u32,
}

impl SlotGuard {
    pub fn box_id(&self) -> u32 {
        self.box_id
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release(self.box_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_and_release_cycle() {
        let pool = SlotPool::new(2);
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.available(), 2);

        let first = pool.reserve(Duration::from_millis(10)).await.unwrap();
        let second = pool.reserve(Duration::from_millis(10)).await.unwrap();
        assert_ne!(first.box_id(), second.box_id());
        assert_eq!(pool.available(), 0);

        drop(first);
        assert_eq!(pool.available(), 1);
        drop(second);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn reserve_times_out_when_exhausted() {
        let pool = SlotPool::new(1);
        let held = pool.reserve(Duration::from_millis(10)).await.unwrap();

        assert!(pool.reserve(Duration::from_millis(50)).await.is_none());
        // expiry leaves the pool untouched
        assert_eq!(pool.available(), 0);

        drop(held);
        assert!(pool.reserve(Duration::from_millis(10)).await.is_some());
    }

    #[tokio::test]
    async fn release_wakes_a_waiting_reserver() {
        let pool = SlotPool::new(1);
        let held = pool.reserve(Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.reserve(Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let guard = waiter.await.unwrap();
        assert!(guard.is_some());
    }

    #[tokio::test]
    async fn guard_releases_even_when_the_holder_panics() {
        let pool = SlotPool::new(1);

        let holder = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let _guard = pool.reserve(Duration::from_millis(10)).await.unwrap();
                panic!("runner died");
            })
        };
        assert!(holder.await.is_err());

        assert_eq!(pool.available(), 1);
    }
}
