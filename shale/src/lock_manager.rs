//! Page-level locks for strict two-phase locking.
//!
//! The recovery core depends only on the guarantee that conflicting
//! writers are serialized; locks are held to transaction end and released
//! in one call as part of commit or abort completion.
//!
//! Each page carries two collections: the transactions currently holding
//! the lock (keyed by id, so re-entry and upgrades are map lookups) and a
//! queue of waiters. Grants happen at release time: the queue head is
//! admitted while compatible, shared waiters batching together, and a
//! pending Shared→Exclusive upgrade is admitted ahead of the queue as
//! soon as its holder is alone. Deadlocks are found by deriving the
//! waits-for edges from the lock table on demand and walking them
//! iteratively from the requesting transaction.

use crate::{PageId, TxnId};
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
pub enum LockError {
    Deadlock,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    txn_id: TxnId,
    mode: LockMode,
    /// The waiter already holds Shared and wants Exclusive; it keeps its
    /// holder entry while queued.
    upgrade: bool,
}

/// Lock state for one page.
#[derive(Debug, Default)]
struct PageLock {
    holders: HashMap<TxnId, LockMode>,
    queue: Vec<Waiter>,
}

impl PageLock {
    fn unused(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }

    /// Whether the waiter could be granted against the current holders.
    fn admissible(&self, waiter: &Waiter) -> bool {
        match waiter.mode {
            LockMode::Shared => self.holders.values().all(|m| *m == LockMode::Shared),
            LockMode::Exclusive if waiter.upgrade => {
                self.holders.len() == 1 && self.holders.contains_key(&waiter.txn_id)
            }
            LockMode::Exclusive => self.holders.is_empty(),
        }
    }

    /// `txn_id` holds the lock strongly enough for `mode`.
    fn satisfies(&self, txn_id: TxnId, mode: LockMode) -> bool {
        match self.holders.get(&txn_id) {
            Some(LockMode::Exclusive) => true,
            Some(LockMode::Shared) => mode == LockMode::Shared,
            None => false,
        }
    }

    /// Admits whatever the holder set now allows. An admissible upgrade
    /// wins over the queue head; otherwise strict arrival order, with
    /// consecutive shared waiters admitted as a batch.
    fn admit_ready(&mut self) {
        loop {
            let pos = match self.queue.iter().position(|w| w.upgrade) {
                Some(up) if self.admissible(&self.queue[up]) => up,
                _ if !self.queue.is_empty() && self.admissible(&self.queue[0]) => 0,
                _ => return,
            };
            let granted = self.queue.remove(pos);
            self.holders.insert(granted.txn_id, granted.mode);
        }
    }
}

/// The lock manager: one `PageLock` per contended page behind a single
/// table mutex, and a condvar waiters park on.
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<HashMap<PageId, PageLock>>,
    ready: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `mode` on `page_id` for `txn_id`, blocking while
    /// incompatible locks are held. Re-acquiring a held mode is a no-op;
    /// a Shared holder asking for Exclusive waits until it is alone.
    pub fn acquire(
        &self,
        txn_id: TxnId,
        page_id: PageId,
        mode: LockMode,
    ) -> Result<(), LockError> {
        let mut table = self.table.lock().unwrap();

        {
            let lock = table.entry(page_id).or_default();
            if lock.satisfies(txn_id, mode) {
                return Ok(());
            }
            let me = Waiter {
                txn_id,
                mode,
                upgrade: lock.holders.contains_key(&txn_id),
            };
            // Grant on the spot when nothing conflicts; a non-upgrade
            // request still queues behind earlier waiters.
            if lock.admissible(&me) && (me.upgrade || lock.queue.is_empty()) {
                lock.holders.insert(txn_id, mode);
                return Ok(());
            }
            lock.queue.push(me);
        }

        loop {
            if waits_on_itself(&table, txn_id) {
                if let Some(lock) = table.get_mut(&page_id) {
                    lock.queue.retain(|w| w.txn_id != txn_id);
                    // A failed upgrade keeps its shared hold; release_all
                    // drops it when the transaction aborts.
                    lock.admit_ready();
                    if lock.unused() {
                        table.remove(&page_id);
                    }
                }
                self.ready.notify_all();
                return Err(LockError::Deadlock);
            }

            table = self.ready.wait(table).unwrap();

            let granted = table
                .get(&page_id)
                .is_some_and(|lock| lock.satisfies(txn_id, mode));
            if granted {
                return Ok(());
            }
        }
    }

    /// Releases every lock the transaction holds or waits for, admitting
    /// whoever that unblocks.
    pub fn release_all(&self, txn_id: TxnId) {
        let mut table = self.table.lock().unwrap();
        table.retain(|_, lock| {
            lock.holders.remove(&txn_id);
            lock.queue.retain(|w| w.txn_id != txn_id);
            lock.admit_ready();
            !lock.unused()
        });
        self.ready.notify_all();
    }
}

/// True when `start` sits on a waits-for cycle. Edges are derived from
/// the table as it stands: every waiter waits on each holder of its page
/// it cannot share with.
fn waits_on_itself(table: &HashMap<PageId, PageLock>, start: TxnId) -> bool {
    let mut edges: HashMap<TxnId, Vec<TxnId>> = HashMap::new();
    for lock in table.values() {
        for waiter in &lock.queue {
            for (&holder, &held_mode) in &lock.holders {
                if holder == waiter.txn_id {
                    continue;
                }
                let shares = waiter.mode == LockMode::Shared && held_mode == LockMode::Shared;
                if !shares {
                    edges.entry(waiter.txn_id).or_default().push(holder);
                }
            }
        }
    }

    let mut stack = vec![start];
    let mut seen = HashSet::new();
    while let Some(txn) = stack.pop() {
        let Some(next) = edges.get(&txn) else {
            continue;
        };
        for &blocker in next {
            if blocker == start {
                return true;
            }
            if seen.insert(blocker) {
                stack.push(blocker);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn page(n: u64) -> PageId {
        PageId::new(1, n)
    }

    #[test]
    fn shared_locks_coexist_and_reacquire_is_noop() {
        let lm = LockManager::new();
        lm.acquire(1, page(1), LockMode::Shared).unwrap();
        lm.acquire(2, page(1), LockMode::Shared).unwrap();
        lm.acquire(1, page(1), LockMode::Shared).unwrap();
        lm.release_all(1);
        lm.release_all(2);
    }

    #[test]
    fn exclusive_lock_blocks_second_writer_until_release() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(1, page(2), LockMode::Exclusive).unwrap();

        let lm2 = lm.clone();
        let waiter = std::thread::spawn(move || {
            lm2.acquire(2, page(2), LockMode::Exclusive).unwrap();
            lm2.release_all(2);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        lm.release_all(1);
        waiter.join().unwrap();
    }

    #[test]
    fn readers_queued_behind_a_writer_do_not_starve_it() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(1, page(6), LockMode::Shared).unwrap();

        let lm2 = lm.clone();
        let writer = std::thread::spawn(move || {
            lm2.acquire(2, page(6), LockMode::Exclusive).unwrap();
            lm2.release_all(2);
        });
        std::thread::sleep(Duration::from_millis(50));

        // A late reader must not slip past the queued writer.
        let lm3 = lm.clone();
        let reader = std::thread::spawn(move || {
            lm3.acquire(3, page(6), LockMode::Shared).unwrap();
            lm3.release_all(3);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());
        assert!(!reader.is_finished());

        lm.release_all(1);
        writer.join().unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn shared_to_exclusive_upgrade_waits_for_other_readers() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(1, page(3), LockMode::Shared).unwrap();
        lm.acquire(2, page(3), LockMode::Shared).unwrap();

        let lm2 = lm.clone();
        let upgrader = std::thread::spawn(move || {
            lm2.acquire(1, page(3), LockMode::Exclusive).unwrap();
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!upgrader.is_finished());
        lm.release_all(2);
        upgrader.join().unwrap();
        lm.release_all(1);
    }

    #[test]
    fn crossed_writers_detect_a_deadlock() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(1, page(4), LockMode::Exclusive).unwrap();
        lm.acquire(2, page(5), LockMode::Exclusive).unwrap();

        let lm2 = lm.clone();
        let crossing = std::thread::spawn(move || lm2.acquire(2, page(4), LockMode::Exclusive));

        std::thread::sleep(Duration::from_millis(50));
        // Txn 2 already waits for txn 1, so this request closes the cycle
        // and must abort.
        let mine = lm.acquire(1, page(5), LockMode::Exclusive);
        assert!(matches!(mine, Err(LockError::Deadlock)));

        lm.release_all(1);
        crossing.join().unwrap().unwrap();
        lm.release_all(2);
    }
}
