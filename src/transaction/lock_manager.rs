use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Result};
use log::warn;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::errors::{AbortReason, Error};
use crate::record::RowId;
use crate::transaction::{IsolationLevel, Transaction, TxnId, TxnState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    granted: Option<LockMode>,
}

/// Per-row wait queue. Requests keep FIFO arrival order; the grant state
/// is summarized by `sharing_count` / `is_writing` and waiters block on
/// the queue's condition variable under the manager's single mutex.
struct LockRequestQueue {
    requests: Vec<LockRequest>,
    cv: Arc<Condvar>,
    sharing_count: u32,
    is_writing: bool,
    is_upgrading: bool,
}

impl Default for LockRequestQueue {
    fn default() -> Self {
        LockRequestQueue {
            requests: vec![],
            cv: Arc::new(Condvar::new()),
            sharing_count: 0,
            is_writing: false,
            is_upgrading: false,
        }
    }
}

impl LockRequestQueue {
    fn request_mut(&mut self, txn_id: TxnId) -> Option<&mut LockRequest> {
        self.requests.iter_mut().find(|r| r.txn.id() == txn_id)
    }

    fn remove_request(&mut self, txn_id: TxnId) {
        self.requests.retain(|r| r.txn.id() != txn_id);
    }
}

type LockTable = HashMap<RowId, LockRequestQueue>;

/// Row-granularity strict two-phase locking with shared/exclusive/upgrade
/// modes and a background wait-for-graph deadlock detector that aborts the
/// youngest transaction of every cycle.
pub struct LockManager {
    lock_table: Mutex<LockTable>,
    cycle_detection_interval: Duration,
    detection_enabled: Arc<AtomicBool>,
}

impl LockManager {
    pub fn new(cycle_detection_interval: Duration) -> Self {
        LockManager {
            lock_table: Mutex::new(HashMap::new()),
            cycle_detection_interval,
            detection_enabled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Blocks until no exclusive lock is held on the row. Rejected under
    /// ReadUncommitted and for shrinking transactions, both of which abort
    /// the caller.
    pub fn lock_shared(&self, txn: &Arc<Transaction>, rid: RowId) -> Result<()> {
        if txn.isolation() == IsolationLevel::ReadUncommitted {
            txn.set_state(TxnState::Aborted);
            bail!(Error::TxnAborted(
                txn.id(),
                AbortReason::LockSharedOnReadUncommitted
            ));
        }

        let mut table = self.lock_table.lock();
        Self::lock_prepare(txn)?;
        let queue = table.entry(rid).or_default();
        queue.requests.push(LockRequest {
            txn: txn.clone(),
            mode: LockMode::Shared,
            granted: None,
        });
        let cv = queue.cv.clone();

        loop {
            let queue = table.get_mut(&rid).unwrap();
            Self::check_abort(txn, queue)?;
            if !queue.is_writing {
                break;
            }
            cv.wait(&mut table);
        }

        let queue = table.get_mut(&rid).unwrap();
        queue.sharing_count += 1;
        queue.request_mut(txn.id()).unwrap().granted = Some(LockMode::Shared);
        txn.add_shared_lock(rid);
        Ok(())
    }

    /// Blocks until the row has neither readers nor a writer.
    pub fn lock_exclusive(&self, txn: &Arc<Transaction>, rid: RowId) -> Result<()> {
        let mut table = self.lock_table.lock();
        Self::lock_prepare(txn)?;
        let queue = table.entry(rid).or_default();
        queue.requests.push(LockRequest {
            txn: txn.clone(),
            mode: LockMode::Exclusive,
            granted: None,
        });
        let cv = queue.cv.clone();

        loop {
            let queue = table.get_mut(&rid).unwrap();
            Self::check_abort(txn, queue)?;
            if !queue.is_writing && queue.sharing_count == 0 {
                break;
            }
            cv.wait(&mut table);
        }

        let queue = table.get_mut(&rid).unwrap();
        queue.is_writing = true;
        queue.request_mut(txn.id()).unwrap().granted = Some(LockMode::Exclusive);
        txn.add_exclusive_lock(rid);
        Ok(())
    }

    /// Promote an already-granted shared lock to exclusive. Only one
    /// upgrade may be pending per row; a second one aborts with
    /// `UpgradeConflict`.
    pub fn lock_upgrade(&self, txn: &Arc<Transaction>, rid: RowId) -> Result<()> {
        let mut table = self.lock_table.lock();
        Self::lock_prepare(txn)?;
        let queue = table.get_mut(&rid).expect("upgrade without a shared lock");
        if queue.is_upgrading {
            txn.set_state(TxnState::Aborted);
            bail!(Error::TxnAborted(txn.id(), AbortReason::UpgradeConflict));
        }

        let request = queue
            .request_mut(txn.id())
            .expect("upgrade without a queued request");
        if request.granted == Some(LockMode::Exclusive) {
            return Ok(());
        }
        request.mode = LockMode::Exclusive;
        let cv = queue.cv.clone();

        loop {
            let queue = table.get_mut(&rid).unwrap();
            if txn.state() == TxnState::Aborted {
                // unlike a plain waiter, an upgrader still owns its shared
                // grant; give it back or sharing_count stays inflated
                queue.sharing_count -= 1;
                queue.is_upgrading = false;
                queue.remove_request(txn.id());
                queue.cv.notify_all();
                txn.remove_shared_lock(rid);
                bail!(Error::TxnAborted(txn.id(), AbortReason::Deadlock));
            }
            if !queue.is_writing && queue.sharing_count == 1 {
                break;
            }
            queue.is_upgrading = true;
            cv.wait(&mut table);
        }

        let queue = table.get_mut(&rid).unwrap();
        queue.sharing_count -= 1;
        queue.is_upgrading = false;
        queue.is_writing = true;
        queue.request_mut(txn.id()).unwrap().granted = Some(LockMode::Exclusive);
        txn.remove_shared_lock(rid);
        txn.add_exclusive_lock(rid);
        Ok(())
    }

    /// Release whatever this transaction holds on the row and wake the
    /// queue. The first unlock moves a growing transaction to shrinking.
    pub fn unlock(&self, txn: &Transaction, rid: RowId) -> bool {
        let mut table = self.lock_table.lock();
        let Some(queue) = table.get_mut(&rid) else {
            return false;
        };
        let Some(position) = queue.requests.iter().position(|r| r.txn.id() == txn.id()) else {
            return false;
        };
        let granted = queue.requests.remove(position).granted;

        match granted {
            Some(LockMode::Shared) => {
                queue.sharing_count -= 1;
                queue.cv.notify_all();
                txn.remove_shared_lock(rid);
            }
            Some(LockMode::Exclusive) => {
                queue.is_writing = false;
                queue.cv.notify_all();
                txn.remove_exclusive_lock(rid);
            }
            None => {}
        }

        if txn.state() == TxnState::Growing {
            txn.set_state(TxnState::Shrinking);
        }
        true
    }

    fn lock_prepare(txn: &Arc<Transaction>) -> Result<()> {
        if txn.state() == TxnState::Shrinking {
            txn.set_state(TxnState::Aborted);
            bail!(Error::TxnAborted(txn.id(), AbortReason::LockOnShrinking));
        }
        Ok(())
    }

    /// A waiter that was picked as a deadlock victim removes its own queue
    /// entry and surfaces the abort.
    fn check_abort(txn: &Arc<Transaction>, queue: &mut LockRequestQueue) -> Result<()> {
        if txn.state() == TxnState::Aborted {
            queue.remove_request(txn.id());
            bail!(Error::TxnAborted(txn.id(), AbortReason::Deadlock));
        }
        Ok(())
    }

    /// Spawn the detector thread. Every iteration rebuilds the wait-for
    /// graph from scratch, aborts victims until the graph is acyclic and
    /// then sleeps for the detection interval.
    pub fn start_deadlock_detection(self: &Arc<Self>) -> JoinHandle<()> {
        self.detection_enabled.store(true, Ordering::SeqCst);
        let manager = Arc::clone(self);
        std::thread::spawn(move || {
            while manager.detection_enabled.load(Ordering::SeqCst) {
                manager.run_detection_pass();
                std::thread::sleep(manager.cycle_detection_interval);
            }
        })
    }

    pub fn stop_deadlock_detection(&self) {
        self.detection_enabled.store(false, Ordering::SeqCst);
    }

    /// One full detection round: abort the youngest transaction of every
    /// cycle until none remain. Returns the victims, oldest pass first.
    pub fn run_detection_pass(&self) -> Vec<TxnId> {
        let mut table = self.lock_table.lock();
        let mut victims = vec![];

        loop {
            let (edges, txns) = Self::build_wait_for_graph(&table);
            let Some(victim) = Self::find_cycle_victim(&edges) else {
                break;
            };
            warn!("deadlock detected, aborting youngest txn {victim}");
            txns[&victim].set_state(TxnState::Aborted);
            victims.push(victim);
            Self::notify_queues_of(&mut table, victim);
        }
        victims
    }

    /// Edge `u -> v` when `u` waits on a row where `v` holds an
    /// incompatible grant. Aborted waiters no longer wait for anyone.
    fn build_wait_for_graph(
        table: &MutexGuard<'_, LockTable>,
    ) -> (BTreeMap<TxnId, BTreeSet<TxnId>>, HashMap<TxnId, Arc<Transaction>>) {
        let mut edges: BTreeMap<TxnId, BTreeSet<TxnId>> = BTreeMap::new();
        let mut txns = HashMap::new();

        for queue in table.values() {
            for request in &queue.requests {
                txns.insert(request.txn.id(), request.txn.clone());
            }
            for waiting in &queue.requests {
                if waiting.txn.state() == TxnState::Aborted {
                    continue;
                }
                // a pending upgrade keeps its shared grant but waits for
                // every other holder, exactly like a writer
                let upgrading = waiting.mode == LockMode::Exclusive
                    && waiting.granted == Some(LockMode::Shared);
                if waiting.granted.is_some() && !upgrading {
                    continue;
                }
                for holder in &queue.requests {
                    if holder.txn.id() == waiting.txn.id() {
                        continue;
                    }
                    let incompatible = match waiting.mode {
                        LockMode::Shared => holder.granted == Some(LockMode::Exclusive),
                        LockMode::Exclusive => holder.granted.is_some(),
                    };
                    if incompatible {
                        edges
                            .entry(waiting.txn.id())
                            .or_default()
                            .insert(holder.txn.id());
                    }
                }
            }
        }
        (edges, txns)
    }

    /// Deterministic DFS in ascending txn order; on a cycle, the victim is
    /// its youngest (largest-id) member.
    fn find_cycle_victim(edges: &BTreeMap<TxnId, BTreeSet<TxnId>>) -> Option<TxnId> {
        let mut done = HashSet::new();
        for &start in edges.keys() {
            let mut path = vec![];
            let mut on_path = HashSet::new();
            if let Some(revisited) = Self::dfs(start, edges, &mut path, &mut on_path, &mut done) {
                let cycle_start = path.iter().position(|&t| t == revisited).unwrap();
                return path[cycle_start..].iter().copied().max();
            }
        }
        None
    }

    fn dfs(
        node: TxnId,
        edges: &BTreeMap<TxnId, BTreeSet<TxnId>>,
        path: &mut Vec<TxnId>,
        on_path: &mut HashSet<TxnId>,
        done: &mut HashSet<TxnId>,
    ) -> Option<TxnId> {
        if on_path.contains(&node) {
            return Some(node);
        }
        if done.contains(&node) {
            return None;
        }
        on_path.insert(node);
        path.push(node);
        if let Some(neighbors) = edges.get(&node) {
            for &next in neighbors {
                if let Some(revisited) = Self::dfs(next, edges, path, on_path, done) {
                    return Some(revisited);
                }
            }
        }
        path.pop();
        on_path.remove(&node);
        done.insert(node);
        None
    }

    fn notify_queues_of(table: &mut MutexGuard<'_, LockTable>, txn_id: TxnId) {
        for queue in table.values() {
            if queue.requests.iter().any(|r| r.txn.id() == txn_id) {
                queue.cv.notify_all();
            }
        }
    }
}
