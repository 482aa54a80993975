//! Per-domain state
//!
//! A [`DomainContext`] belongs to its worker thread for the worker's whole
//! life. The [`DomainHandle`] inside it is the only part other components
//! may reach: the event-channel callback and watch fan-out post its wake
//! semaphore, and the engine raises its stop flag at teardown.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex,
};

use crate::{ring::RingIo, store::local_prefix};

/// Binary wake semaphore, the worker's single suspension point
///
/// A post while the worker is awake is remembered once, so a wake between
/// the worker's ring check and its wait is never lost.
struct WakeSem {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl WakeSem {
    fn new() -> Self {
        Self {
            signalled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn give(&self) {
        let mut signalled = self.signalled.lock().unwrap_or_else(|e| e.into_inner());
        *signalled = true;
        self.cond.notify_one();
    }

    fn take(&self) {
        let mut signalled = self.signalled.lock().unwrap_or_else(|e| e.into_inner());
        while !*signalled {
            signalled = self
                .cond
                .wait(signalled)
                .unwrap_or_else(|e| e.into_inner());
        }
        *signalled = false;
    }
}

/// Shared handle to a running domain, looked up by domid
pub struct DomainHandle {
    sem: WakeSem,
    stop: AtomicBool,
}

impl DomainHandle {
    /// Handle for a freshly connected domain, not yet stopping
    pub fn new() -> Self {
        Self {
            sem: WakeSem::new(),
            stop: AtomicBool::new(false),
        }
    }

    /// Post the wake semaphore
    ///
    /// Safe from event-channel context; it never blocks beyond the short
    /// semaphore lock.
    pub fn wake(&self) {
        self.sem.give();
    }

    /// Block until woken
    pub fn wait(&self) {
        self.sem.take();
    }

    /// Ask the worker to exit at the top of its next iteration
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether teardown has been requested
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Everything a worker owns for its domain
pub struct DomainContext {
    /// Domain id of the peer
    pub domid: u16,
    /// Server side of the shared ring
    pub ring: RingIo,
    /// Shared wake/stop handle, also registered in the engine's domain table
    pub handle: Arc<DomainHandle>,
    /// Monotone transaction counter, the source of transaction ids
    pub txn_counter: u32,
    /// Active transaction id; zero means none
    pub current_txn_id: u32,
    /// Request id of a TRANSACTION_END awaiting its deferred acknowledgement
    pub pending_txn_end: Option<u32>,
    /// Cached `/local/domain/<domid>/` prefix
    pub local_prefix: String,
}

impl DomainContext {
    /// Fresh context for a starting worker
    pub fn new(domid: u16, ring: RingIo, handle: Arc<DomainHandle>) -> Self {
        Self {
            domid,
            ring,
            handle,
            txn_counter: 0,
            current_txn_id: 0,
            pending_txn_end: None,
            local_prefix: local_prefix(domid),
        }
    }
}
