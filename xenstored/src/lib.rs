//! In-guest XenStore service
//!
//! "The XenStore is a storage system shared between Xen guests. It is a
//! simple hierarchical storage system, maintained by Domain 0 and accessed
//! via a shared memory page and an event channel." - The Definitive Guide
//! to the Xen Hypervisor, Chapter 8
//!
//! This crate is the maintaining side: a single global tree served to peer
//! domains over their shared ring pages, with watch notifications fanned
//! out as subtrees change. One worker thread runs per connected domain;
//! the event-channel and page-mapping primitives underneath are supplied
//! through [`Platform`].

#![deny(missing_docs)]

mod dispatch;
mod domain;
mod ring;
mod store;
mod watch;
mod worker;

pub mod error;
pub mod platform;

pub use error::{Error, Result};
pub use platform::{EventCallback, Platform};
pub use xs_wire;

use std::{
    collections::BTreeMap,
    sync::{atomic::Ordering, Arc},
    thread::{self, JoinHandle},
};

use log::{debug, error};
use spin::Mutex;

use crate::{
    domain::{DomainContext, DomainHandle},
    ring::RingIo,
    store::Tree,
    watch::Watches,
};
use xs_wire::Interface;

/// Upper bound on concurrently connected domains
pub const DOM_MAX: usize = 32;

// the worker-slot bitmap must cover every domain
const _: () = assert!(DOM_MAX <= u32::BITS as usize);

/// Longest decimal rendering of an `i32`, terminating nul included
const INT32_MAX_STR_LEN: usize = 12;

/// Access a permission entry grants; recorded nowhere, enforcement is out
/// of scope
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Perm {
    None,
    Read,
    Write,
    Both,
}

/// Handle to one mapped ring page kept for teardown
struct RingPage(*mut Interface);

// The pointer only travels back to Platform::unmap_ring.
unsafe impl Send for RingPage {}

struct DomainSlot {
    handle: Arc<DomainHandle>,
    join: Option<JoinHandle<()>>,
    ring: RingPage,
    local_port: u32,
    slot: usize,
}

/// Domain-table entry: a domid is reserved while its connect sequence runs
/// unlocked, so the table lock itself stays short-held
enum DomainEntry {
    Connecting,
    Running(DomainSlot),
}

struct Inner {
    platform: Arc<dyn Platform>,
    tree: Mutex<Tree>,
    watches: Watches,
    slots: Mutex<u32>,
    domains: Mutex<BTreeMap<u16, DomainEntry>>,
}

/// The service engine: the global tree, the watch registry and the table of
/// running domain workers
///
/// Cloning is cheap and every clone works on the same store; workers carry
/// one for the fan-out paths.
#[derive(Clone)]
pub struct XenStored {
    inner: Arc<Inner>,
}

impl XenStored {
    /// A fresh engine with an empty store and no connected domains
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            inner: Arc::new(Inner {
                platform,
                tree: Mutex::new(Tree::new()),
                watches: Watches::new(),
                slots: Mutex::new(0),
                domains: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Connect a domain: map its ring, wire up its event channel and start
    /// its worker
    ///
    /// Fails if the domain is already connected or every worker slot is
    /// taken; partial setup is released in reverse order.
    pub fn start_domain(&self, domid: u16, remote_port: u32, pfn_offset: u64) -> Result<()> {
        let platform = &self.inner.platform;

        // reserve the domid under a short lock; the slow wiring below runs
        // unlocked so watch fan-out to running domains is never held up
        {
            let mut domains = self.inner.domains.lock();
            if domains.contains_key(&domid) {
                return Err(Error::AlreadyConnected(domid));
            }
            domains.insert(domid, DomainEntry::Connecting);
        }

        let ring = match platform.map_ring(domid, pfn_offset) {
            Ok(ring) => ring,
            Err(err) => {
                self.inner.domains.lock().remove(&domid);
                return Err(err);
            }
        };

        {
            let iface = unsafe { &*ring };
            iface
                .server_features
                .store(xs_wire::SERVER_FEATURE_RECONNECTION, Ordering::Relaxed);
            iface
                .connection
                .store(xs_wire::CONNECTED, Ordering::Release);
        }

        let handle = Arc::new(DomainHandle::new());

        let waker = handle.clone();
        let local_port =
            match platform.bind_event_channel(domid, remote_port, Arc::new(move || waker.wake())) {
                Ok(port) => port,
                Err(err) => {
                    error!("domid#{}: failed to bind event channel: {}", domid, err);
                    let _ = platform.unmap_ring(domid, ring);
                    self.inner.domains.lock().remove(&domid);
                    return Err(err);
                }
            };

        if let Err(err) = platform.publish_store_port(domid, remote_port) {
            error!(
                "domid#{}: failed to publish store event channel: {}",
                domid, err
            );
            platform.unbind_event_channel(local_port);
            let _ = platform.close_event_channel(local_port);
            let _ = platform.unmap_ring(domid, ring);
            self.inner.domains.lock().remove(&domid);
            return Err(err);
        }

        let slot = match self.claim_slot() {
            Ok(slot) => slot,
            Err(err) => {
                platform.unbind_event_channel(local_port);
                let _ = platform.close_event_channel(local_port);
                let _ = platform.unmap_ring(domid, ring);
                self.inner.domains.lock().remove(&domid);
                return Err(err);
            }
        };

        let ctx = DomainContext::new(
            domid,
            RingIo::new(ring, platform.clone(), local_port, domid),
            handle.clone(),
        );

        let engine = self.clone();
        let join = match thread::Builder::new()
            .name(format!("xenstored-dom{}", domid))
            .spawn(move || worker::run(&engine, ctx))
        {
            Ok(join) => join,
            Err(err) => {
                error!("domid#{}: failed to spawn worker: {}", domid, err);
                self.release_slot(slot);
                platform.unbind_event_channel(local_port);
                let _ = platform.close_event_channel(local_port);
                let _ = platform.unmap_ring(domid, ring);
                self.inner.domains.lock().remove(&domid);
                return Err(Error::Platform("worker spawn"));
            }
        };

        self.inner.domains.lock().insert(
            domid,
            DomainEntry::Running(DomainSlot {
                handle,
                join: Some(join),
                ring: RingPage(ring),
                local_port,
                slot,
            }),
        );

        debug!("domid#{}: store worker running", domid);
        Ok(())
    }

    /// Disconnect a domain: stop and join its worker, then release every
    /// resource the start claimed
    pub fn stop_domain(&self, domid: u16) -> Result<()> {
        let platform = &self.inner.platform;

        let mut dom = {
            let mut domains = self.inner.domains.lock();
            match domains.remove(&domid) {
                Some(DomainEntry::Running(dom)) => dom,
                Some(DomainEntry::Connecting) => {
                    // a connect in flight owns the entry; leave it reserved
                    domains.insert(domid, DomainEntry::Connecting);
                    return Err(Error::NotConnected(domid));
                }
                None => return Err(Error::NotConnected(domid)),
            }
        };

        debug!("destroy domain#{}", domid);
        dom.handle.request_stop();
        dom.handle.wake();

        if let Some(join) = dom.join.take() {
            if join.join().is_err() {
                // the worker died before its own purge could run
                self.inner.watches.purge_domain(domid);
            }
        }

        self.release_slot(dom.slot);
        platform.unbind_event_channel(dom.local_port);

        let mut result = Ok(());
        if let Err(err) = platform.close_event_channel(dom.local_port) {
            error!("unable to close event channel#{}: {}", dom.local_port, err);
            result = Err(err);
        }
        if let Err(err) = platform.unmap_ring(domid, dom.ring.0) {
            error!("failed to unmap domain#{} ring: {}", domid, err);
            result = Err(err);
        }

        result
    }

    /// Write a value, firing watchers as domain 0
    pub fn write(&self, path: &str, value: &str) -> Result<()> {
        if path.is_empty() {
            error!("invalid arguments: empty path");
            return Err(Error::Invalid);
        }

        self.inner.tree.lock().write(path, Some(value.as_bytes()));
        self.notify_watchers(path, 0);
        Ok(())
    }

    /// Read the value bytes at `path`
    ///
    /// A node that exists without a value reads as empty.
    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let tree = self.inner.tree.lock();
        let node = tree.lookup(path).ok_or(Error::NotFound)?;
        Ok(node.value().unwrap_or_default().to_vec())
    }

    /// Read and decode a decimal integer value
    pub fn read_integer(&self, path: &str) -> Result<i32> {
        let raw = self.read(path)?;
        if raw.len() > INT32_MAX_STR_LEN {
            return Err(Error::Invalid);
        }

        let text = core::str::from_utf8(&raw).map_err(|_| Error::Invalid)?;
        text.trim_end_matches('\0')
            .trim()
            .parse()
            .map_err(|_| Error::Invalid)
    }

    /// Remove a subtree, firing watchers as domain 0
    pub fn rm(&self, path: &str) -> Result<()> {
        self.inner.tree.lock().remove(path)?;
        self.notify_watchers(path, 0);
        Ok(())
    }

    /// Record a permission change; accepted and ignored
    pub fn set_perm(&self, _path: &str, _domid: u16, _perm: Perm) -> Result<()> {
        Ok(())
    }

    /// Watches currently registered across all domains
    pub fn active_watches(&self) -> usize {
        self.inner.watches.watch_count()
    }

    /// Watch events queued but not yet delivered
    pub fn pending_events(&self) -> usize {
        self.inner.watches.pending_count()
    }

    pub(crate) fn tree(&self) -> &Mutex<Tree> {
        &self.inner.tree
    }

    pub(crate) fn watches(&self) -> &Watches {
        &self.inner.watches
    }

    /// Enqueue events for every watch covering `path`, waking the targets
    pub(crate) fn notify_watchers(&self, path: &str, caller_domid: u16) {
        self.inner
            .watches
            .notify(path, caller_domid, |domid| self.wake_domain(domid));
    }

    fn wake_domain(&self, domid: u16) {
        if let Some(DomainEntry::Running(dom)) = self.inner.domains.lock().get(&domid) {
            dom.handle.wake();
        }
    }

    fn claim_slot(&self) -> Result<usize> {
        let mut used = self.inner.slots.lock();

        let idx = (!*used).trailing_zeros() as usize;
        if idx >= DOM_MAX {
            return Err(Error::SlotsExhausted);
        }

        *used |= 1 << idx;
        debug!("allocated worker slot {}", idx);
        Ok(idx)
    }

    fn release_slot(&self, idx: usize) {
        let mut used = self.inner.slots.lock();
        debug_assert!(*used & (1 << idx) != 0);
        *used &= !(1 << idx);
    }
}
