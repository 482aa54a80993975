//! Watch registry and pending-event fan-out
//!
//! Watches live in one global list keyed by `(path, token)`. Mutations scan
//! the list and enqueue pending events for every interested domain except
//! the mutating one; each domain's worker drains its own events and emits
//! the WATCH_EVENT replies itself, so all ring writes stay on the owning
//! worker.
//!
//! Lock nesting here is registry then queue, never the other way around.

use std::collections::VecDeque;

use log::{debug, warn};
use spin::Mutex;

use crate::domain::DomainContext;
use xs_wire::Kind;

/// One subscription, uniquely identified by `(key, token)` globally
#[derive(Debug)]
struct WatchEntry {
    key: String,
    token: Vec<u8>,
    domid: u16,
    relative: bool,
}

/// A mutation waiting to be reported to one domain
#[derive(Debug)]
struct PendingEvent {
    key: String,
    domid: u16,
}

/// The global watch registry and its pending-event queue
pub struct Watches {
    entries: Mutex<Vec<WatchEntry>>,
    pending: Mutex<VecDeque<PendingEvent>>,
}

impl Watches {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Register a watch, or refresh the path form of an existing one
    ///
    /// Re-registering an identical `(key, token)` pair only updates whether
    /// event paths are reported relative to the owner's domain prefix.
    pub fn register(&self, key: &str, token: &[u8], domid: u16, relative: bool) {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.key == key && e.token == token)
        {
            entry.relative = relative;
            return;
        }

        entries.push(WatchEntry {
            key: key.to_string(),
            token: token.to_vec(),
            domid,
            relative,
        });
    }

    /// Drop the `(key, token)` watch if the calling domain owns it
    pub fn unregister(&self, key: &str, token: &[u8], domid: u16) {
        let mut entries = self.entries.lock();
        if let Some(idx) = entries
            .iter()
            .position(|e| e.key == key && e.token == token && e.domid == domid)
        {
            entries.remove(idx);
        }
    }

    /// Drop every watch globally
    pub fn reset(&self) {
        self.entries.lock().clear();
    }

    /// Fan a mutation at `path` out to every interested domain
    ///
    /// An entry is interested when its key is a byte prefix of `path` and it
    /// is not owned by the mutating domain. `wake` is called once per
    /// enqueued event with the target domid.
    pub fn notify(&self, path: &str, caller_domid: u16, wake: impl Fn(u16)) {
        let entries = self.entries.lock();
        for entry in entries.iter() {
            if entry.domid == caller_domid || !path.as_bytes().starts_with(entry.key.as_bytes()) {
                continue;
            }

            self.pending.lock().push_back(PendingEvent {
                key: path.to_string(),
                domid: entry.domid,
            });
            wake(entry.domid);
        }
    }

    /// Queue the synthetic event a WATCH on an existing path owes its caller
    pub fn enqueue_existing(&self, path: &str, domid: u16) {
        self.pending.lock().push_back(PendingEvent {
            key: path.to_string(),
            domid,
        });
    }

    /// Drain this domain's pending events, emitting one WATCH_EVENT per
    /// owned matching watch per event
    pub fn drain_and_fire(&self, ctx: &DomainContext) {
        let entries = self.entries.lock();
        let mut pending = self.pending.lock();

        pending.retain(|event| {
            if event.domid != ctx.domid {
                return true;
            }

            for entry in entries
                .iter()
                .filter(|e| e.domid == ctx.domid)
                .filter(|e| event.key.as_bytes().starts_with(e.key.as_bytes()))
            {
                let reported = reported_path(&event.key, entry.relative, &ctx.local_prefix);
                let payload = event_payload(reported, &entry.token);
                ctx.ring.send_reply(0, Kind::WatchEvent, &payload);
            }

            false
        });
    }

    /// Number of registered watches
    pub fn watch_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Number of queued, undelivered events
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Forget everything owned by or targeted at a stopping domain
    pub fn purge_domain(&self, domid: u16) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.domid != domid);
        if entries.len() != before {
            debug!("domid#{}: dropped {} watches", domid, before - entries.len());
        }
        drop(entries);

        self.pending.lock().retain(|e| e.domid != domid);
    }
}

impl Default for Watches {
    fn default() -> Self {
        Self::new()
    }
}

/// The path a watch reports for an event, with the owner's local prefix
/// stripped when the watch was registered in relative form
fn reported_path<'a>(key: &'a str, relative: bool, local_prefix: &str) -> &'a str {
    if !relative {
        return key;
    }

    match key.strip_prefix(local_prefix) {
        Some(stripped) => stripped,
        None => {
            // relative watches only ever match keys under the owner's prefix
            warn!("event path {:?} escapes prefix {:?}", key, local_prefix);
            key
        }
    }
}

/// `<path>\0<token>\0`, the WATCH_EVENT payload
fn event_payload(reported: &str, token: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(reported.len() + token.len() + 2);
    payload.extend_from_slice(reported.as_bytes());
    payload.push(0);
    payload.extend_from_slice(token);
    payload.push(0);
    payload
}
