//! Server side of a domain's shared ring
//!
//! One [`RingIo`] exists per connected domain and is owned by its worker,
//! which is the sole consumer of the request direction and sole producer of
//! the reply direction within this process. The peer on the other side of
//! the page is untrusted; index arithmetic never assumes it behaves.

use core::{cmp, hint, sync::atomic::Ordering};
use std::{ptr::NonNull, sync::Arc};

use log::{error, warn};

use crate::{error::Error, platform::Platform};
use xs_wire::{copy_from_ring, copy_to_ring, mask_ring_idx, Header, Interface, Kind, RING_SIZE};

/// Exclusive server-side handle to one mapped ring page
pub struct RingIo {
    iface: NonNull<Interface>,
    platform: Arc<dyn Platform>,
    local_port: u32,
    domid: u16,
}

// Required because the raw interface pointer is not Send; safe because the
// mapping is exclusive to the owning worker for the worker's lifetime.
unsafe impl Send for RingIo {}

impl RingIo {
    /// Wrap a mapped ring page
    ///
    /// `ring` must stay mapped for as long as the handle lives and no other
    /// `RingIo` may refer to it.
    pub fn new(
        ring: *mut Interface,
        platform: Arc<dyn Platform>,
        local_port: u32,
        domid: u16,
    ) -> Self {
        Self {
            // a platform mapping is never null
            iface: NonNull::new(ring).expect("mapped ring page was null"),
            platform,
            local_port,
            domid,
        }
    }

    fn interface(&self) -> &Interface {
        unsafe { self.iface.as_ref() }
    }

    /// Signal the peer's event channel
    pub fn notify(&self) {
        self.platform.notify(self.local_port);
    }

    /// Whether any request bytes are waiting
    pub fn req_pending(&self) -> bool {
        let iface = self.interface();
        let prod = iface.req_prod.load(Ordering::Acquire);
        let cons = iface.req_cons.load(Ordering::Relaxed);
        prod != cons
    }

    /// Copy up to `buf.len()` request bytes, advancing the consumer index
    ///
    /// Returns the number of bytes copied; zero means the request ring was
    /// empty, in which case the peer is nudged so it produces more. Callers
    /// loop until the length they need is satisfied.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let iface = self.interface();
        let cons = iface.req_cons.load(Ordering::Relaxed);
        let prod = iface.req_prod.load(Ordering::Acquire);

        let avail = prod.wrapping_sub(cons) as usize;
        if avail == 0 {
            self.notify();
            return 0;
        }

        let count = cmp::min(avail, buf.len());
        unsafe {
            copy_from_ring(
                &iface.req,
                &mut buf[..count],
                mask_ring_idx(cons) as usize,
                count,
            )
        };
        iface
            .req_cons
            .store(cons.wrapping_add(count as u32), Ordering::Release);

        count
    }

    /// Copy `data` into the reply ring, advancing the producer index
    ///
    /// Spins while the peer has not yet drained enough space.
    pub fn write(&self, mut data: &[u8]) {
        let iface = self.interface();

        while !data.is_empty() {
            let prod = iface.rsp_prod.load(Ordering::Relaxed);
            let cons = iface.rsp_cons.load(Ordering::Acquire);

            // saturate so a peer scribbling on rsp_cons cannot underflow us
            let free = RING_SIZE.saturating_sub(prod.wrapping_sub(cons) as usize);
            if free == 0 {
                hint::spin_loop();
                continue;
            }

            let count = cmp::min(free, data.len());
            unsafe {
                copy_to_ring(
                    &iface.rsp,
                    &data[..count],
                    mask_ring_idx(prod) as usize,
                    count,
                )
            };
            iface
                .rsp_prod
                .store(prod.wrapping_add(count as u32), Ordering::Release);

            data = &data[count..];
        }
    }

    /// Self-heal a reply direction the peer has corrupted
    ///
    /// A producer index more than a ring ahead of the consumer can only come
    /// from the peer scribbling on `rsp_cons`; both indices reset to zero,
    /// losing undelivered replies but never deadlocking the worker.
    pub fn check_reply_indexes(&self) {
        let iface = self.interface();
        let cons = iface.rsp_cons.load(Ordering::Acquire);
        let prod = iface.rsp_prod.load(Ordering::Relaxed);

        if prod.wrapping_sub(cons) > RING_SIZE as u32 {
            warn!(
                "domid#{}: reply indexes broken (cons={} prod={}), resetting",
                self.domid, cons, prod
            );
            iface.rsp_cons.store(0, Ordering::Relaxed);
            iface.rsp_prod.store(0, Ordering::Release);
        }
    }

    /// Drop every request byte currently readable
    pub fn discard_requests(&self) {
        let iface = self.interface();
        let prod = iface.req_prod.load(Ordering::Acquire);
        iface.req_cons.store(prod, Ordering::Release);
    }

    /// Emit one complete reply: header, then payload, notifying the peer
    /// after each
    pub fn send_reply(&self, req_id: u32, kind: Kind, payload: &[u8]) {
        self.check_reply_indexes();

        let header = Header {
            kind: kind.into(),
            req_id,
            tx_id: 0,
            len: payload.len() as u32,
        };

        self.write(&header.to_bytes());
        self.notify();
        self.write(payload);
        self.notify();
    }

    /// Emit an `Error` reply carrying the XSD string for `err`
    pub fn send_error(&self, req_id: u32, err: Error) {
        error!("domid#{}: replying {}", self.domid, err.wire_str());

        let mut payload = err.wire_str().as_bytes().to_vec();
        payload.push(0);
        self.send_reply(req_id, Kind::Error, &payload);
    }
}
