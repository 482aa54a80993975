//! Per-domain worker loop
//!
//! Each connected domain gets one thread running [`run`] until its stop flag
//! rises. The loop acknowledges any deferred transaction end, drains watch
//! events owed to this domain, then frames and dispatches the next request.

use log::{debug, error};

use crate::{dispatch::dispatch, domain::DomainContext, error::Error, XenStored};
use xs_wire::{Header, Kind, HEADER_SIZE, PAYLOAD_MAX};

pub(crate) fn run(engine: &XenStored, mut ctx: DomainContext) {
    debug!("domid#{}: worker running", ctx.domid);

    let mut header_raw = [0u8; HEADER_SIZE];

    while !ctx.handle.should_stop() {
        if let Some(req_id) = ctx.pending_txn_end.take() {
            ctx.ring.send_reply(req_id, Kind::TransactionEnd, b"\0");
        }

        if ctx.current_txn_id == 0 {
            engine.watches().drain_and_fire(&ctx);
        }

        if !ctx.ring.req_pending() {
            ctx.handle.wait();
        }

        // assemble the header; an empty first read means the wake was for
        // something other than request bytes
        let mut have = 0;
        while have < HEADER_SIZE && !ctx.handle.should_stop() {
            let count = ctx.ring.read(&mut header_raw[have..]);
            if count == 0 && have == 0 {
                break;
            }
            have += count;
        }
        if have < HEADER_SIZE {
            continue;
        }

        let header = Header::from_bytes(&header_raw);

        if header.len as usize > PAYLOAD_MAX {
            error!(
                "domid#{}: {} byte payload cannot fit the ring",
                ctx.domid, header.len
            );
            ctx.ring.send_error(header.req_id, Error::PayloadTooBig);
            // the length field lies, so the stream cannot be resynchronized
            ctx.ring.discard_requests();
            ctx.ring.notify();
            continue;
        }

        let mut payload = vec![0u8; header.len as usize];
        let mut have = 0;
        while have < payload.len() && !ctx.handle.should_stop() {
            have += ctx.ring.read(&mut payload[have..]);
        }
        if have < payload.len() {
            continue;
        }

        dispatch(engine, &mut ctx, &header, &payload);
        ctx.ring.notify();
    }

    // watches and undelivered events must not outlive their domain
    engine.watches().purge_domain(ctx.domid);
    debug!("domid#{}: worker stopped", ctx.domid);
}
