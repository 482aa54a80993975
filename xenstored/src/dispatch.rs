//! Request dispatcher
//!
//! Maps every decoded message onto its handler. Handlers mutate the tree or
//! the watch registry and produce at least one reply on the caller's ring;
//! a failing handler replies with the error and never takes the worker down.

use log::error;

use crate::{
    domain::DomainContext,
    error::Error,
    store::construct_path,
    XenStored,
};
use xs_wire::{Header, Kind};

const OK: &[u8] = b"OK\0";
const EMPTY: &[u8] = b"\0";

/// Route one framed request to its handler
pub(crate) fn dispatch(engine: &XenStored, ctx: &mut DomainContext, header: &Header, payload: &[u8]) {
    let id = header.req_id;

    match Kind::from(header.kind) {
        Kind::Control => ctx.ring.send_reply(id, Kind::Control, OK),
        Kind::Directory => handle_directory(engine, ctx, id, payload),
        Kind::Read => handle_read(engine, ctx, id, payload),
        Kind::GetPerms => ctx.ring.send_error(id, Error::Unimplemented),
        Kind::SetPerms => ctx.ring.send_reply(id, Kind::SetPerms, OK),
        Kind::Watch => handle_watch(engine, ctx, id, payload),
        Kind::Unwatch => handle_unwatch(engine, ctx, id, payload),
        Kind::TransactionStart => handle_transaction_start(ctx, id),
        Kind::TransactionEnd => handle_transaction_end(ctx, id),
        Kind::GetDomainPath => handle_get_domain_path(ctx, id, payload),
        Kind::Write => handle_write(engine, ctx, id, Kind::Write, payload),
        Kind::MakeDirectory => handle_write(engine, ctx, id, Kind::MakeDirectory, payload),
        Kind::Remove => handle_rm(engine, ctx, id, payload),
        Kind::ResetWatches => handle_reset_watches(engine, ctx, id),
        other => {
            error!("domid#{}: unsupported message type {:?}", ctx.domid, other);
            ctx.ring.send_error(id, Error::Unimplemented);
        }
    }
}

fn handle_directory(engine: &XenStored, ctx: &mut DomainContext, id: u32, payload: &[u8]) {
    let path = match construct_path(payload, ctx.domid) {
        Ok(path) => path,
        Err(err) => return ctx.ring.send_error(id, err),
    };

    // absent nodes and leaves both list as empty
    let listing = {
        let tree = engine.tree().lock();
        match tree.lookup(&path) {
            Some(node) => {
                let mut listing = Vec::new();
                for name in node.child_names() {
                    listing.extend_from_slice(name.as_bytes());
                    listing.push(0);
                }
                listing
            }
            None => Vec::new(),
        }
    };

    ctx.ring.send_reply(id, Kind::Directory, &listing);
}

fn handle_read(engine: &XenStored, ctx: &mut DomainContext, id: u32, payload: &[u8]) {
    let path = match construct_path(payload, ctx.domid) {
        Ok(path) => path,
        Err(err) => return ctx.ring.send_error(id, err),
    };

    // a node that exists without a value reads as the empty string
    let value = {
        let tree = engine.tree().lock();
        tree.lookup(&path)
            .map(|node| node.value().unwrap_or_default().to_vec())
    };

    match value {
        Some(value) => ctx.ring.send_reply(id, Kind::Read, &value),
        None => ctx.ring.send_error(id, Error::NotFound),
    }
}

fn handle_write(
    engine: &XenStored,
    ctx: &mut DomainContext,
    id: u32,
    kind: Kind,
    payload: &[u8],
) {
    let Some((path_raw, rest)) = split_payload(payload) else {
        error!("domid#{}: write payload carries no path terminator", ctx.domid);
        return ctx.ring.send_error(id, Error::Invalid);
    };

    let path = match construct_path(path_raw, ctx.domid) {
        Ok(path) => path,
        Err(err) => return ctx.ring.send_error(id, err),
    };

    // an absent value creates the node but leaves any existing value alone
    let value = if rest.is_empty() {
        None
    } else {
        Some(strip_trailing_nul(rest))
    };

    engine.tree().lock().write(&path, value);
    ctx.ring.send_reply(id, kind, OK);
    engine.notify_watchers(&path, ctx.domid);
}

fn handle_rm(engine: &XenStored, ctx: &mut DomainContext, id: u32, payload: &[u8]) {
    let path = match construct_path(payload, ctx.domid) {
        Ok(path) => path,
        Err(err) => return ctx.ring.send_error(id, err),
    };

    let removed = { engine.tree().lock().remove(&path) };
    match removed {
        Ok(()) => {
            ctx.ring.send_reply(id, Kind::Remove, b"");
            engine.notify_watchers(&path, ctx.domid);
        }
        // removing what is not there earns no reply at all
        Err(Error::NotFound) => {}
        Err(err) => ctx.ring.send_error(id, err),
    }
}

fn handle_watch(engine: &XenStored, ctx: &mut DomainContext, id: u32, payload: &[u8]) {
    let Some((path_raw, token)) = split_payload(payload) else {
        return ctx.ring.send_error(id, Error::Invalid);
    };

    let relative = !path_raw.starts_with(b"/");
    let path = match construct_path(path_raw, ctx.domid) {
        Ok(path) => path,
        Err(err) => return ctx.ring.send_error(id, err),
    };
    let token = strip_trailing_nul(token);

    engine.watches().register(&path, token, ctx.domid, relative);
    ctx.ring.send_reply(id, Kind::Watch, OK);

    // a watch on an existing path owes its caller one synthetic event
    if engine.tree().lock().lookup(&path).is_some() {
        engine.watches().enqueue_existing(&path, ctx.domid);
        ctx.handle.wake();
    }
}

fn handle_unwatch(engine: &XenStored, ctx: &mut DomainContext, id: u32, payload: &[u8]) {
    let Some((path_raw, token)) = split_payload(payload) else {
        return ctx.ring.send_error(id, Error::Invalid);
    };

    let path = match construct_path(path_raw, ctx.domid) {
        Ok(path) => path,
        Err(err) => return ctx.ring.send_error(id, err),
    };

    engine
        .watches()
        .unregister(&path, strip_trailing_nul(token), ctx.domid);
    ctx.ring.send_reply(id, Kind::Unwatch, EMPTY);
}

fn handle_transaction_start(ctx: &mut DomainContext, id: u32) {
    if ctx.current_txn_id != 0 {
        error!("domid#{}: transaction already started", ctx.domid);
        return ctx.ring.send_error(id, Error::TransactionBusy);
    }

    ctx.txn_counter = ctx.txn_counter.wrapping_add(1);
    ctx.current_txn_id = ctx.txn_counter;

    let reply = format!("{}\0", ctx.current_txn_id);
    ctx.ring
        .send_reply(id, Kind::TransactionStart, reply.as_bytes());
}

fn handle_transaction_end(ctx: &mut DomainContext, id: u32) {
    // acknowledged from the top of the next worker iteration
    ctx.pending_txn_end = Some(id);
    ctx.current_txn_id = 0;
}

fn handle_get_domain_path(ctx: &mut DomainContext, id: u32, payload: &[u8]) {
    let raw = match payload.iter().position(|&b| b == 0) {
        Some(idx) => &payload[..idx],
        None => payload,
    };

    let Ok(domid_str) = core::str::from_utf8(raw) else {
        return ctx.ring.send_error(id, Error::Invalid);
    };

    let reply = format!("/local/domain/{}\0", domid_str);
    ctx.ring
        .send_reply(id, Kind::GetDomainPath, reply.as_bytes());
}

fn handle_reset_watches(engine: &XenStored, ctx: &mut DomainContext, id: u32) {
    engine.watches().reset();
    ctx.ring.send_reply(id, Kind::ResetWatches, OK);
}

/// Split a `path\0rest` payload at its first nul; `None` when the
/// terminator is missing entirely
fn split_payload(payload: &[u8]) -> Option<(&[u8], &[u8])> {
    let idx = payload.iter().position(|&b| b == 0)?;
    Some((&payload[..idx], &payload[idx + 1..]))
}

fn strip_trailing_nul(data: &[u8]) -> &[u8] {
    // remove the terminator if the peer sent one
    if let Some(0) = data.last() {
        &data[..data.len() - 1]
    } else {
        data
    }
}
