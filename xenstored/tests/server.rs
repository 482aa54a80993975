//! Full request/reply cycles against running domain workers, driven from
//! the peer side of in-memory ring pages.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use xenstored::{Error, EventCallback, Platform, XenStored};
use xenstored::xs_wire::{
    copy_from_ring, copy_to_ring, mask_ring_idx, Header, Interface, Kind, HEADER_SIZE, RING_SIZE,
};

const REPLY_DEADLINE: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(50);

struct SendPage(*mut Interface);
unsafe impl Send for SendPage {}

/// In-memory stand-in for the event-channel and mapping primitives
#[derive(Default)]
struct FakePlatform {
    pages: Mutex<HashMap<u16, SendPage>>,
    callbacks: Mutex<HashMap<u16, EventCallback>>,
    published: Mutex<HashMap<u16, u32>>,
    next_port: AtomicU32,
}

impl FakePlatform {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn page(&self, domid: u16) -> *mut Interface {
        self.pages.lock().unwrap()[&domid].0
    }

    /// Deliver the peer's event to the server's bound callback
    fn kick(&self, domid: u16) {
        let callback = self.callbacks.lock().unwrap().get(&domid).cloned();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Platform for FakePlatform {
    fn map_ring(&self, domid: u16, _pfn_offset: u64) -> xenstored::Result<*mut Interface> {
        let page = Box::into_raw(Box::new(Interface::new()));
        self.pages.lock().unwrap().insert(domid, SendPage(page));
        Ok(page)
    }

    fn unmap_ring(&self, domid: u16, ring: *mut Interface) -> xenstored::Result<()> {
        self.pages.lock().unwrap().remove(&domid);
        drop(unsafe { Box::from_raw(ring) });
        Ok(())
    }

    fn bind_event_channel(
        &self,
        domid: u16,
        _remote_port: u32,
        callback: EventCallback,
    ) -> xenstored::Result<u32> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed) + 100;
        self.callbacks.lock().unwrap().insert(domid, callback);
        Ok(port)
    }

    fn notify(&self, _local_port: u32) {}

    fn unbind_event_channel(&self, _local_port: u32) {}

    fn close_event_channel(&self, _local_port: u32) -> xenstored::Result<()> {
        Ok(())
    }

    fn publish_store_port(&self, domid: u16, remote_port: u32) -> xenstored::Result<()> {
        self.published.lock().unwrap().insert(domid, remote_port);
        Ok(())
    }
}

/// Guest-side driver for one domain's ring
struct RingClient {
    page: *mut Interface,
    platform: Arc<FakePlatform>,
    domid: u16,
    next_req_id: u32,
}

impl RingClient {
    fn new(platform: &Arc<FakePlatform>, domid: u16) -> Self {
        Self {
            page: platform.page(domid),
            platform: platform.clone(),
            domid,
            next_req_id: 1,
        }
    }

    fn interface(&self) -> &Interface {
        unsafe { &*self.page }
    }

    fn send(&mut self, kind: Kind, payload: &[u8]) -> u32 {
        let req_id = self.next_req_id;
        self.next_req_id += 1;
        self.send_raw(
            Header {
                kind: kind.into(),
                req_id,
                tx_id: 0,
                len: payload.len() as u32,
            },
            payload,
        );
        req_id
    }

    fn send_raw(&mut self, header: Header, payload: &[u8]) {
        self.produce(&header.to_bytes());
        self.produce(payload);
        self.platform.kick(self.domid);
    }

    fn produce(&self, data: &[u8]) {
        let iface = self.interface();
        let mut sent = 0;
        while sent < data.len() {
            let prod = iface.req_prod.load(Ordering::Relaxed);
            let cons = iface.req_cons.load(Ordering::Acquire);
            let free = RING_SIZE - prod.wrapping_sub(cons) as usize;
            if free == 0 {
                thread::sleep(Duration::from_millis(1));
                continue;
            }

            let count = free.min(data.len() - sent);
            unsafe {
                copy_to_ring(
                    &iface.req,
                    &data[sent..sent + count],
                    mask_ring_idx(prod) as usize,
                    count,
                )
            };
            iface
                .req_prod
                .store(prod.wrapping_add(count as u32), Ordering::Release);
            sent += count;
        }
    }

    fn consume(&self, buf: &mut [u8]) {
        let iface = self.interface();
        let deadline = Instant::now() + REPLY_DEADLINE;
        let mut have = 0;

        while have < buf.len() {
            let cons = iface.rsp_cons.load(Ordering::Relaxed);
            let prod = iface.rsp_prod.load(Ordering::Acquire);
            let avail = prod.wrapping_sub(cons) as usize;
            if avail == 0 {
                assert!(
                    Instant::now() < deadline,
                    "timed out waiting for reply bytes"
                );
                thread::sleep(Duration::from_millis(1));
                continue;
            }

            let count = avail.min(buf.len() - have);
            unsafe {
                copy_from_ring(
                    &iface.rsp,
                    &mut buf[have..have + count],
                    mask_ring_idx(cons) as usize,
                    count,
                )
            };
            iface
                .rsp_cons
                .store(cons.wrapping_add(count as u32), Ordering::Release);
            have += count;
        }
    }

    fn read_reply(&mut self) -> (Header, Vec<u8>) {
        let mut raw = [0u8; HEADER_SIZE];
        self.consume(&mut raw);
        let header = Header::from_bytes(&raw);

        let mut payload = vec![0u8; header.len as usize];
        self.consume(&mut payload);
        (header, payload)
    }

    fn roundtrip(&mut self, kind: Kind, payload: &[u8]) -> (Header, Vec<u8>) {
        let req_id = self.send(kind, payload);
        let (header, reply) = self.read_reply();
        assert_eq!(header.req_id, req_id, "reply answers a different request");
        (header, reply)
    }
}

fn server() -> (XenStored, Arc<FakePlatform>) {
    let platform = FakePlatform::new();
    let engine = XenStored::new(platform.clone());
    (engine, platform)
}

fn connect(engine: &XenStored, platform: &Arc<FakePlatform>, domid: u16) -> RingClient {
    engine
        .start_domain(domid, u32::from(domid) + 1, 0)
        .expect("start domain");
    RingClient::new(platform, domid)
}

#[test]
fn write_then_read() {
    let (engine, platform) = server();
    let mut client = connect(&engine, &platform, 1);

    let (header, reply) = client.roundtrip(Kind::Write, b"/foo\0bar");
    assert_eq!(header.kind, u32::from(Kind::Write));
    assert_eq!(reply, b"OK\0");

    let (header, reply) = client.roundtrip(Kind::Read, b"/foo\0");
    assert_eq!(header.kind, u32::from(Kind::Read));
    assert_eq!(reply, b"bar");

    engine.stop_domain(1).unwrap();
}

#[test]
fn directory_lists_children_in_insertion_order() {
    let (engine, platform) = server();
    let mut client = connect(&engine, &platform, 1);

    client.roundtrip(Kind::Write, b"/a/x\0v1");
    client.roundtrip(Kind::Write, b"/a/y\0v2");

    let (header, reply) = client.roundtrip(Kind::Directory, b"/a\0");
    assert_eq!(header.kind, u32::from(Kind::Directory));
    assert_eq!(reply, b"x\0y\0");

    // absent nodes list as empty
    let (_, reply) = client.roundtrip(Kind::Directory, b"/missing\0");
    assert_eq!(reply, b"");

    engine.stop_domain(1).unwrap();
}

#[test]
fn read_of_missing_path_is_enoent() {
    let (engine, platform) = server();
    let mut client = connect(&engine, &platform, 1);

    let (header, reply) = client.roundtrip(Kind::Read, b"/nope\0");
    assert_eq!(header.kind, u32::from(Kind::Error));
    assert_eq!(reply, b"ENOENT\0");

    engine.stop_domain(1).unwrap();
}

#[test]
fn valueless_nodes_read_as_empty() {
    let (engine, platform) = server();
    let mut client = connect(&engine, &platform, 1);

    client.roundtrip(Kind::Write, b"/a/b\0v");

    let (header, reply) = client.roundtrip(Kind::Read, b"/a\0");
    assert_eq!(header.kind, u32::from(Kind::Read));
    assert_eq!(reply, b"");

    engine.stop_domain(1).unwrap();
}

#[test]
fn watch_fires_across_domains() {
    let (engine, platform) = server();
    let mut watcher = connect(&engine, &platform, 1);
    let mut writer = connect(&engine, &platform, 2);

    let (_, reply) = watcher.roundtrip(Kind::Watch, b"/k\0tok");
    assert_eq!(reply, b"OK\0");

    let (_, reply) = writer.roundtrip(Kind::Write, b"/k\0hello");
    assert_eq!(reply, b"OK\0");

    let (header, payload) = watcher.read_reply();
    assert_eq!(header.kind, u32::from(Kind::WatchEvent));
    assert_eq!(header.req_id, 0);
    assert_eq!(payload, b"/k\0tok\0");

    engine.stop_domain(1).unwrap();
    engine.stop_domain(2).unwrap();
}

#[test]
fn watch_on_an_existing_path_gets_a_synthetic_event() {
    let (engine, platform) = server();
    let mut client = connect(&engine, &platform, 1);

    client.roundtrip(Kind::Write, b"/here\0v");

    let (_, reply) = client.roundtrip(Kind::Watch, b"/here\0t");
    assert_eq!(reply, b"OK\0");

    let (header, payload) = client.read_reply();
    assert_eq!(header.kind, u32::from(Kind::WatchEvent));
    assert_eq!(payload, b"/here\0t\0");

    engine.stop_domain(1).unwrap();
}

#[test]
fn relative_watch_strips_the_prefix_and_skips_self_writes() {
    let (engine, platform) = server();
    let mut client = connect(&engine, &platform, 7);

    let (_, reply) = client.roundtrip(Kind::Watch, b"sub\0t");
    assert_eq!(reply, b"OK\0");

    // a same-domain write must not come back as an event
    let (_, reply) = client.roundtrip(Kind::Write, b"sub\0v");
    assert_eq!(reply, b"OK\0");
    thread::sleep(SETTLE);

    // an external write fires, reported with the local prefix stripped
    engine.write("/local/domain/7/sub", "v2").unwrap();

    let (header, payload) = client.read_reply();
    assert_eq!(header.kind, u32::from(Kind::WatchEvent));
    assert_eq!(payload, b"sub\0t\0");

    engine.stop_domain(7).unwrap();
}

#[test]
fn transactions_serialize_per_domain() {
    let (engine, platform) = server();
    let mut client = connect(&engine, &platform, 1);

    let (header, reply) = client.roundtrip(Kind::TransactionStart, b"\0");
    assert_eq!(header.kind, u32::from(Kind::TransactionStart));
    assert_eq!(reply, b"1\0");

    let (header, reply) = client.roundtrip(Kind::TransactionStart, b"\0");
    assert_eq!(header.kind, u32::from(Kind::Error));
    assert_eq!(reply, b"EBUSY\0");

    // the end acknowledgement is deferred to the next loop iteration
    let end_id = client.send(Kind::TransactionEnd, b"\0");
    let (header, reply) = client.read_reply();
    assert_eq!(header.kind, u32::from(Kind::TransactionEnd));
    assert_eq!(header.req_id, end_id);
    assert_eq!(reply, b"\0");

    let (header, reply) = client.roundtrip(Kind::TransactionStart, b"\0");
    assert_eq!(header.kind, u32::from(Kind::TransactionStart));
    assert_eq!(reply, b"2\0");

    engine.stop_domain(1).unwrap();
}

#[test]
fn recursive_remove_notifies_watchers() {
    let (engine, platform) = server();
    let mut writer = connect(&engine, &platform, 1);
    let mut watcher = connect(&engine, &platform, 2);

    writer.roundtrip(Kind::Write, b"/r/a\0v");
    writer.roundtrip(Kind::Write, b"/r/b/c\0v");
    writer.roundtrip(Kind::Write, b"/r/b/d\0v");

    let (_, reply) = watcher.roundtrip(Kind::Watch, b"/r\0t2");
    assert_eq!(reply, b"OK\0");
    // /r already exists, so one synthetic event arrives up front
    let (header, payload) = watcher.read_reply();
    assert_eq!(header.kind, u32::from(Kind::WatchEvent));
    assert_eq!(payload, b"/r\0t2\0");

    let (header, reply) = writer.roundtrip(Kind::Remove, b"/r\0");
    assert_eq!(header.kind, u32::from(Kind::Remove));
    assert_eq!(reply, b"");

    let (header, payload) = watcher.read_reply();
    assert_eq!(header.kind, u32::from(Kind::WatchEvent));
    assert_eq!(payload, b"/r\0t2\0");

    let (header, reply) = writer.roundtrip(Kind::Read, b"/r/a\0");
    assert_eq!(header.kind, u32::from(Kind::Error));
    assert_eq!(reply, b"ENOENT\0");

    engine.stop_domain(1).unwrap();
    engine.stop_domain(2).unwrap();
}

#[test]
fn rm_of_a_missing_path_stays_silent() {
    let (engine, platform) = server();
    let mut client = connect(&engine, &platform, 1);

    let rm_id = client.send(Kind::Remove, b"/ghost\0");
    let control_id = client.send(Kind::Control, b"");

    // the next reply answers the CONTROL, proving the RM said nothing
    let (header, reply) = client.read_reply();
    assert_eq!(header.kind, u32::from(Kind::Control));
    assert_eq!(header.req_id, control_id);
    assert_ne!(header.req_id, rm_id);
    assert_eq!(reply, b"OK\0");

    engine.stop_domain(1).unwrap();
}

#[test]
fn mkdir_is_idempotent_and_preserves_values() {
    let (engine, platform) = server();
    let mut client = connect(&engine, &platform, 1);

    let (_, reply) = client.roundtrip(Kind::MakeDirectory, b"/m\0");
    assert_eq!(reply, b"OK\0");

    client.roundtrip(Kind::Write, b"/m\0v");
    client.roundtrip(Kind::MakeDirectory, b"/m\0");

    let (_, reply) = client.roundtrip(Kind::Read, b"/m\0");
    assert_eq!(reply, b"v");

    engine.stop_domain(1).unwrap();
}

#[test]
fn unknown_opcodes_are_enosys() {
    let (engine, platform) = server();
    let mut client = connect(&engine, &platform, 1);

    let (header, reply) = client.roundtrip(Kind::Resume, b"");
    assert_eq!(header.kind, u32::from(Kind::Error));
    assert_eq!(reply, b"ENOSYS\0");

    let req_id = 77;
    client.send_raw(
        Header {
            kind: 99,
            req_id,
            tx_id: 0,
            len: 0,
        },
        b"",
    );
    let (header, reply) = client.read_reply();
    assert_eq!(header.kind, u32::from(Kind::Error));
    assert_eq!(header.req_id, req_id);
    assert_eq!(reply, b"ENOSYS\0");

    engine.stop_domain(1).unwrap();
}

#[test]
fn get_domain_path_echoes_the_requested_domid() {
    let (engine, platform) = server();
    let mut client = connect(&engine, &platform, 1);

    let (header, reply) = client.roundtrip(Kind::GetDomainPath, b"5\0");
    assert_eq!(header.kind, u32::from(Kind::GetDomainPath));
    assert_eq!(reply, b"/local/domain/5\0");

    engine.stop_domain(1).unwrap();
}

#[test]
fn unwatch_stops_events() {
    let (engine, platform) = server();
    let mut watcher = connect(&engine, &platform, 1);
    let mut writer = connect(&engine, &platform, 2);

    watcher.roundtrip(Kind::Watch, b"/w\0tok");
    writer.roundtrip(Kind::Write, b"/w/x\0v");

    let (header, _) = watcher.read_reply();
    assert_eq!(header.kind, u32::from(Kind::WatchEvent));

    let (header, reply) = watcher.roundtrip(Kind::Unwatch, b"/w\0tok");
    assert_eq!(header.kind, u32::from(Kind::Unwatch));
    assert_eq!(reply, b"\0");

    writer.roundtrip(Kind::Write, b"/w/y\0v");
    thread::sleep(SETTLE);

    // nothing queued; the next reply is the CONTROL's
    let (header, _) = watcher.roundtrip(Kind::Control, b"");
    assert_eq!(header.kind, u32::from(Kind::Control));

    engine.stop_domain(1).unwrap();
    engine.stop_domain(2).unwrap();
}

#[test]
fn reset_watches_drops_every_watch() {
    let (engine, platform) = server();
    let mut watcher = connect(&engine, &platform, 1);
    let mut writer = connect(&engine, &platform, 2);

    watcher.roundtrip(Kind::Watch, b"/z\0t");
    assert_eq!(engine.active_watches(), 1);

    let (_, reply) = watcher.roundtrip(Kind::ResetWatches, b"\0");
    assert_eq!(reply, b"OK\0");
    assert_eq!(engine.active_watches(), 0);

    writer.roundtrip(Kind::Write, b"/z/leaf\0v");
    thread::sleep(SETTLE);

    let (header, _) = watcher.roundtrip(Kind::Control, b"");
    assert_eq!(header.kind, u32::from(Kind::Control));

    engine.stop_domain(1).unwrap();
    engine.stop_domain(2).unwrap();
}

#[test]
fn oversized_payloads_are_e2big() {
    let (engine, platform) = server();
    let mut client = connect(&engine, &platform, 1);

    client.send_raw(
        Header {
            kind: Kind::Write.into(),
            req_id: 5,
            tx_id: 0,
            len: 2000,
        },
        b"",
    );

    let (header, reply) = client.read_reply();
    assert_eq!(header.kind, u32::from(Kind::Error));
    assert_eq!(header.req_id, 5);
    assert_eq!(reply, b"E2BIG\0");

    // the connection self-heals and keeps serving
    let (header, reply) = client.roundtrip(Kind::Control, b"");
    assert_eq!(header.kind, u32::from(Kind::Control));
    assert_eq!(reply, b"OK\0");

    engine.stop_domain(1).unwrap();
}

#[test]
fn stop_purges_watches_and_pending_events() {
    let (engine, platform) = server();
    let mut client = connect(&engine, &platform, 1);

    client.roundtrip(Kind::Write, b"/p\0v");
    client.roundtrip(Kind::Watch, b"/p\0t");
    let (header, _) = client.read_reply();
    assert_eq!(header.kind, u32::from(Kind::WatchEvent));
    assert_eq!(engine.active_watches(), 1);

    engine.stop_domain(1).unwrap();
    assert_eq!(engine.active_watches(), 0);
    assert_eq!(engine.pending_events(), 0);

    // and the store itself survives the domain
    assert_eq!(engine.read("/p").unwrap(), b"v");
}

#[test]
fn a_domain_cannot_connect_twice() {
    let (engine, platform) = server();
    let _client = connect(&engine, &platform, 1);

    assert_eq!(
        engine.start_domain(1, 2, 0),
        Err(Error::AlreadyConnected(1))
    );

    engine.stop_domain(1).unwrap();
}
