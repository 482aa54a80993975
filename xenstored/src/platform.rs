//! Interface to the event-channel and memory-mapping primitives
//!
//! The service never talks to the hypervisor directly; everything it needs
//! from below is collected in [`Platform`] and supplied by the embedder at
//! engine construction. Tests substitute an in-memory implementation.

use std::sync::Arc;

use crate::error::Result;
use xs_wire::Interface;

/// Callback bound to an event channel, invoked from event context when the
/// peer signals. It must not block; posting the owning domain's wake
/// semaphore is its only intended effect.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// Hypervisor-side primitives consumed by the service
pub trait Platform: Send + Sync {
    /// Attach the foreign domain's store ring page
    fn map_ring(&self, domid: u16, pfn_offset: u64) -> Result<*mut Interface>;

    /// Detach a ring previously returned by [`Platform::map_ring`]
    fn unmap_ring(&self, domid: u16, ring: *mut Interface) -> Result<()>;

    /// Bind an interdomain event channel, returning the local port
    fn bind_event_channel(
        &self,
        domid: u16,
        remote_port: u32,
        callback: EventCallback,
    ) -> Result<u32>;

    /// Signal the peer bound to `local_port`
    fn notify(&self, local_port: u32);

    /// Remove the callback bound to `local_port`
    fn unbind_event_channel(&self, local_port: u32);

    /// Close the local end of the channel
    fn close_event_channel(&self, local_port: u32) -> Result<()>;

    /// Publish the store event-channel parameter for the guest
    fn publish_store_port(&self, domid: u16, remote_port: u32) -> Result<()>;
}
