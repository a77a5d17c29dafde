use super::{IpError, IpLayer, Ipv4Address, Netif};
use crate::buffer::Pbuf;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

/// An [`IpLayer`] that routes over a static set of interfaces and parks every
/// datagram in a transmit queue until someone drains it.
///
/// The handle is cheap to clone; all clones see the same queue. While a
/// datagram is parked, the segment buffer it carries stays shared with TCP,
/// which is exactly how a device queue or an unresolved ARP entry looks from
/// above.
#[derive(Debug, Clone, Default)]
pub struct TxQueue {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    netifs: Vec<Netif>,
    default_route: Option<usize>,
    queue: VecDeque<Datagram>,
    failing: bool,
}

/// A datagram handed to the IP layer.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub ttl: u8,
    pub protocol: u8,
    /// Name of the interface the datagram was sent through
    pub netif: String,
    pub payload: Pbuf,
}

impl TxQueue {
    /// Creates a queue with no interfaces. Nothing is routable until one is
    /// added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an interface that serves its directly attached network.
    pub fn with_netif(self, netif: Netif) -> Self {
        self.lock().netifs.push(netif);
        self
    }

    /// Adds an interface that also serves as the default route.
    pub fn with_default_netif(self, netif: Netif) -> Self {
        {
            let mut inner = self.lock();
            inner.netifs.push(netif);
            inner.default_route = Some(inner.netifs.len() - 1);
        }
        self
    }

    /// Makes every subsequent output fail with [`IpError::Link`] until reset.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// The number of datagrams waiting in the queue.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every queued datagram, releasing the queue's
    /// references to their buffers.
    pub fn drain(&self) -> Vec<Datagram> {
        self.lock().queue.drain(..).collect()
    }

    /// Drops every queued datagram, as a device would once transmission
    /// completes.
    pub fn flush(&self) {
        self.lock().queue.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned queue only means a test thread panicked mid-push; the
        // data is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl IpLayer for TxQueue {
    fn route(&self, dst: Ipv4Address) -> Option<Netif> {
        let inner = self.lock();
        inner
            .netifs
            .iter()
            .find(|netif| netif.address.same_network(dst, netif.netmask))
            .or_else(|| inner.default_route.map(|i| &inner.netifs[i]))
            .cloned()
    }

    fn output_if(
        &mut self,
        packet: Pbuf,
        src: Ipv4Address,
        dst: Ipv4Address,
        ttl: u8,
        protocol: u8,
        netif: &Netif,
    ) -> Result<(), IpError> {
        let mut inner = self.lock();
        if inner.failing {
            tracing::debug!("{}: refusing datagram to {}", netif.name, dst);
            return Err(IpError::Link);
        }
        inner.queue.push_back(Datagram {
            src,
            dst,
            ttl,
            protocol,
            netif: netif.name.clone(),
            payload: packet,
        });
        Ok(())
    }
}
