//! A software broadcast segment.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::{Media, QUEUE_CAPACITY};
use crate::error::Result;

/// The registry of named hubs of one process.
#[derive(Default)]
pub struct Hubs {
    hubs: Mutex<HashMap<String, Arc<Hub>>>,
}

/// A named segment.
///
/// Holds weak references to its ports so that a dropped port simply disappears.
pub struct Hub {
    name: String,
    ports: Mutex<Vec<Weak<Queue>>>,
    next_addr: Mutex<u32>,
}

/// One attachment point of a hub.
pub struct HubPort {
    hub: Arc<Hub>,
    queue: Arc<Queue>,
    addr: [u8; 6],
}

pub(super) struct Queue {
    frames: Mutex<VecDeque<Vec<u8>>>,
    arrived: Condvar,
}

impl Hubs {
    /// An empty registry.
    pub fn new() -> Self {
        Hubs::default()
    }

    /// Find a hub by name, creating it on first use.
    pub fn get(&self, name: &str) -> Arc<Hub> {
        self.hubs.lock()
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Hub::new(name)))
            .clone()
    }
}

impl Hub {
    fn new(name: &str) -> Self {
        Hub {
            name: name.to_owned(),
            ports: Mutex::new(Vec::new()),
            next_addr: Mutex::new(1),
        }
    }

    /// The name under which the hub is registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plug a new port into the hub.
    ///
    /// Every port gets a distinct locally administered hardware address.
    pub fn attach(self: &Arc<Self>) -> HubPort {
        let queue = Arc::new(Queue::new());
        self.ports.lock().push(Arc::downgrade(&queue));

        let serial = {
            let mut next = self.next_addr.lock();
            let serial = *next;
            *next = next.wrapping_add(1);
            serial
        };
        let serial = serial.to_be_bytes();

        HubPort {
            hub: self.clone(),
            queue,
            addr: [0x02, 0x00, serial[0], serial[1], serial[2], serial[3]],
        }
    }

    /// Number of currently attached ports.
    pub fn port_count(&self) -> usize {
        let mut ports = self.ports.lock();
        ports.retain(|port| port.strong_count() > 0);
        ports.len()
    }

    fn broadcast(&self, from: &Arc<Queue>, frame: &[u8]) {
        let mut ports = self.ports.lock();
        ports.retain(|port| port.strong_count() > 0);
        for port in ports.iter().filter_map(Weak::upgrade) {
            if !Arc::ptr_eq(&port, from) {
                port.push(frame.to_vec());
            }
        }
    }

    fn remove(&self, queue: &Arc<Queue>) {
        self.ports.lock().retain(|port| match port.upgrade() {
            Some(port) => !Arc::ptr_eq(&port, queue),
            None => false,
        });
    }
}

impl Queue {
    pub(super) fn new() -> Self {
        Queue {
            frames: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
        }
    }

    pub(super) fn push(&self, frame: Vec<u8>) {
        let mut frames = self.frames.lock();
        if frames.len() == QUEUE_CAPACITY {
            frames.pop_front();
        }
        frames.push_back(frame);
        self.arrived.notify_all();
    }

    pub(super) fn pop(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut frames = self.frames.lock();
        loop {
            if let Some(frame) = frames.pop_front() {
                return Some(frame);
            }
            if self.arrived.wait_until(&mut frames, deadline).timed_out() {
                return frames.pop_front();
            }
        }
    }
}

impl HubPort {
    /// The hub this port is plugged into.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Drop every frame that is queued for this port.
    pub fn flush(&self) {
        self.queue.frames.lock().clear();
    }
}

impl Media for HubPort {
    fn read(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        Ok(self.queue.pop(timeout))
    }

    fn write(&self, frame: &[u8]) -> Result<()> {
        trace!(hub = %self.hub.name, len = frame.len(), "hub frame");
        self.hub.broadcast(&self.queue, frame);
        Ok(())
    }

    fn hardware_addr(&self) -> Option<[u8; 6]> {
        Some(self.addr)
    }

    fn detach(&self) {
        self.hub.remove(&self.queue);
        self.flush();
    }
}

impl Drop for HubPort {
    fn drop(&mut self) {
        self.hub.remove(&self.queue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_to_others() {
        let hubs = Hubs::new();
        let a = hubs.get("seg").attach();
        let b = hubs.get("seg").attach();
        let c = hubs.get("seg").attach();
        assert_eq!(hubs.get("seg").port_count(), 3);
        assert_ne!(a.hardware_addr(), b.hardware_addr());

        a.write(&[1, 2, 3]).unwrap();
        assert_eq!(b.read(Duration::from_millis(10)).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(c.read(Duration::from_millis(10)).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(a.read(Duration::from_millis(10)).unwrap(), None);

        c.detach();
        b.write(&[4]).unwrap();
        assert_eq!(a.read(Duration::from_millis(10)).unwrap(), Some(vec![4]));
        assert_eq!(c.read(Duration::from_millis(10)).unwrap(), None);
        drop(c);
        assert_eq!(hubs.get("seg").port_count(), 2);
    }

    #[test]
    fn separate_hubs() {
        let hubs = Hubs::new();
        let a = hubs.get("one").attach();
        let b = hubs.get("two").attach();
        a.write(&[1]).unwrap();
        assert_eq!(b.read(Duration::from_millis(5)).unwrap(), None);
    }

    #[test]
    fn read_waits_for_writer() {
        let hubs = Hubs::new();
        let a = hubs.get("seg").attach();
        let b = hubs.get("seg").attach();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            a.write(&[9]).unwrap();
            a
        });
        assert_eq!(b.read(Duration::from_secs(5)).unwrap(), Some(vec![9]));
        writer.join().unwrap();
    }
}
