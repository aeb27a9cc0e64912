//! Encapsulates the medium under a CSAP.
//!
//! The read/write layer of a CSAP attaches exactly one [`Media`] during initialization. Engines
//! only ever talk to that object, never to a device directly.
//!
//! * [`Hub`] is a named in-memory broadcast segment. Every port of a hub sees the frames written by
//!   all other ports. Useful for tests and for connecting CSAPs of one process.
//! * [`Pipe`] is the medium of data-CSAPs: whatever is written can be read back.
//! * On Linux with the `std` feature, `sys::RawSocket` binds an `AF_PACKET` socket to a real
//!   interface.
//!
//! [`Media`]: trait.Media.html
//! [`Hub`]: struct.Hub.html
//! [`Pipe`]: struct.Pipe.html
use std::time::Duration;

use crate::error::Result;

mod hub;
mod pipe;

#[cfg(all(feature = "std", target_os = "linux"))]
#[path = "sys/mod.rs"]
mod sys_internal;

pub use self::hub::{Hub, HubPort, Hubs};
pub use self::pipe::Pipe;

#[cfg(all(feature = "std", target_os = "linux"))]
pub use self::sys_internal::exports as sys;

/// Number of frames a receiving queue holds before the oldest are dropped.
pub const QUEUE_CAPACITY: usize = 1024;

/// The frame I/O of a CSAP.
///
/// All methods take `&self`, a send and a receive worker may use the medium at the same time.
pub trait Media: Send + Sync {
    /// Wait at most `timeout` for one frame.
    ///
    /// `Ok(None)` means that nothing arrived in time.
    fn read(&self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Transmit one frame.
    fn write(&self, frame: &[u8]) -> Result<()>;

    /// Transmit one frame and wait for the next frame to arrive.
    fn write_read(&self, frame: &[u8], timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.write(frame)?;
        self.read(timeout)
    }

    /// Called before a send operation starts.
    fn prepare_send(&self) -> Result<()> {
        Ok(())
    }

    /// Called before a receive operation starts.
    fn prepare_recv(&self) -> Result<()> {
        Ok(())
    }

    /// Called when an operation has finished.
    fn release(&self) -> Result<()> {
        Ok(())
    }

    /// The hardware address of the medium, if it has one.
    fn hardware_addr(&self) -> Option<[u8; 6]> {
        None
    }

    /// Disconnect from the underlying device, no more frames arrive afterwards.
    fn detach(&self) {}
}
