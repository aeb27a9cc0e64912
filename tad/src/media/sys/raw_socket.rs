// Copyright (C) 2016 whitequark@whitequark.org
// Copyright (C) 2019 Andreas Molzer <andreas.molzer@tum.de>
//
// in large parts from `smoltcp` originally distributed under 0-clause BSD
use core::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{ifreq, wait, Errno, FdResult, IoLenResult, LibcResult, ETH_P_ALL};
use crate::error::Result;
use crate::media::Media;

/// Largest frame read from the socket, enough for a tagged jumbo-less Ethernet frame.
const FRAME_BUFFER: usize = 1536;

/// A raw `AF_PACKET` socket bound to one interface.
///
/// The socket is non-blocking, reads wait with `select` for at most the requested timeout.
#[derive(Debug)]
pub struct RawSocket {
    lower: libc::c_int,
    ifreq: ifreq,
    hw_addr: Option<[u8; 6]>,
    buffer: Mutex<Vec<u8>>,
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.lower
    }
}

impl RawSocket {
    /// Open a socket and bind it to the named interface.
    pub fn new(name: &str) -> core::result::Result<Self, Errno> {
        let lower = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                ETH_P_ALL.to_be() as i32)
        };

        FdResult(lower).errno()?;

        let mut socket = RawSocket {
            lower,
            ifreq: ifreq::new(name),
            hw_addr: None,
            buffer: Mutex::new(vec![0; FRAME_BUFFER]),
        };
        socket.bind_interface()?;
        socket.hw_addr = socket.ifreq.get_hw_addr(lower).ok();
        debug!(interface = name, "raw socket bound");
        Ok(socket)
    }

    fn bind_interface(&mut self) -> core::result::Result<(), Errno> {
        let sockaddr = libc::sockaddr_ll {
            sll_family:   libc::AF_PACKET as u16,
            sll_protocol: ETH_P_ALL.to_be() as u16,
            sll_ifindex:  self.ifreq.get_if_index(self.lower)?,
            sll_hatype:   1,
            sll_pkttype:  0,
            sll_halen:    6,
            sll_addr:     [0; 8],
        };

        let res = unsafe {
            libc::bind(
                self.lower,
                &sockaddr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as u32)
        };

        FdResult(res).errno()
    }

    fn recv(&self, buffer: &mut [u8]) -> core::result::Result<usize, Errno> {
        let len = unsafe {
            libc::recv(
                self.lower,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                0)
        };
        IoLenResult(len).errno()?;
        Ok(len as usize)
    }

    fn send(&self, buffer: &[u8]) -> core::result::Result<usize, Errno> {
        let len = unsafe {
            libc::send(
                self.lower,
                buffer.as_ptr() as *const libc::c_void,
                buffer.len(),
                0)
        };
        IoLenResult(len).errno()?;
        Ok(len as usize)
    }
}

impl Media for RawSocket {
    fn read(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if !wait(self.lower, Some(timeout))? {
            return Ok(None);
        }

        let mut buffer = self.buffer.lock();
        match self.recv(&mut buffer) {
            Ok(len) => Ok(Some(buffer[..len].to_vec())),
            Err(ref err) if err.0 == libc::EWOULDBLOCK || err.0 == libc::EINTR => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, frame: &[u8]) -> Result<()> {
        self.send(frame)?;
        Ok(())
    }

    fn hardware_addr(&self) -> Option<[u8; 6]> {
        self.hw_addr
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.lower); }
    }
}
