#![allow(unsafe_code)]
// Copyright (C) 2016 whitequark@whitequark.org
// Copyright (C) 2019 Andreas Molzer <andreas.molzer@tum.de>
//
// in large parts from `smoltcp` originally distributed under 0-clause BSD
//
// Applies to files in this folder unless otherwise noted.
use core::mem;
use std::{io, ptr};
use std::os::unix::io::RawFd;
use std::time::Duration;

mod raw_socket;

/// Module importing all types that should be exported.
pub mod exports {
    pub use super::raw_socket::RawSocket;
    pub use super::wait as sys_wait;
    pub use super::Errno;
}

pub(crate) const ETH_P_ALL: libc::c_short = 0x0003;

/// Wait until given file descriptor becomes readable, but no longer than given timeout.
///
/// Returns `Ok(false)` when the timeout elapsed first.
pub fn wait(fd: RawFd, duration: Option<Duration>) -> Result<bool, Errno> {
    let mut readfds;

    unsafe {
        let mut readfds_init = mem::MaybeUninit::<libc::fd_set>::uninit();
        libc::FD_ZERO(readfds_init.as_mut_ptr());
        libc::FD_SET(fd, readfds_init.as_mut_ptr());
        readfds = readfds_init.assume_init();
    }

    let mut timeout = libc::timeval { tv_sec: 0, tv_usec: 0 };
    let timeout = duration.map(|duration| {
        timeout.tv_sec = duration.as_secs() as libc::time_t;
        timeout.tv_usec = duration.subsec_micros() as libc::suseconds_t;
        &mut timeout
    });

    let timeout_ptr = timeout
        .map(|reference| reference as *mut _)
        .unwrap_or_else(ptr::null_mut);

    let res = unsafe {
        libc::select(
            fd + 1,
            &mut readfds,
            ptr::null_mut(),
            ptr::null_mut(),
            timeout_ptr)
    };

    FdResult(res).errno()?;
    Ok(res > 0)
}

/// An errno value.
///
/// This is used as the error representation of raw libc calls. It converts into a
/// `std::io::Error` and from there into the crate error.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Errno(pub libc::c_int);

#[derive(Clone, Copy)]
struct FdResult(pub libc::c_int);

#[derive(Clone, Copy)]
struct IoLenResult(pub libc::ssize_t);

/// Base for an if ioctl request.
///
/// Contains the name of the interface.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct ifreq {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
}

/// Trait for interpreting integer return values.
trait LibcResult: Copy {
    fn is_fail(self) -> bool;

    fn errno(self) -> Result<(), Errno> {
        if self.is_fail() {
            Err(Errno::new())
        } else {
            Ok(())
        }
    }
}

impl Errno {
    /// The errno of the last failed call on this thread.
    pub fn new() -> Errno {
        Errno(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl LibcResult for FdResult {
    fn is_fail(self) -> bool {
        self.0 == -1
    }
}

impl LibcResult for IoLenResult {
    fn is_fail(self) -> bool {
        self.0 == -1
    }
}

impl From<Errno> for io::Error {
    fn from(err: Errno) -> io::Error {
        io::Error::from_raw_os_error(err.0 as i32)
    }
}

impl From<Errno> for crate::error::Error {
    fn from(err: Errno) -> Self {
        io::Error::from(err).into()
    }
}

impl ifreq {
    const SIOCGIFINDEX: libc::Ioctl = 0x8933;
    const SIOCGIFHWADDR: libc::Ioctl = 0x8927;

    fn new(name: &str) -> Self {
        let mut ifr_name = [0; libc::IF_NAMESIZE];

        // Keep the terminating zero.
        for (i, byte) in name.as_bytes().iter().take(libc::IF_NAMESIZE - 1).enumerate() {
            ifr_name[i] = *byte as libc::c_char
        }

        ifreq {
            ifr_name,
        }
    }

    fn get_if_index(&self, fd: libc::c_int) -> Result<libc::c_int, Errno> {
        #[repr(C)]
        struct Request {
            interface: ifreq,
            ifr_ifindex: libc::c_int,
            _pad: [u8; 20],
        }

        let mut request = Request {
            interface: *self,
            ifr_ifindex: 0,
            _pad: [0; 20],
        };

        let res = unsafe {
            libc::ioctl(fd, Self::SIOCGIFINDEX, &mut request as *mut _)
        };

        FdResult(res).errno()?;

        Ok(request.ifr_ifindex)
    }

    fn get_hw_addr(&self, fd: libc::c_int) -> Result<[u8; 6], Errno> {
        #[repr(C)]
        struct Request {
            interface: ifreq,
            ifr_hwaddr: libc::sockaddr,
            _pad: [u8; 8],
        }

        let mut request = Request {
            interface: *self,
            ifr_hwaddr: unsafe { mem::zeroed() },
            _pad: [0; 8],
        };

        let res = unsafe {
            libc::ioctl(fd, Self::SIOCGIFHWADDR, &mut request as *mut _)
        };

        FdResult(res).errno()?;

        let mut addr = [0u8; 6];
        for (octet, raw) in addr.iter_mut().zip(request.ifr_hwaddr.sa_data.iter()) {
            *octet = *raw as u8;
        }
        Ok(addr)
    }
}
