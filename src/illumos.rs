// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! illumos/Solaris STREAMS primitives.

use std::ffi::CStr;
use std::os::fd::RawFd;
use std::{io, mem, ptr};

use tracing::warn;

use crate::libc_extra::*;
use crate::streams::{MuxId, Streams};

/// [`Streams`] backed by the operating system's STREAMS ioctls.
#[derive(Clone, Copy, Debug, Default)]
pub struct SysStreams;

impl SysStreams {
    #[inline]
    fn lifreq_named(name: &str) -> io::Result<lifreq> {
        let name = name.as_bytes();
        if name.len() >= LIFNAMSIZ || name.contains(&0x00) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "malformed interface name",
            ));
        }

        let mut req = lifreq::empty();
        for (dst, src) in req.lifr_name.iter_mut().zip(name) {
            *dst = *src as libc::c_char;
        }

        Ok(req)
    }

    /// Converts the result of `getmsg()` into the number of data bytes received.
    ///
    /// Messages that did not fit in the buffer are truncated; the rest of such a message would be
    /// returned by the next `getmsg()`, so it is logged rather than passed on silently.
    fn received_len(ret: libc::c_int, data_len: libc::c_int) -> usize {
        if ret & (MORECTL | MOREDATA) != 0 {
            warn!(ret, len = data_len, "packet larger than read buffer was truncated");
        }

        // A data length of -1 means the message had no data part.
        usize::try_from(data_len).unwrap_or(0)
    }

    #[inline]
    fn msg_len(len: usize) -> io::Result<libc::c_int> {
        libc::c_int::try_from(len).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "message too large for stream")
        })
    }
}

impl Streams for SysStreams {
    fn open(&self, path: &CStr) -> io::Result<RawFd> {
        match unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) } {
            fd @ 0.. => Ok(fd),
            _ => Err(io::Error::last_os_error()),
        }
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        match unsafe { libc::close(fd) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    fn new_ppa(&self, fd: RawFd, ppa: u32) -> io::Result<u32> {
        let Ok(mut ppa) = libc::c_int::try_from(ppa) else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "PPA too large"));
        };

        let mut strioc = strioctl {
            ic_cmd: TUNNEWPPA,
            ic_timout: 0,
            ic_len: mem::size_of::<libc::c_int>() as libc::c_int,
            ic_dp: ptr::addr_of_mut!(ppa) as *mut libc::c_char,
        };

        // The driver returns the allocated PPA as the ioctl's result.
        match unsafe { libc::ioctl(fd, I_STR, ptr::addr_of_mut!(strioc)) } {
            new_ppa @ 0.. => Ok(new_ppa as u32),
            _ => Err(io::Error::last_os_error()),
        }
    }

    fn push_module(&self, fd: RawFd, module: &CStr) -> io::Result<()> {
        match unsafe { libc::ioctl(fd, I_PUSH, module.as_ptr()) } {
            0.. => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    fn select_unit(&self, fd: RawFd, ppa: u32) -> io::Result<()> {
        let Ok(mut ppa) = libc::c_int::try_from(ppa) else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "PPA too large"));
        };

        match unsafe { libc::ioctl(fd, IF_UNITSEL, ptr::addr_of_mut!(ppa)) } {
            0.. => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    fn link(&self, ctl_fd: RawFd, fd: RawFd) -> io::Result<MuxId> {
        match unsafe { libc::ioctl(ctl_fd, I_PLINK, fd) } {
            muxid @ 0.. => Ok(muxid),
            _ => Err(io::Error::last_os_error()),
        }
    }

    fn unlink(&self, ctl_fd: RawFd, muxid: MuxId) -> io::Result<()> {
        match unsafe { libc::ioctl(ctl_fd, I_PUNLINK, muxid) } {
            0.. => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    fn muxid(&self, ctl_fd: RawFd, name: &str) -> io::Result<MuxId> {
        let mut req = Self::lifreq_named(name)?;

        unsafe {
            match libc::ioctl(ctl_fd, SIOCGLIFMUXID, ptr::addr_of_mut!(req)) {
                0.. => Ok(req.lifr_lifru.lifru_muxid[0]),
                _ => Err(io::Error::last_os_error()),
            }
        }
    }

    fn set_muxid(&self, ctl_fd: RawFd, name: &str, muxid: MuxId) -> io::Result<()> {
        let mut req = Self::lifreq_named(name)?;
        // TUN interfaces have no ARP stream, so only the IP mux id is set.
        req.lifr_lifru.lifru_muxid = [muxid, 0];

        match unsafe { libc::ioctl(ctl_fd, SIOCSLIFMUXID, ptr::addr_of_mut!(req)) } {
            0.. => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    fn recv_msg(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let mut data = strbuf {
            maxlen: Self::msg_len(buf.len())?,
            len: 0,
            buf: buf.as_mut_ptr() as *mut libc::c_char,
        };
        let mut flags: libc::c_int = 0;

        match unsafe {
            getmsg(
                fd,
                ptr::null_mut(),
                ptr::addr_of_mut!(data),
                ptr::addr_of_mut!(flags),
            )
        } {
            ret @ 0.. => Ok(Self::received_len(ret, data.len)),
            _ => Err(io::Error::last_os_error()),
        }
    }

    fn send_msg(&self, fd: RawFd, buf: &[u8]) -> io::Result<()> {
        let data = strbuf {
            maxlen: 0,
            len: Self::msg_len(buf.len())?,
            buf: buf.as_ptr() as *mut libc::c_char,
        };

        match unsafe { putmsg(fd, ptr::null(), ptr::addr_of!(data), 0) } {
            0.. => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn received_len_of_whole_message() {
        assert_eq!(SysStreams::received_len(0, 1500), 1500);
        assert_eq!(SysStreams::received_len(0, -1), 0);
    }

    #[test]
    fn received_len_of_truncated_message() {
        assert_eq!(SysStreams::received_len(MOREDATA, 64), 64);
    }

    #[test]
    fn interface_name_limits() {
        assert!(SysStreams::lifreq_named("tun0").is_ok());
        assert!(SysStreams::lifreq_named("tun\00").is_err());
        assert!(SysStreams::lifreq_named(&"t".repeat(LIFNAMSIZ)).is_err());
    }
}
