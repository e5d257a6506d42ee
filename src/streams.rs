// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The STREAMS operations a TUN interface is built from.
//!
//! [`Streams`] is the narrow set of device primitives that [`NativeTun`](crate::NativeTun) needs
//! to plumb, use and unplumb an interface. The operating system implementation lives in
//! [`SysStreams`](crate::illumos::SysStreams); other implementations can stand in for the kernel
//! driver (e.g. to exercise failure handling).

#[cfg(test)]
pub(crate) mod mock;

use std::ffi::CStr;
use std::io;
use std::os::fd::RawFd;

use tracing::{debug, warn};

/// An opaque link identifier returned by a persistent link.
pub type MuxId = libc::c_int;

/// Device primitives for STREAMS-based TUN interfaces.
///
/// Every method maps to a single system call against an open stream, and every error is the raw
/// OS error of that call.
pub trait Streams {
    /// Opens the given device node for reading and writing.
    fn open(&self, path: &CStr) -> io::Result<RawFd>;

    /// Closes a descriptor previously returned by [`open()`](Self::open).
    fn close(&self, fd: RawFd) -> io::Result<()>;

    /// Asks the TUN driver to allocate the given unit number (PPA), returning the unit number
    /// that was allocated.
    ///
    /// Fails with `EEXIST` if the unit is already in use.
    fn new_ppa(&self, fd: RawFd, ppa: u32) -> io::Result<u32>;

    /// Pushes a named STREAMS module onto the stream.
    fn push_module(&self, fd: RawFd, module: &CStr) -> io::Result<()>;

    /// Binds the stream to the given unit number.
    fn select_unit(&self, fd: RawFd, ppa: u32) -> io::Result<()>;

    /// Persistently links `fd` underneath the multiplexing stream `ctl_fd`.
    fn link(&self, ctl_fd: RawFd, fd: RawFd) -> io::Result<MuxId>;

    /// Removes a persistent link from underneath `ctl_fd`.
    fn unlink(&self, ctl_fd: RawFd, muxid: MuxId) -> io::Result<()>;

    /// Looks up the IP link identifier registered for the named interface.
    fn muxid(&self, ctl_fd: RawFd, name: &str) -> io::Result<MuxId>;

    /// Registers the IP link identifier for the named interface.
    fn set_muxid(&self, ctl_fd: RawFd, name: &str, muxid: MuxId) -> io::Result<()>;

    /// Receives a single message from the stream into `buf`, returning its length.
    fn recv_msg(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;

    /// Sends `buf` as a single message on the stream.
    fn send_msg(&self, fd: RawFd, buf: &[u8]) -> io::Result<()>;
}

impl<S: Streams + ?Sized> Streams for &S {
    #[inline]
    fn open(&self, path: &CStr) -> io::Result<RawFd> {
        (**self).open(path)
    }

    #[inline]
    fn close(&self, fd: RawFd) -> io::Result<()> {
        (**self).close(fd)
    }

    #[inline]
    fn new_ppa(&self, fd: RawFd, ppa: u32) -> io::Result<u32> {
        (**self).new_ppa(fd, ppa)
    }

    #[inline]
    fn push_module(&self, fd: RawFd, module: &CStr) -> io::Result<()> {
        (**self).push_module(fd, module)
    }

    #[inline]
    fn select_unit(&self, fd: RawFd, ppa: u32) -> io::Result<()> {
        (**self).select_unit(fd, ppa)
    }

    #[inline]
    fn link(&self, ctl_fd: RawFd, fd: RawFd) -> io::Result<MuxId> {
        (**self).link(ctl_fd, fd)
    }

    #[inline]
    fn unlink(&self, ctl_fd: RawFd, muxid: MuxId) -> io::Result<()> {
        (**self).unlink(ctl_fd, muxid)
    }

    #[inline]
    fn muxid(&self, ctl_fd: RawFd, name: &str) -> io::Result<MuxId> {
        (**self).muxid(ctl_fd, name)
    }

    #[inline]
    fn set_muxid(&self, ctl_fd: RawFd, name: &str, muxid: MuxId) -> io::Result<()> {
        (**self).set_muxid(ctl_fd, name, muxid)
    }

    #[inline]
    fn recv_msg(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv_msg(fd, buf)
    }

    #[inline]
    fn send_msg(&self, fd: RawFd, buf: &[u8]) -> io::Result<()> {
        (**self).send_msg(fd, buf)
    }
}

/// A descriptor that is closed when dropped unless it is released with
/// [`into_raw()`](Self::into_raw).
///
/// Guards are dropped in reverse order of creation, so an early return while plumbing an
/// interface closes every stream opened so far, latest first.
pub(crate) struct StreamFd<'a, S: Streams + ?Sized> {
    streams: &'a S,
    fd: Option<RawFd>,
}

impl<'a, S: Streams + ?Sized> StreamFd<'a, S> {
    #[inline]
    pub fn open(streams: &'a S, path: &CStr) -> io::Result<Self> {
        let fd = streams.open(path)?;
        debug!(fd, path = ?path, "opened stream");

        Ok(Self {
            streams,
            fd: Some(fd),
        })
    }

    #[inline]
    pub fn raw(&self) -> RawFd {
        // Only `into_raw()` and `close()` clear the descriptor, and both consume the guard.
        self.fd.unwrap_or(-1)
    }

    /// Releases ownership of the descriptor without closing it.
    #[inline]
    pub fn into_raw(mut self) -> RawFd {
        self.fd.take().unwrap_or(-1)
    }

    /// Closes the descriptor, reporting any error.
    #[inline]
    pub fn close(mut self) -> io::Result<()> {
        match self.fd.take() {
            Some(fd) => self.streams.close(fd),
            None => Ok(()),
        }
    }
}

impl<S: Streams + ?Sized> Drop for StreamFd<'_, S> {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            match self.streams.close(fd) {
                Ok(()) => debug!(fd, "rolled back stream"),
                Err(e) => warn!(fd, error = %e, "failed to close stream during rollback"),
            }
        }
    }
}
