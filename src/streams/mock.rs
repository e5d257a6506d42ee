// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! In-memory [`Streams`] for exercising interface plumbing without the kernel TUN driver.
//!
//! Every descriptor handed out is tracked, so tests can check that nothing leaks or is closed
//! twice. Any single step can be scripted to fail.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::RawFd;

use parking_lot::Mutex;

use super::{MuxId, Streams};

pub(crate) fn path(p: &str) -> CString {
    CString::new(p).unwrap()
}

/// A STREAMS call that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    OpenIpControl,
    OpenTun,
    NewPpa,
    OpenLinkStream,
    PushModule,
    SelectUnit,
    Link,
    SetMuxId,
    GetMuxId,
    Unlink,
    Close,
    Recv,
    Send,
}

#[derive(Default)]
struct State {
    next_fd: RawFd,
    next_muxid: MuxId,
    open: BTreeMap<RawFd, CString>,
    closed: Vec<RawFd>,
    tun_opens: usize,
    failing: Option<Step>,
    ppa_conflicts: u32,
    ppa_attempts: Vec<u32>,
    modules: Vec<(RawFd, String)>,
    units: Vec<(RawFd, u32)>,
    links: BTreeMap<MuxId, RawFd>,
    unlinked: Vec<MuxId>,
    names: BTreeMap<String, MuxId>,
    inbound: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
}

pub(crate) struct MockStreams {
    state: Mutex<State>,
}

impl MockStreams {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_fd: 3,
                next_muxid: 100,
                ..Default::default()
            }),
        }
    }

    /// Makes every subsequent call for `step` fail with `EIO`.
    pub fn fail_at(&self, step: Step) {
        self.state.lock().failing = Some(step);
    }

    pub fn clear_failure(&self) {
        self.state.lock().failing = None;
    }

    /// Makes the first `count` unit allocations fail with `EEXIST`.
    pub fn ppa_conflicts(&self, count: u32) {
        self.state.lock().ppa_conflicts = count;
    }

    pub fn ppa_attempts(&self) -> Vec<u32> {
        self.state.lock().ppa_attempts.clone()
    }

    pub fn is_open(&self, fd: RawFd) -> bool {
        self.state.lock().open.contains_key(&fd)
    }

    pub fn open_fds(&self) -> BTreeSet<RawFd> {
        self.state.lock().open.keys().copied().collect()
    }

    pub fn closed_fds(&self) -> Vec<RawFd> {
        self.state.lock().closed.clone()
    }

    pub fn modules(&self) -> Vec<(RawFd, String)> {
        self.state.lock().modules.clone()
    }

    pub fn units(&self) -> Vec<(RawFd, u32)> {
        self.state.lock().units.clone()
    }

    pub fn links(&self) -> BTreeMap<MuxId, RawFd> {
        self.state.lock().links.clone()
    }

    pub fn unlinked(&self) -> Vec<MuxId> {
        self.state.lock().unlinked.clone()
    }

    pub fn registered(&self, name: &str) -> Option<MuxId> {
        self.state.lock().names.get(name).copied()
    }

    pub fn inject_packet(&self, packet: &[u8]) {
        self.state.lock().inbound.push_back(packet.to_vec());
    }

    pub fn sent_packets(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    fn check(state: &State, step: Step) -> io::Result<()> {
        match state.failing {
            Some(s) if s == step => Err(io::Error::from_raw_os_error(libc::EIO)),
            _ => Ok(()),
        }
    }

    fn check_fd(state: &State, fd: RawFd) -> io::Result<()> {
        match state.open.contains_key(&fd) {
            true => Ok(()),
            false => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }
}

impl Streams for MockStreams {
    fn open(&self, path: &CStr) -> io::Result<RawFd> {
        let mut state = self.state.lock();

        let step = match path.to_bytes() {
            b"/dev/udp" => Step::OpenIpControl,
            _ if state.tun_opens == 0 => Step::OpenTun,
            _ => Step::OpenLinkStream,
        };
        Self::check(&state, step)?;

        if step != Step::OpenIpControl {
            state.tun_opens += 1;
        }

        let fd = state.next_fd;
        state.next_fd += 1;
        state.open.insert(fd, path.to_owned());
        Ok(fd)
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.lock();
        Self::check(&state, Step::Close)?;
        Self::check_fd(&state, fd)?;

        state.open.remove(&fd);
        state.closed.push(fd);
        Ok(())
    }

    fn new_ppa(&self, fd: RawFd, ppa: u32) -> io::Result<u32> {
        let mut state = self.state.lock();
        Self::check_fd(&state, fd)?;
        state.ppa_attempts.push(ppa);
        Self::check(&state, Step::NewPpa)?;

        if state.ppa_conflicts > 0 {
            state.ppa_conflicts -= 1;
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }

        Ok(ppa)
    }

    fn push_module(&self, fd: RawFd, module: &CStr) -> io::Result<()> {
        let mut state = self.state.lock();
        Self::check_fd(&state, fd)?;
        Self::check(&state, Step::PushModule)?;

        let module = module.to_string_lossy().into_owned();
        state.modules.push((fd, module));
        Ok(())
    }

    fn select_unit(&self, fd: RawFd, ppa: u32) -> io::Result<()> {
        let mut state = self.state.lock();
        Self::check_fd(&state, fd)?;
        Self::check(&state, Step::SelectUnit)?;

        state.units.push((fd, ppa));
        Ok(())
    }

    fn link(&self, ctl_fd: RawFd, fd: RawFd) -> io::Result<MuxId> {
        let mut state = self.state.lock();
        Self::check_fd(&state, ctl_fd)?;
        Self::check_fd(&state, fd)?;
        Self::check(&state, Step::Link)?;

        let muxid = state.next_muxid;
        state.next_muxid += 1;
        state.links.insert(muxid, fd);
        Ok(muxid)
    }

    fn unlink(&self, ctl_fd: RawFd, muxid: MuxId) -> io::Result<()> {
        let mut state = self.state.lock();
        Self::check_fd(&state, ctl_fd)?;
        Self::check(&state, Step::Unlink)?;

        if state.links.remove(&muxid).is_none() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        state.names.retain(|_, id| *id != muxid);
        state.unlinked.push(muxid);
        Ok(())
    }

    fn muxid(&self, ctl_fd: RawFd, name: &str) -> io::Result<MuxId> {
        let state = self.state.lock();
        Self::check_fd(&state, ctl_fd)?;
        Self::check(&state, Step::GetMuxId)?;

        state
            .names
            .get(name)
            .copied()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENXIO))
    }

    fn set_muxid(&self, ctl_fd: RawFd, name: &str, muxid: MuxId) -> io::Result<()> {
        let mut state = self.state.lock();
        Self::check_fd(&state, ctl_fd)?;
        Self::check(&state, Step::SetMuxId)?;

        state.names.insert(name.to_owned(), muxid);
        Ok(())
    }

    fn recv_msg(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        Self::check_fd(&state, fd)?;
        Self::check(&state, Step::Recv)?;

        // Never block: an empty queue behaves like a non-blocking stream.
        let packet = state
            .inbound
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    fn send_msg(&self, fd: RawFd, buf: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        Self::check_fd(&state, fd)?;
        Self::check(&state, Step::Send)?;

        state.sent.push(buf.to_vec());
        Ok(())
    }
}
