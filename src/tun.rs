// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::RawFd;
use std::sync::mpsc::{self, Receiver, SyncSender};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, TunError};
use crate::streams::{MuxId, StreamFd, Streams};
use crate::{Device, Event};

/// The only interface name that may be requested; the OS appends the allocated unit number.
pub const TUN_BASE_NAME: &str = "tun";

/// The IP multiplexing driver that TUN streams are linked beneath.
pub const DEFAULT_IP_NODE: &str = "/dev/udp";

/// The TUN driver.
pub const DEFAULT_TUN_NODE: &str = "/dev/tun";

/// The number of unit numbers probed before giving up.
pub const DEFAULT_MAX_PPA_ATTEMPTS: u32 = 128;

const EVENT_QUEUE_LEN: usize = 10;

const IP_MODULE: &str = "ip";

/// Parameters for creating a [`NativeTun`].
#[derive(Clone, Debug)]
pub struct TunConfig {
    /// Requested interface name; must be [`TUN_BASE_NAME`].
    pub name: String,
    /// MTU reported by the interface. It is not applied to the OS interface.
    pub mtu: usize,
    /// Path to the IP multiplexing device.
    pub ip_node: String,
    /// Path to the TUN device.
    pub tun_node: String,
    /// How many unit numbers to probe (starting at 0) before failing.
    pub max_ppa_attempts: u32,
}

impl TunConfig {
    pub fn new(name: impl Into<String>, mtu: usize) -> Self {
        Self {
            name: name.into(),
            mtu,
            ip_node: DEFAULT_IP_NODE.into(),
            tun_node: DEFAULT_TUN_NODE.into(),
            max_ppa_attempts: DEFAULT_MAX_PPA_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_ip_node(mut self, path: impl Into<String>) -> Self {
        self.ip_node = path.into();
        self
    }

    #[must_use]
    pub fn with_tun_node(mut self, path: impl Into<String>) -> Self {
        self.tun_node = path.into();
        self
    }

    #[must_use]
    pub const fn with_max_ppa_attempts(mut self, attempts: u32) -> Self {
        self.max_ppa_attempts = attempts;
        self
    }

    /// Checks the configuration without performing any OS calls.
    pub fn validate(&self) -> Result<()> {
        if self.name != TUN_BASE_NAME {
            return Err(TunError::InvalidName {
                name: self.name.clone(),
                expected: TUN_BASE_NAME,
            });
        }

        if self.max_ppa_attempts == 0 {
            return Err(TunError::InvalidConfig {
                field: "max_ppa_attempts",
                reason: "at least one unit number must be probed".into(),
            });
        }

        node_path("ip_node", &self.ip_node)?;
        node_path("tun_node", &self.tun_node)?;
        Ok(())
    }
}

impl Default for TunConfig {
    fn default() -> Self {
        Self::new(TUN_BASE_NAME, 1500)
    }
}

fn node_path(field: &'static str, path: &str) -> Result<CString> {
    CString::new(path).map_err(|_| TunError::InvalidConfig {
        field,
        reason: format!("device path {:?} contains a NUL byte", path),
    })
}

/// Descriptors and identifiers of a fully plumbed interface.
struct Plumbed {
    ip_fd: RawFd,
    tun_fd: RawFd,
    name: String,
    unit: u32,
    muxid: MuxId,
}

/// A TUN interface plumbed into the IP stack of a STREAMS-based system.
///
/// The interface holds two streams: the TUN stream that packets are read from and written to,
/// and a stream to the IP multiplexing driver that the interface's IP stream is persistently
/// linked beneath. [`close()`](Self::close) removes that link and closes both streams; it is
/// also run when the interface is dropped.
///
/// `read()` and `write()` may be called concurrently from different threads (typically one
/// reader and one writer); no further ordering is imposed beyond that of the TUN stream itself.
pub struct NativeTun<S: Streams> {
    streams: S,
    tun_fd: Option<RawFd>,
    ip_fd: Option<RawFd>,
    name: String,
    unit: u32,
    // Not applied to the OS interface.
    mtu: usize,
    events_tx: Option<SyncSender<Event>>,
    events: Mutex<Option<Receiver<Event>>>,
    // Single-slot error queue consumed by `read()`. Only `close()` fills it today, and a read
    // after close would fail with `Closed` anyway; the slot is kept so errors detected outside
    // the read path are delivered the same way as in other `Device` backends.
    pending_error: Mutex<Option<TunError>>,
}

#[cfg(any(target_os = "illumos", target_os = "solaris"))]
impl NativeTun<crate::illumos::SysStreams> {
    /// Creates a new TUN interface.
    ///
    /// `name` must be `"tun"`; the interface is named by the OS as `"tun"` followed by the
    /// allocated unit number (e.g. `tun0`).
    pub fn create(name: &str, mtu: usize) -> Result<Self> {
        Self::create_with(crate::illumos::SysStreams, TunConfig::new(name, mtu))
    }

    /// Reconstructs a TUN interface from an inherited TUN descriptor.
    ///
    /// The unit number attached to a TUN descriptor cannot be recovered, so this always fails
    /// with [`TunError::FromFileUnsupported`].
    pub fn from_file(file: File, mtu: usize) -> Result<Self> {
        Self::from_file_with(crate::illumos::SysStreams, file, mtu)
    }
}

impl<S: Streams> NativeTun<S> {
    /// Creates a new TUN interface using the given STREAMS primitives.
    ///
    /// Either the interface is returned fully plumbed, or every stream opened along the way has
    /// been closed and any link made has been removed.
    ///
    /// An [`Event::Up`] is queued before the interface is returned.
    pub fn create_with(streams: S, config: TunConfig) -> Result<Self> {
        config.validate()?;

        let plumbed = Self::plumb(&streams, &config)?;
        info!(
            name = %plumbed.name,
            unit = plumbed.unit,
            muxid = plumbed.muxid,
            "created TUN interface"
        );

        let (events_tx, events) = mpsc::sync_channel(EVENT_QUEUE_LEN);
        // The queue was just created, so it has room.
        if events_tx.try_send(Event::Up).is_err() {
            warn!(name = %plumbed.name, "could not queue link up event");
        }

        Ok(Self {
            streams,
            tun_fd: Some(plumbed.tun_fd),
            ip_fd: Some(plumbed.ip_fd),
            name: plumbed.name,
            unit: plumbed.unit,
            mtu: config.mtu,
            events_tx: Some(events_tx),
            events: Mutex::new(Some(events)),
            pending_error: Mutex::new(None),
        })
    }

    /// Reconstructs a TUN interface from an inherited TUN descriptor.
    ///
    /// Always fails with [`TunError::FromFileUnsupported`].
    pub fn from_file_with(_streams: S, _file: File, _mtu: usize) -> Result<Self> {
        Err(TunError::FromFileUnsupported)
    }

    fn plumb(streams: &S, config: &TunConfig) -> Result<Plumbed> {
        let ip_node = node_path("ip_node", &config.ip_node)?;
        let tun_node = node_path("tun_node", &config.tun_node)?;

        let ip = StreamFd::open(streams, &ip_node).map_err(|source| TunError::OpenIpControl {
            path: config.ip_node.clone(),
            source,
        })?;

        let tun = StreamFd::open(streams, &tun_node).map_err(|source| TunError::OpenTun {
            path: config.tun_node.clone(),
            source,
        })?;

        let unit = Self::new_ppa(streams, tun.raw(), config.max_ppa_attempts)?;
        let name = format!("{}{}", TUN_BASE_NAME, unit);
        debug!(unit, name = %name, "allocated TUN unit");

        // The IP module is pushed onto a separate stream; `tun` stays free for packet I/O.
        let if_stream =
            StreamFd::open(streams, &tun_node).map_err(|source| TunError::OpenLinkStream {
                path: config.tun_node.clone(),
                source,
            })?;

        let module = node_path("module", IP_MODULE)?;
        streams
            .push_module(if_stream.raw(), &module)
            .map_err(|source| TunError::PushModule {
                module: IP_MODULE,
                source,
            })?;

        streams
            .select_unit(if_stream.raw(), unit)
            .map_err(|source| TunError::SelectUnit { ppa: unit, source })?;

        let muxid = streams
            .link(ip.raw(), if_stream.raw())
            .map_err(|source| TunError::Link { source })?;
        debug!(muxid, "linked IP stream");

        // The persistent link holds the stream open in the kernel.
        if let Err(e) = if_stream.close() {
            warn!(error = %e, "failed to close linked TUN stream");
        }

        if let Err(source) = streams.set_muxid(ip.raw(), &name, muxid) {
            if let Err(e) = streams.unlink(ip.raw(), muxid) {
                warn!(muxid, error = %e, "failed to unlink IP stream during rollback");
            }

            return Err(TunError::RegisterMuxId {
                name,
                muxid,
                source,
            });
        }

        Ok(Plumbed {
            tun_fd: tun.into_raw(),
            ip_fd: ip.into_raw(),
            name,
            unit,
            muxid,
        })
    }

    /// Allocates the lowest free unit number below `max_attempts`.
    fn new_ppa(streams: &S, fd: RawFd, max_attempts: u32) -> Result<u32> {
        for ppa in 0..max_attempts {
            match streams.new_ppa(fd, ppa) {
                Ok(unit) => return Ok(unit),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    debug!(ppa, "TUN unit in use");
                    continue;
                }
                Err(source) => return Err(TunError::NewPpa { ppa, source }),
            }
        }

        Err(TunError::PpaExhausted {
            attempts: max_attempts,
        })
    }

    /// The OS-assigned interface name (e.g. `tun0`).
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The unit number (PPA) allocated to the interface.
    #[inline]
    pub fn unit(&self) -> u32 {
        self.unit
    }

    /// The MTU the interface was created with.
    ///
    /// This value is not applied to or read from the OS interface.
    #[inline]
    pub fn mtu(&self) -> Result<usize> {
        Ok(self.mtu)
    }

    /// The descriptor of the TUN stream, or `None` once the interface has been closed.
    #[inline]
    pub fn file(&self) -> Option<RawFd> {
        self.tun_fd
    }

    /// Takes the receiving end of the interface's event queue.
    ///
    /// The receiver can only be taken once; later calls return `None`. After the interface is
    /// closed the receiver reports disconnection once any queued events have been drained.
    pub fn events(&self) -> Option<Receiver<Event>> {
        self.events.lock().take()
    }

    /// Reads a single packet into `buf[offset..]`, returning the number of bytes received.
    ///
    /// An error queued for the interface (e.g. by [`close()`](Self::close)) is returned first,
    /// without touching the TUN stream.
    pub fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        if let Some(err) = self.pending_error.lock().take() {
            return Err(err);
        }

        let fd = self.tun_fd.ok_or(TunError::Closed)?;
        let len = buf.len();
        let buf = buf
            .get_mut(offset..)
            .ok_or(TunError::InvalidOffset { offset, len })?;

        Ok(self.streams.recv_msg(fd, buf)?)
    }

    /// Writes `buf[offset..]` as a single packet.
    ///
    /// Messages are never partially written, so on success the full length of `buf` is
    /// returned.
    pub fn write(&self, buf: &[u8], offset: usize) -> Result<usize> {
        let fd = self.tun_fd.ok_or(TunError::Closed)?;
        let packet = buf.get(offset..).ok_or(TunError::InvalidOffset {
            offset,
            len: buf.len(),
        })?;

        self.streams.send_msg(fd, packet)?;
        Ok(buf.len())
    }

    /// Does nothing; packets are written individually.
    #[inline]
    pub fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Unplumbs the interface and closes its streams.
    ///
    /// The IP link is looked up and removed before the IP control stream is closed. If either
    /// fails, the error is returned and the remaining teardown is skipped; calling `close()`
    /// again resumes from that point. Once teardown has completed, further calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        if let Some(ip_fd) = self.ip_fd {
            let muxid =
                self.streams
                    .muxid(ip_fd, &self.name)
                    .map_err(|source| TunError::LookupMuxId {
                        name: self.name.clone(),
                        source,
                    })?;

            self.streams
                .unlink(ip_fd, muxid)
                .map_err(|source| TunError::Unlink {
                    name: self.name.clone(),
                    muxid,
                    source,
                })?;

            if let Err(e) = self.streams.close(ip_fd) {
                warn!(name = %self.name, error = %e, "failed to close IP control stream");
            }
            self.ip_fd = None;
            debug!(name = %self.name, muxid, "unlinked IP stream");
        }

        if let Some(tun_fd) = self.tun_fd.take() {
            if let Err(e) = self.streams.close(tun_fd) {
                warn!(name = %self.name, error = %e, "failed to close TUN stream");
            }

            let pending = self.pending_error.get_mut();
            if pending.is_none() {
                *pending = Some(TunError::Closed);
            }
            info!(name = %self.name, "closed TUN interface");
        }

        // Dropping the sender disconnects the event queue.
        self.events_tx.take();

        Ok(())
    }
}

impl<S: Streams> Device for NativeTun<S> {
    #[inline]
    fn name(&self) -> &str {
        NativeTun::name(self)
    }

    #[inline]
    fn file(&self) -> Option<RawFd> {
        NativeTun::file(self)
    }

    #[inline]
    fn events(&self) -> Option<Receiver<Event>> {
        NativeTun::events(self)
    }

    #[inline]
    fn mtu(&self) -> Result<usize> {
        NativeTun::mtu(self)
    }

    #[inline]
    fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        NativeTun::read(self, buf, offset)
    }

    #[inline]
    fn write(&self, buf: &[u8], offset: usize) -> Result<usize> {
        NativeTun::write(self, buf, offset)
    }

    #[inline]
    fn flush(&self) -> Result<()> {
        NativeTun::flush(self)
    }

    #[inline]
    fn close(&mut self) -> Result<()> {
        NativeTun::close(self)
    }
}

impl<S: Streams> Drop for NativeTun<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(name = %self.name, error = %e, "failed to tear down TUN interface");
        }
    }
}
