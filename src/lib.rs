// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! TUN interfaces and control-socket listeners for STREAMS-based systems (illumos/Solaris).
//!
//! [`NativeTun`] plumbs a TUN interface the way `ifconfig` does: it allocates a unit from the
//! TUN driver, pushes the IP module onto a second stream bound to that unit, and persistently
//! links that stream beneath the IP multiplexor. Creation is transactional; if any step fails,
//! everything done so far is undone before the error is returned.
//!
//! [`UapiListener`] serves the administrative control socket, accepting connections on a
//! background thread and handing them out one at a time.
//!
//! ## Examples
//!
//! To create a TUN interface and begin receiving packets from it:
//!
//! ```no_run
//! # #[cfg(any(target_os = "illumos", target_os = "solaris"))]
//! # fn create_tun() -> streams_tun::Result<()> {
//! use streams_tun::{Device, Tun};
//!
//! // The OS picks the unit number (`tun0`, `tun1`, ...)
//! let mut tun = Tun::create("tun", 1420)?;
//! println!("created {}", tun.name());
//!
//! let mut recv_buf = [0; 65536];
//! for _ in 0..10 {
//!     let amount = tun.read(&mut recv_buf, 0)?;
//!     println!("Received packet: {:?}", &recv_buf[..amount]);
//! }
//!
//! // Unlinks the interface from IP and closes its streams
//! tun.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! The control socket is typically created by the parent process and passed down:
//!
//! ```no_run
//! # #[cfg(unix)]
//! # fn serve(fd: std::os::fd::OwnedFd) -> std::io::Result<()> {
//! use streams_tun::uapi::{self, Listener};
//!
//! let listener = uapi::listen(fd)?;
//! while let Ok(conn) = listener.accept() {
//!     // Handle the connection...
//!     drop(conn);
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub mod illumos;
#[cfg(unix)]
pub mod streams;
#[cfg(unix)]
pub mod uapi;

#[cfg(unix)]
mod error;
#[cfg(unix)]
mod libc_extra;
#[cfg(unix)]
mod tun;

#[cfg(unix)]
pub use error::{Result, TunError};
#[cfg(unix)]
pub use streams::{MuxId, Streams};
#[cfg(unix)]
pub use tun::{
    NativeTun, TunConfig, DEFAULT_IP_NODE, DEFAULT_MAX_PPA_ATTEMPTS, DEFAULT_TUN_NODE,
    TUN_BASE_NAME,
};
#[cfg(unix)]
pub use uapi::{listen, Acceptor, Listener, UapiListener};

/// A TUN interface backed by the operating system's STREAMS drivers.
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub type Tun = NativeTun<illumos::SysStreams>;

#[cfg(unix)]
use std::os::fd::RawFd;
#[cfg(unix)]
use std::sync::mpsc::Receiver;

/// A change in the state of a TUN interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// The interface is up.
    Up,
    /// The interface is down.
    Down,
    /// The interface's MTU changed.
    MtuUpdate,
}

/// A network-layer packet device.
#[cfg(unix)]
pub trait Device {
    /// The name the operating system assigned to the interface.
    fn name(&self) -> &str;

    /// The underlying TUN descriptor, or `None` once the device is closed.
    fn file(&self) -> Option<RawFd>;

    /// Takes the receiving end of the device's event queue.
    ///
    /// Only the first call returns `Some`. The queue is disconnected once the device is closed.
    fn events(&self) -> Option<Receiver<Event>>;

    /// The configured MTU of the device.
    fn mtu(&self) -> Result<usize>;

    /// Receives a single packet into `buf[offset..]`, returning the number of bytes received.
    fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize>;

    /// Sends `buf[offset..]` as a single packet.
    fn write(&self, buf: &[u8], offset: usize) -> Result<usize>;

    fn flush(&self) -> Result<()>;

    /// Tears the device down. Closing an already-closed device succeeds.
    fn close(&mut self) -> Result<()>;
}
