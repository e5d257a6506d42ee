// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Errors returned while acquiring, using or tearing down a TUN interface.

use std::io;

use thiserror::Error;

use crate::streams::MuxId;

/// Result type for TUN interface operations.
pub type Result<T> = std::result::Result<T, TunError>;

/// An error arising from a TUN interface.
///
/// Errors produced while the interface is being created identify the step that failed; every
/// descriptor opened before that step has already been closed by the time the error is
/// returned.
#[derive(Error, Debug)]
pub enum TunError {
    /// The requested interface name is not the supported base name.
    #[error("interface name must be '{expected}' (got '{name}')")]
    InvalidName {
        name: String,
        expected: &'static str,
    },

    /// A configuration value was rejected before any OS call was made.
    #[error("invalid configuration: {field} - {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: String,
    },

    #[error("could not open IP control device ({path})")]
    OpenIpControl {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("could not open TUN device ({path})")]
    OpenTun {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The TUN driver refused to allocate the given unit number for a reason other than it
    /// already being in use.
    #[error("could not allocate TUN unit {ppa}")]
    NewPpa {
        ppa: u32,
        #[source]
        source: io::Error,
    },

    /// Every unit number probed was already in use.
    #[error("no unused TUN unit found after {attempts} attempts")]
    PpaExhausted { attempts: u32 },

    #[error("could not open second TUN stream ({path})")]
    OpenLinkStream {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("could not push '{module}' module onto TUN stream")]
    PushModule {
        module: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("could not bind TUN stream to unit {ppa}")]
    SelectUnit {
        ppa: u32,
        #[source]
        source: io::Error,
    },

    #[error("could not link TUN stream under IP control device")]
    Link {
        #[source]
        source: io::Error,
    },

    #[error("could not register mux id {muxid} for interface {name}")]
    RegisterMuxId {
        name: String,
        muxid: MuxId,
        #[source]
        source: io::Error,
    },

    #[error("could not look up mux id for interface {name}")]
    LookupMuxId {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("could not unlink mux id {muxid} for interface {name}")]
    Unlink {
        name: String,
        muxid: MuxId,
        #[source]
        source: io::Error,
    },

    /// A packet offset pointed past the end of the supplied buffer.
    #[error("offset {offset} is out of bounds for a buffer of {len} bytes")]
    InvalidOffset { offset: usize, len: usize },

    /// Creating an interface from an inherited descriptor is not supported.
    #[error("creating a TUN interface from a file descriptor is not supported")]
    FromFileUnsupported,

    /// The interface has been closed.
    #[error("TUN interface is closed")]
    Closed,

    /// I/O error from the transport stream.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TunError {
    /// Returns the name of the creation step this error originated from, if any.
    pub fn failed_step(&self) -> Option<&'static str> {
        Some(match self {
            Self::InvalidName { .. } | Self::InvalidConfig { .. } => "validate",
            Self::OpenIpControl { .. } => "open-ip-control",
            Self::OpenTun { .. } => "open-tun",
            Self::NewPpa { .. } | Self::PpaExhausted { .. } => "new-ppa",
            Self::OpenLinkStream { .. } => "open-link-stream",
            Self::PushModule { .. } => "push-module",
            Self::SelectUnit { .. } => "select-unit",
            Self::Link { .. } => "link",
            Self::RegisterMuxId { .. } => "register-muxid",
            _ => return None,
        })
    }

    /// Returns `true` if this error was produced while acquiring the interface.
    #[must_use]
    pub fn is_acquisition_error(&self) -> bool {
        self.failed_step().is_some()
    }

    /// Returns `true` if this error was produced while tearing the interface down.
    #[must_use]
    pub const fn is_teardown_error(&self) -> bool {
        matches!(self, Self::LookupMuxId { .. } | Self::Unlink { .. })
    }

    /// The OS error underlying this error, if any.
    pub fn os_error(&self) -> Option<&io::Error> {
        match self {
            Self::OpenIpControl { source, .. }
            | Self::OpenTun { source, .. }
            | Self::NewPpa { source, .. }
            | Self::OpenLinkStream { source, .. }
            | Self::PushModule { source, .. }
            | Self::SelectUnit { source, .. }
            | Self::Link { source }
            | Self::RegisterMuxId { source, .. }
            | Self::LookupMuxId { source, .. }
            | Self::Unlink { source, .. }
            | Self::Io(source) => Some(source),
            _ => None,
        }
    }
}

impl From<TunError> for io::Error {
    fn from(err: TunError) -> Self {
        let kind = match err {
            TunError::Io(e) => return e,
            TunError::InvalidName { .. }
            | TunError::InvalidConfig { .. }
            | TunError::InvalidOffset { .. } => io::ErrorKind::InvalidInput,
            TunError::PpaExhausted { .. } => io::ErrorKind::AddrInUse,
            TunError::FromFileUnsupported => io::ErrorKind::Unsupported,
            TunError::Closed => io::ErrorKind::NotConnected,
            ref other => other
                .os_error()
                .map(io::Error::kind)
                .unwrap_or(io::ErrorKind::Other),
        };

        io::Error::new(kind, err)
    }
}
