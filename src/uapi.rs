// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Listener for the administrative control socket.
//!
//! A [`UapiListener`] takes ownership of an already-bound, listening socket and accepts
//! connections on a dedicated worker thread. Accepted connections and the worker's terminal
//! error are each handed over through a single-item slot:
//!
//! - The worker does not accept another connection until the previous one has been taken by
//!   [`accept()`](Listener::accept).
//! - The first accept error stops the worker for good; it is delivered once by `accept()`.
//!   Closing the listener is what causes that error.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{self, UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{io, mem, ptr, thread};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

/// A stream-oriented listener.
pub trait Listener {
    type Conn;
    type Addr;

    /// Waits for and returns the next connection.
    fn accept(&self) -> io::Result<Self::Conn>;

    /// Closes the listener.
    fn close(&self) -> io::Result<()>;

    /// Returns the local address the listener is bound to.
    fn addr(&self) -> io::Result<Self::Addr>;
}

/// A listening socket with a blocking `accept()`.
pub trait Acceptor: Send + Sync + 'static {
    type Conn: Send + 'static;
    type Addr;

    /// Blocks until a connection is received.
    fn accept(&self) -> io::Result<Self::Conn>;

    /// Stops the socket from accepting connections, causing any blocked or future
    /// [`accept()`](Self::accept) to fail.
    fn shutdown(&self) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<Self::Addr>;

    /// The filesystem path backing the socket, if any. It is removed when the listener closes.
    fn backing_path(&self) -> Option<PathBuf> {
        None
    }
}

#[inline]
fn shutdown_fd(fd: RawFd) -> io::Result<()> {
    match unsafe { libc::shutdown(fd, libc::SHUT_RDWR) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

impl Acceptor for UnixListener {
    type Conn = UnixStream;
    type Addr = net::SocketAddr;

    #[inline]
    fn accept(&self) -> io::Result<UnixStream> {
        UnixListener::accept(self).map(|(conn, _)| conn)
    }

    #[inline]
    fn shutdown(&self) -> io::Result<()> {
        shutdown_fd(self.as_raw_fd())
    }

    #[inline]
    fn local_addr(&self) -> io::Result<net::SocketAddr> {
        UnixListener::local_addr(self)
    }

    fn backing_path(&self) -> Option<PathBuf> {
        let addr = UnixListener::local_addr(self).ok()?;
        addr.as_pathname().map(Path::to_path_buf)
    }
}

impl Acceptor for TcpListener {
    type Conn = TcpStream;
    type Addr = SocketAddr;

    #[inline]
    fn accept(&self) -> io::Result<TcpStream> {
        TcpListener::accept(self).map(|(conn, _)| conn)
    }

    #[inline]
    fn shutdown(&self) -> io::Result<()> {
        shutdown_fd(self.as_raw_fd())
    }

    #[inline]
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

struct Slots<C> {
    conn: Option<C>,
    err: Option<io::Error>,
    closed: bool,
    // Set once the terminal error has been handed to a caller.
    drained: bool,
}

struct Shared<A: Acceptor> {
    acceptor: A,
    slots: Mutex<Slots<A::Conn>>,
    ready: Condvar,
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener is closed")
}

/// A [`Listener`] that accepts connections on a background thread.
pub struct UapiListener<A: Acceptor> {
    shared: Arc<Shared<A>>,
    unlink_path: Option<PathBuf>,
}

impl<A: Acceptor> UapiListener<A> {
    /// Wraps an already-listening socket and starts accepting connections on it.
    ///
    /// If the socket is bound to a filesystem path, that path is removed when the listener is
    /// closed.
    pub fn new(acceptor: A) -> io::Result<Self> {
        let unlink_path = acceptor.backing_path();

        let shared = Arc::new(Shared {
            acceptor,
            slots: Mutex::new(Slots {
                conn: None,
                err: None,
                closed: false,
                drained: false,
            }),
            ready: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name("uapi-accept".into())
            .spawn(move || Self::run(worker))?;

        Ok(Self {
            shared,
            unlink_path,
        })
    }

    fn run(shared: Arc<Shared<A>>) {
        debug!("control socket worker started");

        loop {
            {
                let mut slots = shared.slots.lock();
                while slots.conn.is_some() && !slots.closed {
                    shared.ready.wait(&mut slots);
                }
            }

            let res = shared.acceptor.accept();

            let mut slots = shared.slots.lock();
            match res {
                Ok(conn) => {
                    // A close that failed to shut the socket down can leave the slot occupied.
                    while slots.conn.is_some() && !slots.closed {
                        shared.ready.wait(&mut slots);
                    }

                    if slots.closed {
                        debug!("connection accepted after close, dropping it");
                        slots.err = Some(closed_error());
                        shared.ready.notify_all();
                        break;
                    }

                    slots.conn = Some(conn);
                    shared.ready.notify_all();
                }
                Err(e) => {
                    debug!(error = %e, "control socket worker stopping");
                    slots.err = Some(e);
                    shared.ready.notify_all();
                    break;
                }
            }
        }
    }

    /// Returns `true` until the listener has been closed.
    pub fn is_active(&self) -> bool {
        !self.shared.slots.lock().closed
    }
}

impl<A: Acceptor> Listener for UapiListener<A> {
    type Conn = A::Conn;
    type Addr = A::Addr;

    /// Waits for the next connection accepted by the worker.
    ///
    /// After the listener is closed, pending connections are still returned and the worker's
    /// terminal error is returned exactly once. Unlike a listener whose consumer blocks forever
    /// once that error is drained, every later call here fails immediately with
    /// [`io::ErrorKind::NotConnected`]; only the first error comes from the socket.
    fn accept(&self) -> io::Result<A::Conn> {
        let mut slots = self.shared.slots.lock();

        loop {
            if let Some(conn) = slots.conn.take() {
                self.shared.ready.notify_all();
                return Ok(conn);
            }

            if let Some(err) = slots.err.take() {
                slots.drained = true;
                return Err(err);
            }

            if slots.drained {
                return Err(closed_error());
            }

            self.shared.ready.wait(&mut slots);
        }
    }

    /// Stops the worker and removes the socket's backing file, if any.
    ///
    /// If the socket cannot be shut down, the error is returned and the listener stays active,
    /// so `close()` can be retried.
    fn close(&self) -> io::Result<()> {
        {
            let mut slots = self.shared.slots.lock();
            if mem::replace(&mut slots.closed, true) {
                return Ok(());
            }
            self.shared.ready.notify_all();
        }

        if let Some(path) = &self.unlink_path {
            match std::fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), error = %e, "failed to remove control socket")
                }
                _ => (),
            }
        }

        if let Err(e) = self.shared.acceptor.shutdown() {
            self.shared.slots.lock().closed = false;
            return Err(e);
        }

        Ok(())
    }

    #[inline]
    fn addr(&self) -> io::Result<A::Addr> {
        self.shared.acceptor.local_addr()
    }
}

impl<A: Acceptor> Drop for UapiListener<A> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close control socket listener");
        }
    }
}

/// Wraps an inherited descriptor of a bound, listening Unix socket.
///
/// # Errors
///
/// Returns [`InvalidInput`](io::ErrorKind::InvalidInput) if `fd` is not a listening socket.
pub fn listen(fd: OwnedFd) -> io::Result<UapiListener<UnixListener>> {
    let mut accepting: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;

    if unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            ptr::addr_of_mut!(accepting) as *mut libc::c_void,
            ptr::addr_of_mut!(len),
        )
    } != 0
    {
        return Err(io::Error::last_os_error());
    }

    if accepting == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptor is not a listening socket",
        ));
    }

    UapiListener::new(UnixListener::from(fd))
}
