//! A connection that can synchronously block the caller for one request
//! while still running as an ordinary readiness-driven connection the rest
//! of the time.
//!
//! The connection's actual reader/writer live on a private, second `Poll`
//! owned by this `Overwatch`. The outer loop normally only watches the same
//! file descriptor read-only, via a second, independent epoll registration
//! of the raw fd (`SourceFd`) -- so it notices if the peer sends something
//! unprompted or closes while no call is in flight. `block()` disarms that
//! outer watch and pumps the private `Poll` in a tight loop until `unblock()`
//! (called from a callback invoked by that very pump) asks it to stop, then
//! rearms the outer watch. This is the nested-event-loop trick that lets a
//! callback-based connection be driven synchronously from an otherwise
//! async caller, without threads.

use std::{cell::RefCell, os::fd::RawFd, rc::Rc};

use mio::{Events, Interest, Poll, Registry, Token, unix::SourceFd};

use crate::{
    connection::{ConnHandle, Connection},
    error::ConnectionError,
    socket::Stream,
};

/// Token used for the connection's reader/writer on the private inner poll.
/// The inner poll only ever has this one source registered, so any fixed
/// value works.
const CONN_TOKEN: Token = Token(0);

pub type OverwatchHandle = Rc<RefCell<Overwatch>>;

pub struct Overwatch {
    conn: ConnHandle,
    inner_poll: Poll,
    blocked: bool,
    raw_fd: RawFd,
    outer: Option<(Registry, Token)>,
}

impl Overwatch {
    /// Builds the connection on a fresh private poll. Returns both the
    /// overwatch handle and the connection handle it owns -- callers drive
    /// I/O through the latter and blocking through the former.
    pub fn new(
        socket: Stream,
        label: &'static str,
        on_close: Option<Box<dyn FnOnce()>>,
    ) -> std::io::Result<(OverwatchHandle, ConnHandle)> {
        use std::os::fd::AsRawFd;

        let raw_fd = socket.as_raw_fd();
        let inner_poll = Poll::new()?;
        let inner_registry = inner_poll.registry().try_clone()?;
        let conn = Connection::new(socket, inner_registry, CONN_TOKEN, label, on_close)?;
        let overwatch = Rc::new(RefCell::new(Self {
            conn: Rc::clone(&conn),
            inner_poll,
            blocked: false,
            raw_fd,
            outer: None,
        }));
        Ok((overwatch, conn))
    }

    /// Registers the outer, read-only watch. Call once, after the connection
    /// is handed to a [`crate::base_loop::BaseLoop`].
    pub fn arm(handle: &OverwatchHandle, outer_registry: &Registry, outer_token: Token) -> std::io::Result<()> {
        let mut ow = handle.borrow_mut();
        outer_registry.register(&mut SourceFd(&ow.raw_fd), outer_token, Interest::READABLE)?;
        ow.outer = Some((outer_registry.try_clone()?, outer_token));
        Ok(())
    }

    fn disarm(ow: &mut Overwatch) {
        if let Some((registry, _)) = ow.outer.take() {
            let _ = registry.deregister(&mut SourceFd(&ow.raw_fd));
        }
    }

    /// The outer loop saw read-readiness on the watched fd while not
    /// blocked: route it straight through the connection's normal handling.
    pub fn on_outer_readable(handle: &OverwatchHandle) {
        let conn = Rc::clone(&handle.borrow().conn);
        Connection::on_readable(&conn);
    }

    /// Disarms the outer watch and pumps the private poll until a callback
    /// invoked from within it calls [`Overwatch::unblock`]. Rearms the outer
    /// watch before returning.
    pub fn block(handle: &OverwatchHandle) -> Result<(), ConnectionError> {
        let outer = {
            let mut ow = handle.borrow_mut();
            let outer = ow.outer.take();
            if let Some((registry, _)) = &outer {
                let _ = registry.deregister(&mut SourceFd(&ow.raw_fd));
            }
            ow.blocked = true;
            outer
        };

        let mut events = Events::with_capacity(4);
        loop {
            if !handle.borrow().blocked {
                break;
            }
            {
                let mut ow = handle.borrow_mut();
                ow.inner_poll.poll(&mut events, None).map_err(ConnectionError::SocketFailure)?;
            }
            let ready: Vec<(bool, bool)> = events.iter().map(|e| (e.is_readable(), e.is_writable())).collect();
            for (readable, writable) in ready {
                if readable {
                    let conn = Rc::clone(&handle.borrow().conn);
                    Connection::on_readable(&conn);
                }
                if !handle.borrow().blocked {
                    break;
                }
                if writable {
                    let conn = Rc::clone(&handle.borrow().conn);
                    Connection::on_writable(&conn);
                }
                if !handle.borrow().blocked {
                    break;
                }
            }
        }

        if let Some((registry, token)) = outer {
            let mut ow = handle.borrow_mut();
            let _ = registry.register(&mut SourceFd(&ow.raw_fd), token, Interest::READABLE);
            ow.outer = Some((registry, token));
        }
        Ok(())
    }

    pub fn unblock(handle: &OverwatchHandle) {
        handle.borrow_mut().blocked = false;
    }

    pub fn connection(handle: &OverwatchHandle) -> ConnHandle {
        Rc::clone(&handle.borrow().conn)
    }
}

impl Drop for Overwatch {
    fn drop(&mut self) {
        Self::disarm(self);
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, io::Write};

    use super::*;
    use crate::socket::Stream;

    /// While a call is blocked, the outer loop must have no readiness
    /// subscription on the client socket (spec.md invariant 7).
    #[test]
    fn outer_watch_disarmed_while_blocked_and_rearmed_after() {
        let (a, mut b) = mio::net::UnixStream::pair().expect("socketpair");
        let (ow, conn) = Overwatch::new(Stream::from_raw(a), "test", None).expect("overwatch");

        let outer_poll = Poll::new().expect("outer poll");
        let outer_registry = outer_poll.registry().try_clone().expect("clone registry");
        Overwatch::arm(&ow, &outer_registry, Token(7)).expect("arm");
        assert!(ow.borrow().outer.is_some(), "outer watch should start armed");

        // Already sitting in the kernel buffer, so the inner poll sees it on
        // the very first tick -- no second thread needed.
        b.write_all(&[0xAB]).expect("write reply");

        let seen_armed_while_blocked = Rc::new(Cell::new(true));
        let seen = Rc::clone(&seen_armed_while_blocked);
        let ow_for_cb = Rc::clone(&ow);
        Connection::read(
            &conn,
            1,
            Box::new(move |_conn, _bytes| {
                seen.set(ow_for_cb.borrow().outer.is_some());
                Overwatch::unblock(&ow_for_cb);
                Ok(())
            }),
        )
        .expect("read");

        Overwatch::block(&ow).expect("block");

        assert!(!seen_armed_while_blocked.get(), "outer watch must be disarmed while blocked");
        assert!(ow.borrow().outer.is_some(), "outer watch must be rearmed once block() returns");
    }
}
