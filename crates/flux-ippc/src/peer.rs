//! Server-side per-connection request loop.
//!
//! A `Peer` wraps one accepted connection and drives a fixed read chain --
//! length-of-length byte, size bytes, payload bytes -- handing the decoded
//! request to a handler and writing back whatever it returns before waiting
//! for the next request. Exactly one request is in flight per connection at
//! a time.

use std::rc::Rc;

use mio::{Registry, Token};
use tracing::warn;

use crate::{
    codec,
    connection::{ConnHandle, Connection},
    error::ConnectionError,
    socket::Stream,
};

/// What a [`RequestHandler`] decided for one request: either a framed
/// response ready to write back, or a signal that a [`crate::error::HandlerError::Critical`]
/// (or a framing failure) occurred and this connection must be torn down
/// without a response, so the caller sees connection loss rather than a
/// value -- the server-side half of "critical error propagates out of the
/// request handler".
pub enum RequestOutcome {
    Respond(Vec<u8>),
    Critical,
}

/// Invoked with the raw request payload, decides what happens next. An
/// ordinary handler failure is already encoded into `Respond`'s bytes as a
/// [`Response::Err`]; only a critical failure reaches here as `Critical`.
pub type RequestHandler = Rc<dyn Fn(Vec<u8>) -> RequestOutcome>;

pub struct Peer {
    conn: ConnHandle,
}

impl Peer {
    pub fn accept(
        socket: Stream,
        registry: Registry,
        token: Token,
        handler: RequestHandler,
        on_close: Option<Box<dyn FnOnce()>>,
    ) -> std::io::Result<Self> {
        let conn = Connection::new(socket, registry, token, "peer", on_close)?;
        wait(&conn, handler);
        Ok(Self { conn })
    }

    pub fn token(&self) -> Token {
        self.conn.borrow().token()
    }

    pub fn connection(&self) -> ConnHandle {
        Rc::clone(&self.conn)
    }

    pub fn closed(&self) -> bool {
        self.conn.borrow().closed()
    }

    pub fn close(&self, notify: bool) {
        Connection::close(&self.conn, notify);
    }
}

fn wait(conn: &ConnHandle, handler: RequestHandler) {
    let h = handler.clone();
    let result = Connection::read(
        conn,
        1,
        Box::new(move |conn, len_byte| on_len(conn, len_byte, h)),
    );
    if let Err(e) = result {
        warn!(error = %e, "peer: could not arm length read");
    }
}

fn on_len(conn: &ConnHandle, len_byte: Vec<u8>, handler: RequestHandler) -> Result<(), ConnectionError> {
    let l = len_byte[0] as usize;
    Connection::read(conn, l, Box::new(move |conn, size_bytes| on_size(conn, size_bytes, handler)))
}

fn on_size(conn: &ConnHandle, size_bytes: Vec<u8>, handler: RequestHandler) -> Result<(), ConnectionError> {
    let size = codec::parse_size(&size_bytes)?;
    if size == 0 {
        return on_request(conn, Vec::new(), handler);
    }
    Connection::read(conn, size, Box::new(move |conn, payload| on_request(conn, payload, handler)))
}

fn on_request(conn: &ConnHandle, payload: Vec<u8>, handler: RequestHandler) -> Result<(), ConnectionError> {
    match handler(payload) {
        RequestOutcome::Respond(response) => {
            let h = handler.clone();
            Connection::write(
                conn,
                response,
                Some(Box::new(move |conn| {
                    wait(conn, h);
                    Ok(())
                })),
            )
        }
        RequestOutcome::Critical => {
            Connection::close(conn, true);
            Ok(())
        }
    }
}
