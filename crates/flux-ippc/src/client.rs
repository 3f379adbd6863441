//! Synchronous call bridge: `Client::connect` plus a dotted-name method
//! proxy that blocks the calling thread for exactly one request/response
//! round trip, built on [`Overwatch`].
//!
//! Rust has no `__getattr__`, so the dotted-name proxy the source builds by
//! intercepting arbitrary attribute access becomes an explicit builder:
//! `client.method("math").attr("add").call(args, kwargs)`.

use std::{
    cell::{Cell, RefCell},
    path::{Path, PathBuf},
    rc::Rc,
};

use serde_json::{Map, Value};
use tracing::warn;

use crate::{
    base_loop::{BaseLoop, Runnable, WatcherAction},
    codec::{self, Request, Response},
    connection::{ConnHandle, Connection},
    error::{ClientError, ConnectionError, RequestError},
    overwatch::{Overwatch, OverwatchHandle},
    socket::Stream,
};

type PendingResult = Rc<RefCell<Option<Result<Value, ClientError>>>>;

pub struct Client {
    overwatch: OverwatchHandle,
    conn: ConnHandle,
    result: PendingResult,
    closed: Rc<Cell<bool>>,
}

impl Client {
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, ConnectionError> {
        let stream = Stream::connect(path).map_err(ConnectionError::SocketFailure)?;

        let result: PendingResult = Rc::new(RefCell::new(None));
        let closed = Rc::new(Cell::new(false));
        // Tie the knot: `on_close` needs the overwatch handle to unblock a
        // pending call, but the handle doesn't exist until `Overwatch::new`
        // returns (which needs `on_close` already built).
        let overwatch_cell: Rc<RefCell<Option<OverwatchHandle>>> = Rc::new(RefCell::new(None));

        let on_close: Box<dyn FnOnce()> = {
            let result = Rc::clone(&result);
            let closed = Rc::clone(&closed);
            let overwatch_cell = Rc::clone(&overwatch_cell);
            Box::new(move || {
                closed.set(true);
                let mut r = result.borrow_mut();
                if r.is_none() {
                    *r = Some(Err(ClientError::Request(RequestError::new("connection closed"))));
                }
                drop(r);
                if let Some(ow) = overwatch_cell.borrow().as_ref() {
                    Overwatch::unblock(ow);
                }
            })
        };

        let (overwatch, conn) = Overwatch::new(stream, "client", Some(on_close)).map_err(ConnectionError::SocketFailure)?;
        *overwatch_cell.borrow_mut() = Some(Rc::clone(&overwatch));

        Ok(Self { overwatch, conn, result, closed })
    }

    pub fn connection(&self) -> ConnHandle {
        Rc::clone(&self.conn)
    }

    pub fn overwatch(&self) -> OverwatchHandle {
        Rc::clone(&self.overwatch)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn method(&self, name: &str) -> Attribute<'_> {
        Attribute { client: self, name: name.to_string() }
    }

    /// One request/response round trip, blocking the caller.
    pub fn call(&self, name: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value, ClientError> {
        if self.closed.get() {
            return Err(ClientError::Request(RequestError::new("connection already closed")));
        }

        *self.result.borrow_mut() = Some(Err(RequestError::new("request still in flight").into()));

        let req = Request { name: name.to_string(), args, kwargs };
        let framed = codec::encode_request(&req).map_err(|e| ClientError::Request(RequestError::new(e.to_string())))?;

        let result = Rc::clone(&self.result);
        let overwatch = Rc::clone(&self.overwatch);
        let wait_conn = Rc::clone(&self.conn);
        let write_result = Connection::write(
            &self.conn,
            framed,
            Some(Box::new(move |_conn| {
                wait(&wait_conn, result, overwatch);
                Ok(())
            })),
        );
        if let Err(e) = write_result {
            return Err(ClientError::Request(RequestError::new(e.to_string())));
        }

        Overwatch::block(&self.overwatch).map_err(|e| ClientError::Request(RequestError::new(e.to_string())))?;

        self.result
            .borrow_mut()
            .take()
            .unwrap_or_else(|| Err(ClientError::Request(RequestError::new("no response received"))))
    }
}

fn wait(conn: &ConnHandle, result: PendingResult, overwatch: OverwatchHandle) {
    let r = Rc::clone(&result);
    let ow = Rc::clone(&overwatch);
    if let Err(e) = Connection::read(conn, 1, Box::new(move |conn, len_byte| on_len(conn, len_byte, r, ow))) {
        finish(&result, Err(ClientError::Request(RequestError::new(e.to_string()))), &overwatch);
    }
}

fn on_len(conn: &ConnHandle, len_byte: Vec<u8>, result: PendingResult, overwatch: OverwatchHandle) -> Result<(), ConnectionError> {
    let l = len_byte[0] as usize;
    Connection::read(conn, l, Box::new(move |conn, size_bytes| on_size(conn, size_bytes, result, overwatch)))
}

fn on_size(conn: &ConnHandle, size_bytes: Vec<u8>, result: PendingResult, overwatch: OverwatchHandle) -> Result<(), ConnectionError> {
    let size = codec::parse_size(&size_bytes)?;
    if size == 0 {
        return on_payload(conn, Vec::new(), result, overwatch);
    }
    Connection::read(conn, size, Box::new(move |conn, payload| on_payload(conn, payload, result, overwatch)))
}

fn on_payload(_conn: &ConnHandle, payload: Vec<u8>, result: PendingResult, overwatch: OverwatchHandle) -> Result<(), ConnectionError> {
    let outcome = match codec::decode_response(&payload) {
        Ok(Response::Ok(v)) => Ok(v),
        Ok(Response::Err(e)) => Err(ClientError::Remote(e)),
        Err(e) => Err(ClientError::Request(RequestError::new(e.to_string()))),
    };
    finish(&result, outcome, &overwatch);
    Ok(())
}

fn finish(result: &PendingResult, outcome: Result<Value, ClientError>, overwatch: &OverwatchHandle) {
    *result.borrow_mut() = Some(outcome);
    Overwatch::unblock(overwatch);
}

/// Dotted-name method proxy: `client.method("math").attr("add").call(...)`
/// targets `"math.add"`, mirroring a nested attribute access chain.
pub struct Attribute<'a> {
    client: &'a Client,
    name: String,
}

impl<'a> Attribute<'a> {
    #[must_use]
    pub fn attr(mut self, name: &str) -> Self {
        self.name = format!("{}.{name}", self.name);
        self
    }

    pub fn call(self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value, ClientError> {
        self.client.call(&self.name, args, kwargs)
    }
}

/// Embeds a [`Client`] in a signal-aware [`BaseLoop`], so a long-lived
/// process can both issue blocking calls and notice SIGINT/SIGTERM or an
/// unexpected disconnect between them.
pub struct ClientLoop {
    path: PathBuf,
    client: Rc<RefCell<Option<Client>>>,
}

impl ClientLoop {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf(), client: Rc::new(RefCell::new(None)) }
    }

    pub fn client(&self) -> Rc<RefCell<Option<Client>>> {
        Rc::clone(&self.client)
    }

    pub fn run(mut self) -> Result<(), ConnectionError> {
        let base = BaseLoop::new().map_err(ConnectionError::SocketFailure)?;
        base.run(&mut self)
    }
}

impl Runnable for ClientLoop {
    fn starting(&mut self, loop_: &mut BaseLoop) -> Result<(), ConnectionError> {
        let client = Client::connect(&self.path)?;
        let token = loop_.alloc_token();
        Overwatch::arm(&client.overwatch, loop_.registry(), token).map_err(ConnectionError::SocketFailure)?;

        let overwatch = Rc::clone(&client.overwatch);
        let closed = Rc::clone(&client.closed);
        loop_.watch(
            token,
            Box::new(move |loop_, readable, _writable| {
                if readable {
                    Overwatch::on_outer_readable(&overwatch);
                }
                if closed.get() {
                    loop_.stop();
                    WatcherAction::Remove
                } else {
                    WatcherAction::Keep
                }
            }),
        );

        *self.client.borrow_mut() = Some(client);
        Ok(())
    }

    fn stopping(&mut self, _loop_: &mut BaseLoop) {
        if let Some(client) = self.client.borrow_mut().take() {
            Connection::close(&client.conn, false);
        } else {
            warn!("client loop stopping with no connected client");
        }
    }
}
