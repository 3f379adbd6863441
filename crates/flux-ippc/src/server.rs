//! Accept loop and request dispatch.
//!
//! `ServerLoop::new` takes an optional root service (its methods registered
//! bare, unprefixed) plus any number of named services (registered under
//! `name.method`) and builds one flat [`DispatchTable`] up front. Each
//! accepted connection becomes a [`Peer`] whose handler looks a request's
//! `name` up in that table.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    path::{Path, PathBuf},
    rc::Rc,
    sync::Arc,
};

use mio::Token;
use tracing::{error, info, warn};

use crate::{
    base_loop::{BaseLoop, Runnable, WatcherAction},
    codec::{self, Response},
    connection::Connection,
    dispatch::{DispatchTable, Service},
    error::{ConnectionError, HandlerError, RemoteError},
    peer::{Peer, RequestHandler, RequestOutcome},
    socket::ServerSocket,
};

const LISTENER_TOKEN: Token = Token(usize::MAX);

struct ServerState {
    path: PathBuf,
    listener: Option<ServerSocket>,
    peers: HashMap<Token, Peer>,
}

pub struct ServerLoop {
    table: Rc<DispatchTable>,
    state: Rc<RefCell<ServerState>>,
    /// Set by a request handler that raised [`HandlerError::Critical`] (or
    /// hit a framing failure), checked by the peer watcher right after
    /// driving the connection so it can tear the whole loop down instead of
    /// just the one connection.
    critical: Rc<Cell<bool>>,
}

impl ServerLoop {
    /// `root` methods are exposed unprefixed; every `(name, service)` pair
    /// is additionally exposed under `name.method`.
    pub fn new(
        path: impl AsRef<Path>,
        root: Option<Arc<dyn Service>>,
        services: Vec<(&str, Arc<dyn Service>)>,
    ) -> Self {
        let mut table = DispatchTable::new();
        if let Some(root) = &root {
            table.register("", root);
        }
        for (name, service) in &services {
            table.register(name, service);
        }
        Self {
            table: Rc::new(table),
            state: Rc::new(RefCell::new(ServerState {
                path: path.as_ref().to_path_buf(),
                listener: None,
                peers: HashMap::new(),
            })),
            critical: Rc::new(Cell::new(false)),
        }
    }

    pub fn run(mut self) -> Result<(), ConnectionError> {
        let base = BaseLoop::new().map_err(ConnectionError::SocketFailure)?;
        base.run(&mut self)
    }
}

impl Runnable for ServerLoop {
    fn starting(&mut self, loop_: &mut BaseLoop) -> Result<(), ConnectionError> {
        let path = self.state.borrow().path.clone();
        let mut listener = ServerSocket::bind(&path).map_err(ConnectionError::SocketFailure)?;
        listener.register(loop_.registry(), LISTENER_TOKEN).map_err(ConnectionError::SocketFailure)?;
        self.state.borrow_mut().listener = Some(listener);

        loop_.watch(
            LISTENER_TOKEN,
            accept_watcher(Rc::clone(&self.table), Rc::clone(&self.state), Rc::clone(&self.critical)),
        );
        info!(path = %path.display(), "listening");
        Ok(())
    }

    fn stopping(&mut self, loop_: &mut BaseLoop) {
        let mut state = self.state.borrow_mut();
        for (token, peer) in state.peers.drain() {
            peer.close(false);
            loop_.unwatch(token);
        }
        if let Some(mut listener) = state.listener.take() {
            listener.close(loop_.registry());
        }
    }
}

fn accept_watcher(
    table: Rc<DispatchTable>,
    state: Rc<RefCell<ServerState>>,
    critical: Rc<Cell<bool>>,
) -> crate::base_loop::Watcher {
    Box::new(move |loop_, _readable, _writable| {
        loop {
            let accepted = {
                let st = state.borrow();
                let listener = st.listener.as_ref().expect("listener bound before accepts");
                listener.accept()
            };
            let (stream, addr) = match accepted {
                Ok(Some(pair)) => pair,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            };

            let token = loop_.alloc_token();
            let registry = match loop_.registry().try_clone() {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "could not clone registry for new peer");
                    continue;
                }
            };

            let handler: RequestHandler = {
                let table = Rc::clone(&table);
                let critical = Rc::clone(&critical);
                Rc::new(move |payload| dispatch(&table, payload, &critical))
            };
            let on_close: Box<dyn FnOnce()> = {
                let state = Rc::clone(&state);
                Box::new(move || {
                    state.borrow_mut().peers.remove(&token);
                })
            };

            match Peer::accept(stream, registry, token, handler, Some(on_close)) {
                Ok(peer) => {
                    loop_.watch(token, peer_watcher(token, Rc::clone(&state), Rc::clone(&critical)));
                    state.borrow_mut().peers.insert(token, peer);
                    info!(?addr, "peer connected");
                }
                Err(e) => warn!(error = %e, "could not accept connection"),
            }
        }
        WatcherAction::Keep
    })
}

fn peer_watcher(token: Token, state: Rc<RefCell<ServerState>>, critical: Rc<Cell<bool>>) -> crate::base_loop::Watcher {
    Box::new(move |loop_, readable, writable| {
        let conn = state.borrow().peers.get(&token).map(Peer::connection);
        let Some(conn) = conn else { return WatcherAction::Remove };

        if readable {
            Connection::on_readable(&conn);
        }
        if writable && !conn.borrow().closed() {
            Connection::on_writable(&conn);
        }

        if critical.get() {
            error!("critical error in request handler -> stopping server loop");
            loop_.stop();
        }

        if conn.borrow().closed() {
            state.borrow_mut().peers.remove(&token);
            WatcherAction::Remove
        } else {
            WatcherAction::Keep
        }
    })
}

/// Decodes a request, looks it up, and invokes it. A missing method or an
/// ordinary handler failure becomes a `RemoteError` response, same as any
/// other result -- the connection and the loop stay up. A request that
/// fails to decode, a handler raising [`HandlerError::Critical`], or a
/// response that fails to encode are all `FramingFailure`/`CriticalError`
/// territory: no response is sent, `critical` is set so the peer watcher
/// stops the whole server loop, and the connection is torn down (the caller
/// observes this as a lost connection, per [`crate::error::RequestError`]).
fn dispatch(table: &DispatchTable, payload: Vec<u8>, critical: &Cell<bool>) -> RequestOutcome {
    let request = match codec::decode_request(&payload) {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "framing failure decoding request");
            critical.set(true);
            return RequestOutcome::Critical;
        }
    };

    let response = match table.get(&request.name) {
        Some(method) => match method((request.args, request.kwargs)) {
            Ok(value) => Response::Ok(value),
            Err(HandlerError::Critical(msg)) => {
                error!(%msg, "critical error processing request");
                critical.set(true);
                return RequestOutcome::Critical;
            }
            Err(e @ HandlerError::Ordinary { .. }) => {
                warn!(error = %e, "request handler failed");
                Response::Err(e.into_remote())
            }
        },
        None => Response::Err(RemoteError::no_such_method(&request.name)),
    };

    match codec::encode_response(&response) {
        Ok(bytes) => RequestOutcome::Respond(bytes),
        Err(e) => {
            error!(error = %e, "framing failure encoding response");
            critical.set(true);
            RequestOutcome::Critical
        }
    }
}
