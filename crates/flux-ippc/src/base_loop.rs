//! Event loop lifecycle shared by [`crate::server::ServerLoop`] and
//! [`crate::client::ClientLoop`].
//!
//! Owns the single outer `mio::Poll`, a token-keyed table of readiness
//! callbacks (the generalization of the source's reflected-over
//! `__watcher__`-tagged methods -- callbacks are registered explicitly here
//! rather than discovered by introspection, since Rust has no runtime
//! reflection), and SIGINT/SIGTERM/SIGQUIT handling. Signals are delivered
//! through `signal_hook::flag` into an `AtomicUsize` and polled once per
//! tick rather than woken via a dedicated signal watcher, since mio has no
//! direct signal-fd integration on its own; the poll timeout bounds how
//! quickly a signal is noticed.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use mio::{Events, Poll, Registry, Token};
use signal_hook::{
    consts::{SIGINT, SIGQUIT, SIGTERM},
    flag as signal_flag,
};
use tracing::{debug, info};

use crate::error::ConnectionError;

/// How often the poll loop wakes up even with nothing readable, to notice a
/// delivered signal or an externally requested stop.
const TICK: Duration = Duration::from_millis(100);

/// Whether a watcher should stay registered after handling one readiness
/// event.
pub enum WatcherAction {
    Keep,
    Remove,
}

/// A readiness callback gets the loop back (to allocate tokens, register
/// further watchers, or request a stop) alongside the readability it fired
/// for.
pub type Watcher = Box<dyn FnMut(&mut BaseLoop, bool, bool) -> WatcherAction>;

/// Hooks a loop owner implements. `starting` runs once before the first
/// tick (the source's one-shot `prepare` watcher); `stopping` runs once,
/// before watchers are torn down, to let the owner release its own
/// resources (closing peers, the client connection, ...).
pub trait Runnable {
    fn starting(&mut self, loop_: &mut BaseLoop) -> Result<(), ConnectionError>;
    fn stopping(&mut self, loop_: &mut BaseLoop);
}

pub struct BaseLoop {
    poll: Poll,
    events: Events,
    watchers: HashMap<Token, Watcher>,
    next_token: usize,
    stop_flag: Arc<AtomicUsize>,
    stop_requested: bool,
}

impl BaseLoop {
    pub fn new() -> std::io::Result<Self> {
        let stop_flag = Arc::new(AtomicUsize::new(0));
        signal_flag::register_usize(SIGTERM, Arc::clone(&stop_flag), SIGTERM as usize)?;
        signal_flag::register_usize(SIGINT, Arc::clone(&stop_flag), SIGINT as usize)?;
        signal_flag::register_usize(SIGQUIT, Arc::clone(&stop_flag), SIGQUIT as usize)?;
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(128),
            watchers: HashMap::new(),
            next_token: 0,
            stop_flag,
            stop_requested: false,
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Hands out a fresh token for a connection or listening socket to
    /// register under.
    pub fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Registers a readiness callback for `token`. The caller is responsible
    /// for having registered the matching I/O source with [`Self::registry`]
    /// under the same token.
    pub fn watch(&mut self, token: Token, cb: Watcher) {
        self.watchers.insert(token, cb);
    }

    pub fn unwatch(&mut self, token: Token) {
        self.watchers.remove(&token);
    }

    /// Requests shutdown. Idempotent; safe to call from inside a watcher
    /// callback.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    fn signalled(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed) != 0
    }

    /// `setup()` + `start()` from the source's `BaseLoop`, folded into one
    /// call: runs `starting`, pumps ticks until stopped, then runs
    /// `stopping`.
    pub fn run(mut self, app: &mut dyn Runnable) -> Result<(), ConnectionError> {
        app.starting(&mut self)?;

        while !self.stop_requested && !self.signalled() {
            self.poll.poll(&mut self.events, Some(TICK)).map_err(ConnectionError::SocketFailure)?;
            let ready: Vec<(Token, bool, bool)> =
                self.events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();
            for (token, readable, writable) in ready {
                let Some(mut cb) = self.watchers.remove(&token) else { continue };
                match cb(&mut self, readable, writable) {
                    WatcherAction::Keep => {
                        self.watchers.insert(token, cb);
                    }
                    WatcherAction::Remove => {}
                }
                if self.stop_requested {
                    break;
                }
            }
        }

        if self.signalled() {
            info!("signal received, shutting down");
        }
        debug!("stopping...");
        app.stopping(&mut self);
        self.watchers.clear();
        debug!("stopped");
        Ok(())
    }
}
