//! Dotted-name dispatch table.
//!
//! A request name like `"math.add"` or bare `"ping"` is looked up in a flat
//! `HashMap`; the dotted prefix is just a string convention imposed by
//! [`ServerLoop::new`](crate::server::ServerLoop::new) when it registers a
//! named service, not structure the table itself understands.

use std::{collections::HashMap, sync::Arc};

use serde_json::{Map, Value};

use crate::error::HandlerError;

/// Positional args, then keyword args, exactly as they arrived over the wire.
pub type Args = (Vec<Value>, Map<String, Value>);

/// A dispatchable method: takes the call arguments, returns the encoded
/// result or a [`HandlerError`].
pub type Method = Arc<dyn Fn(Args) -> Result<Value, HandlerError> + Send + Sync>;

/// Implemented by `#[flux_ippc_derive::service]`-annotated types: yields the
/// `(name, method)` pairs its `#[public]` methods expose.
///
/// `self: Arc<Self>` rather than `&Arc<Self>`: a by-reference `Arc` receiver
/// isn't `DispatchFromDyn`-compatible, so `dyn Service` wouldn't be object
/// safe with one. By-value `Arc<Self>` is a dispatchable receiver and is all
/// this needs -- the one call site just clones the `Arc` it already holds.
pub trait Service {
    fn dispatch_entries(self: Arc<Self>) -> Vec<(String, Method)>;
}

#[derive(Default)]
pub struct DispatchTable {
    methods: HashMap<String, Method>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every entry a service exposes under `prefix.name`, or bare
    /// `name` when `prefix` is empty (the root service). Later registrations
    /// for the same full name win, mirroring a plain dict update.
    pub fn register(&mut self, prefix: &str, service: &Arc<dyn Service>) {
        for (name, method) in Arc::clone(service).dispatch_entries() {
            let full_name = if prefix.is_empty() { name } else { format!("{prefix}.{name}") };
            self.methods.insert(full_name, method);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
