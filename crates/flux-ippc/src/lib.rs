//! Inter-process procedure call runtime: a framed connection state machine,
//! a synchronous client bridge over it, and dotted-name RPC dispatch, all
//! over local stream sockets.
//!
//! - [`connection`] -- non-blocking read/write task queue over one socket.
//! - [`overwatch`] -- lets a connection block the caller for one request
//!   while still readiness-driven the rest of the time.
//! - [`codec`] / [`socket`] -- wire framing and the transport it runs over.
//! - [`dispatch`] -- the `#[flux_ippc_derive::service]`-built method table.
//! - [`peer`] / [`server`] -- server-side accept loop and per-connection
//!   request/response cycle.
//! - [`client`] -- `Client::connect` plus the dotted-name call proxy.
//! - [`base_loop`] -- the signal-aware event loop [`server::ServerLoop`] and
//!   [`client::ClientLoop`] both run on.

pub mod base_loop;
pub mod client;
pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod overwatch;
pub mod peer;
pub mod server;
pub mod socket;

pub use flux_ippc_derive::service;
