//! Session-side client for the connection pool manager.
//!
//! The pool manager itself is a separate worker process; this crate covers
//! its *contract* with the execution fabric: registration, connection
//! checkout with fd passing, release, out-of-band cancel, SET forwarding,
//! and the administrative abort/clean calls. It also owns the fabric's
//! configuration surface, since every option the fabric recognizes exists to
//! tell the pooler where the backends are.

pub mod client;
pub mod config;
pub mod fd;
pub mod protocol;

pub use client::PoolerClient;
pub use config::{pooler_socket_path, FabricOptions};
pub use protocol::{PoolReply, PoolRequest, SetScope};
