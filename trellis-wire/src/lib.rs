//! Wire-level primitives for talking to PostgreSQL-speaking backend nodes:
//! v3 message framing over non-blocking sockets, the growable buffers behind
//! it, and the [`NodeHandle`] that owns one backend connection.
//!
//! Nothing in this crate knows about distribution policies or transactions;
//! it moves framed bytes and tracks per-connection protocol state. The
//! response combiner and the transaction coordinator both drive handles
//! through the API here.

pub mod buffer;
pub mod cancel;
pub mod handle;
pub mod messages;

pub use buffer::WireBuffer;
pub use cancel::CancelToken;
pub use handle::{
    CombinerId, ConnState, HandleKey, HandleSet, NodeHandle, NodeId, NodeRole, TransactionStatus,
};
pub use messages::{
    BackendMessage, FieldDescription, FrontendMessage, SnapshotData, CANCEL_REQUEST_CODE,
};
