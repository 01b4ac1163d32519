//! Trellis: the remote-execution fabric of a distributed-SQL coordinator.
//!
//! A [`Session`] multiplexes one client session over many backend nodes
//! while preserving transactional semantics. The pieces compose the way a
//! statement flows: the locator picks target nodes, the pool client checks
//! out connection handles, a response combiner merges the backends' answers,
//! and the transaction coordinator drives two-phase commit across every
//! handle the session touched.

pub mod session;

pub use session::Session;
pub use trellis_combiner::{
    CombineKind, QueryPrelude, RemoteQuery, RequestKind, ResponseCombiner, ResponseEvent, Tuple,
    TupleComparator,
};
pub use trellis_errors::{FabricError, FabricResult, SqlState, TxnPhase};
pub use trellis_locator::{
    compute_modulo, create_locator, get_any_data_node, AccessIntent, Datum, DistributionPolicy,
    KeyType, Locator, Placement, RelationLocInfo,
};
pub use trellis_pool::{FabricOptions, PoolerClient, SetScope};
pub use trellis_wire::{
    CancelToken, ConnState, HandleKey, HandleSet, NodeHandle, NodeId, NodeRole, TransactionStatus,
};
pub use trellis_xact::{
    BarrierLock, InMemorySequencer, IsolationLevel, RemoteXact, Sequencer, XactStatus,
};
