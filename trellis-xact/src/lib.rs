//! Distributed transaction coordinator: tracks which backends a session has
//! read from or written to, and drives commit, two-phase where required,
//! and abort across all of them.
//!
//! All state lives in the per-session [`RemoteXact`]; nothing here is a
//! process global (two sessions in one process share only the
//! [`BarrierLock`]). The driver half (begin broadcast, 2PC, abort) is in
//! [`driver`]; this module owns the state machine and the bookkeeping
//! rules.

use tracing::warn;
use trellis_errors::{internal_err, FabricError, FabricResult};
use trellis_wire::{HandleKey, NodeId};

pub mod barrier;
pub mod driver;
pub mod sequencer;

pub use barrier::BarrierLock;
pub use sequencer::{InMemorySequencer, PreparedRecord, Sequencer};

/// Longest gid the backend accepts.
pub const MAX_GID_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Session-wide distributed transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XactStatus {
    /// No distributed transaction work yet (or reset after one finished).
    #[default]
    None,
    PrepareFailed,
    Prepared,
    CommitFailed,
    /// Some nodes committed, some did not: in-doubt, registered externally.
    PartCommitted,
    Committed,
    AbortFailed,
    PartAborted,
    Aborted,
}

/// Per-node progress through the commit/abort protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeXactStatus {
    #[default]
    None,
    PrepareSent,
    PrepareFailed,
    Prepared,
    CommitSent,
    CommitFailed,
    Committed,
    AbortSent,
    AbortFailed,
    Aborted,
}

/// One backend participating in the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XactNode {
    pub key: HandleKey,
    pub node: NodeId,
    pub status: NodeXactStatus,
}

/// The distributed transaction state of one session.
#[derive(Debug, Default)]
pub struct RemoteXact {
    session_id: u32,
    status: XactStatus,
    /// Writers, in first-write order. Send order during commit and abort
    /// follows this, then the readers, to keep partial-failure analysis
    /// reproducible.
    write_nodes: Vec<XactNode>,
    read_nodes: Vec<XactNode>,
    gxid: Option<u64>,
    timestamp: Option<u64>,
    prepare_gid: Option<String>,
    commit_xid: Option<u64>,
    /// The coordinator's own storage participated and was prepared locally.
    prepared_local: bool,
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

impl RemoteXact {
    pub fn new(session_id: u32) -> RemoteXact {
        RemoteXact {
            session_id,
            ..RemoteXact::default()
        }
    }

    pub fn status(&self) -> XactStatus {
        self.status
    }

    pub fn gxid(&self) -> Option<u64> {
        self.gxid
    }

    pub fn prepare_gid(&self) -> Option<&str> {
        self.prepare_gid.as_deref()
    }

    pub fn commit_xid(&self) -> Option<u64> {
        self.commit_xid
    }

    pub fn prepared_local(&self) -> bool {
        self.prepared_local
    }

    pub fn set_prepared_local(&mut self, prepared: bool) {
        self.prepared_local = prepared;
    }

    pub fn write_nodes(&self) -> &[XactNode] {
        &self.write_nodes
    }

    pub fn read_nodes(&self) -> &[XactNode] {
        &self.read_nodes
    }

    /// Whether any backend has been touched this transaction.
    pub fn is_active(&self) -> bool {
        !self.write_nodes.is_empty() || !self.read_nodes.is_empty()
    }

    /// Track that a statement acquired `key` for reading or writing. A node
    /// is on exactly one of the two lists; a read node that is later written
    /// is promoted, never the other way around.
    pub fn register_transaction_node(&mut self, key: HandleKey, node: NodeId, writing: bool) {
        let in_write = self.write_nodes.iter().any(|n| n.key == key);
        if writing {
            if in_write {
                return;
            }
            let entry = match self.read_nodes.iter().position(|n| n.key == key) {
                Some(pos) => self.read_nodes.remove(pos),
                None => XactNode {
                    key,
                    node,
                    status: NodeXactStatus::None,
                },
            };
            self.write_nodes.push(entry);
        } else if !in_write && !self.read_nodes.iter().any(|n| n.key == key) {
            self.read_nodes.push(XactNode {
                key,
                node,
                status: NodeXactStatus::None,
            });
        }
    }

    /// The 2PC decision table. Temp objects cannot survive a prepare, so
    /// their presence forces a direct commit regardless of writer count.
    pub fn is_2pc_required(&self, local_writes: bool, temp_objects_used: bool) -> bool {
        if temp_objects_used {
            if !self.write_nodes.is_empty() {
                warn!(
                    session = self.session_id,
                    writers = self.write_nodes.len(),
                    "session uses temp objects; committing without 2PC"
                );
            }
            return false;
        }
        match self.write_nodes.len() {
            0 => false,
            1 => local_writes,
            _ => true,
        }
    }

    /// Session-unique identifier for the prepared transaction.
    pub fn make_gid(&self) -> FabricResult<String> {
        let gxid = self
            .gxid
            .ok_or_else(|| internal_err!("cannot build a gid before a gxid is assigned"))?;
        let gid = format!("t{}_{}", self.session_id, gxid);
        if gid.len() > MAX_GID_LEN {
            return Err(FabricError::Config(format!(
                "prepared transaction gid exceeds {MAX_GID_LEN} bytes"
            )));
        }
        Ok(gid)
    }

    /// Forget the finished transaction so the session can start another.
    /// Terminal in-doubt state is preserved in the external registry, not
    /// here.
    pub fn reset(&mut self) {
        self.status = XactStatus::None;
        self.write_nodes.clear();
        self.read_nodes.clear();
        self.gxid = None;
        self.timestamp = None;
        self.prepare_gid = None;
        self.commit_xid = None;
        self.prepared_local = false;
    }
}
