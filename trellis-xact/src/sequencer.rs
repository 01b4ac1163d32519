//! The external sequencer (xid/timestamp oracle and prepared-transaction
//! registry) as seen by the coordinator.
//!
//! The wire transport to the real sequencer belongs to whatever deployment
//! embeds this fabric; the coordinator only needs the call surface below.
//! The in-memory implementation backs tests and single-process setups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use trellis_errors::FabricResult;

/// Registry entry for a prepared (possibly in-doubt) transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRecord {
    /// The transaction's gxid.
    pub xid: u64,
    /// The auxiliary xid under which the prepare was driven.
    pub prepare_xid: u64,
    /// Comma-separated node list still involved in the transaction.
    pub node_list: String,
}

/// Monotonic id/timestamp allocation plus prepared-transaction bookkeeping.
///
/// A transaction registered with [`start_prepared`] continues to appear
/// in-progress to snapshots until [`finish_prepared`] or [`rollback`]
/// resolves it; that is what keeps partially committed transactions
/// invisible until an operator (or recovery) settles them.
///
/// [`start_prepared`]: Sequencer::start_prepared
/// [`finish_prepared`]: Sequencer::finish_prepared
/// [`rollback`]: Sequencer::rollback
#[async_trait]
pub trait Sequencer: Send + Sync {
    async fn new_xid(&self) -> FabricResult<u64>;

    async fn new_timestamp(&self) -> FabricResult<u64>;

    /// Record `gid` as prepared under `xid` on the listed nodes. Re-recording
    /// the same gid replaces the node list (used to narrow the record to the
    /// in-doubt subset after a partial commit).
    async fn start_prepared(&self, xid: u64, gid: &str, node_list: &str) -> FabricResult<()>;

    /// The prepared transaction fully committed; drop it from the registry.
    async fn finish_prepared(&self, xid: u64) -> FabricResult<()>;

    /// The transaction rolled back; drop any prepared record.
    async fn rollback(&self, xid: u64) -> FabricResult<()>;

    /// Commit a prepared transaction under a fresh final xid.
    async fn commit_prepared(&self, prepare_xid: u64, final_xid: u64) -> FabricResult<()>;

    async fn lookup_gid(&self, gid: &str) -> FabricResult<Option<PreparedRecord>>;
}

/// Process-local sequencer for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemorySequencer {
    next_xid: AtomicU64,
    next_timestamp: AtomicU64,
    prepared: Mutex<HashMap<String, PreparedRecord>>,
}

impl InMemorySequencer {
    pub fn new() -> InMemorySequencer {
        InMemorySequencer {
            next_xid: AtomicU64::new(100),
            next_timestamp: AtomicU64::new(1),
            prepared: Mutex::default(),
        }
    }

    /// Number of unresolved prepared transactions.
    pub fn in_doubt_count(&self) -> usize {
        self.prepared.lock().len()
    }
}

#[async_trait]
impl Sequencer for InMemorySequencer {
    async fn new_xid(&self) -> FabricResult<u64> {
        Ok(self.next_xid.fetch_add(1, Ordering::Relaxed))
    }

    async fn new_timestamp(&self) -> FabricResult<u64> {
        Ok(self.next_timestamp.fetch_add(1, Ordering::Relaxed))
    }

    async fn start_prepared(&self, xid: u64, gid: &str, node_list: &str) -> FabricResult<()> {
        self.prepared.lock().insert(
            gid.to_owned(),
            PreparedRecord {
                xid,
                prepare_xid: xid,
                node_list: node_list.to_owned(),
            },
        );
        Ok(())
    }

    async fn finish_prepared(&self, xid: u64) -> FabricResult<()> {
        self.prepared.lock().retain(|_, rec| rec.xid != xid);
        Ok(())
    }

    async fn rollback(&self, xid: u64) -> FabricResult<()> {
        self.prepared.lock().retain(|_, rec| rec.xid != xid);
        Ok(())
    }

    async fn commit_prepared(&self, prepare_xid: u64, _final_xid: u64) -> FabricResult<()> {
        self.prepared
            .lock()
            .retain(|_, rec| rec.prepare_xid != prepare_xid);
        Ok(())
    }

    async fn lookup_gid(&self, gid: &str) -> FabricResult<Option<PreparedRecord>> {
        Ok(self.prepared.lock().get(gid).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn xids_are_monotone() {
        let seq = InMemorySequencer::new();
        let a = seq.new_xid().await.unwrap();
        let b = seq.new_xid().await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn prepared_records_resolve() {
        let seq = InMemorySequencer::new();
        seq.start_prepared(7, "t1_7", "1,2,3").await.unwrap();
        assert_eq!(
            seq.lookup_gid("t1_7").await.unwrap().unwrap().node_list,
            "1,2,3"
        );

        // narrowing to the in-doubt subset replaces the record
        seq.start_prepared(7, "t1_7", "2").await.unwrap();
        assert_eq!(seq.lookup_gid("t1_7").await.unwrap().unwrap().node_list, "2");

        seq.finish_prepared(7).await.unwrap();
        assert_eq!(seq.lookup_gid("t1_7").await.unwrap(), None);
        assert_eq!(seq.in_doubt_count(), 0);
    }
}
