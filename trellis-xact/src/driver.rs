//! The transaction driver: BEGIN broadcast, the two-phase commit protocol,
//! and the abort path.
//!
//! Send order is deterministic (writers in insertion order, then readers)
//! so a partial failure always implicates a reproducible prefix. Errors
//! during PREPARE raise (normal abort handling still applies); errors after
//! the first COMMIT was sent never raise as fatal: the transaction is
//! registered in-doubt and control returns to the abort path, which only
//! logs.

use tracing::{debug, error, info, warn};
use trellis_combiner::{
    clean_all_handles, CombineKind, QueryPrelude, RemoteQuery, ResponseCombiner,
};
use trellis_errors::{FabricError, FabricResult, SqlState, TxnPhase};
use trellis_wire::{
    BackendMessage, ConnState, FrontendMessage, HandleKey, HandleSet, NodeHandle, SnapshotData,
};

use crate::barrier::BarrierLock;
use crate::sequencer::Sequencer;
use crate::{NodeXactStatus, RemoteXact, XactStatus};

/// Which list a participant sits on, for deterministic traversal.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Write,
    Read,
}

impl RemoteXact {
    async fn ensure_gxid(&mut self, seq: &impl Sequencer) -> FabricResult<u64> {
        if let Some(gxid) = self.gxid {
            return Ok(gxid);
        }
        let gxid = seq.new_xid().await?;
        self.gxid = Some(gxid);
        Ok(gxid)
    }

    async fn ensure_timestamp(&mut self, seq: &impl Sequencer) -> FabricResult<u64> {
        if let Some(ts) = self.timestamp {
            return Ok(ts);
        }
        let ts = seq.new_timestamp().await?;
        self.timestamp = Some(ts);
        Ok(ts)
    }

    /// The per-statement prelude: gxid, snapshot timestamp, and a snapshot
    /// bounded by the transaction's own gxid (concurrent-transaction lists
    /// come from the oracle in deployments that use one).
    pub fn query_prelude(&self) -> QueryPrelude {
        let snapshot = self.gxid.map(|gxid| SnapshotData {
            xmin: gxid,
            xmax: gxid,
            active: Vec::new(),
        });
        QueryPrelude {
            gxid: self.gxid,
            snapshot,
            timestamp: self.timestamp,
            command_id: None,
        }
    }

    /// Start the transaction on every handle that is not already in one:
    /// gxid, snapshot timestamp, and `START TRANSACTION` with the session's
    /// isolation level. Also registers every key on the read or write list.
    pub async fn begin(
        &mut self,
        handles: &mut HandleSet,
        keys: &[HandleKey],
        writing: bool,
        seq: &impl Sequencer,
    ) -> FabricResult<()> {
        let gxid = self.ensure_gxid(seq).await?;
        let timestamp = self.ensure_timestamp(seq).await?;

        let mut fresh = Vec::new();
        for &key in keys {
            let handle = handles.expect_mut(key)?;
            if !handle.in_transaction() {
                fresh.push(key);
            }
            let node = handle.node_id();
            self.register_transaction_node(key, node, writing);
        }
        if fresh.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "START TRANSACTION ISOLATION LEVEL {} {}",
            self.isolation.as_sql(),
            if self.read_only { "READ ONLY" } else { "READ WRITE" },
        );
        debug!(gxid, nodes = fresh.len(), "beginning transaction on backends");
        let mut combiner = ResponseCombiner::new(fresh.len(), CombineKind::None);
        let prelude = QueryPrelude {
            gxid: Some(gxid),
            snapshot: None,
            timestamp: Some(timestamp),
            command_id: None,
        };
        combiner
            .dispatch(handles, &fresh, &RemoteQuery::Simple { sql }, &prelude)
            .await?;
        combiner.receive_loop(handles).await.map_err(|e| {
            FabricError::Txn {
                phase: TxnPhase::Begin,
                failed_nodes: fresh
                    .iter()
                    .filter_map(|&k| handles.get(k).map(|h| h.node_id().0))
                    .collect(),
                message: e.to_string(),
            }
        })
    }

    /// Commit the distributed transaction: single-phase when the decision
    /// table allows it, two-phase otherwise. Holds the barrier-shared lock
    /// for the whole commit window.
    pub async fn commit(
        &mut self,
        handles: &mut HandleSet,
        seq: &impl Sequencer,
        local_writes: bool,
        temp_objects_used: bool,
    ) -> FabricResult<()> {
        if !self.is_active() {
            self.status = XactStatus::Committed;
            return Ok(());
        }
        let two_phase = self.is_2pc_required(local_writes, temp_objects_used);

        // a concurrent barrier-exclusive request must not interleave within
        // the commit window
        let _window = BarrierLock::global().share().await;
        if two_phase {
            self.commit_two_phase(handles, seq).await
        } else {
            self.commit_direct(handles).await
        }
    }

    async fn commit_direct(&mut self, handles: &mut HandleSet) -> FabricResult<()> {
        let participants = self.participants();
        let mut sent = Vec::new();
        for (side, idx) in participants {
            let entry = self.entry(side, idx);
            let Some(handle) = handles.get_mut(entry.key) else {
                continue;
            };
            if handle.state() == ConnState::ErrorFatal || !handle.in_transaction() {
                continue;
            }
            match send_command(handle, None, "COMMIT TRANSACTION").await {
                Ok(()) => {
                    self.entry_mut(side, idx).status = NodeXactStatus::CommitSent;
                    sent.push((side, idx));
                }
                Err(e) => {
                    warn!(node = entry.node.0, error = %e, "failed to send commit");
                    self.entry_mut(side, idx).status = NodeXactStatus::CommitFailed;
                }
            }
        }

        let mut failed = Vec::new();
        for (side, idx) in sent {
            let key = self.entry(side, idx).key;
            let handle = handles.expect_mut(key)?;
            match collect_result(handle).await {
                Ok(()) => self.entry_mut(side, idx).status = NodeXactStatus::Committed,
                Err(e) => {
                    let node = self.entry(side, idx).node;
                    warn!(node = node.0, error = %e, "direct commit failed");
                    self.entry_mut(side, idx).status = NodeXactStatus::CommitFailed;
                }
            }
        }
        failed.extend(
            self.write_nodes
                .iter()
                .chain(self.read_nodes.iter())
                .filter(|n| n.status == NodeXactStatus::CommitFailed)
                .map(|n| n.node.0),
        );

        if failed.is_empty() {
            self.status = XactStatus::Committed;
            Ok(())
        } else {
            self.status = XactStatus::CommitFailed;
            Err(FabricError::Txn {
                phase: TxnPhase::Commit,
                failed_nodes: failed,
                message: "commit failed on some nodes".into(),
            })
        }
    }

    async fn commit_two_phase(
        &mut self,
        handles: &mut HandleSet,
        seq: &impl Sequencer,
    ) -> FabricResult<()> {
        let gxid = self.ensure_gxid(seq).await?;
        let gid = self.make_gid()?;
        self.prepare_gid = Some(gid.clone());

        // ---- prepare phase: every writer, insertion order
        let prepare_sql = format!("PREPARE TRANSACTION '{gid}'");
        let mut sent = Vec::new();
        for idx in 0..self.write_nodes.len() {
            let entry = self.write_nodes[idx];
            let Some(handle) = handles.get_mut(entry.key) else {
                self.write_nodes[idx].status = NodeXactStatus::PrepareFailed;
                continue;
            };
            if handle.state() == ConnState::ErrorFatal {
                self.write_nodes[idx].status = NodeXactStatus::PrepareFailed;
                continue;
            }
            match send_command(handle, None, &prepare_sql).await {
                Ok(()) => {
                    self.write_nodes[idx].status = NodeXactStatus::PrepareSent;
                    sent.push(idx);
                }
                Err(e) => {
                    warn!(node = entry.node.0, error = %e, "failed to send prepare");
                    self.write_nodes[idx].status = NodeXactStatus::PrepareFailed;
                }
            }
        }
        for idx in sent {
            let key = self.write_nodes[idx].key;
            let handle = handles.expect_mut(key)?;
            match collect_result(handle).await {
                Ok(()) => self.write_nodes[idx].status = NodeXactStatus::Prepared,
                Err(e) => {
                    warn!(node = self.write_nodes[idx].node.0, error = %e, "prepare failed");
                    self.write_nodes[idx].status = NodeXactStatus::PrepareFailed;
                }
            }
        }

        let failed: Vec<u32> = self
            .write_nodes
            .iter()
            .filter(|n| n.status == NodeXactStatus::PrepareFailed)
            .map(|n| n.node.0)
            .collect();
        if !failed.is_empty() {
            self.status = XactStatus::PrepareFailed;
            return Err(FabricError::Txn {
                phase: TxnPhase::Prepare,
                failed_nodes: failed,
                message: format!("prepare of '{gid}' failed"),
            });
        }
        self.status = XactStatus::Prepared;

        // the transaction must stay visible as in-progress until resolved
        let node_csv = csv(self.write_nodes.iter().map(|n| n.node.0));
        seq.start_prepared(gxid, &gid, &node_csv).await?;

        // ---- commit phase: fresh auxiliary xid, unless the local prepare
        // already owns one
        let commit_xid = match (self.prepared_local, self.commit_xid) {
            (true, Some(xid)) => xid,
            _ => seq.new_xid().await?,
        };
        self.commit_xid = Some(commit_xid);

        let commit_prepared_sql = format!("COMMIT PREPARED '{gid}'");
        let mut sent = Vec::new();
        for (side, idx) in self.participants() {
            let entry = self.entry(side, idx);
            let Some(handle) = handles.get_mut(entry.key) else {
                continue;
            };
            if handle.state() == ConnState::ErrorFatal {
                if side == Side::Write {
                    self.entry_mut(side, idx).status = NodeXactStatus::CommitFailed;
                }
                continue;
            }
            let result = if entry.status == NodeXactStatus::Prepared {
                send_command(handle, Some(commit_xid), &commit_prepared_sql).await
            } else if handle.in_transaction() {
                send_command(handle, None, "COMMIT TRANSACTION").await
            } else {
                continue;
            };
            match result {
                Ok(()) => {
                    self.entry_mut(side, idx).status = NodeXactStatus::CommitSent;
                    sent.push((side, idx));
                }
                Err(e) => {
                    warn!(node = entry.node.0, error = %e, "failed to send commit");
                    self.entry_mut(side, idx).status = NodeXactStatus::CommitFailed;
                }
            }
        }

        let mut committed = 0usize;
        for &(side, idx) in &sent {
            let key = self.entry(side, idx).key;
            let handle = handles.expect_mut(key)?;
            match collect_result(handle).await {
                Ok(()) => {
                    self.entry_mut(side, idx).status = NodeXactStatus::Committed;
                    committed += 1;
                }
                Err(e) => {
                    error!(node = self.entry(side, idx).node.0, error = %e, "commit prepared failed");
                    self.entry_mut(side, idx).status = NodeXactStatus::CommitFailed;
                }
            }
        }

        let failed: Vec<u32> = self
            .write_nodes
            .iter()
            .chain(self.read_nodes.iter())
            .filter(|n| n.status == NodeXactStatus::CommitFailed)
            .map(|n| n.node.0)
            .collect();

        if failed.is_empty() {
            self.status = XactStatus::Committed;
            if let Err(e) = seq.commit_prepared(gxid, commit_xid).await {
                // every backend committed; a registry hiccup must not undo that
                warn!(error = %e, gid = %gid, "failed to resolve prepared record");
            }
            debug!(gid = %gid, committed, "distributed commit complete");
            Ok(())
        } else {
            // in-doubt: narrow the registry record to the unresolved nodes
            // and leave resolution to recovery
            self.status = XactStatus::PartCommitted;
            let failed_csv = csv(failed.iter().copied());
            if let Err(e) = seq.start_prepared(gxid, &gid, &failed_csv).await {
                error!(error = %e, gid = %gid, "failed to register in-doubt transaction");
            }
            info!(gid = %gid, nodes = %failed_csv, "transaction partially committed; registered in-doubt");
            Err(FabricError::Txn {
                phase: TxnPhase::Commit,
                failed_nodes: failed,
                message: format!("'{gid}' partially committed; resolution deferred"),
            })
        }
    }

    /// Roll back everything this session touched. Never raises: every
    /// failure is logged and reflected in the status, so error handling
    /// cannot recurse into itself. Calling it again once `Aborted` is a
    /// no-op; a partially committed transaction is in-doubt and is left for
    /// recovery.
    pub async fn abort(&mut self, handles: &mut HandleSet, seq: &impl Sequencer) {
        match self.status {
            XactStatus::Aborted | XactStatus::Committed | XactStatus::PartCommitted => return,
            _ => {}
        }
        if !self.is_active() {
            self.status = XactStatus::Aborted;
            return;
        }

        // drain half-processed COPY and query streams before rollbacks
        clean_all_handles(handles).await;

        let gid = self.prepare_gid.clone();
        let needs_aux = self.write_nodes.iter().any(|n| {
            matches!(
                n.status,
                NodeXactStatus::Prepared | NodeXactStatus::PrepareSent
            )
        });
        let aux_xid = if needs_aux {
            match seq.new_xid().await {
                Ok(xid) => Some(xid),
                Err(e) => {
                    warn!(error = %e, "no auxiliary xid for rollback prepared");
                    None
                }
            }
        } else {
            None
        };

        let mut sent = Vec::new();
        for (side, idx) in self.participants() {
            let entry = self.entry(side, idx);
            let Some(handle) = handles.get_mut(entry.key) else {
                continue;
            };
            if handle.state() == ConnState::ErrorFatal {
                // connection destroyed; nothing to send
                continue;
            }
            let result = match entry.status {
                NodeXactStatus::Prepared | NodeXactStatus::PrepareSent => match &gid {
                    Some(gid) => {
                        send_command(handle, aux_xid, &format!("ROLLBACK PREPARED '{gid}'")).await
                    }
                    None => continue,
                },
                NodeXactStatus::CommitSent
                | NodeXactStatus::CommitFailed
                | NodeXactStatus::Committed
                | NodeXactStatus::Aborted => continue,
                _ => {
                    if handle.in_transaction() {
                        send_command(handle, None, "ROLLBACK TRANSACTION").await
                    } else {
                        continue;
                    }
                }
            };
            match result {
                Ok(()) => {
                    self.entry_mut(side, idx).status = NodeXactStatus::AbortSent;
                    sent.push((side, idx));
                }
                Err(e) => {
                    warn!(node = entry.node.0, error = %e, "failed to send rollback");
                    self.entry_mut(side, idx).status = NodeXactStatus::AbortFailed;
                }
            }
        }

        for (side, idx) in sent {
            let key = self.entry(side, idx).key;
            let Some(handle) = handles.get_mut(key) else {
                continue;
            };
            match collect_result(handle).await {
                Ok(()) => self.entry_mut(side, idx).status = NodeXactStatus::Aborted,
                Err(e) => {
                    warn!(node = self.entry(side, idx).node.0, error = %e, "rollback failed");
                    self.entry_mut(side, idx).status = NodeXactStatus::AbortFailed;
                }
            }
        }
        let all = || self.write_nodes.iter().chain(self.read_nodes.iter());
        let succeeded = all()
            .filter(|n| n.status == NodeXactStatus::Aborted)
            .count();
        let failed = all()
            .filter(|n| n.status == NodeXactStatus::AbortFailed)
            .count();

        self.status = if failed == 0 {
            XactStatus::Aborted
        } else if succeeded > 0 {
            XactStatus::PartAborted
        } else {
            XactStatus::AbortFailed
        };

        if let Some(gxid) = self.gxid {
            if let Err(e) = seq.rollback(gxid).await {
                warn!(error = %e, gxid, "failed to report rollback to sequencer");
            }
        }
        debug!(status = ?self.status, "distributed abort finished");
    }

    /// `(side, index)` pairs in deterministic traversal order: writers in
    /// insertion order, then readers.
    fn participants(&self) -> Vec<(Side, usize)> {
        (0..self.write_nodes.len())
            .map(|i| (Side::Write, i))
            .chain((0..self.read_nodes.len()).map(|i| (Side::Read, i)))
            .collect()
    }

    fn entry(&self, side: Side, idx: usize) -> crate::XactNode {
        match side {
            Side::Write => self.write_nodes[idx],
            Side::Read => self.read_nodes[idx],
        }
    }

    fn entry_mut(&mut self, side: Side, idx: usize) -> &mut crate::XactNode {
        match side {
            Side::Write => &mut self.write_nodes[idx],
            Side::Read => &mut self.read_nodes[idx],
        }
    }
}

fn csv(ids: impl Iterator<Item = u32>) -> String {
    ids.map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

/// Queue a transaction-control statement (with an optional fresh gxid) and
/// flush it.
async fn send_command(
    handle: &mut NodeHandle,
    gxid: Option<u64>,
    sql: &str,
) -> FabricResult<()> {
    if let Some(gxid) = gxid {
        handle.send(&FrontendMessage::GlobalXid(gxid));
    }
    handle.send(&FrontendMessage::Query(sql.to_owned()));
    handle.set_state(ConnState::Query);
    handle.flush().await
}

/// Read the backend's verdict on a single transaction-control statement:
/// everything up to `ReadyForQuery`, surfacing an `ErrorResponse` if one
/// arrived.
async fn collect_result(handle: &mut NodeHandle) -> FabricResult<()> {
    let mut failure: Option<FabricError> = None;
    loop {
        match handle.receive().await? {
            BackendMessage::ErrorResponse {
                sqlstate,
                message,
                detail,
            } => {
                failure = Some(FabricError::Remote {
                    sqlstate: sqlstate.unwrap_or(SqlState::INTERNAL_ERROR),
                    message,
                    detail,
                });
            }
            BackendMessage::ReadyForQuery(status) => {
                handle.set_transaction_status(status);
                handle.set_state(ConnState::Idle);
                handle.clear_owner();
                return match failure {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
            BackendMessage::Unknown(tag) => {
                handle.mark_fatal();
                return Err(FabricError::Corrupted(format!(
                    "unexpected message {:?} awaiting command result",
                    tag as char
                )));
            }
            _ => {}
        }
    }
}
