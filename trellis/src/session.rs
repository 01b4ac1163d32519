//! The per-client [`Session`]: owner of every backend handle, the
//! transaction state, and the pooler connection.
//!
//! All coordinator state is held here rather than in process globals, so
//! two sessions in one process interact only through the barrier lock and
//! the pool manager.

use std::collections::HashMap;

use tracing::{debug, warn};
use trellis_combiner::{
    clean_all_handles, CombineKind, RemoteQuery, ResponseCombiner,
};
use trellis_errors::{FabricError, FabricResult};
use trellis_pool::{FabricOptions, PoolerClient, SetScope};
use trellis_wire::{ConnState, HandleKey, HandleSet, NodeHandle, NodeId, NodeRole};
use trellis_xact::{RemoteXact, Sequencer, XactStatus};

pub struct Session<S> {
    id: u32,
    options: FabricOptions,
    handles: HandleSet,
    /// Which slot serves which backend, per role.
    slot_by_node: HashMap<(NodeRole, NodeId), HandleKey>,
    xact: RemoteXact,
    pool: Option<PoolerClient>,
    sequencer: S,
    /// The coordinator's local storage wrote in this transaction.
    local_writes: bool,
    /// The session created temp objects (breaks 2PC; set via `TempMark`).
    temp_objects_used: bool,
}

impl<S: Sequencer> Session<S> {
    pub fn new(id: u32, options: FabricOptions, sequencer: S) -> Session<S> {
        Session {
            id,
            options,
            handles: HandleSet::new(),
            slot_by_node: HashMap::new(),
            xact: RemoteXact::new(id),
            pool: None,
            sequencer,
            local_writes: false,
            temp_objects_used: false,
        }
    }

    pub fn with_pool(mut self, pool: PoolerClient) -> Session<S> {
        self.pool = Some(pool);
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn options(&self) -> &FabricOptions {
        &self.options
    }

    pub fn xact(&self) -> &RemoteXact {
        &self.xact
    }

    pub fn xact_mut(&mut self) -> &mut RemoteXact {
        &mut self.xact
    }

    pub fn handles_mut(&mut self) -> &mut HandleSet {
        &mut self.handles
    }

    pub fn sequencer(&self) -> &S {
        &self.sequencer
    }

    /// Note a write by the coordinator's own storage engine; feeds the 2PC
    /// decision table.
    pub fn set_local_writes(&mut self, wrote: bool) {
        self.local_writes = wrote;
    }

    /// Adopt an already-established handle (embedded deployments, tests).
    pub fn attach_handle(&mut self, handle: NodeHandle) -> HandleKey {
        let id = (handle.role(), handle.node_id());
        let key = self.handles.insert(handle);
        self.slot_by_node.insert(id, key);
        key
    }

    /// Handle slots for the given data nodes, in request order, checking out
    /// fresh connections from the pooler for nodes the session does not hold
    /// yet.
    pub async fn acquire(&mut self, data_nodes: &[NodeId]) -> FabricResult<Vec<HandleKey>> {
        let missing: Vec<NodeId> = data_nodes
            .iter()
            .copied()
            .filter(|n| !self.slot_by_node.contains_key(&(NodeRole::Data, *n)))
            .collect();
        if !missing.is_empty() {
            let Some(pool) = self.pool.as_mut() else {
                return Err(FabricError::Connection {
                    node: Some(missing[0].0),
                    message: "no pooler attached and node not held".into(),
                });
            };
            let fresh = pool.checkout(&missing, &[]).await?;
            for handle in fresh {
                let id = (handle.role(), handle.node_id());
                let key = self.handles.insert(handle);
                self.slot_by_node.insert(id, key);
            }
        }
        data_nodes
            .iter()
            .map(|n| {
                self.slot_by_node
                    .get(&(NodeRole::Data, *n))
                    .copied()
                    .ok_or_else(|| FabricError::Connection {
                        node: Some(n.0),
                        message: "pooler did not deliver a handle for this node".into(),
                    })
            })
            .collect()
    }

    /// Run one statement on the given nodes: begin the transaction where
    /// needed, dispatch, and hand back the combiner for the executor to
    /// drain (via `fetch_tuple` or `receive_loop`).
    pub async fn execute(
        &mut self,
        data_nodes: &[NodeId],
        query: RemoteQuery,
        combine: CombineKind,
        writing: bool,
    ) -> FabricResult<ResponseCombiner> {
        let keys = self.acquire(data_nodes).await?;
        self.xact
            .begin(&mut self.handles, &keys, writing, &self.sequencer)
            .await?;
        let mut combiner = ResponseCombiner::new(keys.len(), combine);
        let prelude = self.xact.query_prelude();
        combiner
            .dispatch(&mut self.handles, &keys, &query, &prelude)
            .await?;
        Ok(combiner)
    }

    /// Run a statement that produces no row stream; returns the combined
    /// affected-row count.
    pub async fn execute_command(
        &mut self,
        data_nodes: &[NodeId],
        sql: &str,
        combine: CombineKind,
        writing: bool,
    ) -> FabricResult<u64> {
        let mut combiner = self
            .execute(
                data_nodes,
                RemoteQuery::Simple { sql: sql.into() },
                combine,
                writing,
            )
            .await?;
        let result = combiner.receive_loop(&mut self.handles).await;
        combiner.close(&mut self.handles).await?;
        result?;
        Ok(combiner.processed())
    }

    /// Commit the distributed transaction and release per-statement
    /// resources. On failure the abort path runs, unless the transaction is
    /// in-doubt (partially committed), which is left to recovery.
    pub async fn commit(&mut self) -> FabricResult<()> {
        let result = self
            .xact
            .commit(
                &mut self.handles,
                &self.sequencer,
                self.local_writes,
                self.temp_objects_used,
            )
            .await;
        match result {
            Ok(()) => {
                self.xact.reset();
                self.local_writes = false;
                self.finish_statement_handles().await;
                Ok(())
            }
            Err(err) => {
                if self.xact.status() != XactStatus::PartCommitted {
                    self.abort().await;
                }
                Err(err)
            }
        }
    }

    /// Abort the distributed transaction. Never raises; all failures are
    /// logged by the coordinator.
    pub async fn abort(&mut self) {
        self.xact.abort(&mut self.handles, &self.sequencer).await;
        if self.xact.status() == XactStatus::Aborted {
            self.xact.reset();
            self.local_writes = false;
        }
        self.finish_statement_handles().await;
    }

    /// Post-transaction handle hygiene. Fenced handles are destroyed
    /// unconditionally (an ambiguous conversation can never be reused, pinned
    /// or not); healthy handles go back to the pool unless the session pins
    /// its connections.
    async fn finish_statement_handles(&mut self) {
        let keys: Vec<HandleKey> = self.handles.keys();
        let mut returned = Vec::new();
        for key in keys {
            let Some(handle) = self.handles.get(key) else {
                continue;
            };
            let node = handle.node_id();
            let role = handle.role();
            if handle.state() == ConnState::ErrorFatal {
                // ambiguous server state: destroy, never reuse
                debug!(node = node.0, "destroying fenced handle");
                self.slot_by_node.remove(&(role, node));
                drop(self.handles.remove(key));
            } else if !self.options.persistent_connections && handle.is_returnable() {
                self.slot_by_node.remove(&(role, node));
                drop(self.handles.remove(key));
                returned.push((role, node));
            }
        }
        if returned.is_empty() {
            return;
        }
        if let Some(pool) = self.pool.as_mut() {
            let data: Vec<NodeId> = returned
                .iter()
                .filter(|(r, _)| *r == NodeRole::Data)
                .map(|(_, n)| *n)
                .collect();
            let coord: Vec<NodeId> = returned
                .iter()
                .filter(|(r, _)| *r == NodeRole::Coord)
                .map(|(_, n)| *n)
                .collect();
            if let Err(error) = pool.release(&data, &coord).await {
                warn!(%error, "failed to return handles to the pool");
            }
        }
    }

    /// Forward a SET command to the pooler. `Global` commands are replayed
    /// on fresh checkouts; `TempMark` flags the session as using temp
    /// objects, which disables 2PC.
    pub async fn set_command(&mut self, scope: SetScope, command: &str) -> FabricResult<i32> {
        if scope == SetScope::TempMark {
            self.temp_objects_used = true;
        }
        match self.pool.as_mut() {
            Some(pool) => pool.set_command(scope, command).await,
            None => Ok(0),
        }
    }

    /// Issue a cluster-wide barrier on every handle the session holds.
    pub async fn barrier(&mut self, barrier_id: &str) -> FabricResult<()> {
        let keys = self.handles.keys();
        if keys.is_empty() {
            return Ok(());
        }
        let mut combiner = ResponseCombiner::new(keys.len(), CombineKind::None);
        combiner
            .request_barrier(&mut self.handles, &keys, barrier_id)
            .await
    }

    /// Fire every held handle's cancel token. Out-of-band: the main sockets
    /// are untouched and must still be drained to ready.
    pub fn cancel_query(&self) {
        for (_, handle) in self.handles.iter() {
            handle.cancel_token().fire();
        }
    }

    /// Tear the session down: drain dirty handles, abort any open
    /// transaction, release everything, and unregister from the pooler.
    pub async fn close(mut self) {
        clean_all_handles(&mut self.handles).await;
        if self.xact.is_active() {
            self.xact.abort(&mut self.handles, &self.sequencer).await;
        }
        self.finish_statement_handles().await;
        // whatever remains is pinned or dirty; drop it with the session
        if let Some(pool) = self.pool.take() {
            if let Err(error) = pool.disconnect().await {
                warn!(%error, "pooler disconnect failed");
            }
        }
        debug!(session = self.id, "session closed");
    }
}
