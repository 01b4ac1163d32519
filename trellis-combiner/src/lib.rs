//! Remote response combiner: drives one logical query across N backend
//! handles and merges their row streams, copy streams and command results
//! into a single logical result for the local executor.
//!
//! The combiner is a per-query object. It borrows handles from the
//! session's [`HandleSet`] by slot key and leaves its [`CombinerId`] on each
//! handle while the conversation is live; the session remains the owner of
//! the slots themselves. Backend errors are recorded, not raised, until the
//! message batch is drained, then surfaced once with the first backend's
//! SQLSTATE.

use std::cmp::Ordering;
use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace, warn};
use trellis_errors::{
    internal, internal_err, invariant, invariant_eq, FabricError, FabricResult, SqlState,
};
use trellis_wire::messages::rows_from_command_tag;
use trellis_wire::{
    BackendMessage, CombinerId, ConnState, FieldDescription, FrontendMessage, HandleKey,
    HandleSet, NodeHandle, NodeId, SnapshotData,
};

pub mod cleanup;
pub mod row_buffer;

pub use cleanup::{clean_all_handles, drain_handle};
pub use row_buffer::{RowBuffer, Tuple};

/// What kind of response stream this combiner is merging. Transitions are
/// monotone: `Undefined` may become anything once, and `Error` absorbs all
/// further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestKind {
    #[default]
    Undefined,
    Command,
    Query,
    CopyIn,
    CopyOut,
    Error,
}

/// How row counts reported by multiple backends combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineKind {
    /// Counts are not meaningful (utility statements).
    None,
    /// Distributed DML: each backend touched its own rows.
    Sum,
    /// Replicated DML: every backend must report the same count.
    Same,
}

/// What one call to [`ResponseCombiner::handle_response`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseEvent {
    /// No complete message buffered (try variant only).
    Eof,
    /// `CommandComplete` consumed.
    Complete,
    /// `ReadyForQuery` consumed; the handle is idle and disowned.
    Ready,
    /// `PortalSuspended` consumed.
    Suspended,
    /// `RowDescription` consumed.
    TupleDesc,
    /// A data row is available (unless an error discarded it).
    DataRow,
    /// Copy-protocol traffic consumed.
    Copy,
    /// An `ErrorResponse` was recorded.
    Error,
    /// A barrier acknowledgement.
    BarrierOk,
}

/// Comparator over raw data rows, supplied by the executor from the tuple
/// descriptor's sort keys.
pub type TupleComparator = Box<dyn Fn(&Tuple, &Tuple) -> Ordering + Send>;

/// The first error observed by a combiner. A "producer" placeholder (a
/// producing process died without detail) may be overwritten by a real
/// backend error; nothing overwrites a real one.
#[derive(Debug, Clone)]
pub struct CombinerError {
    pub sqlstate: SqlState,
    pub message: String,
    pub detail: Option<String>,
    placeholder: bool,
    local: bool,
}

impl CombinerError {
    fn remote(sqlstate: Option<SqlState>, message: String, detail: Option<String>) -> Self {
        CombinerError {
            sqlstate: sqlstate.unwrap_or(SqlState::INTERNAL_ERROR),
            message,
            detail,
            placeholder: false,
            local: false,
        }
    }

    fn corrupted(message: String) -> Self {
        CombinerError {
            sqlstate: SqlState::DATA_CORRUPTED,
            message,
            detail: None,
            placeholder: false,
            local: true,
        }
    }

    fn producer(message: String) -> Self {
        CombinerError {
            sqlstate: SqlState::CONNECTION_FAILURE,
            message,
            detail: None,
            placeholder: true,
            local: true,
        }
    }

    fn into_fabric(self) -> FabricError {
        if self.placeholder {
            FabricError::Connection {
                node: None,
                message: self.message,
            }
        } else if self.local {
            FabricError::Corrupted(self.message)
        } else {
            FabricError::Remote {
                sqlstate: self.sqlstate,
                message: self.message,
                detail: self.detail,
            }
        }
    }
}

/// Transaction context shipped to each backend ahead of the query proper.
#[derive(Debug, Clone, Default)]
pub struct QueryPrelude {
    pub gxid: Option<u64>,
    pub snapshot: Option<SnapshotData>,
    pub timestamp: Option<u64>,
    pub command_id: Option<u32>,
}

/// The query to run on every target handle.
#[derive(Debug, Clone)]
pub enum RemoteQuery {
    /// Simple-protocol query; terminated by `ReadyForQuery`.
    Simple { sql: String },
    /// Extended-protocol sequence. When `cursor` names a portal the combiner
    /// remembers which connections hold it so a suspended portal can be
    /// resumed.
    Extended {
        statement: Option<String>,
        cursor: Option<String>,
        sql: Option<String>,
        param_types: Vec<u32>,
        params: Vec<Option<Bytes>>,
        fetch_size: i32,
    },
}

struct MergeState {
    cmp: TupleComparator,
    /// One lookahead row per tape; `None` means the tape is dry (for now).
    lookahead: Vec<Option<Tuple>>,
    primed: bool,
}

/// Per-query response combiner. See the crate docs for the ownership story.
pub struct ResponseCombiner {
    id: CombinerId,
    node_count: usize,
    /// Tape view of the connections: nil-ed in place when a stream is
    /// exhausted so tape indices stay stable.
    connections: Vec<Option<HandleKey>>,
    /// The slots as dispatched, for close/drain; never nil-ed.
    dispatch_slots: Vec<HandleKey>,
    /// Origin node per tape, preserved even after the slot goes nil.
    tape_nodes: Vec<NodeId>,
    current_conn: usize,
    request_kind: RequestKind,
    combine_kind: CombineKind,
    extended: bool,
    command_complete_count: usize,
    suspended_count: usize,
    description_count: usize,
    copy_in_count: usize,
    copy_out_count: usize,
    /// Rows affected, combined from command tags per `combine_kind`.
    processed: u64,
    /// Rows seen on the wire, including rows discarded after an error.
    rows_seen: u64,
    combined_row_count: Option<u64>,
    tuple_desc: Option<Vec<FieldDescription>>,
    current_row: Option<Tuple>,
    row_buffer: RowBuffer,
    copy_out_rows: VecDeque<Bytes>,
    merge: Option<MergeState>,
    cursor: Option<String>,
    cursor_conns: Vec<HandleKey>,
    error: Option<CombinerError>,
}

impl ResponseCombiner {
    /// `init(node_count, combine_type)`: counters zeroed, request kind
    /// undefined.
    pub fn new(node_count: usize, combine_kind: CombineKind) -> ResponseCombiner {
        ResponseCombiner {
            id: CombinerId::fresh(),
            node_count,
            connections: Vec::new(),
            dispatch_slots: Vec::new(),
            tape_nodes: Vec::new(),
            current_conn: 0,
            request_kind: RequestKind::Undefined,
            combine_kind,
            extended: false,
            command_complete_count: 0,
            suspended_count: 0,
            description_count: 0,
            copy_in_count: 0,
            copy_out_count: 0,
            processed: 0,
            rows_seen: 0,
            combined_row_count: None,
            tuple_desc: None,
            current_row: None,
            row_buffer: RowBuffer::new(),
            copy_out_rows: VecDeque::new(),
            merge: None,
            cursor: None,
            cursor_conns: Vec::new(),
            error: None,
        }
    }

    pub fn id(&self) -> CombinerId {
        self.id
    }

    pub fn request_kind(&self) -> RequestKind {
        self.request_kind
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn rows_seen(&self) -> u64 {
        self.rows_seen
    }

    pub fn command_complete_count(&self) -> usize {
        self.command_complete_count
    }

    pub fn description_count(&self) -> usize {
        self.description_count
    }

    pub fn copy_in_count(&self) -> usize {
        self.copy_in_count
    }

    pub fn copy_out_count(&self) -> usize {
        self.copy_out_count
    }

    pub fn tuple_desc(&self) -> Option<&[FieldDescription]> {
        self.tuple_desc.as_deref()
    }

    pub fn is_merge_sort(&self) -> bool {
        self.merge.is_some()
    }

    pub fn recorded_error(&self) -> Option<&CombinerError> {
        self.error.as_ref()
    }

    /// Surface the recorded error (once), clearing it.
    pub fn take_error(&mut self) -> Option<FabricError> {
        self.error.take().map(CombinerError::into_fabric)
    }

    /// Record a placeholder for a producer that died without sending an
    /// `ErrorResponse`; a later real backend error overwrites it.
    pub fn set_producer_error(&mut self, message: impl Into<String>) {
        self.record_error(CombinerError::producer(message.into()));
    }

    /// The merge-sort tapes' buffered-row marks are consistent. Exposed for
    /// assertions in tests and debug checks.
    pub fn row_buffer_valid(&self) -> bool {
        self.row_buffer.marks_valid()
    }

    /// Send the prelude plus the query to every target handle and move them
    /// all into `Query` state. Handles must be idle (leftover terminators
    /// from a buffered-away conversation are tolerated and consumed).
    pub async fn dispatch(
        &mut self,
        handles: &mut HandleSet,
        slots: &[HandleKey],
        query: &RemoteQuery,
        prelude: &QueryPrelude,
    ) -> FabricResult<()> {
        invariant_eq!(slots.len(), self.node_count);
        self.dispatch_slots = slots.to_vec();
        self.connections = slots.iter().copied().map(Some).collect();
        self.tape_nodes = Vec::with_capacity(slots.len());
        self.current_conn = 0;

        for &slot in slots {
            let handle = handles.expect_mut(slot)?;
            consume_leftovers(handle)?;
            invariant!(
                handle.state() == ConnState::Idle,
                "cannot dispatch on node {} in state {:?}",
                handle.node_id(),
                handle.state()
            );
            handle.bind_owner(self.id)?;
            self.tape_nodes.push(handle.node_id());

            if let Some(gxid) = prelude.gxid {
                handle.send(&FrontendMessage::GlobalXid(gxid));
            }
            if let Some(ts) = prelude.timestamp {
                handle.send(&FrontendMessage::Timestamp(ts));
            }
            if let Some(snap) = &prelude.snapshot {
                handle.send(&FrontendMessage::Snapshot(snap.clone()));
            }
            if let Some(cid) = prelude.command_id {
                handle.send(&FrontendMessage::CommandId(cid));
            }
            match query {
                RemoteQuery::Simple { sql } => {
                    handle.send(&FrontendMessage::Query(sql.clone()));
                }
                RemoteQuery::Extended {
                    statement,
                    cursor,
                    sql,
                    param_types,
                    params,
                    fetch_size,
                } => {
                    let stmt = statement.clone().unwrap_or_default();
                    let portal = cursor.clone().unwrap_or_default();
                    if let Some(sql) = sql {
                        handle.send(&FrontendMessage::Parse {
                            statement: stmt.clone(),
                            query: sql.clone(),
                            param_types: param_types.clone(),
                        });
                    }
                    handle.send(&FrontendMessage::Bind {
                        portal: portal.clone(),
                        statement: stmt,
                        params: params.clone(),
                        binary_results: false,
                    });
                    handle.send(&FrontendMessage::DescribePortal(portal.clone()));
                    handle.send(&FrontendMessage::Execute {
                        portal,
                        max_rows: *fetch_size,
                    });
                    handle.send(&FrontendMessage::Sync);
                }
            }
            handle.set_state(ConnState::Query);
            handle.flush().await?;
        }

        match query {
            RemoteQuery::Simple { .. } => {
                self.extended = false;
                self.cursor = None;
                self.cursor_conns.clear();
            }
            RemoteQuery::Extended { cursor, .. } => {
                self.extended = true;
                match cursor {
                    Some(name) => {
                        self.cursor = Some(name.clone());
                        self.cursor_conns = slots.to_vec();
                    }
                    None => {
                        self.cursor = None;
                        self.cursor_conns.clear();
                    }
                }
            }
        }
        debug!(
            nodes = slots.len(),
            extended = self.extended,
            "dispatched remote query"
        );
        Ok(())
    }

    /// Re-execute a suspended portal on the connections that hold it.
    pub async fn resume_portal(
        &mut self,
        handles: &mut HandleSet,
        fetch_size: i32,
    ) -> FabricResult<()> {
        let Some(cursor) = self.cursor.clone() else {
            internal!("resume_portal without an open cursor");
        };
        self.connections = self.cursor_conns.iter().copied().map(Some).collect();
        self.current_conn = 0;
        let cursor_conns = self.cursor_conns.clone();
        for &slot in &cursor_conns {
            // the previous execute round ended in Sync; eat its terminator
            // before queueing the next one
            loop {
                let handle = handles.expect_mut(slot)?;
                if handle.owner() != Some(self.id) || handle.state() == ConnState::ErrorFatal {
                    break;
                }
                self.handle_response(handles, slot).await?;
            }
        }
        for &slot in &cursor_conns {
            let handle = handles.expect_mut(slot)?;
            consume_leftovers(handle)?;
            handle.bind_owner(self.id)?;
            handle.send(&FrontendMessage::Execute {
                portal: cursor.clone(),
                max_rows: fetch_size,
            });
            handle.send(&FrontendMessage::Sync);
            handle.set_state(ConnState::Query);
            handle.flush().await?;
        }
        Ok(())
    }

    /// Read one framed message from the handle, waiting on the socket as
    /// needed, and fold it into combiner state. Insignificant messages
    /// (parse/bind/close completions, notices) are consumed silently.
    pub async fn handle_response(
        &mut self,
        handles: &mut HandleSet,
        slot: HandleKey,
    ) -> FabricResult<ResponseEvent> {
        let handle = handles.expect_mut(slot)?;
        loop {
            let msg = handle.receive().await?;
            if let Some(event) = self.apply_message(handle, msg)? {
                return Ok(event);
            }
        }
    }

    /// Like [`handle_response`](Self::handle_response) but never touches the
    /// socket; returns [`ResponseEvent::Eof`] when no complete message is
    /// buffered.
    pub fn try_handle_response(
        &mut self,
        handles: &mut HandleSet,
        slot: HandleKey,
    ) -> FabricResult<ResponseEvent> {
        let handle = handles.expect_mut(slot)?;
        loop {
            match handle.try_receive()? {
                None => return Ok(ResponseEvent::Eof),
                Some(msg) => {
                    if let Some(event) = self.apply_message(handle, msg)? {
                        return Ok(event);
                    }
                }
            }
        }
    }

    fn apply_message(
        &mut self,
        handle: &mut NodeHandle,
        msg: BackendMessage,
    ) -> FabricResult<Option<ResponseEvent>> {
        trace!(node = %handle.node_id(), msg = ?kind_of(&msg), "backend message");
        let event = match msg {
            BackendMessage::RowDescription(fields) => {
                self.observe_request_kind(RequestKind::Query)?;
                self.description_count += 1;
                match &self.tuple_desc {
                    None => self.tuple_desc = Some(fields),
                    Some(existing) if existing.len() == fields.len() => {}
                    Some(existing) => {
                        return Err(FabricError::Corrupted(format!(
                            "row descriptions disagree across nodes ({} vs {} columns)",
                            existing.len(),
                            fields.len()
                        )))
                    }
                }
                ResponseEvent::TupleDesc
            }
            BackendMessage::DataRow(data) => {
                self.rows_seen += 1;
                if self.error.is_some() {
                    // discard, but the count keeps moving so callers can
                    // observe progress while draining
                    return Ok(Some(ResponseEvent::DataRow));
                }
                self.observe_request_kind(RequestKind::Query)?;
                if self.tuple_desc.is_none() {
                    return Err(FabricError::Corrupted(
                        "data row arrived without a row description".into(),
                    ));
                }
                if let Some(prev) = self.current_row.take() {
                    self.row_buffer.push_back(prev);
                }
                self.current_row = Some(Tuple {
                    node: handle.node_id(),
                    data,
                });
                ResponseEvent::DataRow
            }
            BackendMessage::CommandComplete(tag) => {
                if self.request_kind == RequestKind::Undefined {
                    self.request_kind = RequestKind::Command;
                }
                if let Some(count) = rows_from_command_tag(&tag) {
                    self.combine_row_count(count);
                }
                self.command_complete_count += 1;
                handle.set_state(ConnState::Idle);
                ResponseEvent::Complete
            }
            BackendMessage::PortalSuspended => {
                self.suspended_count += 1;
                handle.set_state(ConnState::Idle);
                ResponseEvent::Suspended
            }
            BackendMessage::CopyInResponse => {
                self.observe_request_kind(RequestKind::CopyIn)?;
                self.copy_in_count += 1;
                handle.set_state(ConnState::CopyIn);
                ResponseEvent::Copy
            }
            BackendMessage::CopyOutResponse => {
                self.observe_request_kind(RequestKind::CopyOut)?;
                self.copy_out_count += 1;
                handle.set_state(ConnState::CopyOut);
                ResponseEvent::Copy
            }
            BackendMessage::CopyData(data) => {
                if self.error.is_none() {
                    self.copy_out_rows.push_back(data);
                }
                ResponseEvent::Copy
            }
            BackendMessage::CopyDone => {
                // command completion and ready still follow
                handle.set_state(ConnState::Query);
                ResponseEvent::Copy
            }
            BackendMessage::ErrorResponse {
                sqlstate,
                message,
                detail,
            } => {
                debug!(node = %handle.node_id(), %message, "backend error");
                self.record_error(CombinerError::remote(sqlstate, message, detail));
                // count it so response waits terminate
                self.command_complete_count += 1;
                ResponseEvent::Error
            }
            BackendMessage::ReadyForQuery(status) => {
                handle.set_transaction_status(status);
                handle.set_state(ConnState::Idle);
                handle.clear_owner();
                ResponseEvent::Ready
            }
            BackendMessage::BarrierOk => {
                handle.set_state(ConnState::Idle);
                ResponseEvent::BarrierOk
            }
            BackendMessage::NoticeResponse(message) => {
                debug!(node = %handle.node_id(), %message, "backend notice");
                return Ok(None);
            }
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::NoData
            | BackendMessage::Notification
            | BackendMessage::ParameterStatus { .. } => return Ok(None),
            BackendMessage::Unknown(tag) => {
                handle.mark_fatal();
                return Err(FabricError::Corrupted(format!(
                    "unexpected message type {:?} from node {}",
                    tag as char,
                    handle.node_id()
                )));
            }
        };
        Ok(Some(event))
    }

    fn observe_request_kind(&mut self, kind: RequestKind) -> FabricResult<()> {
        match self.request_kind {
            RequestKind::Undefined => {
                self.request_kind = kind;
                Ok(())
            }
            RequestKind::Error => Ok(()),
            current if current == kind => Ok(()),
            current => Err(FabricError::Corrupted(format!(
                "{kind:?} response while combiner is handling {current:?}"
            ))),
        }
    }

    fn combine_row_count(&mut self, count: u64) {
        match self.combine_kind {
            CombineKind::None => {}
            CombineKind::Sum => self.processed += count,
            CombineKind::Same => match self.combined_row_count {
                None => {
                    self.combined_row_count = Some(count);
                    self.processed = count;
                }
                Some(prev) if prev == count => {}
                Some(prev) => {
                    self.record_error(CombinerError::corrupted(format!(
                        "replicated write row counts disagree ({prev} vs {count})"
                    )));
                }
            },
        }
    }

    fn record_error(&mut self, err: CombinerError) {
        match &self.error {
            None => self.error = Some(err),
            Some(current) if current.placeholder && !err.placeholder => self.error = Some(err),
            _ => {}
        }
        self.request_kind = RequestKind::Error;
    }

    /// Drive every handle to `ReadyForQuery`, then surface the recorded
    /// error (if any) and validate that every node answered.
    ///
    /// Extended dispatches always end in `Sync`, so a ready terminator is in
    /// flight for both protocols.
    pub async fn receive_loop(&mut self, handles: &mut HandleSet) -> FabricResult<()> {
        let slots: Vec<HandleKey> = self.connections.iter().flatten().copied().collect();
        for slot in slots {
            loop {
                let state = handles.expect_mut(slot)?.state();
                if state == ConnState::ErrorFatal {
                    self.set_producer_error(format!(
                        "lost connection to node while awaiting responses (slot {slot})"
                    ));
                    break;
                }
                match self.handle_response(handles, slot).await {
                    Ok(ResponseEvent::Ready) => break,
                    Ok(_) => {}
                    Err(FabricError::Connection { node, message }) => {
                        self.set_producer_error(format!(
                            "connection failure on node {node:?}: {message}"
                        ));
                        break;
                    }
                    Err(other) => return Err(other),
                }
            }
        }
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        self.verify_complete()
    }

    fn verify_complete(&self) -> FabricResult<()> {
        let answered = self.command_complete_count + self.suspended_count;
        if answered != self.node_count {
            return Err(FabricError::Corrupted(format!(
                "unexpected response count: {answered} of {} nodes answered",
                self.node_count
            )));
        }
        Ok(())
    }

    /// The next tuple of the combined stream, or `None` at end of stream.
    /// With merge sort active, order is defined by the comparator; otherwise
    /// connections are exhausted in dispatch order.
    pub async fn fetch_tuple(&mut self, handles: &mut HandleSet) -> FabricResult<Option<Tuple>> {
        if self.merge.is_some() {
            return self.fetch_merge(handles).await;
        }
        if let Some(row) = self.current_row.take() {
            return Ok(Some(row));
        }
        if let Some(row) = self.row_buffer.pop_front() {
            return Ok(Some(row));
        }
        while self.current_conn < self.connections.len() {
            let Some(slot) = self.connections[self.current_conn] else {
                self.current_conn += 1;
                continue;
            };
            let state = handles.expect_mut(slot)?.state();
            if state != ConnState::Query {
                self.current_conn += 1;
                continue;
            }
            match self.handle_response(handles, slot).await? {
                ResponseEvent::DataRow => {
                    if let Some(row) = self.current_row.take() {
                        return Ok(Some(row));
                    }
                    // discarded after an error; keep draining
                }
                ResponseEvent::Complete | ResponseEvent::Suspended | ResponseEvent::Ready => {
                    self.current_conn += 1;
                }
                _ => {}
            }
        }
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        Ok(None)
    }

    /// Switch this combiner to merge-sort delivery. One tape per dispatched
    /// connection; call before the first [`fetch_tuple`](Self::fetch_tuple).
    pub fn enable_merge_sort(&mut self, cmp: TupleComparator) {
        let tapes = self.connections.len();
        self.row_buffer.init_tapes(tapes);
        self.merge = Some(MergeState {
            cmp,
            lookahead: (0..tapes).map(|_| None).collect(),
            primed: false,
        });
    }

    async fn fetch_merge(&mut self, handles: &mut HandleSet) -> FabricResult<Option<Tuple>> {
        let tapes = self.connections.len();
        let primed = self.merge.as_ref().map(|m| m.primed).unwrap_or(false);
        if !primed {
            for tape in 0..tapes {
                let row = self.next_from_tape(handles, tape).await?;
                if let Some(merge) = &mut self.merge {
                    merge.lookahead[tape] = row;
                }
            }
            if let Some(merge) = &mut self.merge {
                merge.primed = true;
            }
        }

        let winner = {
            let merge = self
                .merge
                .as_ref()
                .ok_or_else(|| internal_err!("merge state vanished"))?;
            let mut best: Option<usize> = None;
            for (tape, candidate) in merge.lookahead.iter().enumerate() {
                let Some(candidate) = candidate else { continue };
                best = match best {
                    None => Some(tape),
                    Some(current)
                        if (merge.cmp)(candidate, merge.lookahead[current].as_ref().unwrap())
                            == Ordering::Less =>
                    {
                        Some(tape)
                    }
                    current => current,
                };
            }
            best
        };

        let Some(tape) = winner else {
            if let Some(err) = self.take_error() {
                return Err(err);
            }
            return Ok(None);
        };
        let row = self
            .merge
            .as_mut()
            .and_then(|m| m.lookahead[tape].take())
            .ok_or_else(|| internal_err!("merge winner vanished"))?;
        let refill = self.next_from_tape(handles, tape).await?;
        if let Some(merge) = &mut self.merge {
            merge.lookahead[tape] = refill;
        }
        Ok(Some(row))
    }

    /// The next row from tape `k`: buffered rows for that tape first, then
    /// the connection. When the stream is exhausted the slot is nil-ed in
    /// place (tape indices stay stable; the node id is preserved in
    /// `tape_nodes`).
    async fn next_from_tape(
        &mut self,
        handles: &mut HandleSet,
        tape: usize,
    ) -> FabricResult<Option<Tuple>> {
        let node = self.tape_nodes[tape];
        if let Some(row) = self.row_buffer.take_for_tape(tape, node) {
            return Ok(Some(row));
        }
        loop {
            let Some(slot) = self.connections[tape] else {
                return Ok(None);
            };
            let state = handles.expect_mut(slot)?.state();
            if !matches!(state, ConnState::Query | ConnState::CopyOut) {
                self.connections[tape] = None;
                return Ok(None);
            }
            match self.handle_response(handles, slot).await? {
                ResponseEvent::DataRow => {
                    if let Some(row) = self.current_row.take() {
                        if row.node == node {
                            return Ok(Some(row));
                        }
                        self.row_buffer.push_back(row);
                    }
                }
                ResponseEvent::Complete | ResponseEvent::Suspended | ResponseEvent::Ready => {
                    self.connections[tape] = None;
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    /// Whether every tape slot has been nil-ed (merge-sorted stream fully
    /// consumed).
    pub fn all_tapes_done(&self) -> bool {
        self.connections.iter().all(Option::is_none)
    }

    /// Stream one chunk of COPY IN data to every handle still in copy state.
    pub async fn send_copy_data(
        &mut self,
        handles: &mut HandleSet,
        data: Bytes,
    ) -> FabricResult<()> {
        for &slot in &self.dispatch_slots {
            let handle = handles.expect_mut(slot)?;
            if handle.state() == ConnState::CopyIn {
                handle.send(&FrontendMessage::CopyData(data.clone()));
                handle.flush().await?;
            }
        }
        Ok(())
    }

    /// Finish a COPY IN: send `CopyDone` everywhere and collect the command
    /// results.
    pub async fn finish_copy_in(&mut self, handles: &mut HandleSet) -> FabricResult<()> {
        for &slot in &self.dispatch_slots {
            let handle = handles.expect_mut(slot)?;
            if handle.state() == ConnState::CopyIn {
                handle.send(&FrontendMessage::CopyDone);
                handle.set_state(ConnState::Query);
                handle.flush().await?;
            }
        }
        self.receive_loop(handles).await
    }

    /// Copy-out data received so far, in arrival order.
    pub fn take_copy_data(&mut self) -> Option<Bytes> {
        self.copy_out_rows.pop_front()
    }

    /// Absorb everything a prior conversation still has in flight on this
    /// handle into the row buffer, then disown the handle. This is the only
    /// legitimate way to transfer a handle that is mid-query to another
    /// combiner. Post-conditions: the handle's back-reference is cleared and
    /// its state is not `Query`.
    pub async fn buffer_connection(
        &mut self,
        handles: &mut HandleSet,
        slot: HandleKey,
    ) -> FabricResult<()> {
        loop {
            let handle = handles.expect_mut(slot)?;
            // fully drained once the ready terminator cleared the owner;
            // copy states cannot be handed over and fatal ones are dead
            let mid_conversation = handle.owner() == Some(self.id)
                && !matches!(
                    handle.state(),
                    ConnState::ErrorFatal | ConnState::CopyIn | ConnState::CopyOut
                );
            if !mid_conversation {
                break;
            }
            if let ResponseEvent::DataRow = self.handle_response(handles, slot).await? {
                if let Some(row) = self.current_row.take() {
                    self.row_buffer.push_back(row);
                }
            }
        }
        let handle = handles.expect_mut(slot)?;
        handle.clear_owner();
        for conn in &mut self.connections {
            if *conn == Some(slot) {
                *conn = None;
            }
        }
        debug!(slot, buffered = self.row_buffer.len(), "buffered connection for handover");
        Ok(())
    }

    /// Request a cluster barrier on the dispatched handles and wait for all
    /// acknowledgements.
    pub async fn request_barrier(
        &mut self,
        handles: &mut HandleSet,
        slots: &[HandleKey],
        barrier_id: &str,
    ) -> FabricResult<()> {
        self.dispatch_slots = slots.to_vec();
        self.connections = slots.iter().copied().map(Some).collect();
        self.tape_nodes = Vec::with_capacity(slots.len());
        for &slot in slots {
            let handle = handles.expect_mut(slot)?;
            self.tape_nodes.push(handle.node_id());
            handle.send(&FrontendMessage::Barrier(barrier_id.to_owned()));
            handle.set_state(ConnState::Query);
            handle.flush().await?;
        }
        for &slot in slots {
            loop {
                match self.handle_response(handles, slot).await? {
                    ResponseEvent::BarrierOk => break,
                    ResponseEvent::Error | ResponseEvent::Ready => break,
                    _ => {}
                }
            }
        }
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        Ok(())
    }

    /// Drain or discard pending traffic on every dispatched handle and
    /// release per-handle ownership. Closes the portal first if one is open.
    pub async fn close(&mut self, handles: &mut HandleSet) -> FabricResult<()> {
        if let Some(cursor) = self.cursor.take() {
            for slot in std::mem::take(&mut self.cursor_conns) {
                let Some(handle) = handles.get_mut(slot) else {
                    continue;
                };
                if handle.state() == ConnState::ErrorFatal {
                    continue;
                }
                handle.bind_owner(self.id)?;
                handle.send(&FrontendMessage::ClosePortal(cursor.clone()));
                handle.send(&FrontendMessage::Sync);
                if handle.state() == ConnState::Idle {
                    handle.set_state(ConnState::Query);
                }
                handle.flush().await?;
            }
        }
        for slot in std::mem::take(&mut self.dispatch_slots) {
            let Some(handle) = handles.get_mut(slot) else {
                continue;
            };
            if matches!(handle.state(), ConnState::CopyIn | ConnState::CopyOut) {
                if let Err(error) = drain_handle(handle).await {
                    warn!(slot, %error, "failed to drain copy handle on close");
                    handle.mark_fatal();
                }
            }
            // the conversation is over only once the ready terminator has
            // cleared our back-reference
            while handle.state() != ConnState::ErrorFatal && handle.owner() == Some(self.id) {
                match handle.receive().await {
                    Ok(BackendMessage::ReadyForQuery(status)) => {
                        handle.set_transaction_status(status);
                        handle.set_state(ConnState::Idle);
                        handle.clear_owner();
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(slot, %error, "failed to drain handle on close");
                        handle.mark_fatal();
                    }
                }
            }
        }
        self.connections.clear();
        Ok(())
    }
}

/// Consume protocol leftovers (ready/parameter/notice messages) a prior
/// conversation may have parked in the inbound buffer.
fn consume_leftovers(handle: &mut NodeHandle) -> FabricResult<()> {
    while let Some(msg) = handle.try_receive()? {
        match msg {
            BackendMessage::ReadyForQuery(status) => {
                handle.set_transaction_status(status);
                handle.set_state(ConnState::Idle);
                handle.clear_owner();
            }
            BackendMessage::ParameterStatus { .. }
            | BackendMessage::NoticeResponse(_)
            | BackendMessage::Notification
            | BackendMessage::CloseComplete => {}
            other => {
                return Err(FabricError::Corrupted(format!(
                    "unexpected leftover message {other:?} before dispatch"
                )))
            }
        }
    }
    Ok(())
}

fn kind_of(msg: &BackendMessage) -> &'static str {
    match msg {
        BackendMessage::RowDescription(_) => "RowDescription",
        BackendMessage::DataRow(_) => "DataRow",
        BackendMessage::CommandComplete(_) => "CommandComplete",
        BackendMessage::PortalSuspended => "PortalSuspended",
        BackendMessage::CopyInResponse => "CopyInResponse",
        BackendMessage::CopyOutResponse => "CopyOutResponse",
        BackendMessage::CopyData(_) => "CopyData",
        BackendMessage::CopyDone => "CopyDone",
        BackendMessage::ErrorResponse { .. } => "ErrorResponse",
        BackendMessage::NoticeResponse(_) => "NoticeResponse",
        BackendMessage::ReadyForQuery(_) => "ReadyForQuery",
        BackendMessage::BarrierOk => "BarrierOk",
        BackendMessage::ParseComplete => "ParseComplete",
        BackendMessage::BindComplete => "BindComplete",
        BackendMessage::CloseComplete => "CloseComplete",
        BackendMessage::NoData => "NoData",
        BackendMessage::Notification => "Notification",
        BackendMessage::ParameterStatus { .. } => "ParameterStatus",
        BackendMessage::Unknown(_) => "Unknown",
    }
}
