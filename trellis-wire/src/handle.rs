//! [`NodeHandle`]: one owned connection to one backend node, with its
//! protocol state and buffered traffic. The session owns every handle slot
//! (in a [`HandleSet`]); a response combiner borrows handles by key and
//! leaves a [`CombinerId`] back-reference while it does.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use slab::Slab;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::trace;
use trellis_errors::{internal_err, FabricError, FabricResult};

use crate::buffer::WireBuffer;
use crate::cancel::CancelToken;
use crate::messages::{BackendMessage, FrontendMessage};

/// Identifies a backend within its role for the life of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Data,
    Coord,
}

/// Backend-reported transaction state, from `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    #[default]
    Idle,
    InTxn,
    InErrorTxn,
}

/// Connection-level protocol state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Idle,
    Query,
    /// The conversation is in an ambiguous state; the handle must be
    /// destroyed, never returned to the pool.
    ErrorFatal,
    CopyIn,
    CopyOut,
}

/// Token identifying the combiner that currently owns a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CombinerId(u64);

impl CombinerId {
    /// Allocate a process-unique id.
    pub fn fresh() -> CombinerId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        CombinerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
    #[cfg(feature = "test-util")]
    Duplex(tokio::io::DuplexStream),
}

impl Stream {
    async fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf).await,
            Stream::Unix(s) => s.read(buf).await,
            #[cfg(feature = "test-util")]
            Stream::Duplex(s) => s.read(buf).await,
        }
    }

    async fn write_all_buf(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.write_all(data).await,
            Stream::Unix(s) => s.write_all(data).await,
            #[cfg(feature = "test-util")]
            Stream::Duplex(s) => s.write_all(data).await,
        }
    }
}

/// One owned connection to one backend.
pub struct NodeHandle {
    role: NodeRole,
    node_id: NodeId,
    txn_status: TransactionStatus,
    state: ConnState,
    stream: Stream,
    inbound: WireBuffer,
    outbound: WireBuffer,
    owner: Option<CombinerId>,
    cancel: CancelToken,
    scratch: Vec<u8>,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("role", &self.role)
            .field("node_id", &self.node_id)
            .field("txn_status", &self.txn_status)
            .field("state", &self.state)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl NodeHandle {
    fn new(stream: Stream, role: NodeRole, node_id: NodeId) -> NodeHandle {
        NodeHandle {
            role,
            node_id,
            txn_status: TransactionStatus::Idle,
            state: ConnState::Idle,
            stream,
            inbound: WireBuffer::default(),
            outbound: WireBuffer::default(),
            owner: None,
            cancel: CancelToken::noop(),
            scratch: Vec::new(),
        }
    }

    /// Wrap an already-established connection handed over by the pooler.
    pub fn from_std_tcp(
        stream: std::net::TcpStream,
        role: NodeRole,
        node_id: NodeId,
    ) -> FabricResult<NodeHandle> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let stream = TcpStream::from_std(stream)?;
        Ok(NodeHandle::new(Stream::Tcp(stream), role, node_id))
    }

    pub fn from_std_unix(
        stream: std::os::unix::net::UnixStream,
        role: NodeRole,
        node_id: NodeId,
    ) -> FabricResult<NodeHandle> {
        stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(stream)?;
        Ok(NodeHandle::new(Stream::Unix(stream), role, node_id))
    }

    /// An in-process handle over a duplex pipe, with the far end returned for
    /// a mock backend to drive.
    #[cfg(feature = "test-util")]
    pub fn duplex(role: NodeRole, node_id: NodeId) -> (NodeHandle, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(1 << 20);
        (NodeHandle::new(Stream::Duplex(near), role, node_id), far)
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        trace!(node = %self.node_id, ?state, "handle state change");
        self.state = state;
    }

    pub fn mark_fatal(&mut self) {
        self.state = ConnState::ErrorFatal;
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.txn_status
    }

    pub fn set_transaction_status(&mut self, status: TransactionStatus) {
        self.txn_status = status;
    }

    pub fn in_transaction(&self) -> bool {
        self.txn_status != TransactionStatus::Idle
    }

    /// A handle may be returned to the pool only when its conversation is
    /// fully drained and it is not mid-transaction.
    pub fn is_returnable(&self) -> bool {
        self.state == ConnState::Idle
            && self.txn_status == TransactionStatus::Idle
            && self.owner.is_none()
            && self.inbound.is_empty()
            && self.outbound.is_empty()
    }

    pub fn owner(&self) -> Option<CombinerId> {
        self.owner
    }

    /// Record `owner` as the combiner driving this handle. At most one
    /// combiner owns a handle at any instant; ownership is transferred, never
    /// shared.
    pub fn bind_owner(&mut self, owner: CombinerId) -> FabricResult<()> {
        match self.owner {
            Some(current) if current != owner => Err(internal_err!(
                "handle for node {} already owned by combiner {current:?}",
                self.node_id
            )),
            _ => {
                self.owner = Some(owner);
                Ok(())
            }
        }
    }

    pub fn clear_owner(&mut self) {
        self.owner = None;
    }

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Queue a message for this backend. Nothing is written to the socket
    /// until [`flush`](NodeHandle::flush).
    pub fn send(&mut self, msg: &FrontendMessage) {
        self.scratch.clear();
        msg.encode(&mut self.scratch);
        self.outbound.extend(&self.scratch);
    }

    /// Drain the outbound buffer to the socket, yielding whenever the write
    /// would stall.
    pub async fn flush(&mut self) -> FabricResult<()> {
        while !self.outbound.is_empty() {
            let n = self.outbound.len();
            let res = self.stream.write_all_buf(self.outbound.readable()).await;
            if let Err(e) = res {
                self.mark_fatal();
                return Err(FabricError::Connection {
                    node: Some(self.node_id.0),
                    message: format!("write failed: {e}"),
                });
            }
            self.outbound.consume(n);
        }
        Ok(())
    }

    /// Whether a complete message is already sitting in the inbound buffer.
    pub fn has_buffered_message(&self) -> bool {
        // peek without consuming: frame needs 5 header bytes plus payload
        let data = self.inbound.readable();
        if data.len() < 5 {
            return false;
        }
        let len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
        len >= 4 && data.len() >= 1 + len
    }

    /// Take one message from the inbound buffer without touching the socket.
    pub fn try_receive(&mut self) -> FabricResult<Option<BackendMessage>> {
        match self.inbound.try_frame() {
            Some(frame) => BackendMessage::decode(frame.tag, frame.payload).map(Some),
            None => Ok(None),
        }
    }

    /// Read one framed message, awaiting socket readiness as needed.
    pub async fn receive(&mut self) -> FabricResult<BackendMessage> {
        loop {
            if let Some(frame) = self.inbound.try_frame() {
                return BackendMessage::decode(frame.tag, frame.payload);
            }
            let spare = self.inbound.spare_tail(4096);
            let n = match self.stream.read_into(spare).await {
                Ok(n) => n,
                Err(e) => {
                    self.state = ConnState::ErrorFatal;
                    return Err(FabricError::Connection {
                        node: Some(self.node_id.0),
                        message: format!("read failed: {e}"),
                    });
                }
            };
            if n == 0 {
                self.state = ConnState::ErrorFatal;
                return Err(FabricError::Connection {
                    node: Some(self.node_id.0),
                    message: "connection closed by backend".into(),
                });
            }
            self.inbound.advance_end(n);
        }
    }
}

/// Key of a handle slot within a session's [`HandleSet`].
pub type HandleKey = usize;

/// The session-owned slab of backend handles.
///
/// Slot keys are stable for the life of the handle and serve as the identity
/// the transaction coordinator's read/write lists are keyed by.
#[derive(Default)]
pub struct HandleSet {
    slots: Slab<NodeHandle>,
}

impl HandleSet {
    pub fn new() -> HandleSet {
        HandleSet::default()
    }

    pub fn insert(&mut self, handle: NodeHandle) -> HandleKey {
        self.slots.insert(handle)
    }

    pub fn remove(&mut self, key: HandleKey) -> Option<NodeHandle> {
        self.slots.try_remove(key)
    }

    pub fn get(&self, key: HandleKey) -> Option<&NodeHandle> {
        self.slots.get(key)
    }

    pub fn get_mut(&mut self, key: HandleKey) -> Option<&mut NodeHandle> {
        self.slots.get_mut(key)
    }

    /// A handle the caller has every reason to believe exists; a missing slot
    /// is session-state corruption.
    pub fn expect_mut(&mut self, key: HandleKey) -> FabricResult<&mut NodeHandle> {
        self.slots
            .get_mut(key)
            .ok_or_else(|| internal_err!("no handle in slot {key}"))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (HandleKey, &NodeHandle)> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (HandleKey, &mut NodeHandle)> {
        self.slots.iter_mut()
    }

    pub fn keys(&self) -> Vec<HandleKey> {
        self.slots.iter().map(|(k, _)| k).collect()
    }
}

#[cfg(all(test, feature = "test-util"))]
mod tests {
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::messages::BackendMessage;

    fn framed(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn receive_reads_framed_messages() {
        let (mut handle, mut far) = NodeHandle::duplex(NodeRole::Data, NodeId(1));
        far.write_all(&framed(b'C', b"SELECT 1\0")).await.unwrap();
        far.write_all(&framed(b'Z', b"I")).await.unwrap();

        assert_eq!(
            handle.receive().await.unwrap(),
            BackendMessage::CommandComplete("SELECT 1".into())
        );
        assert_eq!(
            handle.receive().await.unwrap(),
            BackendMessage::ReadyForQuery(TransactionStatus::Idle)
        );
    }

    #[tokio::test]
    async fn eof_marks_handle_fatal() {
        let (mut handle, far) = NodeHandle::duplex(NodeRole::Data, NodeId(7));
        drop(far);
        let err = handle.receive().await.unwrap_err();
        assert!(matches!(err, FabricError::Connection { node: Some(7), .. }));
        assert_eq!(handle.state(), ConnState::ErrorFatal);
    }

    #[tokio::test]
    async fn send_buffers_until_flush() {
        let (mut handle, mut far) = NodeHandle::duplex(NodeRole::Data, NodeId(2));
        handle.send(&FrontendMessage::Query("SELECT 1".into()));
        assert!(!handle.is_returnable());

        handle.flush().await.unwrap();
        let mut read = vec![0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut far, &mut read).await.unwrap();
        assert_eq!(read[0], b'Q');
        assert!(read[..n].ends_with(b"SELECT 1\0"));
    }

    #[tokio::test]
    async fn try_receive_never_touches_the_socket() {
        let (mut handle, mut far) = NodeHandle::duplex(NodeRole::Data, NodeId(3));
        assert!(handle.try_receive().unwrap().is_none());
        assert!(!handle.has_buffered_message());

        far.write_all(&framed(b'd', b"copy bytes")).await.unwrap();
        // pull socket data into the inbound buffer via receive
        let msg = handle.receive().await.unwrap();
        assert_eq!(msg, BackendMessage::CopyData(Bytes::from_static(b"copy bytes")));
    }

    #[test]
    fn owner_binding_is_exclusive() {
        let (mut handle, _far) = NodeHandle::duplex(NodeRole::Data, NodeId(4));
        let a = CombinerId::fresh();
        let b = CombinerId::fresh();
        handle.bind_owner(a).unwrap();
        // rebinding the same owner is a no-op
        handle.bind_owner(a).unwrap();
        assert!(handle.bind_owner(b).is_err());
        handle.clear_owner();
        handle.bind_owner(b).unwrap();
        assert_eq!(handle.owner(), Some(b));
    }
}
