//! Client stub for the pool-manager worker.
//!
//! The pooler runs as a separate process; sessions talk to it over a Unix
//! socket using the protocol in [`crate::protocol`]. This stub covers the
//! session side: registration, connection checkout (with fd passing),
//! release, cancel, SET forwarding, and administrative abort/clean.

use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::{debug, warn};
use trellis_errors::{FabricError, FabricResult};
use trellis_wire::{CancelToken, NodeHandle, NodeId, NodeRole};

use crate::fd::recv_with_fds;
use crate::protocol::{PoolReply, PoolRequest, SetScope};

pub struct PoolerClient {
    stream: UnixStream,
    /// Present when we dialed a socket path ourselves; cancel tokens open
    /// their own short-lived connection to the same path.
    socket_path: Option<PathBuf>,
    pid: u32,
    database: String,
    user: String,
}

impl PoolerClient {
    /// Dial the pooler's Unix socket and register this session.
    pub async fn connect(
        path: impl Into<PathBuf>,
        database: impl Into<String>,
        user: impl Into<String>,
    ) -> FabricResult<PoolerClient> {
        let path = path.into();
        let stream = UnixStream::connect(&path).await.map_err(|e| {
            FabricError::Connection {
                node: None,
                message: format!("pooler at {}: {e}", path.display()),
            }
        })?;
        PoolerClient::handshake(stream, Some(path), database.into(), user.into()).await
    }

    /// Register over an existing stream (in-process poolers, tests). Cancel
    /// tokens minted by such a client are no-ops.
    pub async fn attach(
        stream: UnixStream,
        database: impl Into<String>,
        user: impl Into<String>,
    ) -> FabricResult<PoolerClient> {
        PoolerClient::handshake(stream, None, database.into(), user.into()).await
    }

    async fn handshake(
        stream: UnixStream,
        socket_path: Option<PathBuf>,
        database: String,
        user: String,
    ) -> FabricResult<PoolerClient> {
        let mut client = PoolerClient {
            stream,
            socket_path,
            pid: std::process::id(),
            database,
            user,
        };
        let connect = PoolRequest::Connect {
            pid: client.pid,
            database: client.database.clone(),
            user: client.user.clone(),
        };
        client.send_request(&connect).await?;
        Ok(client)
    }

    async fn send_request(&mut self, req: &PoolRequest) -> FabricResult<()> {
        let mut out = Vec::new();
        req.encode(&mut out);
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> FabricResult<PoolReply> {
        let mut header = [0u8; 5];
        self.stream.read_exact(&mut header).await?;
        let len = u32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        PoolReply::decode(header[0], &payload)
    }

    /// One recvmsg carrying the reply frame plus its fd array.
    async fn read_fd_reply(&mut self) -> FabricResult<Vec<RawFd>> {
        let mut buf = [0u8; 64];
        let (n, fds) = loop {
            self.stream.readable().await?;
            let raw = self.stream.as_raw_fd();
            match self
                .stream
                .try_io(Interest::READABLE, || recv_with_fds(raw, &mut buf))
            {
                Ok(result) => break result,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if n < 5 {
            return Err(FabricError::Corrupted("short pooler fd reply".into()));
        }
        let len = u32::from_be_bytes(buf[1..5].try_into().unwrap()) as usize;
        if n != 5 + len {
            return Err(FabricError::Corrupted("malformed pooler fd reply".into()));
        }
        match PoolReply::decode(buf[0], &buf[5..n])? {
            PoolReply::Fds { count } if count as usize == fds.len() => Ok(fds),
            PoolReply::Fds { count } => Err(FabricError::Connection {
                node: None,
                message: format!("pooler promised {count} fds, delivered {}", fds.len()),
            }),
            other => Err(FabricError::Corrupted(format!(
                "unexpected pooler reply {other:?} to checkout"
            ))),
        }
    }

    /// Check out one connection per listed node: data nodes first, in the
    /// requested order, then coordinators. Every handle comes back with a
    /// cancel token wired to the pooler's cancel primitive.
    pub async fn checkout(
        &mut self,
        data: &[NodeId],
        coord: &[NodeId],
    ) -> FabricResult<Vec<NodeHandle>> {
        self.send_request(&PoolRequest::GetConnections {
            data: data.iter().map(|n| n.0).collect(),
            coord: coord.iter().map(|n| n.0).collect(),
        })
        .await?;
        let fds = self.read_fd_reply().await?;
        if fds.len() != data.len() + coord.len() {
            for fd in fds {
                unsafe { libc::close(fd) };
            }
            return Err(FabricError::Connection {
                node: None,
                message: "pooler returned the wrong number of connections".into(),
            });
        }

        let roles = data
            .iter()
            .map(|&n| (NodeRole::Data, n))
            .chain(coord.iter().map(|&n| (NodeRole::Coord, n)));
        let mut handles = Vec::with_capacity(fds.len());
        for ((role, node), fd) in roles.zip(fds) {
            let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
            let mut handle = NodeHandle::from_std_tcp(std_stream, role, node)?;
            handle.set_cancel_token(self.cancel_token(node, role));
            handles.push(handle);
        }
        debug!(
            data = data.len(),
            coord = coord.len(),
            "checked out backend connections"
        );
        Ok(handles)
    }

    /// Return the listed connections to the pool. The pooler cleans and
    /// reuses them, or discards them if cleaning fails.
    pub async fn release(&mut self, data: &[NodeId], coord: &[NodeId]) -> FabricResult<()> {
        self.send_request(&PoolRequest::Release {
            data: data.iter().map(|n| n.0).collect(),
            coord: coord.iter().map(|n| n.0).collect(),
        })
        .await
    }

    /// Fire a backend cancel for each listed node.
    pub async fn cancel(&mut self, data: &[NodeId], coord: &[NodeId]) -> FabricResult<()> {
        self.send_request(&PoolRequest::Cancel {
            data: data.iter().map(|n| n.0).collect(),
            coord: coord.iter().map(|n| n.0).collect(),
        })
        .await
    }

    /// Forward a SET command. `Global` commands are replayed by the pooler
    /// on every fresh checkout for this session; `TempMark` flags the
    /// session as using temp objects.
    pub async fn set_command(&mut self, scope: SetScope, command: &str) -> FabricResult<i32> {
        self.send_request(&PoolRequest::Set {
            scope,
            command: command.to_owned(),
        })
        .await?;
        match self.read_reply().await? {
            PoolReply::Result(code) => Ok(code),
            other => Err(FabricError::Corrupted(format!(
                "unexpected pooler reply {other:?} to SET"
            ))),
        }
    }

    /// Ask the pooler to signal every session of a database/user pair.
    /// Returns the pids that were signalled.
    pub async fn abort_sessions(&mut self, database: &str, user: &str) -> FabricResult<Vec<u32>> {
        self.send_request(&PoolRequest::Abort {
            database: database.to_owned(),
            user: user.to_owned(),
        })
        .await?;
        match self.read_reply().await? {
            PoolReply::Pids(pids) => Ok(pids),
            other => Err(FabricError::Corrupted(format!(
                "unexpected pooler reply {other:?} to ABORT"
            ))),
        }
    }

    /// Ask the pooler to drop idle pooled connections for the listed nodes.
    /// Returns 0 when the pools were fully cleaned.
    pub async fn clean(&mut self, data: &[NodeId], coord: &[NodeId]) -> FabricResult<i32> {
        self.send_request(&PoolRequest::Clean {
            data: data.iter().map(|n| n.0).collect(),
            coord: coord.iter().map(|n| n.0).collect(),
            database: self.database.clone(),
            user: self.user.clone(),
        })
        .await?;
        match self.read_reply().await? {
            PoolReply::Result(code) => Ok(code),
            other => Err(FabricError::Corrupted(format!(
                "unexpected pooler reply {other:?} to CLEAN"
            ))),
        }
    }

    /// Unregister and close.
    pub async fn disconnect(mut self) -> FabricResult<()> {
        self.send_request(&PoolRequest::Disconnect).await?;
        Ok(())
    }

    /// A token that cancels the query running on `node`, from any task,
    /// without touching the handle's main socket. The token opens its own
    /// short-lived pooler connection so it stays usable while the session's
    /// connection is busy.
    pub fn cancel_token(&self, node: NodeId, role: NodeRole) -> CancelToken {
        let Some(path) = self.socket_path.clone() else {
            return CancelToken::noop();
        };
        let pid = self.pid;
        let database = self.database.clone();
        let user = self.user.clone();
        CancelToken::new(move || {
            let path = path.clone();
            let database = database.clone();
            let user = user.clone();
            let (data, coord) = match role {
                NodeRole::Data => (vec![node.0], vec![]),
                NodeRole::Coord => (vec![], vec![node.0]),
            };
            let Ok(rt) = tokio::runtime::Handle::try_current() else {
                warn!(node = node.0, "cancel fired outside a runtime; dropped");
                return;
            };
            rt.spawn(async move {
                if let Err(error) = fire_cancel(&path, pid, &database, &user, data, coord).await {
                    warn!(%error, node = node.0, "backend cancel failed");
                }
            });
        })
    }
}

async fn fire_cancel(
    path: &std::path::Path,
    pid: u32,
    database: &str,
    user: &str,
    data: Vec<u32>,
    coord: Vec<u32>,
) -> FabricResult<()> {
    let mut stream = UnixStream::connect(path).await?;
    let mut out = Vec::new();
    PoolRequest::Connect {
        pid,
        database: database.to_owned(),
        user: user.to_owned(),
    }
    .encode(&mut out);
    PoolRequest::Cancel { data, coord }.encode(&mut out);
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}
