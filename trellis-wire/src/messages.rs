//! Typed views of the v3 frontend/backend protocol messages the fabric
//! exchanges with backend nodes, plus the coordinator extension messages
//! (global xid, snapshot, timestamp, barrier) that precede queries.

use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};
use bytes::Bytes;
use trellis_errors::{FabricError, FabricResult, SqlState};

use crate::handle::TransactionStatus;

/// Special "length" code that identifies an out-of-band cancel request on a
/// freshly opened socket.
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// One column of a `RowDescription`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_id: i16,
    pub type_oid: u32,
    pub type_len: i16,
    pub type_mod: i32,
    pub format: i16,
}

/// Snapshot data shipped to every backend before a query so its visibility
/// checks agree with the coordinator's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotData {
    pub xmin: u64,
    pub xmax: u64,
    pub active: Vec<u64>,
}

/// Messages a backend can deliver while the fabric is driving a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    /// `T`
    RowDescription(Vec<FieldDescription>),
    /// `D`: raw payload (column count + column values), left undecoded; the
    /// executor owns tuple decoding.
    DataRow(Bytes),
    /// `C`: the command tag, e.g. `INSERT 0 1`.
    CommandComplete(String),
    /// `s`
    PortalSuspended,
    /// `G`
    CopyInResponse,
    /// `H`
    CopyOutResponse,
    /// `d`
    CopyData(Bytes),
    /// `c`
    CopyDone,
    /// `E`: only the `C`/`M`/`D` sub-fields are retained.
    ErrorResponse {
        sqlstate: Option<SqlState>,
        message: String,
        detail: Option<String>,
    },
    /// `N`: consumed silently by the combiner.
    NoticeResponse(String),
    /// `Z`
    ReadyForQuery(TransactionStatus),
    /// `b`: coordinator extension: a barrier request completed.
    BarrierOk,
    /// `1`
    ParseComplete,
    /// `2`
    BindComplete,
    /// `3`
    CloseComplete,
    /// `n`
    NoData,
    /// `A`: async notification, consumed silently.
    Notification,
    /// `S`: run-time parameter report, consumed silently.
    ParameterStatus { name: String, value: String },
    /// Anything else; the handle carrying it must be fenced off.
    Unknown(u8),
}

impl BackendMessage {
    /// Decode one framed message. Malformed payloads for known tags are
    /// protocol corruption; unknown tags are reported as [`Unknown`] so the
    /// combiner can fence the handle.
    ///
    /// [`Unknown`]: BackendMessage::Unknown
    pub fn decode(tag: u8, payload: Bytes) -> FabricResult<BackendMessage> {
        let mut r = Reader::new(&payload);
        let msg = match tag {
            b'T' => {
                let nfields = r.i16()?;
                let mut fields = Vec::with_capacity(nfields.max(0) as usize);
                for _ in 0..nfields {
                    fields.push(FieldDescription {
                        name: r.cstr()?,
                        table_oid: r.u32()?,
                        column_id: r.i16()?,
                        type_oid: r.u32()?,
                        type_len: r.i16()?,
                        type_mod: r.i32()?,
                        format: r.i16()?,
                    });
                }
                BackendMessage::RowDescription(fields)
            }
            b'D' => BackendMessage::DataRow(payload.clone()),
            b'C' => BackendMessage::CommandComplete(r.cstr()?),
            b's' => BackendMessage::PortalSuspended,
            b'G' => BackendMessage::CopyInResponse,
            b'H' => BackendMessage::CopyOutResponse,
            b'd' => BackendMessage::CopyData(payload.clone()),
            b'c' => BackendMessage::CopyDone,
            b'E' => {
                let mut sqlstate = None;
                let mut message = String::new();
                let mut detail = None;
                loop {
                    let field = r.u8()?;
                    if field == 0 {
                        break;
                    }
                    let value = r.cstr()?;
                    match field {
                        b'C' => sqlstate = SqlState::from_bytes(value.as_bytes()),
                        b'M' => message = value,
                        b'D' => detail = Some(value),
                        _ => {}
                    }
                }
                BackendMessage::ErrorResponse {
                    sqlstate,
                    message,
                    detail,
                }
            }
            b'N' => {
                // keep only the human-readable message for the log
                let mut message = String::new();
                loop {
                    let field = r.u8()?;
                    if field == 0 {
                        break;
                    }
                    let value = r.cstr()?;
                    if field == b'M' {
                        message = value;
                    }
                }
                BackendMessage::NoticeResponse(message)
            }
            b'Z' => {
                let status = match r.u8()? {
                    b'I' => TransactionStatus::Idle,
                    b'T' => TransactionStatus::InTxn,
                    b'E' => TransactionStatus::InErrorTxn,
                    other => {
                        return Err(FabricError::Corrupted(format!(
                            "bad transaction status {:?} in ReadyForQuery",
                            other as char
                        )))
                    }
                };
                BackendMessage::ReadyForQuery(status)
            }
            b'b' => BackendMessage::BarrierOk,
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'n' => BackendMessage::NoData,
            b'A' => BackendMessage::Notification,
            b'S' => BackendMessage::ParameterStatus {
                name: r.cstr()?,
                value: r.cstr()?,
            },
            other => BackendMessage::Unknown(other),
        };
        Ok(msg)
    }
}

/// Messages the fabric sends to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    Query(String),
    Parse {
        statement: String,
        query: String,
        param_types: Vec<u32>,
    },
    Bind {
        portal: String,
        statement: String,
        params: Vec<Option<Bytes>>,
        binary_results: bool,
    },
    DescribePortal(String),
    DescribeStatement(String),
    Execute {
        portal: String,
        max_rows: i32,
    },
    Sync,
    ClosePortal(String),
    CloseStatement(String),
    Flush,
    CopyData(Bytes),
    CopyDone,
    CopyFail(String),
    Terminate,
    /// Coordinator extension `g`: the global transaction id all participants
    /// share.
    GlobalXid(u64),
    /// Coordinator extension `s`.
    Snapshot(SnapshotData),
    /// Coordinator extension `t`: the snapshot timestamp from the oracle.
    Timestamp(u64),
    /// Coordinator extension `b`: request a cluster barrier.
    Barrier(String),
    /// Coordinator extension `M`: command id, so triggers on the backend see
    /// the coordinator's statement numbering.
    CommandId(u32),
}

impl FrontendMessage {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            FrontendMessage::Query(q) => {
                frame(out, b'Q', |body| {
                    put_cstr(body, q);
                });
            }
            FrontendMessage::Parse {
                statement,
                query,
                param_types,
            } => {
                frame(out, b'P', |body| {
                    put_cstr(body, statement);
                    put_cstr(body, query);
                    body.write_i16::<BigEndian>(param_types.len() as i16).ok();
                    for oid in param_types {
                        body.write_u32::<BigEndian>(*oid).ok();
                    }
                });
            }
            FrontendMessage::Bind {
                portal,
                statement,
                params,
                binary_results,
            } => {
                frame(out, b'B', |body| {
                    put_cstr(body, portal);
                    put_cstr(body, statement);
                    // all parameters in text format
                    body.write_i16::<BigEndian>(0).ok();
                    body.write_i16::<BigEndian>(params.len() as i16).ok();
                    for p in params {
                        match p {
                            Some(v) => {
                                body.write_i32::<BigEndian>(v.len() as i32).ok();
                                body.write_all(v).ok();
                            }
                            None => {
                                body.write_i32::<BigEndian>(-1).ok();
                            }
                        }
                    }
                    body.write_i16::<BigEndian>(1).ok();
                    body.write_i16::<BigEndian>(i16::from(*binary_results)).ok();
                });
            }
            FrontendMessage::DescribePortal(name) => {
                frame(out, b'D', |body| {
                    body.push(b'P');
                    put_cstr(body, name);
                });
            }
            FrontendMessage::DescribeStatement(name) => {
                frame(out, b'D', |body| {
                    body.push(b'S');
                    put_cstr(body, name);
                });
            }
            FrontendMessage::Execute { portal, max_rows } => {
                frame(out, b'E', |body| {
                    put_cstr(body, portal);
                    body.write_i32::<BigEndian>(*max_rows).ok();
                });
            }
            FrontendMessage::Sync => frame(out, b'S', |_| {}),
            FrontendMessage::ClosePortal(name) => {
                frame(out, b'C', |body| {
                    body.push(b'P');
                    put_cstr(body, name);
                });
            }
            FrontendMessage::CloseStatement(name) => {
                frame(out, b'C', |body| {
                    body.push(b'S');
                    put_cstr(body, name);
                });
            }
            FrontendMessage::Flush => frame(out, b'H', |_| {}),
            FrontendMessage::CopyData(data) => {
                frame(out, b'd', |body| {
                    body.extend_from_slice(data);
                });
            }
            FrontendMessage::CopyDone => frame(out, b'c', |_| {}),
            FrontendMessage::CopyFail(reason) => {
                frame(out, b'f', |body| {
                    put_cstr(body, reason);
                });
            }
            FrontendMessage::Terminate => frame(out, b'X', |_| {}),
            FrontendMessage::GlobalXid(xid) => {
                frame(out, b'g', |body| {
                    body.write_u64::<BigEndian>(*xid).ok();
                });
            }
            FrontendMessage::Snapshot(snap) => {
                frame(out, b's', |body| {
                    body.write_u64::<BigEndian>(snap.xmin).ok();
                    body.write_u64::<BigEndian>(snap.xmax).ok();
                    body.write_u32::<BigEndian>(snap.active.len() as u32).ok();
                    for xid in &snap.active {
                        body.write_u64::<BigEndian>(*xid).ok();
                    }
                });
            }
            FrontendMessage::Timestamp(ts) => {
                frame(out, b't', |body| {
                    body.write_u64::<BigEndian>(*ts).ok();
                });
            }
            FrontendMessage::Barrier(id) => {
                frame(out, b'b', |body| {
                    put_cstr(body, id);
                });
            }
            FrontendMessage::CommandId(cid) => {
                frame(out, b'M', |body| {
                    body.write_u32::<BigEndian>(*cid).ok();
                });
            }
        }
    }
}

fn frame(out: &mut Vec<u8>, tag: u8, fill: impl FnOnce(&mut Vec<u8>)) {
    out.push(tag);
    let len_at = out.len();
    out.extend_from_slice(&[0, 0, 0, 0]);
    fill(out);
    let len = (out.len() - len_at) as u32;
    out[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> FabricResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(FabricError::Corrupted("truncated backend message".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> FabricResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> FabricResult<i16> {
        Ok(i16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> FabricResult<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> FabricResult<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn cstr(&mut self) -> FabricResult<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| FabricError::Corrupted("unterminated string in message".into()))?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Ok(s)
    }
}

/// Parse the affected-row count out of a `CommandComplete` tag.
///
/// `INSERT 0 5` → 5, `UPDATE 3` → 3, `SELECT 10` → 10; tags without a count
/// (`BEGIN`, `PREPARE TRANSACTION`, ...) yield `None`.
pub fn rows_from_command_tag(tag: &str) -> Option<u64> {
    let last = tag.rsplit(' ').next()?;
    last.parse().ok()
}
