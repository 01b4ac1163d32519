//! The pool-manager wire protocol: one-byte message types on a
//! length-prefixed socket.
//!
//! Frame layout in both directions: `type: u8`, `len: u32` (payload bytes,
//! big-endian), payload. Node lists are `ndata: u32, data_ids..., ncoord:
//! u32, coord_ids...`; strings are length-prefixed without a terminator.
//! The reply to `g` carries only an fd count in its payload; the fds
//! themselves ride in `SCM_RIGHTS` ancillary data on the same message.
//!
//! Both directions live here so an in-process pooler (tests, embedded
//! deployments) can speak the protocol with the same codec the client uses.

use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};
use trellis_errors::{FabricError, FabricResult};

/// Scope of a forwarded `SET` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetScope {
    /// Applies to the current transaction only; not replayed.
    Local = 0,
    /// Session-wide; the pooler replays it on fresh checkouts.
    Global = 1,
    /// Marks the session as having created temp objects.
    TempMark = 2,
}

impl SetScope {
    fn from_u32(v: u32) -> FabricResult<SetScope> {
        match v {
            0 => Ok(SetScope::Local),
            1 => Ok(SetScope::Global),
            2 => Ok(SetScope::TempMark),
            other => Err(FabricError::Corrupted(format!(
                "bad SET scope {other} in pool message"
            ))),
        }
    }
}

/// Client → pooler messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolRequest {
    /// `c`: register this session with the pooler. No reply.
    Connect {
        pid: u32,
        database: String,
        user: String,
    },
    /// `d`: unregister and close. No reply.
    Disconnect,
    /// `g`: check out connections. Reply: fd array, data nodes first, in
    /// the requested order.
    GetConnections { data: Vec<u32>, coord: Vec<u32> },
    /// `r`: return the listed connections (cleaned) or discard them.
    Release { data: Vec<u32>, coord: Vec<u32> },
    /// `h`: fire a backend cancel for each listed connection.
    Cancel { data: Vec<u32>, coord: Vec<u32> },
    /// `s`: forward a SET command. Reply: result code.
    Set { scope: SetScope, command: String },
    /// `a`: abort every session of the given database/user pair. Reply:
    /// signalled pids.
    Abort { database: String, user: String },
    /// `f`: clean pooled connections for the given nodes and
    /// database/user. Reply: 0 when complete.
    Clean {
        data: Vec<u32>,
        coord: Vec<u32>,
        database: String,
        user: String,
    },
}

impl PoolRequest {
    pub fn tag(&self) -> u8 {
        match self {
            PoolRequest::Connect { .. } => b'c',
            PoolRequest::Disconnect => b'd',
            PoolRequest::GetConnections { .. } => b'g',
            PoolRequest::Release { .. } => b'r',
            PoolRequest::Cancel { .. } => b'h',
            PoolRequest::Set { .. } => b's',
            PoolRequest::Abort { .. } => b'a',
            PoolRequest::Clean { .. } => b'f',
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        match self {
            PoolRequest::Connect {
                pid,
                database,
                user,
            } => {
                body.write_u32::<BigEndian>(*pid).ok();
                put_string(&mut body, database);
                put_string(&mut body, user);
            }
            PoolRequest::Disconnect => {}
            PoolRequest::GetConnections { data, coord }
            | PoolRequest::Release { data, coord }
            | PoolRequest::Cancel { data, coord } => {
                put_nodes(&mut body, data, coord);
            }
            PoolRequest::Set { scope, command } => {
                body.write_u32::<BigEndian>(*scope as u32).ok();
                put_string(&mut body, command);
            }
            PoolRequest::Abort { database, user } => {
                put_string(&mut body, database);
                put_string(&mut body, user);
            }
            PoolRequest::Clean {
                data,
                coord,
                database,
                user,
            } => {
                put_nodes(&mut body, data, coord);
                put_string(&mut body, database);
                put_string(&mut body, user);
            }
        }
        out.push(self.tag());
        out.write_u32::<BigEndian>(body.len() as u32).ok();
        out.write_all(&body).ok();
    }

    pub fn decode(tag: u8, payload: &[u8]) -> FabricResult<PoolRequest> {
        let mut r = PoolReader::new(payload);
        let req = match tag {
            b'c' => PoolRequest::Connect {
                pid: r.u32()?,
                database: r.string()?,
                user: r.string()?,
            },
            b'd' => PoolRequest::Disconnect,
            b'g' => {
                let (data, coord) = r.nodes()?;
                PoolRequest::GetConnections { data, coord }
            }
            b'r' => {
                let (data, coord) = r.nodes()?;
                PoolRequest::Release { data, coord }
            }
            b'h' => {
                let (data, coord) = r.nodes()?;
                PoolRequest::Cancel { data, coord }
            }
            b's' => PoolRequest::Set {
                scope: SetScope::from_u32(r.u32()?)?,
                command: r.string()?,
            },
            b'a' => PoolRequest::Abort {
                database: r.string()?,
                user: r.string()?,
            },
            b'f' => {
                let (data, coord) = r.nodes()?;
                PoolRequest::Clean {
                    data,
                    coord,
                    database: r.string()?,
                    user: r.string()?,
                }
            }
            other => {
                return Err(FabricError::Corrupted(format!(
                    "unknown pool message type {:?}",
                    other as char
                )))
            }
        };
        Ok(req)
    }
}

/// Pooler → client messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolReply {
    /// `g`: `count` fds follow in ancillary data.
    Fds { count: u32 },
    /// `s` / `f`: result code, 0 for success/complete.
    Result(i32),
    /// `a`: pids that were signalled.
    Pids(Vec<u32>),
}

impl PoolReply {
    pub fn tag(&self) -> u8 {
        match self {
            PoolReply::Fds { .. } => b'g',
            PoolReply::Result(_) => b'i',
            PoolReply::Pids(_) => b'a',
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        match self {
            PoolReply::Fds { count } => {
                body.write_u32::<BigEndian>(*count).ok();
            }
            PoolReply::Result(code) => {
                body.write_i32::<BigEndian>(*code).ok();
            }
            PoolReply::Pids(pids) => {
                body.write_u32::<BigEndian>(pids.len() as u32).ok();
                for pid in pids {
                    body.write_u32::<BigEndian>(*pid).ok();
                }
            }
        }
        out.push(self.tag());
        out.write_u32::<BigEndian>(body.len() as u32).ok();
        out.write_all(&body).ok();
    }

    pub fn decode(tag: u8, payload: &[u8]) -> FabricResult<PoolReply> {
        let mut r = PoolReader::new(payload);
        let reply = match tag {
            b'g' => PoolReply::Fds { count: r.u32()? },
            b'i' => PoolReply::Result(r.u32()? as i32),
            b'a' => {
                let n = r.u32()? as usize;
                let mut pids = Vec::with_capacity(n);
                for _ in 0..n {
                    pids.push(r.u32()?);
                }
                PoolReply::Pids(pids)
            }
            other => {
                return Err(FabricError::Corrupted(format!(
                    "unknown pool reply type {:?}",
                    other as char
                )))
            }
        };
        Ok(reply)
    }
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.write_u32::<BigEndian>(s.len() as u32).ok();
    out.write_all(s.as_bytes()).ok();
}

fn put_nodes(out: &mut Vec<u8>, data: &[u32], coord: &[u32]) {
    out.write_u32::<BigEndian>(data.len() as u32).ok();
    for id in data {
        out.write_u32::<BigEndian>(*id).ok();
    }
    out.write_u32::<BigEndian>(coord.len() as u32).ok();
    for id in coord {
        out.write_u32::<BigEndian>(*id).ok();
    }
}

struct PoolReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PoolReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        PoolReader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> FabricResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(FabricError::Corrupted("truncated pool message".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> FabricResult<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn string(&mut self) -> FabricResult<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| FabricError::Corrupted("non-utf8 string in pool message".into()))
    }

    fn nodes(&mut self) -> FabricResult<(Vec<u32>, Vec<u32>)> {
        let ndata = self.u32()? as usize;
        let mut data = Vec::with_capacity(ndata);
        for _ in 0..ndata {
            data.push(self.u32()?);
        }
        let ncoord = self.u32()? as usize;
        let mut coord = Vec::with_capacity(ncoord);
        for _ in 0..ncoord {
            coord.push(self.u32()?);
        }
        Ok((data, coord))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn roundtrip_request(req: PoolRequest) {
        let mut out = Vec::new();
        req.encode(&mut out);
        let tag = out[0];
        let len = u32::from_be_bytes(out[1..5].try_into().unwrap()) as usize;
        assert_eq!(out.len(), 5 + len);
        assert_eq!(PoolRequest::decode(tag, &out[5..]).unwrap(), req);
    }

    #[test]
    fn requests_roundtrip() {
        roundtrip_request(PoolRequest::Connect {
            pid: 4242,
            database: "orders".into(),
            user: "app".into(),
        });
        roundtrip_request(PoolRequest::Disconnect);
        roundtrip_request(PoolRequest::GetConnections {
            data: vec![1, 2, 3],
            coord: vec![7],
        });
        roundtrip_request(PoolRequest::Release {
            data: vec![],
            coord: vec![1],
        });
        roundtrip_request(PoolRequest::Cancel {
            data: vec![5],
            coord: vec![],
        });
        roundtrip_request(PoolRequest::Set {
            scope: SetScope::Global,
            command: "SET search_path TO app".into(),
        });
        roundtrip_request(PoolRequest::Abort {
            database: "orders".into(),
            user: "app".into(),
        });
        roundtrip_request(PoolRequest::Clean {
            data: vec![1, 2],
            coord: vec![],
            database: "orders".into(),
            user: "app".into(),
        });
    }

    #[test]
    fn replies_roundtrip() {
        for reply in [
            PoolReply::Fds { count: 4 },
            PoolReply::Result(0),
            PoolReply::Result(-1),
            PoolReply::Pids(vec![100, 200]),
        ] {
            let mut out = Vec::new();
            reply.encode(&mut out);
            let tag = out[0];
            assert_eq!(PoolReply::decode(tag, &out[5..]).unwrap(), reply);
        }
    }

    #[test]
    fn truncated_payloads_are_corruption() {
        assert!(matches!(
            PoolRequest::decode(b'g', &[0, 0, 0, 5]),
            Err(FabricError::Corrupted(_))
        ));
        assert!(matches!(
            PoolRequest::decode(b'z', &[]),
            Err(FabricError::Corrupted(_))
        ));
    }
}
