//! Error types shared by every crate in the trellis workspace.
//!
//! Callers generally match on the top-level [`FabricError`] variant only; the
//! payloads exist for logging and for the transaction coordinator, which needs
//! node-granular failure information to drive recovery.

use std::fmt;
use std::io;

use thiserror::Error;

/// A 5-byte SQLSTATE code as carried in backend `ErrorResponse` messages.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SqlState(pub [u8; 5]);

impl SqlState {
    /// `XX001`: reported when backend responses contradict each other or the
    /// protocol state machine.
    pub const DATA_CORRUPTED: SqlState = SqlState(*b"XX001");
    /// `08006`: the connection to a backend failed mid-conversation.
    pub const CONNECTION_FAILURE: SqlState = SqlState(*b"08006");
    /// `57014`: statement cancelled at the user's request.
    pub const QUERY_CANCELED: SqlState = SqlState(*b"57014");
    /// `XX000`: catch-all internal error.
    pub const INTERNAL_ERROR: SqlState = SqlState(*b"XX000");

    pub fn from_bytes(raw: &[u8]) -> Option<SqlState> {
        raw.try_into().ok().map(SqlState)
    }

    pub fn as_str(&self) -> &str {
        // SQLSTATE codes are ASCII by definition; fall back for hostile input
        std::str::from_utf8(&self.0).unwrap_or("?????")
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SqlState({})", self.as_str())
    }
}

/// Which phase of the distributed commit protocol a [`FabricError::Txn`]
/// originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    Begin,
    Prepare,
    Commit,
    Abort,
}

impl fmt::Display for TxnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnPhase::Begin => f.write_str("begin"),
            TxnPhase::Prepare => f.write_str("prepare"),
            TxnPhase::Commit => f.write_str("commit"),
            TxnPhase::Abort => f.write_str("abort"),
        }
    }
}

/// Every error surfaced by the trellis crates.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Unsupported distribution policy or key type, malformed host/port list.
    /// Raised at construction time; no partial state leaks.
    #[error("configuration error: {0}")]
    Config(String),

    /// Lost socket, pool checkout failure, cancel failure.
    #[error("connection error{}: {message}", node_suffix(.node))]
    Connection {
        /// Backend node the failure was observed on, when known.
        node: Option<u32>,
        message: String,
    },

    /// Unexpected message type for the current request state, a data row
    /// without a description, or replicated writes reporting different row
    /// counts. Surfaces with SQLSTATE `XX001`.
    #[error("data corrupted: {0}")]
    Corrupted(String),

    /// An `ErrorResponse` relayed from a backend.
    #[error("remote error {sqlstate}: {message}")]
    Remote {
        sqlstate: SqlState,
        message: String,
        detail: Option<String>,
    },

    /// Prepare/commit/abort failure with node granularity.
    #[error("transaction {phase} failed on nodes {failed_nodes:?}: {message}")]
    Txn {
        phase: TxnPhase,
        failed_nodes: Vec<u32>,
        message: String,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Assertion failures and other conditions that should never happen.
    /// The session terminates on these.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FabricError {
    /// The SQLSTATE this error would be reported under to a client.
    pub fn sqlstate(&self) -> SqlState {
        match self {
            FabricError::Remote { sqlstate, .. } => *sqlstate,
            FabricError::Corrupted(_) => SqlState::DATA_CORRUPTED,
            FabricError::Connection { .. } | FabricError::Io(_) => SqlState::CONNECTION_FAILURE,
            _ => SqlState::INTERNAL_ERROR,
        }
    }

    /// Whether the session must be torn down rather than recovered.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FabricError::Internal(_))
    }
}

fn node_suffix(node: &Option<u32>) -> String {
    match node {
        Some(n) => format!(" on node {n}"),
        None => String::new(),
    }
}

pub type FabricResult<T> = Result<T, FabricError>;

/// Return early with a [`FabricError::Internal`] built from a format string.
#[macro_export]
macro_rules! internal {
    ($($fmt:tt)*) => {
        return Err($crate::FabricError::Internal(format!($($fmt)*)).into())
    };
}

/// Build (without returning) a [`FabricError::Internal`] from a format string.
#[macro_export]
macro_rules! internal_err {
    ($($fmt:tt)*) => {
        $crate::FabricError::Internal(format!($($fmt)*))
    };
}

/// Return early with a [`FabricError::Internal`] unless the condition holds.
#[macro_export]
macro_rules! invariant {
    ($cond:expr) => {
        if !$cond {
            $crate::internal!("invariant failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($fmt:tt)*) => {
        if !$cond {
            $crate::internal!($($fmt)*);
        }
    };
}

/// Return early with a [`FabricError::Internal`] unless the two expressions
/// are equal.
#[macro_export]
macro_rules! invariant_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            $crate::internal!(
                "invariant failed: {} == {} ({:?} vs {:?})",
                stringify!($left),
                stringify!($right),
                $left,
                $right
            );
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_display() {
        assert_eq!(SqlState::DATA_CORRUPTED.to_string(), "XX001");
        assert_eq!(SqlState::from_bytes(b"42P01").unwrap().to_string(), "42P01");
        assert_eq!(SqlState::from_bytes(b"too long to be one"), None);
    }

    #[test]
    fn error_sqlstates() {
        assert_eq!(
            FabricError::Corrupted("row counts".into()).sqlstate(),
            SqlState::DATA_CORRUPTED
        );
        let remote = FabricError::Remote {
            sqlstate: SqlState::from_bytes(b"23505").unwrap(),
            message: "duplicate key".into(),
            detail: None,
        };
        assert_eq!(remote.sqlstate().to_string(), "23505");
    }

    #[test]
    fn invariant_macros_return_err() {
        fn check(x: u32) -> FabricResult<u32> {
            invariant!(x < 10, "x out of range: {x}");
            invariant_eq!(x % 2, 0);
            Ok(x)
        }
        assert!(check(2).is_ok());
        assert!(matches!(check(12), Err(FabricError::Internal(_))));
        assert!(matches!(check(3), Err(FabricError::Internal(_))));
    }
}
