//! Out-of-band query cancellation.

use std::fmt;
use std::sync::Arc;

/// A cloneable token that interrupts the query currently running on one
/// backend connection.
///
/// The token is obtained at pool checkout and is safe to fire from any task;
/// it never touches the handle's main socket, so the session does not need
/// to stop mid-read to cancel. Firing is best-effort and idempotent: the
/// backend ignores cancel requests that arrive after the query finished.
#[derive(Clone)]
pub struct CancelToken {
    action: Arc<dyn Fn() + Send + Sync>,
}

impl CancelToken {
    pub fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        CancelToken {
            action: Arc::new(action),
        }
    }

    /// A token that does nothing, for handles without a cancel path.
    pub fn noop() -> Self {
        CancelToken::new(|| {})
    }

    pub fn fire(&self) {
        (self.action)();
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CancelToken")
    }
}
