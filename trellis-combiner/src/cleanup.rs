//! Pre-abort cleanup: drain half-processed conversations so rollback
//! statements meet idle connections.
//!
//! Runs over every handle the session owns before the transaction
//! coordinator issues rollbacks. COPY IN is failed explicitly, COPY OUT is
//! read dry, and in-flight queries are read-and-discarded until the backend
//! reports ready. Failures here are the caller's to log; this code never
//! escalates them into new aborts.

use tracing::{debug, warn};
use trellis_errors::FabricResult;
use trellis_wire::{BackendMessage, ConnState, FrontendMessage, HandleSet, NodeHandle};

/// Drain one handle to a quiet state. On return the handle is `Idle` (ready
/// seen), or `ErrorFatal` if the conversation could not be salvaged.
pub async fn drain_handle(handle: &mut NodeHandle) -> FabricResult<()> {
    loop {
        match handle.state() {
            ConnState::Idle | ConnState::ErrorFatal => return Ok(()),
            ConnState::CopyIn => {
                // tell the backend to error out the copy; it answers with
                // ErrorResponse then ReadyForQuery
                handle.send(&FrontendMessage::CopyFail("transaction aborted".into()));
                handle.flush().await?;
                handle.set_state(ConnState::Query);
            }
            ConnState::CopyOut => {
                // nothing to send; read the stream dry
                handle.set_state(ConnState::Query);
            }
            ConnState::Query => match handle.receive().await? {
                BackendMessage::ReadyForQuery(status) => {
                    handle.set_transaction_status(status);
                    handle.set_state(ConnState::Idle);
                    handle.clear_owner();
                    return Ok(());
                }
                BackendMessage::Unknown(tag) => {
                    warn!(node = %handle.node_id(), tag, "unknown message while draining");
                    handle.mark_fatal();
                    return Ok(());
                }
                // data rows, copy data, command completions, errors: all
                // discarded on the way to ready
                _ => {}
            },
        }
    }
}

/// The session-wide cleanup pass. Each handle is drained independently;
/// a handle that cannot be drained is fenced off (`ErrorFatal`) rather than
/// blocking the others.
pub async fn clean_all_handles(handles: &mut HandleSet) {
    for (key, handle) in handles.iter_mut() {
        if handle.state() == ConnState::Idle {
            continue;
        }
        debug!(slot = key, node = %handle.node_id(), state = ?handle.state(), "draining dirty handle");
        if let Err(error) = drain_handle(handle).await {
            warn!(slot = key, %error, "failed to drain handle; fencing it off");
            handle.mark_fatal();
        }
    }
}
