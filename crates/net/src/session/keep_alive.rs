use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::session::connection::{SessionInner, SessionState};
use crate::session::transport;

/// Starts the reconnect supervisor of a keep-alive session, once per session.
///
/// Every interval the supervisor checks whether the session lost its
/// connection and, if so, connects again to the last opened address under
/// the same id. It stops when the session closes or the last handle drops.
pub(super) fn spawn(inner: &Arc<SessionInner>) {
    if !inner.claim_supervisor() {
        return;
    }

    let token = inner.shutdown_token().clone();
    let interval = inner.config().reconnect_interval();
    tokio::spawn(supervise(Arc::downgrade(inner), token, interval));
}

async fn supervise(session: Weak<SessionInner>, token: CancellationToken, interval: Duration) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }

        let Some(inner) = session.upgrade() else {
            break;
        };
        if inner.state() != SessionState::Unconnected {
            continue;
        }
        let Some(remote) = inner.remote() else {
            continue;
        };

        trace!(id = inner.id(), %remote, "reconnecting keep-alive session");
        match transport::connect(inner.kind(), remote, inner.config().reuse_addr()).await {
            Ok(transport) => {
                inner.attach(transport).await;
                info!(id = inner.id(), %remote, "keep-alive session reconnected");
            }
            Err(e) => warn!(id = inner.id(), %remote, cause = %e, "keep-alive reconnect failed"),
        }
    }
    trace!("keep-alive supervisor stopped");
}
