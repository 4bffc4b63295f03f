use std::fmt::Debug;

use tracing::{info, warn};

use crate::client::error::Error;

/// Observer of a group consumer's rebalance and commit lifecycle.
///
/// Callbacks run on the coordinator's tasks and must not block.
pub trait Notifier: Debug + Send + Sync {
    fn rebalance_start(&self);

    fn rebalance_ok(&self);

    fn rebalance_error(&self, err: &Error);

    fn commit_error(&self, err: &Error);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn rebalance_start(&self) {
        info!("rebalance started");
    }

    fn rebalance_ok(&self) {
        info!("rebalance finished");
    }

    fn rebalance_error(&self, err: &Error) {
        warn!(%err, "rebalance failed");
    }

    fn commit_error(&self, err: &Error) {
        warn!(%err, "offset commit failed");
    }
}
