// Transaction observers.
//
// The ledger calls every registered observer after an operation has been
// committed. Observers only get to look: they return nothing and cannot undo
// a transaction.

use super::economy_models::TransactionOutcome;
use tokio::sync::mpsc::UnboundedSender;

pub trait TransactionObserver: Send + Sync {
    fn on_transaction(&self, outcome: &TransactionOutcome);
}

/// Writes an audit line for every completed transaction.
pub struct LogObserver;

impl TransactionObserver for LogObserver {
    fn on_transaction(&self, outcome: &TransactionOutcome) {
        match serde_json::to_string(outcome) {
            Ok(json) => tracing::info!(
                target: "economy::audit",
                account = %outcome.account,
                kind = ?outcome.kind,
                amount = %outcome.amount,
                "{}",
                json
            ),
            Err(e) => tracing::warn!("Failed to serialize transaction outcome: {}", e),
        }
    }
}

/// Forwards outcomes into a channel, for anything that wants to react to
/// transactions on its own task.
pub struct ChannelObserver {
    sender: UnboundedSender<TransactionOutcome>,
}

impl ChannelObserver {
    pub fn new(sender: UnboundedSender<TransactionOutcome>) -> Self {
        Self { sender }
    }
}

impl TransactionObserver for ChannelObserver {
    fn on_transaction(&self, outcome: &TransactionOutcome) {
        // Nobody listening any more is fine.
        let _ = self.sender.send(outcome.clone());
    }
}
