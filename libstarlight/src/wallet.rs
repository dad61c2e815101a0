use crate::amount::Amount;
use crate::ledger::Cursor;
use serde::{Deserialize, Serialize};

/// The agent's primary account as tracked by the wallet watcher.
///
/// `seqnum` is the agent's own view of the account sequence number; it is bumped
/// locally whenever an envelope sourced from the primary account is built, so
/// that concurrent submissions in the task basket do not collide.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAcct {
    pub balance: Amount,
    /// Zero until the create-account operation is observed on the ledger.
    pub seqnum: u64,
    /// Paging token of the last processed wallet transaction.
    pub cursor: Cursor,
    /// The agent's own federation address, `username*host`. Set when the first
    /// channel is created.
    pub address: String,
}

impl WalletAcct {
    /// The agent is funded once the create-account operation has been observed.
    pub fn is_funded(&self) -> bool {
        self.seqnum > 0
    }

    /// Debits `amount`, failing without mutation if the balance cannot cover it.
    pub fn debit(&mut self, amount: Amount) -> bool {
        match self.balance.checked_sub(amount) {
            Some(next) => {
                self.balance = next;
                true
            }
            None => false,
        }
    }
}
