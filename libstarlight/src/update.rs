//! Observable update records. Every successful durable transaction may append
//! one of these; they are published to subscribers only after the commit is
//! durable.

use crate::amount::Amount;
use crate::fsm::{Channel, Command, PeerMessage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    Init,
    Config,
    Account,
    Channel,
    TxSuccess,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub id: String,
    pub balance: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    pub update_type: UpdateType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountUpdate>,
    /// Snapshot of the channel after the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<Box<Channel>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_command: Option<Command>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_message: Option<Box<PeerMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tx_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Wallet sequence number consumed by a pending wallet payment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_sequence: Option<String>,
}

impl Update {
    pub fn new(update_type: UpdateType) -> Update {
        Update {
            update_type,
            account: None,
            channel: None,
            input_command: None,
            input_message: None,
            input_tx_id: None,
            warning: None,
            pending_sequence: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Update {
        let mut update = Update::new(UpdateType::Warning);
        update.warning = Some(message.into());
        update
    }

    pub fn account(id: String, balance: Amount) -> Update {
        let mut update = Update::new(UpdateType::Account);
        update.account = Some(AccountUpdate { id, balance });
        update
    }

    pub fn channel(channel: &Channel) -> Update {
        let mut update = Update::new(UpdateType::Channel);
        update.channel = Some(Box::new(channel.clone()));
        update
    }

    pub fn tx_success(tx_id: String) -> Update {
        let mut update = Update::new(UpdateType::TxSuccess);
        update.input_tx_id = Some(tx_id);
        update
    }
}
