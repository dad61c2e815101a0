use crate::amount::Amount;
use crate::balance::ChannelBalances;
use crate::fsm::state::ChannelState;
use crate::keys::AccountId;
use crate::ledger::{Cursor, TxEnvelope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

/// Which end of the channel this agent is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    pub fn other(&self) -> Role {
        match self {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Role::Host)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Guest => write!(f, "guest"),
        }
    }
}

/// The in-flight payment round, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentProposal {
    pub round_number: u64,
    pub amount: Amount,
    pub sender: Role,
}

/// Which of the three setup transactions have been observed on the ledger.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupSeen {
    pub escrow: bool,
    pub host_ratchet: bool,
    pub guest_ratchet: bool,
}

impl SetupSeen {
    pub fn all(&self) -> bool {
        self.escrow && self.host_ratchet && self.guest_ratchet
    }
}

/// The replicated channel record. Everything the state machine needs is here;
/// transitions are a pure function of this record, the input and the clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// The escrow account address doubles as the channel identity.
    pub id: String,
    pub role: Role,
    pub state: ChannelState,
    /// Strictly increasing; bumped once per completed payment round.
    pub round_number: u64,
    pub balances: ChannelBalances,
    /// Round number of the in-flight payment; zero when idle.
    pub pending_round: u64,
    pub current_proposal: Option<PaymentProposal>,

    /// Counterparty federation address and agent base URL.
    pub counterparty_address: String,
    pub remote_url: String,

    pub host_acct: AccountId,
    pub guest_acct: AccountId,
    pub escrow_acct: AccountId,
    pub host_ratchet_acct: AccountId,
    pub guest_ratchet_acct: AccountId,

    /// Sequence numbers of the three channel accounts at creation. Ratcheted
    /// transactions anchor to these.
    pub base_seq_num: u64,
    pub host_ratchet_seq_num: u64,
    pub guest_ratchet_seq_num: u64,

    /// First of the three derivation indices consumed by this channel (host only).
    pub key_index: u32,

    pub max_round_duration: Duration,
    pub finality_delay: Duration,
    pub channel_feerate: Amount,
    pub host_feerate: Amount,
    pub funding_time: SystemTime,
    pub payment_time: SystemTime,
    pub passphrase: String,

    /// Paging token per watched account, so restarts resume the channel's
    /// transaction streams exactly where they left off. Maintained by the
    /// dispatcher, not by transitions.
    #[serde(default)]
    pub cursors: BTreeMap<String, Cursor>,

    pub setup_seen: SetupSeen,
    pub funding_tx_id: Option<String>,
    pub coop_close_tx_id: Option<String>,
    /// Set once we have submitted the countersigned cooperative close, so
    /// redelivered `Close` messages are no-ops.
    pub coop_close_submitted: bool,
    pub my_ratchet_tx_id: Option<String>,
    pub settlement_tx_id: Option<String>,

    /// Force-close artifacts usable for the current (completed) round. The host
    /// rebuilds these on demand; the guest holds the pre-signed copies it
    /// received from the host.
    pub current_ratchet_tx: Option<TxEnvelope>,
    pub current_settlement_txs: Vec<TxEnvelope>,
    /// Artifacts for the round still in flight; promoted when the round completes.
    pub staged_ratchet_tx: Option<TxEnvelope>,
    pub staged_settlement_txs: Vec<TxEnvelope>,
}

/// The five account identities of a channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelAccounts {
    pub host: AccountId,
    pub guest: AccountId,
    pub escrow: AccountId,
    pub host_ratchet: AccountId,
    pub guest_ratchet: AccountId,
}

impl Channel {
    /// A fresh record in `Start`. Parameters and sequence numbers are filled in
    /// by the dispatcher (host) or from the proposal message (guest).
    pub fn new(id: impl Into<String>, role: Role, accounts: ChannelAccounts, now: SystemTime) -> Channel {
        Channel {
            id: id.into(),
            role,
            state: ChannelState::Start,
            round_number: 1,
            balances: ChannelBalances::default(),
            pending_round: 0,
            current_proposal: None,
            counterparty_address: String::new(),
            remote_url: String::new(),
            host_acct: accounts.host,
            guest_acct: accounts.guest,
            escrow_acct: accounts.escrow,
            host_ratchet_acct: accounts.host_ratchet,
            guest_ratchet_acct: accounts.guest_ratchet,
            base_seq_num: 0,
            host_ratchet_seq_num: 0,
            guest_ratchet_seq_num: 0,
            key_index: 0,
            max_round_duration: Duration::from_secs(24 * 60 * 60),
            finality_delay: Duration::from_secs(4 * 60 * 60),
            channel_feerate: Amount::ZERO,
            host_feerate: Amount::ZERO,
            funding_time: now,
            payment_time: now,
            passphrase: String::new(),
            cursors: BTreeMap::new(),
            setup_seen: SetupSeen::default(),
            funding_tx_id: None,
            coop_close_tx_id: None,
            coop_close_submitted: false,
            my_ratchet_tx_id: None,
            settlement_tx_id: None,
            current_ratchet_tx: None,
            current_settlement_txs: Vec::new(),
            staged_ratchet_tx: None,
            staged_settlement_txs: Vec::new(),
        }
    }

    pub fn host_amount(&self) -> Amount {
        self.balances.host
    }

    pub fn guest_amount(&self) -> Amount {
        self.balances.guest
    }

    pub fn pending_amount(&self) -> Amount {
        self.balances.pending
    }

    /// My own side of the balance sheet.
    pub fn my_balance(&self) -> Amount {
        match self.role {
            Role::Host => self.balances.host,
            Role::Guest => self.balances.guest,
        }
    }

    /// The escrow sequence number a ratchet transaction for `round` bumps to.
    /// Each round claims two numbers: one for the bump, one for settlement.
    pub fn round_seqnum(&self, round: u64) -> u64 {
        self.base_seq_num + 2 * round
    }

    /// Maps an observed escrow bump back to its round number, if it is one of ours.
    pub fn round_of_bump(&self, bump_to: u64) -> Option<u64> {
        let offset = bump_to.checked_sub(self.base_seq_num)?;
        if offset == 0 || offset % 2 != 0 {
            return None;
        }
        Some(offset / 2)
    }

    pub fn my_ratchet_acct(&self) -> AccountId {
        match self.role {
            Role::Host => self.host_ratchet_acct,
            Role::Guest => self.guest_ratchet_acct,
        }
    }

    pub fn their_ratchet_acct(&self) -> AccountId {
        match self.role {
            Role::Host => self.guest_ratchet_acct,
            Role::Guest => self.host_ratchet_acct,
        }
    }

    /// Deadline for the funding phase and for each payment round.
    pub fn funding_deadline(&self) -> SystemTime {
        self.funding_time + self.max_round_duration
    }

    pub fn round_deadline(&self) -> SystemTime {
        self.payment_time + self.max_round_duration
    }

    /// Bytes both parties sign to commit to the channel terms.
    pub fn terms_payload(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Terms<'a> {
            escrow_acct: &'a AccountId,
            host_acct: &'a AccountId,
            guest_acct: &'a AccountId,
            host_amount: Amount,
            funding_time: SystemTime,
        }
        let terms = Terms {
            escrow_acct: &self.escrow_acct,
            host_acct: &self.host_acct,
            guest_acct: &self.guest_acct,
            host_amount: self.balances.host + self.balances.pending,
            funding_time: self.funding_time,
        };
        serde_json::to_vec(&terms).expect("terms serialization cannot fail")
    }

    /// Amount debited from the host wallet when the channel is created: the
    /// channel funding itself plus account reserves and fee allowances for the
    /// setup and funding transactions.
    pub fn setup_and_funding_reserve(&self) -> Amount {
        let ratchet = crate::fsm::tx_build::ratchet_start_balance(self.channel_feerate);
        let fees = self.host_feerate + self.host_feerate + self.host_feerate + self.host_feerate;
        self.balances.total() + crate::fsm::tx_build::escrow_start_balance(self.channel_feerate) + ratchet + ratchet + fees
    }
}
