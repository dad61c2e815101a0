use crate::amount::Amount;
use crate::fsm::message::PeerMessage;
use crate::ledger::LedgerTx;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Operator commands addressed to a single channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Host only; valid in `Start`. Creates the channel accounts on the ledger.
    CreateChannel { guest_federation_address: String, host_amount: Amount },
    /// Propose an off-ledger payment to the counterparty.
    Pay { amount: Amount },
    /// Host only; pays additional funds into the escrow account.
    TopUp { amount: Amount },
    /// Begin a cooperative close.
    Close,
    /// Settle unilaterally through the ratchet path.
    ForceClose,
    /// Host only; abandon an unfunded channel and recover the reserve.
    CleanUp,
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::CreateChannel { .. } => "CreateChannel",
            Command::Pay { .. } => "Pay",
            Command::TopUp { .. } => "TopUp",
            Command::Close => "Close",
            Command::ForceClose => "ForceClose",
            Command::CleanUp => "CleanUp",
        };
        write!(f, "{name}")
    }
}

/// Timers armed by the state machine. Each fire re-enters the machine, which
/// checks the deadline against `now` so stale timers are harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerKind {
    /// Funding was never observed in time.
    PreFund,
    /// The guest never accepted the channel proposal.
    Round1,
    /// An in-flight round did not complete in time.
    Round,
    /// The finality delay after a ratchet observation has elapsed.
    SettlementMintime,
}

impl Display for TimerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimerKind::PreFund => "PreFundTimeout",
            TimerKind::Round1 => "Round1Timeout",
            TimerKind::Round => "RoundTimeout",
            TimerKind::SettlementMintime => "SettlementMintimeTimeout",
        };
        write!(f, "{name}")
    }
}

/// The three input classes of the state machine, plus submission failures fed
/// back by the task basket.
#[derive(Debug, Clone)]
pub enum Input {
    Command(Command),
    Message(PeerMessage),
    Tx(LedgerTx),
    Timer(TimerKind),
    /// A ledger submission for this channel failed permanently.
    TxFailed { tx_id: String },
}

impl Display for Input {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Input::Command(c) => write!(f, "Command({c})"),
            Input::Message(m) => write!(f, "Message({})", m.body),
            Input::Tx(tx) => write!(f, "Tx({})", tx.id),
            Input::Timer(t) => write!(f, "Timer({t})"),
            Input::TxFailed { tx_id } => write!(f, "TxFailed({tx_id})"),
        }
    }
}
