use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// The per-channel finite states. `Closed` is terminal; no transition ever
/// leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// The channel record exists but nothing has happened yet.
    Start,
    /// Host only: the three channel accounts are being created on the ledger.
    SettingUp,
    /// Host only: the accounts exist and the proposal has been sent to the guest.
    ChannelProposed,
    /// Waiting for the funding transaction to be observed on the escrow account.
    AwaitingFunding,
    /// Funded and idle; payments can flow.
    Open,
    /// We proposed a payment and are waiting for the counterparty's acceptance.
    PaymentProposed,
    /// We accepted the counterparty's payment and are waiting for finalization.
    PaymentAccepted,
    /// We lost a simultaneous-proposal conflict and are waiting for the winner's
    /// merged re-proposal.
    AwaitingPaymentMerge,
    /// A cooperative close is in flight on the ledger.
    AwaitingClose,
    /// Host only: funding never happened and the cleanup transaction is in flight.
    AwaitingCleanup,
    /// Our ratchet transaction has been submitted and not yet observed.
    AwaitingRatchet,
    /// A ratchet transaction is on the ledger; waiting out the finality delay.
    AwaitingSettlementMintime,
    /// Settlement transactions are in flight.
    AwaitingSettlement,
    /// Terminal. The record is retained for post-mortem only.
    Closed,
}

impl ChannelState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelState::Closed)
    }

    /// States in which the channel holds funds that a round timeout or a failed
    /// cooperative close must recover through the ratchet path.
    pub fn can_force_close(&self) -> bool {
        matches!(
            self,
            ChannelState::Open
                | ChannelState::PaymentProposed
                | ChannelState::PaymentAccepted
                | ChannelState::AwaitingPaymentMerge
                | ChannelState::AwaitingClose
        )
    }

    /// States before the funding transaction has been observed, where the host
    /// can still recover its reserve with a cleanup transaction.
    pub fn is_pre_funding(&self) -> bool {
        matches!(self, ChannelState::SettingUp | ChannelState::ChannelProposed | ChannelState::AwaitingFunding)
    }
}

impl Display for ChannelState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelState::Start => "Start",
            ChannelState::SettingUp => "SettingUp",
            ChannelState::ChannelProposed => "ChannelProposed",
            ChannelState::AwaitingFunding => "AwaitingFunding",
            ChannelState::Open => "Open",
            ChannelState::PaymentProposed => "PaymentProposed",
            ChannelState::PaymentAccepted => "PaymentAccepted",
            ChannelState::AwaitingPaymentMerge => "AwaitingPaymentMerge",
            ChannelState::AwaitingClose => "AwaitingClose",
            ChannelState::AwaitingCleanup => "AwaitingCleanup",
            ChannelState::AwaitingRatchet => "AwaitingRatchet",
            ChannelState::AwaitingSettlementMintime => "AwaitingSettlementMintime",
            ChannelState::AwaitingSettlement => "AwaitingSettlement",
            ChannelState::Closed => "Closed",
        };
        write!(f, "{name}")
    }
}
