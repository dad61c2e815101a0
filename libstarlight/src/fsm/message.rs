//! The peer wire protocol: JSON messages POSTed to `<remote>/starlight/message`.

use crate::amount::Amount;
use crate::keys::{AccountId, Signature};
use crate::ledger::TxEnvelope;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::{Duration, SystemTime};

/// Envelope for every peer message. The channel ID is the escrow account address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMessage {
    pub channel_id: String,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    ChannelPropose(ChannelProposeMsg),
    ChannelAccept(ChannelAcceptMsg),
    PaymentPropose(PaymentProposeMsg),
    PaymentAccept(PaymentAcceptMsg),
    PaymentComplete(PaymentCompleteMsg),
    Close(CloseMsg),
}

impl Display for MessageBody {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageBody::ChannelPropose(_) => "ChannelPropose",
            MessageBody::ChannelAccept(_) => "ChannelAccept",
            MessageBody::PaymentPropose(_) => "PaymentPropose",
            MessageBody::PaymentAccept(_) => "PaymentAccept",
            MessageBody::PaymentComplete(_) => "PaymentComplete",
            MessageBody::Close(_) => "Close",
        };
        write!(f, "{name}")
    }
}

/// Sent by the host once all three channel accounts exist on the ledger.
/// Carries the channel terms plus the guest's pre-signed round-1 force-close
/// artifacts, so the guest can recover unilaterally from the moment it accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelProposeMsg {
    pub host_acct: AccountId,
    pub guest_acct: AccountId,
    pub escrow_acct: AccountId,
    pub host_ratchet_acct: AccountId,
    pub guest_ratchet_acct: AccountId,
    pub host_amount: Amount,
    pub funding_time: SystemTime,
    pub max_round_duration: Duration,
    pub finality_delay: Duration,
    pub channel_feerate: Amount,
    pub host_feerate: Amount,
    /// The host's federation address, cross-checked by the guest's agent.
    pub counterparty_address: String,
    pub guest_ratchet_tx: TxEnvelope,
    pub settlement_txs: Vec<TxEnvelope>,
}

/// The guest's acceptance: its signature over the channel terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAcceptMsg {
    pub round_number: u64,
    pub guest_signature: Signature,
}

/// Proposes a payment for round `round_number`. When the host is the sender it
/// attaches the guest's refreshed force-close artifacts for the new round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentProposeMsg {
    pub round_number: u64,
    pub amount: Amount,
    pub payment_time: SystemTime,
    pub recipient_ratchet_tx: Option<TxEnvelope>,
    pub settlement_txs: Vec<TxEnvelope>,
}

/// Accepts the payment for `round_number`. When the guest proposed, the host
/// attaches the guest's refreshed artifacts here instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAcceptMsg {
    pub round_number: u64,
    pub sender_ratchet_tx: Option<TxEnvelope>,
    pub settlement_txs: Vec<TxEnvelope>,
}

/// Finalizes the round on the recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCompleteMsg {
    pub round_number: u64,
}

/// Carries the signed cooperative-close transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseMsg {
    pub cooperative_close_tx: TxEnvelope,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let msg = PeerMessage {
            channel_id: "GABC".to_string(),
            body: MessageBody::PaymentComplete(PaymentCompleteMsg { round_number: 4 }),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let decoded: PeerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, msg);
    }
}
