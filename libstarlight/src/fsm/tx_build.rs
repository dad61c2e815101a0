//! Builders for the channel's on-ledger transactions. All of them are pure
//! functions of the channel record; signing happens at the call site, where the
//! derived keypairs are available.

use crate::amount::{Amount, LUMEN};
use crate::balance::ChannelBalances;
use crate::fsm::channel::Channel;
use crate::ledger::{Asset, Operation, OperationBody, TxEnvelope};
use std::time::{SystemTime, UNIX_EPOCH};

/// Ledger base reserve (0.5 XLM).
pub const BASE_RESERVE: Amount = Amount::from_stroops(LUMEN / 2);
/// Minimum balance of a freshly created account (two base reserves).
pub const MIN_ACCOUNT_BALANCE: Amount = Amount::from_stroops(LUMEN);

/// Starting balance of the escrow account: the minimum balance plus a fee
/// allowance for the one close or settlement transaction it will source.
pub fn escrow_start_balance(channel_feerate: Amount) -> Amount {
    MIN_ACCOUNT_BALANCE + channel_feerate + channel_feerate
}

/// Starting balance of a ratchet account: the minimum balance plus the fee for
/// the single ratchet transaction it may ever source.
pub fn ratchet_start_balance(channel_feerate: Amount) -> Amount {
    MIN_ACCOUNT_BALANCE + channel_feerate
}

pub fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// The three account-creation transactions submitted from the host wallet.
/// `wallet_seqnum` is the wallet sequence before the first of them.
pub fn setup_txs(ch: &Channel, wallet_seqnum: u64) -> Vec<TxEnvelope> {
    let creations = [
        (ch.escrow_acct, escrow_start_balance(ch.channel_feerate)),
        (ch.host_ratchet_acct, ratchet_start_balance(ch.channel_feerate)),
        (ch.guest_ratchet_acct, ratchet_start_balance(ch.channel_feerate)),
    ];
    creations
        .into_iter()
        .enumerate()
        .map(|(i, (destination, starting_balance))| {
            TxEnvelope::new(
                ch.host_acct,
                wallet_seqnum + 1 + i as u64,
                ch.host_feerate,
                vec![Operation::new(OperationBody::CreateAccount { destination, starting_balance })],
            )
        })
        .collect()
}

/// The funding payment from the host wallet into the escrow account.
pub fn funding_tx(ch: &Channel, wallet_seqnum: u64, amount: Amount) -> TxEnvelope {
    TxEnvelope::new(
        ch.host_acct,
        wallet_seqnum + 1,
        ch.host_feerate,
        vec![Operation::new(OperationBody::Payment { destination: ch.escrow_acct, asset: Asset::Native, amount })],
    )
}

/// A top-up payment from the host wallet into the escrow account.
pub fn topup_tx(ch: &Channel, wallet_seqnum: u64, amount: Amount) -> TxEnvelope {
    funding_tx(ch, wallet_seqnum, amount)
}

/// The ratchet transaction for `round`, sourced from `ratchet_acct`. It bumps
/// the escrow sequence to the round's anchor so that only this round's
/// settlement can follow, and so that any older settlement is dead on arrival.
pub fn ratchet_tx(ch: &Channel, round: u64, ratchet_acct: crate::keys::AccountId, ratchet_seqnum: u64) -> TxEnvelope {
    TxEnvelope::new(
        ratchet_acct,
        ratchet_seqnum + 1,
        ch.channel_feerate,
        vec![Operation::with_source(ch.escrow_acct, OperationBody::BumpSequence { bump_to: ch.round_seqnum(round) })],
    )
}

/// The settlement transaction for `round` paying out `balances`. Valid only
/// after the matching ratchet has bumped the escrow sequence, and only after
/// the finality delay measured from the round's payment time.
pub fn settlement_tx(ch: &Channel, round: u64, balances: &ChannelBalances, payment_time: SystemTime) -> TxEnvelope {
    let mut operations = Vec::new();
    if !balances.guest.is_zero() {
        operations.push(Operation::new(OperationBody::Payment {
            destination: ch.guest_acct,
            asset: Asset::Native,
            amount: balances.guest,
        }));
    }
    operations.push(Operation::new(OperationBody::AccountMerge {
        destination: ch.host_acct,
        source_balance: Amount::ZERO,
    }));
    operations.push(Operation::with_source(
        ch.host_ratchet_acct,
        OperationBody::AccountMerge { destination: ch.host_acct, source_balance: Amount::ZERO },
    ));
    operations.push(Operation::with_source(
        ch.guest_ratchet_acct,
        OperationBody::AccountMerge { destination: ch.host_acct, source_balance: Amount::ZERO },
    ));
    TxEnvelope::new(ch.escrow_acct, ch.round_seqnum(round) + 1, ch.channel_feerate, operations)
        .with_min_time(unix_secs(payment_time + ch.finality_delay))
}

/// The cooperative close: pays the guest its balance and merges everything else
/// back to the host in a single transaction, anchored before any ratchet.
pub fn coop_close_tx(ch: &Channel) -> TxEnvelope {
    let mut operations = Vec::new();
    if !ch.balances.guest.is_zero() {
        operations.push(Operation::new(OperationBody::Payment {
            destination: ch.guest_acct,
            asset: Asset::Native,
            amount: ch.balances.guest,
        }));
    }
    operations.push(Operation::new(OperationBody::AccountMerge {
        destination: ch.host_acct,
        source_balance: Amount::ZERO,
    }));
    operations.push(Operation::with_source(
        ch.host_ratchet_acct,
        OperationBody::AccountMerge { destination: ch.host_acct, source_balance: Amount::ZERO },
    ));
    operations.push(Operation::with_source(
        ch.guest_ratchet_acct,
        OperationBody::AccountMerge { destination: ch.host_acct, source_balance: Amount::ZERO },
    ));
    TxEnvelope::new(ch.escrow_acct, ch.base_seq_num + 1, ch.channel_feerate, operations)
}

/// The cleanup transaction: like a cooperative close, but before funding ever
/// arrived, so there is nothing to pay the guest.
pub fn cleanup_tx(ch: &Channel) -> TxEnvelope {
    let operations = vec![
        Operation::new(OperationBody::AccountMerge { destination: ch.host_acct, source_balance: Amount::ZERO }),
        Operation::with_source(
            ch.host_ratchet_acct,
            OperationBody::AccountMerge { destination: ch.host_acct, source_balance: Amount::ZERO },
        ),
        Operation::with_source(
            ch.guest_ratchet_acct,
            OperationBody::AccountMerge { destination: ch.host_acct, source_balance: Amount::ZERO },
        ),
    ];
    TxEnvelope::new(ch.escrow_acct, ch.base_seq_num + 1, ch.channel_feerate, operations)
}
