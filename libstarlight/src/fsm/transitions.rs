//! The channel state machine. [`step`] is a pure function of the channel
//! record, the input and the clock; its outputs are side effects for the
//! dispatcher to enroll in the same durable update that persists the record.

use crate::balance::ChannelBalances;
use crate::fsm::channel::{Channel, PaymentProposal, Role};
use crate::fsm::error::FsmError;
use crate::fsm::input::{Command, Input, TimerKind};
use crate::fsm::message::{
    ChannelAcceptMsg, ChannelProposeMsg, CloseMsg, MessageBody, PaymentAcceptMsg, PaymentCompleteMsg,
    PaymentProposeMsg, PeerMessage,
};
use crate::fsm::output::Output;
use crate::fsm::state::ChannelState;
use crate::fsm::tx_build;
use crate::keys::{KeySeed, Keypair};
use crate::ledger::{LedgerTx, OperationBody, TxEnvelope};
use crate::wallet::WalletAcct;
use log::debug;
use std::time::SystemTime;

/// Everything a transition may read or mutate besides the channel record
/// itself. The wallet is mutated in the same durable update as the channel.
pub struct StepCtx<'a> {
    pub now: SystemTime,
    /// Present only after authentication. Transitions that need a signature
    /// fail with [`FsmError::SeedUnavailable`] while it is absent.
    pub seed: Option<&'a KeySeed>,
    pub wallet: &'a mut WalletAcct,
}

impl StepCtx<'_> {
    fn seed(&self) -> Result<&KeySeed, FsmError> {
        self.seed.ok_or(FsmError::SeedUnavailable)
    }
}

/// Advances the channel by one input. On error the caller must discard the
/// record (roll back the transaction); the record may be partially mutated.
pub fn step(ch: &mut Channel, input: Input, ctx: &mut StepCtx) -> Result<Vec<Output>, FsmError> {
    debug!("channel {} ({}, {}): input {input}", ch.id, ch.role, ch.state);
    if ch.state.is_closed() {
        return match input {
            // Trailing ledger events and stale timers after closure are expected.
            Input::Tx(_) | Input::Timer(_) | Input::TxFailed { .. } => Ok(Vec::new()),
            Input::Command(_) | Input::Message(_) => Err(FsmError::ChannelClosed),
        };
    }
    match input {
        Input::Command(command) => handle_command(ch, command, ctx),
        Input::Message(message) => handle_message(ch, message, ctx),
        Input::Tx(tx) => handle_tx(ch, &tx, ctx),
        Input::Timer(kind) => handle_timer(ch, kind, ctx),
        Input::TxFailed { tx_id } => handle_tx_failed(ch, &tx_id, ctx),
    }
}

//------------------------------------         User commands         ------------------------------------------------//

fn handle_command(ch: &mut Channel, command: Command, ctx: &mut StepCtx) -> Result<Vec<Output>, FsmError> {
    match command {
        Command::CreateChannel { .. } => {
            if ch.state != ChannelState::Start {
                return Err(FsmError::invalid_input(ch.state, "CreateChannel"));
            }
            if !ch.role.is_host() {
                return Err(FsmError::WrongRole("host"));
            }
            let keys = HostKeys::derive(ch, ctx.seed()?);
            let mut outputs = Vec::new();
            for mut envelope in tx_build::setup_txs(ch, ctx.wallet.seqnum) {
                envelope.sign_with(&keys.primary);
                outputs.push(Output::Submit(envelope));
            }
            ctx.wallet.seqnum += 3;
            ch.state = ChannelState::SettingUp;
            outputs.push(Output::SetTimer { kind: TimerKind::PreFund, at: ch.funding_deadline() });
            Ok(outputs)
        }
        Command::Pay { amount } => {
            if ch.state != ChannelState::Open {
                return Err(FsmError::invalid_input(ch.state, "Pay"));
            }
            if amount.is_zero() {
                return Err(FsmError::InvalidProposal("amount not set".to_string()));
            }
            let sender = ch.role;
            let held = ch.balances.hold(sender.is_host(), amount).ok_or(FsmError::InsufficientBalance)?;
            let round = ch.round_number + 1;
            ch.balances = held;
            ch.pending_round = round;
            ch.payment_time = ctx.now;
            ch.current_proposal = Some(PaymentProposal { round_number: round, amount, sender });
            let (recipient_ratchet_tx, settlement_txs) = if sender.is_host() {
                let keys = HostKeys::derive(ch, ctx.seed()?);
                let post = ch.balances.settle(true);
                let (ratchet, settlements) = build_guest_artifacts(ch, round, &post, ch.payment_time, &keys);
                (Some(ratchet), settlements)
            } else {
                (None, Vec::new())
            };
            ch.state = ChannelState::PaymentProposed;
            Ok(vec![
                Output::Send(PeerMessage {
                    channel_id: ch.id.clone(),
                    body: MessageBody::PaymentPropose(PaymentProposeMsg {
                        round_number: round,
                        amount,
                        payment_time: ch.payment_time,
                        recipient_ratchet_tx,
                        settlement_txs,
                    }),
                }),
                Output::SetTimer { kind: TimerKind::Round, at: ch.round_deadline() },
            ])
        }
        Command::TopUp { amount } => {
            if ch.state != ChannelState::Open {
                return Err(FsmError::invalid_input(ch.state, "TopUp"));
            }
            if !ch.role.is_host() {
                return Err(FsmError::WrongRole("host"));
            }
            if amount.is_zero() {
                return Err(FsmError::InvalidProposal("amount not set".to_string()));
            }
            let keys = HostKeys::derive(ch, ctx.seed()?);
            if !ctx.wallet.debit(amount + ch.host_feerate) {
                return Err(FsmError::InsufficientWalletBalance);
            }
            let mut envelope = tx_build::topup_tx(ch, ctx.wallet.seqnum, amount);
            ctx.wallet.seqnum += 1;
            envelope.sign_with(&keys.primary);
            // No state change; the credit arrives through the escrow watcher.
            Ok(vec![Output::Submit(envelope)])
        }
        Command::Close => {
            if ch.state != ChannelState::Open && ch.state != ChannelState::PaymentProposed {
                return Err(FsmError::invalid_input(ch.state, "Close"));
            }
            release_pending(ch);
            let mut envelope = tx_build::coop_close_tx(ch);
            sign_as_role(ch, &mut envelope, ctx)?;
            ch.coop_close_tx_id = Some(envelope.tx_id());
            ch.payment_time = ctx.now;
            ch.state = ChannelState::AwaitingClose;
            Ok(vec![
                Output::Send(PeerMessage {
                    channel_id: ch.id.clone(),
                    body: MessageBody::Close(CloseMsg { cooperative_close_tx: envelope }),
                }),
                Output::SetTimer { kind: TimerKind::Round, at: ch.round_deadline() },
            ])
        }
        Command::ForceClose => {
            if !ch.state.can_force_close() {
                return Err(FsmError::invalid_input(ch.state, "ForceClose"));
            }
            begin_force_close(ch, ctx)
        }
        Command::CleanUp => {
            if !ch.role.is_host() {
                return Err(FsmError::WrongRole("host"));
            }
            if !ch.state.is_pre_funding() {
                return Err(FsmError::invalid_input(ch.state, "CleanUp"));
            }
            begin_cleanup(ch, ctx)
        }
    }
}

//------------------------------------         Peer messages         ------------------------------------------------//

fn handle_message(ch: &mut Channel, message: PeerMessage, ctx: &mut StepCtx) -> Result<Vec<Output>, FsmError> {
    match message.body {
        MessageBody::ChannelPropose(msg) => handle_channel_propose(ch, msg, ctx),
        MessageBody::ChannelAccept(msg) => handle_channel_accept(ch, msg, ctx),
        MessageBody::PaymentPropose(msg) => handle_payment_propose(ch, msg, ctx),
        MessageBody::PaymentAccept(msg) => handle_payment_accept(ch, msg),
        MessageBody::PaymentComplete(msg) => handle_payment_complete(ch, msg),
        MessageBody::Close(msg) => handle_close_msg(ch, msg, ctx),
    }
}

fn handle_channel_propose(ch: &mut Channel, msg: ChannelProposeMsg, ctx: &mut StepCtx) -> Result<Vec<Output>, FsmError> {
    if ch.state != ChannelState::Start {
        // A resent proposal for a channel we already accepted.
        if ch.role == Role::Guest {
            return Ok(Vec::new());
        }
        return Err(FsmError::invalid_input(ch.state, "ChannelPropose"));
    }
    if msg.host_amount.is_zero() {
        return Err(FsmError::InvalidProposal("zero funding amount".to_string()));
    }
    if msg.escrow_acct.address() != ch.id {
        return Err(FsmError::InvalidProposal("escrow account does not match channel ID".to_string()));
    }
    if msg.guest_acct != ch.guest_acct {
        return Err(FsmError::InvalidProposal("guest account is not ours".to_string()));
    }
    let seed = ctx.seed()?;
    ch.role = Role::Guest;
    ch.host_acct = msg.host_acct;
    ch.escrow_acct = msg.escrow_acct;
    ch.host_ratchet_acct = msg.host_ratchet_acct;
    ch.guest_ratchet_acct = msg.guest_ratchet_acct;
    ch.counterparty_address = msg.counterparty_address;
    ch.balances = ChannelBalances::new(msg.host_amount, crate::amount::Amount::ZERO);
    ch.round_number = 1;
    ch.funding_time = msg.funding_time;
    ch.payment_time = msg.funding_time;
    ch.max_round_duration = msg.max_round_duration;
    ch.finality_delay = msg.finality_delay;
    ch.channel_feerate = msg.channel_feerate;
    ch.host_feerate = msg.host_feerate;
    ch.staged_ratchet_tx = Some(msg.guest_ratchet_tx);
    ch.staged_settlement_txs = msg.settlement_txs;
    let guest_signature = seed.derive_account(0).sign(&ch.terms_payload());
    ch.state = ChannelState::AwaitingFunding;
    Ok(vec![
        Output::Send(PeerMessage {
            channel_id: ch.id.clone(),
            body: MessageBody::ChannelAccept(ChannelAcceptMsg { round_number: 1, guest_signature }),
        }),
        Output::SetTimer { kind: TimerKind::PreFund, at: ch.funding_deadline() },
    ])
}

fn handle_channel_accept(ch: &mut Channel, msg: ChannelAcceptMsg, ctx: &mut StepCtx) -> Result<Vec<Output>, FsmError> {
    match ch.state {
        ChannelState::ChannelProposed => {}
        // A resent acceptance after we already moved on.
        ChannelState::AwaitingFunding | ChannelState::Open => return Ok(Vec::new()),
        _ => return Err(FsmError::invalid_input(ch.state, "ChannelAccept")),
    }
    if msg.round_number != 1 {
        return Err(FsmError::RoundMismatch { expected: 1, got: msg.round_number });
    }
    if !ch.guest_acct.verify(&ch.terms_payload(), &msg.guest_signature) {
        return Err(FsmError::InvalidProposal("guest signature does not cover the channel terms".to_string()));
    }
    let keys = HostKeys::derive(ch, ctx.seed()?);
    let mut envelope = tx_build::funding_tx(ch, ctx.wallet.seqnum, ch.balances.host);
    ctx.wallet.seqnum += 1;
    envelope.sign_with(&keys.primary);
    ch.funding_tx_id = Some(envelope.tx_id());
    ch.state = ChannelState::AwaitingFunding;
    Ok(vec![
        Output::Submit(envelope),
        Output::SetTimer { kind: TimerKind::PreFund, at: ch.funding_deadline() },
    ])
}

fn handle_payment_propose(ch: &mut Channel, msg: PaymentProposeMsg, ctx: &mut StepCtx) -> Result<Vec<Output>, FsmError> {
    match ch.state {
        ChannelState::Open | ChannelState::AwaitingPaymentMerge => accept_incoming_payment(ch, msg, ctx),
        ChannelState::PaymentProposed => resolve_conflict(ch, msg, ctx),
        ChannelState::PaymentAccepted => {
            // The proposal we already accepted, redelivered.
            if msg.round_number == ch.pending_round {
                Ok(Vec::new())
            } else if msg.round_number <= ch.round_number {
                Ok(Vec::new())
            } else {
                Err(FsmError::RoundMismatch { expected: ch.pending_round, got: msg.round_number })
            }
        }
        _ if msg.round_number <= ch.round_number => Ok(Vec::new()),
        _ => Err(FsmError::invalid_input(ch.state, "PaymentPropose")),
    }
}

/// A payment proposed by the counterparty, in a state where we can accept it.
fn accept_incoming_payment(ch: &mut Channel, msg: PaymentProposeMsg, ctx: &mut StepCtx) -> Result<Vec<Output>, FsmError> {
    let expected = ch.round_number + 1;
    if msg.round_number <= ch.round_number {
        return Ok(Vec::new()); // already completed; duplicate
    }
    if msg.round_number != expected {
        return Err(FsmError::RoundMismatch { expected, got: msg.round_number });
    }
    let sender = ch.role.other();
    let held = ch.balances.hold(sender.is_host(), msg.amount).ok_or(FsmError::InsufficientBalance)?;
    ch.balances = held;
    ch.pending_round = msg.round_number;
    ch.payment_time = ctx.now;
    ch.current_proposal = Some(PaymentProposal { round_number: msg.round_number, amount: msg.amount, sender });
    if ch.role == Role::Guest {
        if let Some(ratchet) = msg.recipient_ratchet_tx {
            ch.staged_ratchet_tx = Some(ratchet);
        }
        if !msg.settlement_txs.is_empty() {
            ch.staged_settlement_txs = msg.settlement_txs;
        }
    }
    // When the guest proposed, the host returns the guest's refreshed artifacts
    // with its acceptance.
    let (sender_ratchet_tx, settlement_txs) = if ch.role.is_host() {
        let keys = HostKeys::derive(ch, ctx.seed()?);
        let post = ch.balances.settle(sender.is_host());
        let (ratchet, settlements) = build_guest_artifacts(ch, msg.round_number, &post, ch.payment_time, &keys);
        (Some(ratchet), settlements)
    } else {
        (None, Vec::new())
    };
    ch.state = ChannelState::PaymentAccepted;
    Ok(vec![
        Output::Send(PeerMessage {
            channel_id: ch.id.clone(),
            body: MessageBody::PaymentAccept(PaymentAcceptMsg {
                round_number: msg.round_number,
                sender_ratchet_tx,
                settlement_txs,
            }),
        }),
        Output::SetTimer { kind: TimerKind::Round, at: ch.round_deadline() },
    ])
}

/// Both sides proposed a payment for the same round. The higher amount wins;
/// ties go to the host. The loser becomes the recipient and waits for the
/// winner's merged re-proposal, which nets both intents into one round.
fn resolve_conflict(ch: &mut Channel, msg: PaymentProposeMsg, ctx: &mut StepCtx) -> Result<Vec<Output>, FsmError> {
    if msg.round_number <= ch.round_number {
        return Ok(Vec::new());
    }
    let mine = ch.current_proposal.clone().ok_or_else(|| FsmError::invalid_input(ch.state, "PaymentPropose"))?;
    if msg.round_number != mine.round_number {
        return Err(FsmError::RoundMismatch { expected: mine.round_number, got: msg.round_number });
    }
    let i_win = mine.amount > msg.amount || (mine.amount == msg.amount && ch.role.is_host());
    if i_win {
        let net = mine.amount - msg.amount;
        // Re-balance the hold to the netted amount and re-propose the round.
        ch.balances = ch.balances.release(mine.sender.is_host());
        let held = ch.balances.hold(ch.role.is_host(), net).ok_or(FsmError::InsufficientBalance)?;
        ch.balances = held;
        ch.payment_time = ctx.now;
        ch.current_proposal = Some(PaymentProposal { round_number: mine.round_number, amount: net, sender: ch.role });
        let (recipient_ratchet_tx, settlement_txs) = if ch.role.is_host() {
            let keys = HostKeys::derive(ch, ctx.seed()?);
            let post = ch.balances.settle(true);
            let (ratchet, settlements) = build_guest_artifacts(ch, mine.round_number, &post, ch.payment_time, &keys);
            (Some(ratchet), settlements)
        } else {
            (None, Vec::new())
        };
        debug!("channel {}: simultaneous proposals, we win; re-proposing net {net}", ch.id);
        Ok(vec![
            Output::Send(PeerMessage {
                channel_id: ch.id.clone(),
                body: MessageBody::PaymentPropose(PaymentProposeMsg {
                    round_number: mine.round_number,
                    amount: net,
                    payment_time: ch.payment_time,
                    recipient_ratchet_tx,
                    settlement_txs,
                }),
            }),
            Output::SetTimer { kind: TimerKind::Round, at: ch.round_deadline() },
        ])
    } else {
        release_pending(ch);
        ch.payment_time = ctx.now;
        ch.state = ChannelState::AwaitingPaymentMerge;
        debug!("channel {}: simultaneous proposals, we lose; awaiting merged proposal", ch.id);
        Ok(vec![Output::SetTimer { kind: TimerKind::Round, at: ch.round_deadline() }])
    }
}

fn handle_payment_accept(ch: &mut Channel, msg: PaymentAcceptMsg) -> Result<Vec<Output>, FsmError> {
    match ch.state {
        ChannelState::PaymentProposed => {}
        ChannelState::Open if msg.round_number <= ch.round_number => return Ok(Vec::new()),
        _ => return Err(FsmError::invalid_input(ch.state, "PaymentAccept")),
    }
    if msg.round_number != ch.pending_round {
        if msg.round_number <= ch.round_number {
            return Ok(Vec::new());
        }
        return Err(FsmError::RoundMismatch { expected: ch.pending_round, got: msg.round_number });
    }
    if ch.role == Role::Guest {
        if let Some(ratchet) = msg.sender_ratchet_tx {
            ch.staged_ratchet_tx = Some(ratchet);
        }
        if !msg.settlement_txs.is_empty() {
            ch.staged_settlement_txs = msg.settlement_txs;
        }
    }
    let round = msg.round_number;
    complete_round(ch);
    ch.state = ChannelState::Open;
    Ok(vec![Output::Send(PeerMessage {
        channel_id: ch.id.clone(),
        body: MessageBody::PaymentComplete(PaymentCompleteMsg { round_number: round }),
    })])
}

fn handle_payment_complete(ch: &mut Channel, msg: PaymentCompleteMsg) -> Result<Vec<Output>, FsmError> {
    match ch.state {
        ChannelState::PaymentAccepted => {}
        ChannelState::Open if msg.round_number <= ch.round_number => return Ok(Vec::new()),
        _ => return Err(FsmError::invalid_input(ch.state, "PaymentComplete")),
    }
    if msg.round_number != ch.pending_round {
        if msg.round_number <= ch.round_number {
            return Ok(Vec::new());
        }
        return Err(FsmError::RoundMismatch { expected: ch.pending_round, got: msg.round_number });
    }
    complete_round(ch);
    ch.state = ChannelState::Open;
    Ok(Vec::new())
}

fn handle_close_msg(ch: &mut Channel, msg: CloseMsg, ctx: &mut StepCtx) -> Result<Vec<Output>, FsmError> {
    match ch.state {
        ChannelState::Open | ChannelState::PaymentProposed | ChannelState::AwaitingClose => {}
        _ => return Err(FsmError::invalid_input(ch.state, "Close")),
    }
    if ch.coop_close_submitted {
        return Ok(Vec::new());
    }
    release_pending(ch);
    let canonical = tx_build::coop_close_tx(ch);
    let mut envelope = msg.cooperative_close_tx;
    if envelope.signing_payload() != canonical.signing_payload() {
        return Err(FsmError::InvalidProposal("close transaction does not match channel state".to_string()));
    }
    sign_as_role(ch, &mut envelope, ctx)?;
    ch.coop_close_tx_id = Some(envelope.tx_id());
    ch.coop_close_submitted = true;
    ch.payment_time = ctx.now;
    ch.state = ChannelState::AwaitingClose;
    Ok(vec![
        Output::Submit(envelope),
        Output::SetTimer { kind: TimerKind::Round, at: ch.round_deadline() },
    ])
}

//------------------------------------         Ledger events         ------------------------------------------------//

fn handle_tx(ch: &mut Channel, tx: &LedgerTx, ctx: &mut StepCtx) -> Result<Vec<Output>, FsmError> {
    // A ratchet transaction bumping the escrow sequence outranks everything else.
    if let Some(bump_round) = observed_ratchet_round(ch, tx) {
        return handle_ratchet_observed(ch, tx, bump_round, ctx);
    }
    // The escrow account merging away means the channel is settled, whichever
    // path (cooperative close, cleanup, settlement) got it there.
    if escrow_merged(ch, tx) {
        debug!("channel {}: escrow merged on-ledger, channel closed", ch.id);
        ch.state = ChannelState::Closed;
        return Ok(Vec::new());
    }
    match ch.state {
        ChannelState::SettingUp => {
            for op in &tx.operations {
                if let OperationBody::CreateAccount { destination, .. } = &op.body {
                    let created_seqnum = (tx.ledger as u64) << 32;
                    if *destination == ch.escrow_acct {
                        ch.setup_seen.escrow = true;
                        ch.base_seq_num = created_seqnum;
                    } else if *destination == ch.host_ratchet_acct {
                        ch.setup_seen.host_ratchet = true;
                        ch.host_ratchet_seq_num = created_seqnum;
                    } else if *destination == ch.guest_ratchet_acct {
                        ch.setup_seen.guest_ratchet = true;
                        ch.guest_ratchet_seq_num = created_seqnum;
                    }
                }
            }
            if !ch.setup_seen.all() {
                return Ok(Vec::new());
            }
            // All three accounts exist; propose the channel to the guest.
            let keys = HostKeys::derive(ch, ctx.seed()?);
            let balances = ch.balances;
            let (guest_ratchet_tx, settlement_txs) =
                build_guest_artifacts(ch, ch.round_number, &balances, ch.funding_time, &keys);
            ch.state = ChannelState::ChannelProposed;
            Ok(vec![
                Output::Send(PeerMessage {
                    channel_id: ch.id.clone(),
                    body: MessageBody::ChannelPropose(ChannelProposeMsg {
                        host_acct: ch.host_acct,
                        guest_acct: ch.guest_acct,
                        escrow_acct: ch.escrow_acct,
                        host_ratchet_acct: ch.host_ratchet_acct,
                        guest_ratchet_acct: ch.guest_ratchet_acct,
                        host_amount: ch.balances.host,
                        funding_time: ch.funding_time,
                        max_round_duration: ch.max_round_duration,
                        finality_delay: ch.finality_delay,
                        channel_feerate: ch.channel_feerate,
                        host_feerate: ch.host_feerate,
                        counterparty_address: ctx.wallet.address.clone(),
                        guest_ratchet_tx,
                        settlement_txs,
                    }),
                }),
                Output::SetTimer { kind: TimerKind::Round1, at: ch.funding_deadline() },
            ])
        }
        ChannelState::AwaitingFunding => {
            if funding_observed(ch, tx) {
                debug!("channel {}: funding observed, channel open", ch.id);
                promote_staged(ch);
                ch.state = ChannelState::Open;
                return Ok(Vec::new());
            }
            Ok(Vec::new())
        }
        ChannelState::Open
        | ChannelState::PaymentProposed
        | ChannelState::PaymentAccepted
        | ChannelState::AwaitingPaymentMerge => {
            // Any other deposit into the channel accounts is a top-up, credited
            // to the host balance without a state change.
            let credit = topup_amount(ch, tx);
            if !credit.is_zero() {
                debug!("channel {}: top-up of {credit} credited to host balance", ch.id);
                ch.balances.host += credit;
            }
            Ok(Vec::new())
        }
        _ => Ok(Vec::new()),
    }
}

fn handle_ratchet_observed(
    ch: &mut Channel,
    tx: &LedgerTx,
    bump_round: u64,
    ctx: &mut StepCtx,
) -> Result<Vec<Output>, FsmError> {
    if tx.source == ch.my_ratchet_acct() {
        // Our own ratchet landed.
        return match ch.state {
            ChannelState::AwaitingRatchet => {
                ch.state = ChannelState::AwaitingSettlementMintime;
                Ok(vec![Output::SetTimer { kind: TimerKind::SettlementMintime, at: ctx.now + ch.finality_delay }])
            }
            _ => Ok(Vec::new()),
        };
    }
    if tx.source != ch.their_ratchet_acct() {
        return Ok(Vec::new());
    }
    // The counterparty force-closed. An outdated round is met with our own
    // ratchet; a current one is accepted and we wait out the finality delay.
    if bump_round < ch.round_number {
        debug!(
            "channel {}: counterparty ratcheted outdated round {bump_round} (current {}); overriding",
            ch.id, ch.round_number
        );
        if ch.state == ChannelState::AwaitingRatchet {
            return Ok(Vec::new()); // ours is already in flight
        }
        return begin_force_close(ch, ctx);
    }
    match ch.state {
        ChannelState::AwaitingSettlementMintime | ChannelState::AwaitingSettlement => Ok(Vec::new()),
        _ => {
            release_pending(ch);
            ch.state = ChannelState::AwaitingSettlementMintime;
            Ok(vec![Output::SetTimer { kind: TimerKind::SettlementMintime, at: ctx.now + ch.finality_delay }])
        }
    }
}

//------------------------------------            Timers             ------------------------------------------------//

fn handle_timer(ch: &mut Channel, kind: TimerKind, ctx: &mut StepCtx) -> Result<Vec<Output>, FsmError> {
    match kind {
        TimerKind::PreFund | TimerKind::Round1 => {
            if !ch.state.is_pre_funding() {
                return Ok(Vec::new());
            }
            if ctx.now < ch.funding_deadline() {
                return Ok(Vec::new()); // stale timer from before a restart
            }
            if ch.role.is_host() {
                debug!("channel {}: funding deadline passed, cleaning up", ch.id);
                begin_cleanup(ch, ctx)
            } else {
                debug!("channel {}: funding deadline passed, closing", ch.id);
                ch.state = ChannelState::Closed;
                Ok(Vec::new())
            }
        }
        TimerKind::Round => {
            let armed = matches!(
                ch.state,
                ChannelState::PaymentProposed
                    | ChannelState::PaymentAccepted
                    | ChannelState::AwaitingPaymentMerge
                    | ChannelState::AwaitingClose
            );
            if !armed || ctx.now < ch.round_deadline() {
                return Ok(Vec::new());
            }
            debug!("channel {}: round deadline passed in {}, force closing", ch.id, ch.state);
            begin_force_close(ch, ctx)
        }
        TimerKind::SettlementMintime => {
            if ch.state != ChannelState::AwaitingSettlementMintime {
                return Ok(Vec::new());
            }
            let settlements = if ch.role.is_host() {
                let keys = HostKeys::derive(ch, ctx.seed()?);
                let mut envelope = tx_build::settlement_tx(ch, ch.round_number, &ch.balances, ch.payment_time);
                envelope.sign_with(&keys.escrow);
                envelope.sign_with(&keys.host_ratchet);
                envelope.sign_with(&keys.guest_ratchet);
                vec![envelope]
            } else {
                if ch.current_settlement_txs.is_empty() {
                    return Err(FsmError::MissingArtifacts);
                }
                ch.current_settlement_txs.clone()
            };
            ch.settlement_tx_id = settlements.first().map(|tx| tx.tx_id());
            ch.state = ChannelState::AwaitingSettlement;
            Ok(settlements.into_iter().map(Output::Submit).collect())
        }
    }
}

fn handle_tx_failed(ch: &mut Channel, tx_id: &str, ctx: &mut StepCtx) -> Result<Vec<Output>, FsmError> {
    if ch.state == ChannelState::AwaitingClose && ch.coop_close_tx_id.as_deref() == Some(tx_id) {
        // The cooperative close was rejected on-ledger; fall through to force close.
        let mut outputs = begin_force_close(ch, ctx)?;
        outputs.push(Output::Warning("cooperative close failed on-ledger; force closing".to_string()));
        return Ok(outputs);
    }
    if ch.state == ChannelState::AwaitingFunding && ch.funding_tx_id.as_deref() == Some(tx_id) && ch.role.is_host() {
        // The funding payment was rejected, so its amount never left the wallet.
        ctx.wallet.balance += ch.balances.host + ch.balances.pending;
        let mut outputs = begin_cleanup(ch, ctx)?;
        outputs.push(Output::Warning("funding transaction failed on-ledger; cleaning up".to_string()));
        return Ok(outputs);
    }
    Ok(vec![Output::Warning(format!("ledger transaction {tx_id} failed permanently"))])
}

//------------------------------------           Helpers             ------------------------------------------------//

struct HostKeys {
    primary: Keypair,
    escrow: Keypair,
    host_ratchet: Keypair,
    guest_ratchet: Keypair,
}

impl HostKeys {
    fn derive(ch: &Channel, seed: &KeySeed) -> HostKeys {
        HostKeys {
            primary: seed.derive_account(0),
            escrow: seed.derive_account(ch.key_index),
            host_ratchet: seed.derive_account(ch.key_index + 1),
            guest_ratchet: seed.derive_account(ch.key_index + 2),
        }
    }
}

/// Builds the guest's force-close artifacts for `round`: its pre-signed ratchet
/// transaction and the settlement paying out `balances`.
fn build_guest_artifacts(
    ch: &Channel,
    round: u64,
    balances: &ChannelBalances,
    payment_time: SystemTime,
    keys: &HostKeys,
) -> (TxEnvelope, Vec<TxEnvelope>) {
    let mut ratchet = tx_build::ratchet_tx(ch, round, ch.guest_ratchet_acct, ch.guest_ratchet_seq_num);
    ratchet.sign_with(&keys.guest_ratchet);
    ratchet.sign_with(&keys.escrow);
    let mut settlement = tx_build::settlement_tx(ch, round, balances, payment_time);
    settlement.sign_with(&keys.escrow);
    settlement.sign_with(&keys.host_ratchet);
    settlement.sign_with(&keys.guest_ratchet);
    (ratchet, vec![settlement])
}

/// Signs an escrow-sourced envelope the way this role can: the host with the
/// escrow key, the guest with its primary key as endorsement.
fn sign_as_role(ch: &Channel, envelope: &mut TxEnvelope, ctx: &StepCtx) -> Result<(), FsmError> {
    let seed = ctx.seed()?;
    if ch.role.is_host() {
        let keys = HostKeys::derive(ch, seed);
        envelope.sign_with(&keys.escrow);
        envelope.sign_with(&keys.host_ratchet);
        envelope.sign_with(&keys.guest_ratchet);
    } else {
        envelope.sign_with(&seed.derive_account(0));
    }
    Ok(())
}

fn begin_force_close(ch: &mut Channel, ctx: &mut StepCtx) -> Result<Vec<Output>, FsmError> {
    release_pending(ch);
    let ratchet = if ch.role.is_host() {
        let keys = HostKeys::derive(ch, ctx.seed()?);
        let mut envelope = tx_build::ratchet_tx(ch, ch.round_number, ch.host_ratchet_acct, ch.host_ratchet_seq_num);
        envelope.sign_with(&keys.host_ratchet);
        envelope.sign_with(&keys.escrow);
        envelope
    } else {
        ch.current_ratchet_tx.clone().ok_or(FsmError::MissingArtifacts)?
    };
    ch.my_ratchet_tx_id = Some(ratchet.tx_id());
    ch.state = ChannelState::AwaitingRatchet;
    Ok(vec![Output::Submit(ratchet)])
}

fn begin_cleanup(ch: &mut Channel, ctx: &mut StepCtx) -> Result<Vec<Output>, FsmError> {
    let keys = HostKeys::derive(ch, ctx.seed()?);
    let mut envelope = tx_build::cleanup_tx(ch);
    envelope.sign_with(&keys.escrow);
    envelope.sign_with(&keys.host_ratchet);
    envelope.sign_with(&keys.guest_ratchet);
    // The funding payment was never submitted, so the channel amount reserved
    // at creation never left the wallet; hand it back. The account reserves
    // come back through the merges, via the wallet watcher.
    if ch.funding_tx_id.is_none() {
        ctx.wallet.balance += ch.balances.host + ch.balances.pending;
    }
    ch.state = ChannelState::AwaitingCleanup;
    Ok(vec![Output::Submit(envelope)])
}

/// Completes the in-flight round: settles the hold, bumps the round number and
/// promotes the staged force-close artifacts.
fn complete_round(ch: &mut Channel) {
    if let Some(proposal) = ch.current_proposal.take() {
        ch.balances = ch.balances.settle(proposal.sender.is_host());
        ch.round_number = proposal.round_number;
    }
    ch.pending_round = 0;
    promote_staged(ch);
}

fn promote_staged(ch: &mut Channel) {
    if let Some(ratchet) = ch.staged_ratchet_tx.take() {
        ch.current_ratchet_tx = Some(ratchet);
    }
    if !ch.staged_settlement_txs.is_empty() {
        ch.current_settlement_txs = std::mem::take(&mut ch.staged_settlement_txs);
    }
}

/// Returns the held amount to the payer and clears the in-flight round.
fn release_pending(ch: &mut Channel) {
    if let Some(proposal) = ch.current_proposal.take() {
        ch.balances = ch.balances.release(proposal.sender.is_host());
    }
    ch.pending_round = 0;
}

/// If `tx` bumps the escrow sequence, returns the round it ratchets to.
fn observed_ratchet_round(ch: &Channel, tx: &LedgerTx) -> Option<u64> {
    tx.operations.iter().find_map(|op| match &op.body {
        OperationBody::BumpSequence { bump_to } if op.source == Some(ch.escrow_acct) => ch.round_of_bump(*bump_to),
        _ => None,
    })
}

/// Whether `tx` merges the escrow account away (settlement, close or cleanup).
fn escrow_merged(ch: &Channel, tx: &LedgerTx) -> bool {
    tx.operations.iter().any(|op| {
        matches!(op.body, OperationBody::AccountMerge { .. })
            && (op.source == Some(ch.escrow_acct) || (op.source.is_none() && tx.source == ch.escrow_acct))
    })
}

fn funding_observed(ch: &Channel, tx: &LedgerTx) -> bool {
    if ch.funding_tx_id.as_deref() == Some(tx.id.as_str()) {
        return true;
    }
    tx.operations.iter().any(|op| {
        matches!(&op.body, OperationBody::Payment { destination, amount, .. }
            if *destination == ch.escrow_acct && *amount >= ch.balances.host)
    })
}

/// Total of deposits into the channel accounts carried by `tx`.
fn topup_amount(ch: &Channel, tx: &LedgerTx) -> crate::amount::Amount {
    let mine = |acct: &crate::keys::AccountId| {
        *acct == ch.escrow_acct || *acct == ch.host_ratchet_acct || *acct == ch.guest_ratchet_acct
    };
    tx.operations
        .iter()
        .filter_map(|op| match &op.body {
            OperationBody::Payment { destination, amount, asset } if mine(destination) => {
                matches!(asset, crate::ledger::Asset::Native).then_some(*amount)
            }
            OperationBody::AccountMerge { destination, source_balance } if mine(destination) => Some(*source_balance),
            _ => None,
        })
        .sum()
}
