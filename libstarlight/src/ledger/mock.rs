//! An in-memory ledger for tests and local development. Applies submitted envelopes
//! to a map of accounts, enforces sequence numbers and time bounds, and replays the
//! resulting transactions to streaming subscribers.

use crate::amount::Amount;
use crate::keys::{AccountId, KeySeed};
use crate::ledger::{Cursor, LedgerClient, LedgerError, LedgerTx, Operation, OperationBody, SubmitError, TxEnvelope};
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};

struct MockAccount {
    balance: Amount,
    seqnum: u64,
}

struct Inner {
    accounts: HashMap<AccountId, MockAccount>,
    ledger: u32,
    next_cursor: u64,
    history: Vec<LedgerTx>,
}

pub struct MockLedger {
    inner: Mutex<Inner>,
    events: broadcast::Sender<LedgerTx>,
    reject_submits: AtomicBool,
    friendbot: AccountId,
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLedger {
    pub fn new() -> Self {
        let friendbot = KeySeed::from_bytes([0xFB; 32]).derive_account(0).account_id();
        let (events, _) = broadcast::channel(1024);
        let mut accounts = HashMap::new();
        accounts.insert(friendbot, MockAccount { balance: Amount::from_lumens("1000000000").unwrap(), seqnum: 1 });
        MockLedger {
            inner: Mutex::new(Inner { accounts, ledger: 1, next_cursor: 1, history: Vec::new() }),
            events,
            reject_submits: AtomicBool::new(false),
            friendbot,
        }
    }

    /// Simulates the testnet faucet: creates `account` with `amount` on the ledger.
    pub fn fund(&self, account: AccountId, amount: Amount) {
        let seqnum = {
            let inner = self.inner.lock().expect("mock ledger poisoned");
            inner.accounts.get(&self.friendbot).map(|a| a.seqnum + 1).unwrap_or(1)
        };
        let envelope = TxEnvelope::new(
            self.friendbot,
            seqnum,
            Amount::from_stroops(100),
            vec![Operation::new(OperationBody::CreateAccount { destination: account, starting_balance: amount })],
        );
        self.apply(&envelope).expect("faucet funding cannot fail");
    }

    /// When set, every submission fails with a retriable error.
    pub fn set_reject_submits(&self, reject: bool) {
        self.reject_submits.store(reject, Ordering::SeqCst);
    }

    pub fn balance_of(&self, account: &AccountId) -> Option<Amount> {
        let inner = self.inner.lock().expect("mock ledger poisoned");
        inner.accounts.get(account).map(|a| a.balance)
    }

    pub fn seqnum_of(&self, account: &AccountId) -> Option<u64> {
        let inner = self.inner.lock().expect("mock ledger poisoned");
        inner.accounts.get(account).map(|a| a.seqnum)
    }

    pub fn account_exists(&self, account: &AccountId) -> bool {
        let inner = self.inner.lock().expect("mock ledger poisoned");
        inner.accounts.contains_key(account)
    }

    fn apply(&self, envelope: &TxEnvelope) -> Result<(), SubmitError> {
        let mut inner = self.inner.lock().expect("mock ledger poisoned");
        let now = unix_now();
        if let Some(min_time) = envelope.min_time {
            if now < min_time {
                return Err(SubmitError::Retriable(format!("too early: min_time {min_time}, now {now}")));
            }
        }
        let source = inner
            .accounts
            .get(&envelope.source)
            .ok_or_else(|| SubmitError::Permanent(format!("source account {} not found", envelope.source)))?;
        if envelope.seqnum != source.seqnum + 1 {
            return Err(SubmitError::Permanent(format!(
                "bad sequence number {} for {} (current {})",
                envelope.seqnum, envelope.source, source.seqnum
            )));
        }

        // Dry-run every operation before mutating anything, so a rejected
        // envelope leaves the ledger untouched.
        let ledger_number = inner.ledger + 1;
        let mut recorded = Vec::with_capacity(envelope.operations.len());
        {
            let mut scratch: HashMap<AccountId, (Amount, u64, bool)> = inner
                .accounts
                .iter()
                .map(|(id, a)| (*id, (a.balance, a.seqnum, true)))
                .collect();
            let total_debit = envelope.fee;
            let src = scratch.get_mut(&envelope.source).expect("source checked above");
            src.0 = src
                .0
                .checked_sub(total_debit)
                .ok_or_else(|| SubmitError::Permanent("insufficient balance for fee".to_string()))?;
            src.1 += 1;
            for op in &envelope.operations {
                let op_source = op.source.unwrap_or(envelope.source);
                let mut op = op.clone();
                match &mut op.body {
                    OperationBody::CreateAccount { destination, starting_balance } => {
                        if scratch.get(destination).is_some_and(|entry| entry.2) {
                            return Err(SubmitError::Permanent(format!("account {destination} already exists")));
                        }
                        let entry = scratch
                            .get_mut(&op_source)
                            .filter(|entry| entry.2)
                            .ok_or_else(|| SubmitError::Permanent(format!("op source {op_source} not found")))?;
                        entry.0 = entry
                            .0
                            .checked_sub(*starting_balance)
                            .ok_or_else(|| SubmitError::Permanent("insufficient balance".to_string()))?;
                        let seqnum = (ledger_number as u64) << 32;
                        scratch.insert(*destination, (*starting_balance, seqnum, true));
                    }
                    OperationBody::Payment { destination, amount, .. } => {
                        let entry = scratch
                            .get_mut(&op_source)
                            .filter(|entry| entry.2)
                            .ok_or_else(|| SubmitError::Permanent(format!("op source {op_source} not found")))?;
                        entry.0 = entry
                            .0
                            .checked_sub(*amount)
                            .ok_or_else(|| SubmitError::Permanent("insufficient balance".to_string()))?;
                        let dest = scratch
                            .get_mut(destination)
                            .filter(|entry| entry.2)
                            .ok_or_else(|| SubmitError::Permanent(format!("destination {destination} not found")))?;
                        dest.0 += *amount;
                    }
                    OperationBody::AccountMerge { destination, source_balance } => {
                        let entry = scratch
                            .get_mut(&op_source)
                            .filter(|entry| entry.2)
                            .ok_or_else(|| SubmitError::Permanent(format!("op source {op_source} not found")))?;
                        let merged = entry.0;
                        entry.0 = Amount::ZERO;
                        entry.2 = false;
                        let dest = scratch
                            .get_mut(destination)
                            .filter(|entry| entry.2)
                            .ok_or_else(|| SubmitError::Permanent(format!("destination {destination} not found")))?;
                        dest.0 += merged;
                        *source_balance = merged;
                    }
                    OperationBody::BumpSequence { bump_to } => {
                        let entry = scratch
                            .get_mut(&op_source)
                            .filter(|entry| entry.2)
                            .ok_or_else(|| SubmitError::Permanent(format!("op source {op_source} not found")))?;
                        if *bump_to > entry.1 {
                            entry.1 = *bump_to;
                        }
                    }
                }
                recorded.push(op);
            }
            // Commit the scratch state.
            inner.accounts = scratch
                .into_iter()
                .filter(|(_, entry)| entry.2)
                .map(|(id, (balance, seqnum, _))| (id, MockAccount { balance, seqnum }))
                .collect();
        }

        inner.ledger = ledger_number;
        let cursor = inner.next_cursor;
        inner.next_cursor += 1;
        let tx = LedgerTx {
            id: envelope.tx_id(),
            source: envelope.source,
            seqnum: envelope.seqnum,
            ledger: ledger_number,
            cursor: cursor.to_string(),
            operations: recorded,
        };
        inner.history.push(tx.clone());
        debug!("mock ledger applied tx {} from {}", tx.id, tx.source);
        let _ = self.events.send(tx);
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn cursor_value(cursor: &str) -> u64 {
    cursor.parse().unwrap_or(0)
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn validate_testnet_url(&self, url: &str) -> Result<(), LedgerError> {
        if url.contains("testnet") || url.contains("localhost") || url.contains("127.0.0.1") {
            Ok(())
        } else {
            Err(LedgerError::InvalidHorizonUrl(url.to_string()))
        }
    }

    async fn sequence_for_account(&self, account: &AccountId) -> Result<u64, LedgerError> {
        self.seqnum_of(account).ok_or(LedgerError::AccountNotFound(*account))
    }

    async fn submit(&self, envelope: &TxEnvelope) -> Result<(), SubmitError> {
        if self.reject_submits.load(Ordering::SeqCst) {
            return Err(SubmitError::Retriable("mock ledger rejecting submissions".to_string()));
        }
        if envelope.signatures.is_empty() {
            return Err(SubmitError::Permanent("unsigned envelope".to_string()));
        }
        self.apply(envelope)
    }

    async fn stream_txs(
        &self,
        account: AccountId,
        cursor: Cursor,
        sink: mpsc::Sender<LedgerTx>,
    ) -> Result<(), LedgerError> {
        // Subscribe before snapshotting the backlog so nothing is missed;
        // duplicates across the seam are filtered by cursor.
        let mut rx = self.events.subscribe();
        let mut last_sent = cursor_value(&cursor);
        let backlog: Vec<LedgerTx> = {
            let inner = self.inner.lock().expect("mock ledger poisoned");
            inner
                .history
                .iter()
                .filter(|tx| tx.touches(&account) && cursor_value(&tx.cursor) > last_sent)
                .cloned()
                .collect()
        };
        for tx in backlog {
            last_sent = cursor_value(&tx.cursor);
            if sink.send(tx).await.is_err() {
                return Ok(());
            }
        }
        loop {
            match rx.recv().await {
                Ok(tx) => {
                    if tx.touches(&account) && cursor_value(&tx.cursor) > last_sent {
                        last_sent = cursor_value(&tx.cursor);
                        if sink.send(tx).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("transaction stream for {account} lagged by {n}");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(LedgerError::StreamClosed),
            }
        }
    }

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ledger::Asset;
    use rand_core::OsRng;

    fn keypair(index: u32) -> crate::keys::Keypair {
        KeySeed::from_bytes([9u8; 32]).derive_account(index)
    }

    fn lumens(s: &str) -> Amount {
        Amount::from_lumens(s).unwrap()
    }

    #[tokio::test]
    async fn fund_and_pay() {
        let ledger = MockLedger::new();
        let alice = keypair(0);
        let bob = keypair(1);
        ledger.fund(alice.account_id(), lumens("100"));
        ledger.fund(bob.account_id(), lumens("10"));
        assert_eq!(ledger.balance_of(&alice.account_id()), Some(lumens("100")));

        let seq = ledger.seqnum_of(&alice.account_id()).unwrap();
        let mut env = TxEnvelope::new(
            alice.account_id(),
            seq + 1,
            Amount::from_stroops(100),
            vec![Operation::new(OperationBody::Payment {
                destination: bob.account_id(),
                asset: Asset::Native,
                amount: lumens("25"),
            })],
        );
        env.sign_with(&alice);
        ledger.submit(&env).await.unwrap();
        assert_eq!(ledger.balance_of(&bob.account_id()), Some(lumens("35")));

        // Replaying the same envelope is rejected permanently: the sequence number is spent.
        let err = ledger.submit(&env).await.unwrap_err();
        assert!(matches!(err, SubmitError::Permanent(_)));
    }

    #[tokio::test]
    async fn merge_removes_account() {
        let ledger = MockLedger::new();
        let alice = keypair(0);
        let bob = keypair(1);
        ledger.fund(alice.account_id(), lumens("100"));
        ledger.fund(bob.account_id(), lumens("10"));

        let seq = ledger.seqnum_of(&bob.account_id()).unwrap();
        let mut env = TxEnvelope::new(
            bob.account_id(),
            seq + 1,
            Amount::from_stroops(100),
            vec![Operation::new(OperationBody::AccountMerge {
                destination: alice.account_id(),
                source_balance: Amount::ZERO,
            })],
        );
        env.sign_with(&bob);
        ledger.submit(&env).await.unwrap();
        assert!(!ledger.account_exists(&bob.account_id()));
        // Fee is paid before the merge, so alice receives the remainder.
        let alice_balance = ledger.balance_of(&alice.account_id()).unwrap();
        assert_eq!(alice_balance, lumens("110").checked_sub(Amount::from_stroops(100)).unwrap());
    }

    #[tokio::test]
    async fn stream_replays_backlog_and_follows() {
        let ledger = std::sync::Arc::new(MockLedger::new());
        let alice = KeySeed::generate(&mut OsRng).derive_account(0);
        ledger.fund(alice.account_id(), lumens("50"));

        let (tx, mut rx) = mpsc::channel(16);
        let streamer = {
            let ledger = ledger.clone();
            let account = alice.account_id();
            tokio::spawn(async move { ledger.stream_txs(account, String::new(), tx).await })
        };
        let funded = rx.recv().await.unwrap();
        assert!(funded.touches(&alice.account_id()));

        // A transaction that does not touch alice never reaches her stream.
        let carol = KeySeed::generate(&mut OsRng).derive_account(1);
        ledger.fund(carol.account_id(), lumens("1"));
        assert!(rx.try_recv().is_err());

        let bob = KeySeed::generate(&mut OsRng).derive_account(2);
        ledger.fund(bob.account_id(), lumens("5"));
        let seq = ledger.seqnum_of(&bob.account_id()).unwrap();
        let mut env = TxEnvelope::new(
            bob.account_id(),
            seq + 1,
            Amount::from_stroops(100),
            vec![Operation::new(OperationBody::Payment {
                destination: alice.account_id(),
                asset: Asset::Native,
                amount: lumens("2"),
            })],
        );
        env.sign_with(&bob);
        ledger.submit(&env).await.unwrap();
        let observed = rx.recv().await.unwrap();
        assert_eq!(observed.id, env.tx_id());
        streamer.abort();
    }
}
