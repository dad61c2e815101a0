//! The agent's view of the ledger: a minimal transaction model, a client trait for
//! streaming and submitting transactions, and the two implementations (Horizon, mock).
//!
//! The concrete XDR codec and SDK of the target ledger are out of scope; the agent
//! works against this model and lets the client implementation do the translation.

pub mod horizon;
pub mod mock;

use crate::amount::Amount;
use crate::keys::{AccountId, Keypair, Signature};
use async_trait::async_trait;
use blake2::{Blake2b512, Digest};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::mpsc;

/// Paging token of the transaction stream. Persisted so a restart resumes exactly
/// where the previous run left off.
pub type Cursor = String;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid Horizon URL: {0}")]
    InvalidHorizonUrl(String),
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),
    #[error("ledger request failed: {0}")]
    Request(String),
    #[error("transaction stream closed")]
    StreamClosed,
}

/// Submission failures are classified so the task basket knows whether to retry.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("retriable submission failure: {0}")]
    Retriable(String),
    #[error("permanent submission failure: {0}")]
    Permanent(String),
}

//------------------------------------      Transaction model        ------------------------------------------------//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Asset {
    Native,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationBody {
    CreateAccount {
        destination: AccountId,
        starting_balance: Amount,
    },
    Payment {
        destination: AccountId,
        asset: Asset,
        amount: Amount,
    },
    AccountMerge {
        destination: AccountId,
        /// Balance moved out of the source account. Zero in an unsubmitted envelope;
        /// filled in by the ledger on the observed transaction.
        source_balance: Amount,
    },
    BumpSequence {
        bump_to: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Defaults to the envelope source when absent.
    pub source: Option<AccountId>,
    pub body: OperationBody,
}

impl Operation {
    pub fn new(body: OperationBody) -> Self {
        Operation { source: None, body }
    }

    pub fn with_source(source: AccountId, body: OperationBody) -> Self {
        Operation { source: Some(source), body }
    }
}

/// A transaction envelope: what the agent signs and submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEnvelope {
    pub source: AccountId,
    pub seqnum: u64,
    /// Earliest wall-clock time (unix seconds) the ledger may accept this envelope.
    pub min_time: Option<u64>,
    pub fee: Amount,
    pub operations: Vec<Operation>,
    pub signatures: Vec<Signature>,
}

impl TxEnvelope {
    pub fn new(source: AccountId, seqnum: u64, fee: Amount, operations: Vec<Operation>) -> Self {
        TxEnvelope { source, seqnum, min_time: None, fee, operations, signatures: Vec::new() }
    }

    pub fn with_min_time(mut self, min_time: u64) -> Self {
        self.min_time = Some(min_time);
        self
    }

    /// The byte string that signatures commit to: everything except the signatures.
    pub fn signing_payload(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Unsigned<'a> {
            source: &'a AccountId,
            seqnum: u64,
            min_time: Option<u64>,
            fee: &'a Amount,
            operations: &'a [Operation],
        }
        let unsigned = Unsigned {
            source: &self.source,
            seqnum: self.seqnum,
            min_time: self.min_time,
            fee: &self.fee,
            operations: &self.operations,
        };
        serde_json::to_vec(&unsigned).expect("envelope serialization cannot fail")
    }

    /// Content hash identifying this transaction on the ledger.
    pub fn tx_id(&self) -> String {
        let mut hasher = Blake2b512::new();
        hasher.update(self.signing_payload());
        hex::encode(&hasher.finalize()[..32])
    }

    pub fn sign_with(&mut self, keypair: &Keypair) {
        let signature = keypair.sign(&self.signing_payload());
        self.signatures.push(signature);
    }

    pub fn is_signed_by(&self, account: &AccountId) -> bool {
        let payload = self.signing_payload();
        self.signatures.iter().any(|sig| account.verify(&payload, sig))
    }
}

/// A confirmed transaction as observed on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTx {
    pub id: String,
    pub source: AccountId,
    pub seqnum: u64,
    /// Sequence number of the ledger that included this transaction.
    pub ledger: u32,
    /// Paging token; strictly increasing over the stream.
    pub cursor: Cursor,
    pub operations: Vec<Operation>,
}

impl LedgerTx {
    /// Whether any operation touches `account` as a destination.
    pub fn touches(&self, account: &AccountId) -> bool {
        if self.source == *account {
            return true;
        }
        self.operations.iter().any(|op| {
            op.source.as_ref() == Some(account)
                || match &op.body {
                    OperationBody::CreateAccount { destination, .. } => destination == account,
                    OperationBody::Payment { destination, .. } => destination == account,
                    OperationBody::AccountMerge { destination, .. } => destination == account,
                    OperationBody::BumpSequence { .. } => false,
                }
        })
    }
}

//------------------------------------         Client trait          ------------------------------------------------//

/// The ledger client used by the agent. `stream_txs` runs until the sink is dropped
/// or the stream fails; everything else is a single round trip.
#[async_trait]
pub trait LedgerClient: Send + Sync + 'static {
    /// Rejects any endpoint that is not a testnet endpoint.
    async fn validate_testnet_url(&self, url: &str) -> Result<(), LedgerError>;

    async fn sequence_for_account(&self, account: &AccountId) -> Result<u64, LedgerError>;

    async fn submit(&self, envelope: &TxEnvelope) -> Result<(), SubmitError>;

    /// Delivers every confirmed transaction touching `account` after `cursor`, in order.
    async fn stream_txs(
        &self,
        account: AccountId,
        cursor: Cursor,
        sink: mpsc::Sender<LedgerTx>,
    ) -> Result<(), LedgerError>;

    /// The canonical "now" used for channel deadlines.
    fn now(&self) -> SystemTime;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::keys::KeySeed;
    use rand_core::OsRng;

    #[test]
    fn envelope_signing() {
        let seed = KeySeed::generate(&mut OsRng);
        let pair = seed.derive_account(0);
        let other = seed.derive_account(1);
        let mut env = TxEnvelope::new(
            pair.account_id(),
            7,
            Amount::from_stroops(100),
            vec![Operation::new(OperationBody::Payment {
                destination: other.account_id(),
                asset: Asset::Native,
                amount: Amount::from_lumens("1").unwrap(),
            })],
        );
        assert!(!env.is_signed_by(&pair.account_id()));
        env.sign_with(&pair);
        assert!(env.is_signed_by(&pair.account_id()));
        assert!(!env.is_signed_by(&other.account_id()));
    }

    #[test]
    fn tx_id_commits_to_contents() {
        let seed = KeySeed::from_bytes([1u8; 32]);
        let pair = seed.derive_account(0);
        let env_a = TxEnvelope::new(pair.account_id(), 1, Amount::ZERO, vec![]);
        let env_b = TxEnvelope::new(pair.account_id(), 2, Amount::ZERO, vec![]);
        assert_ne!(env_a.tx_id(), env_b.tx_id());
        assert_eq!(env_a.tx_id(), env_a.clone().tx_id());
    }
}
