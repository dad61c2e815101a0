//! The wallet watcher: one long-running consumer of the primary account's
//! transaction stream, translating observed operations into balance updates.

use crate::agent::{Agent, AgentError};
use crate::ledger::{Asset, LedgerTx, OperationBody};
use crate::store::StoreError;
use crate::taskbasket::{Backoff, BACKOFF_BASE};
use crate::update::Update;
use log::warn;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Consecutive stream failures before a warning update is recorded.
const FAILURES_BEFORE_WARNING: u32 = 5;

pub(crate) fn spawn(agent: Arc<Agent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Backoff::new(BACKOFF_BASE);
        let mut failures = 0u32;
        loop {
            let setup = agent.store().view::<_, StoreError>(|snap| {
                let primary = snap.primary_acct()?;
                let cursor = snap.wallet()?.cursor.clone();
                Ok(primary.map(|acct| (acct, cursor)))
            });
            let (primary, cursor) = match setup {
                Ok(Some(pair)) => pair,
                Ok(None) => return, // not configured; config_init restarts us
                Err(e) => {
                    warn!("wallet watcher: reading state: {e}");
                    tokio::time::sleep(backoff.next()).await;
                    continue;
                }
            };
            let (tx, mut rx) = mpsc::channel(64);
            let streamer = {
                let ledger = agent.ledger().clone();
                tokio::spawn(async move { ledger.stream_txs(primary, cursor, tx).await })
            };
            while let Some(ledger_tx) = rx.recv().await {
                backoff.reset();
                failures = 0;
                if let Err(e) = process_wallet_tx(&agent, &ledger_tx) {
                    warn!("wallet watcher: applying tx {}: {e}", ledger_tx.id);
                }
            }
            streamer.abort();
            // The stream ended; reconnect with backoff rather than aborting the
            // process, recording a warning once it looks persistent.
            failures += 1;
            if failures == FAILURES_BEFORE_WARNING {
                agent.record_warning("wallet transaction stream keeps failing; retrying".to_string());
            }
            tokio::time::sleep(backoff.next()).await;
        }
    })
}

/// Applies one confirmed transaction to the wallet, inside a single update.
fn process_wallet_tx(agent: &Arc<Agent>, tx: &LedgerTx) -> Result<(), AgentError> {
    agent.store().update::<_, AgentError>(|root| {
        let primary = root.primary_acct()?.ok_or(AgentError::NotConfigured)?;
        let mut wallet = root.wallet()?;
        if tx.source == primary {
            // One of our own submissions made it to the ledger.
            wallet.cursor = tx.cursor.clone();
            agent.put_update(root, Update::tx_success(tx.id.clone()));
        }
        for op in &tx.operations {
            match &op.body {
                OperationBody::CreateAccount { destination, starting_balance } if *destination == primary => {
                    wallet.balance = *starting_balance;
                    // Initial sequence number: the creating ledger, shifted left 32 bits.
                    wallet.seqnum = (tx.ledger as u64) << 32;
                    wallet.cursor = tx.cursor.clone();
                    agent.put_update(root, Update::account(primary.address(), wallet.balance));
                }
                OperationBody::Payment { destination, asset, amount } if *destination == primary => {
                    if !matches!(asset, Asset::Native) {
                        continue; // only the native asset is tracked
                    }
                    wallet.balance += *amount;
                    wallet.cursor = tx.cursor.clone();
                    agent.put_update(root, Update::account(primary.address(), wallet.balance));
                }
                OperationBody::AccountMerge { destination, source_balance } if *destination == primary => {
                    wallet.balance += *source_balance;
                    wallet.cursor = tx.cursor.clone();
                    agent.put_update(root, Update::account(primary.address(), wallet.balance));
                }
                _ => {}
            }
        }
        root.put_wallet(&wallet)?;
        Ok(())
    })
}
