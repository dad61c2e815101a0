//! Horizon-backed [`LedgerClient`]. Streams by polling the account transaction
//! endpoint with a cursor and submits envelopes in the agent's JSON model; the
//! XDR translation lives behind the gateway, not in this crate.

use crate::keys::AccountId;
use crate::ledger::{Cursor, LedgerClient, LedgerError, LedgerTx, SubmitError, TxEnvelope};
use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

/// Network passphrase of the test network. The agent refuses to run anywhere else.
pub const TESTNET_PASSPHRASE: &str = "Test SDF Network ; September 2015";

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const PAGE_LIMIT: usize = 100;

pub struct HorizonClient {
    base_url: String,
    http: reqwest::Client,
}

impl HorizonClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        HorizonClient { base_url: base_url.into().trim_end_matches('/').to_string(), http: reqwest::Client::new() }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Deserialize)]
struct RootInfo {
    network_passphrase: String,
}

#[derive(Deserialize)]
struct AccountInfo {
    sequence: u64,
}

#[derive(Deserialize)]
struct TxPage {
    records: Vec<LedgerTx>,
}

#[async_trait]
impl LedgerClient for HorizonClient {
    async fn validate_testnet_url(&self, url: &str) -> Result<(), LedgerError> {
        let url = url.trim_end_matches('/');
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(LedgerError::InvalidHorizonUrl(url.to_string()));
        }
        let info: RootInfo = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| LedgerError::Request(e.to_string()))?
            .json()
            .await
            .map_err(|e| LedgerError::Request(e.to_string()))?;
        if info.network_passphrase != TESTNET_PASSPHRASE {
            return Err(LedgerError::InvalidHorizonUrl(format!("{url} is not a testnet endpoint")));
        }
        Ok(())
    }

    async fn sequence_for_account(&self, account: &AccountId) -> Result<u64, LedgerError> {
        let url = format!("{}/accounts/{}", self.base_url, account.address());
        let resp = self.http.get(&url).send().await.map_err(|e| LedgerError::Request(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LedgerError::AccountNotFound(*account));
        }
        let info: AccountInfo =
            resp.json().await.map_err(|e| LedgerError::Request(format!("decoding account: {e}")))?;
        Ok(info.sequence)
    }

    async fn submit(&self, envelope: &TxEnvelope) -> Result<(), SubmitError> {
        let url = format!("{}/transactions", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| SubmitError::Retriable(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(SubmitError::Permanent(format!("{status}: {body}")))
        } else {
            Err(SubmitError::Retriable(format!("{status}: {body}")))
        }
    }

    async fn stream_txs(
        &self,
        account: AccountId,
        cursor: Cursor,
        sink: mpsc::Sender<LedgerTx>,
    ) -> Result<(), LedgerError> {
        let mut cursor = cursor;
        loop {
            let url = format!(
                "{}/accounts/{}/transactions?cursor={}&limit={}&order=asc",
                self.base_url,
                account.address(),
                cursor,
                PAGE_LIMIT
            );
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let page: TxPage =
                        resp.json().await.map_err(|e| LedgerError::Request(format!("decoding tx page: {e}")))?;
                    for tx in page.records {
                        cursor = tx.cursor.clone();
                        if sink.send(tx).await.is_err() {
                            debug!("transaction stream for {account} dropped by consumer");
                            return Ok(());
                        }
                    }
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    // Account does not exist yet. Keep polling; it will appear once funded.
                }
                Ok(resp) => warn!("transaction stream for {account}: http {}", resp.status()),
                Err(e) => warn!("transaction stream for {account}: {e}"),
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
