//! A payment-channel agent for the Stellar testnet.
//!
//! Two peers, a *host* and a *guest*, open a bilateral off-ledger channel
//! backed by on-ledger escrow accounts, exchange signed transactions
//! representing channel-internal payments, and close the channel either
//! cooperatively or by force. The agent tracks one wallet account, manages any
//! number of concurrent channels as replicated state machines, persists every
//! transition durably, and drives peer messages and ledger submissions to
//! completion across crashes and network failures.

pub mod agent;
pub mod amount;
pub mod balance;
pub mod config;
pub mod fsm;
pub mod keys;
pub mod ledger;
pub mod peer;
pub mod store;
pub mod taskbasket;
pub mod update;
pub mod wallet;
