use crate::fsm::FsmError;
use crate::keys::KeyError;
use crate::ledger::LedgerError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("already configured")]
    AlreadyConfigured,
    #[error("not configured")]
    NotConfigured,
    #[error("primary acct not funded")]
    NotFunded,
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("invalid username")]
    InvalidUsername,
    #[error("invalid password: {0}")]
    InvalidPassword(&'static str),
    #[error("can only update password and horizon URL")]
    InvalidEdit,
    #[error("old password doesn't match")]
    PasswordsDontMatch,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("destination address not set")]
    EmptyAddress,
    #[error("amount not set")]
    EmptyAmount,
    #[error("same host and guest acct address")]
    AcctsSame,
    #[error("channel exists")]
    ChannelExists,
    #[error("channel not specified")]
    NoChannelSpecified,
    #[error("channel {0} not found")]
    ChannelNotFound(String),
    #[error("federation lookup failed: {0}")]
    Federation(String),
    #[error(transparent)]
    Fsm(#[from] FsmError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl AgentError {
    /// Whether a peer that caused this error should give up instead of
    /// retrying (mapped to HTTP 205 on the RPC surface).
    pub fn is_non_retriable(&self) -> bool {
        matches!(
            self,
            AgentError::ChannelExists
                | AgentError::ChannelNotFound(_)
                | AgentError::Fsm(FsmError::ChannelClosed)
                | AgentError::Fsm(FsmError::InvalidInput { .. })
                | AgentError::Fsm(FsmError::RoundMismatch { .. })
        )
    }
}
