use crate::fsm::state::ChannelState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsmError {
    /// The transition needs a signature but the seed has not been decrypted.
    /// The surrounding transaction must roll back so the input is redelivered.
    #[error("seed unavailable; authenticate first")]
    SeedUnavailable,
    #[error("channel is closed")]
    ChannelClosed,
    #[error("invalid input {input} in state {state}")]
    InvalidInput { state: ChannelState, input: String },
    #[error("round mismatch: expected {expected}, got {got}")]
    RoundMismatch { expected: u64, got: u64 },
    #[error("insufficient channel balance")]
    InsufficientBalance,
    #[error("insufficient wallet balance")]
    InsufficientWalletBalance,
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),
    #[error("command is only valid for the {0} role")]
    WrongRole(&'static str),
    #[error("missing force-close artifacts for this round")]
    MissingArtifacts,
}

impl FsmError {
    pub fn invalid_input(state: ChannelState, input: impl std::fmt::Display) -> Self {
        FsmError::InvalidInput { state, input: input.to_string() }
    }
}
