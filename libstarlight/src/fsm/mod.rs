//! The per-channel replicated state machine and its surrounding types.

pub mod channel;
pub mod error;
pub mod input;
pub mod message;
pub mod output;
pub mod state;
pub mod transitions;
pub mod tx_build;

pub use channel::{Channel, ChannelAccounts, PaymentProposal, Role, SetupSeen};
pub use error::FsmError;
pub use input::{Command, Input, TimerKind};
pub use message::{
    ChannelAcceptMsg, ChannelProposeMsg, CloseMsg, MessageBody, PaymentAcceptMsg, PaymentCompleteMsg,
    PaymentProposeMsg, PeerMessage,
};
pub use output::Output;
pub use state::ChannelState;
pub use transitions::{step, StepCtx};
