use crate::fsm::input::TimerKind;
use crate::fsm::message::PeerMessage;
use crate::ledger::TxEnvelope;
use std::fmt::{Display, Formatter};
use std::time::SystemTime;

/// Side effects emitted by a transition, in order. The dispatcher records them
/// as tasks (or arms timers) inside the same durable update that persists the
/// new channel state.
#[derive(Debug, Clone)]
pub enum Output {
    /// POST a message to the counterparty's agent.
    Send(PeerMessage),
    /// Submit a signed envelope to the ledger.
    Submit(TxEnvelope),
    /// Arm a timer; firing re-enters the machine with `Input::Timer`.
    SetTimer { kind: TimerKind, at: SystemTime },
    /// Surface a non-fatal problem in the observable update log.
    Warning(String),
}

impl Display for Output {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Output::Send(m) => write!(f, "Send({})", m.body),
            Output::Submit(tx) => write!(f, "Submit({})", tx.tx_id()),
            Output::SetTimer { kind, .. } => write!(f, "SetTimer({kind})"),
            Output::Warning(w) => write!(f, "Warning({w})"),
        }
    }
}
