//! The agent's task executor: carries out the two side-effect kinds enrolled
//! by the dispatcher.

use crate::agent::Agent;
use crate::ledger::SubmitError;
use crate::taskbasket::{Task, TaskExecutor, TaskOutcome};
use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use std::sync::Arc;

pub(crate) struct AgentExecutor {
    agent: Arc<Agent>,
}

impl AgentExecutor {
    pub(crate) fn new(agent: Arc<Agent>) -> AgentExecutor {
        AgentExecutor { agent }
    }
}

#[async_trait]
impl TaskExecutor for AgentExecutor {
    async fn execute(&self, task: &Task) -> TaskOutcome {
        match task {
            Task::SendMsg { remote_url, message } => {
                let url = format!("{}/starlight/message", remote_url.trim_end_matches('/'));
                match self.agent.http.post(&url).json(message).send().await {
                    Ok(resp) if resp.status().is_success() => TaskOutcome::Done,
                    // 205 Reset Content marks non-retriable protocol errors.
                    Ok(resp) if resp.status() == StatusCode::RESET_CONTENT => {
                        TaskOutcome::Fail(format!("peer refused {} message", message.body))
                    }
                    Ok(resp) if resp.status() == StatusCode::BAD_REQUEST => {
                        TaskOutcome::Fail(format!("peer rejected {} message as malformed", message.body))
                    }
                    Ok(resp) => TaskOutcome::Retry(format!("peer returned {}", resp.status())),
                    Err(e) => TaskOutcome::Retry(e.to_string()),
                }
            }
            Task::SendTx { channel_id, envelope } => match self.agent.ledger().submit(envelope).await {
                Ok(()) => TaskOutcome::Done,
                Err(SubmitError::Retriable(reason)) => TaskOutcome::Retry(reason),
                Err(SubmitError::Permanent(reason)) => {
                    // A consumed sequence number means the envelope already took
                    // effect (typically a resubmission after a crash).
                    if let Ok(seq) = self.agent.ledger().sequence_for_account(&envelope.source).await {
                        if seq >= envelope.seqnum {
                            debug!("envelope {} already applied (account seq {seq})", envelope.tx_id());
                            return TaskOutcome::Done;
                        }
                    }
                    if !channel_id.is_empty() {
                        self.agent.report_tx_failed(channel_id, envelope.tx_id());
                    }
                    TaskOutcome::Fail(reason)
                }
            },
        }
    }

    fn report_failure(&self, task: &Task, reason: &str) {
        let what = match task {
            Task::SendTx { channel_id, .. } => format!("ledger submission for channel {channel_id}"),
            Task::SendMsg { remote_url, message } => format!("{} message to {remote_url}", message.body),
        };
        self.agent.record_warning(format!("dropping {what}: {reason}"));
    }
}
