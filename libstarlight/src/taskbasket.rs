//! The task basket: a persistent queue of outbound side effects (ledger
//! submissions, peer messages). Tasks are enrolled inside the durable update
//! that produced them, survive restarts, and are retried with exponential
//! backoff until they report success or a permanent failure.

use crate::fsm::PeerMessage;
use crate::ledger::TxEnvelope;
use crate::store::{Store, StoreError};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Base delay for retry backoff.
pub const BACKOFF_BASE: Duration = Duration::from_millis(100);
/// Upper bound on a single backoff sleep.
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// A reliable side effect. Tagged so the queue survives restarts without any
/// dynamic dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    /// Submit a signed envelope to the ledger on behalf of a channel (or the
    /// wallet, identified by an empty channel ID).
    SendTx { channel_id: String, envelope: TxEnvelope },
    /// POST a peer message to the counterparty's agent.
    SendMsg { remote_url: String, message: PeerMessage },
}

/// A task with its persistent queue position.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: u64,
    pub task: Task,
}

/// Result of one execution attempt.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The side effect is confirmed; remove the task.
    Done,
    /// Transient failure; retry with backoff.
    Retry(String),
    /// Non-retriable failure; remove the task and record a warning.
    Fail(String),
}

/// Executes tasks against the outside world. Implemented by the agent, which
/// owns the HTTP client and the ledger client.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> TaskOutcome;

    /// Called when a task is dropped after a permanent failure, so the agent
    /// can record a `warning` update.
    fn report_failure(&self, task: &Task, reason: &str);
}

/// Exponential backoff starting at `base` and doubling per attempt.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Backoff { base, attempts: 0 }
    }

    pub fn next(&mut self) -> Duration {
        let delay = self.base.saturating_mul(1u32 << self.attempts.min(16));
        self.attempts += 1;
        delay.min(BACKOFF_CAP)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

pub struct TaskBasket {
    store: Arc<Store>,
    /// Signalled by post-commit hooks when new tasks are enrolled.
    notify: Arc<Notify>,
}

impl TaskBasket {
    pub fn new(store: Arc<Store>) -> Self {
        TaskBasket { store, notify: Arc::new(Notify::new()) }
    }

    /// Handle used by post-commit hooks to wake the run loop.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Drives the persisted queue until the process shuts down. Resumes from
    /// whatever the last committed update left behind, giving at-least-once
    /// execution; receivers are responsible for idempotence.
    ///
    /// Each pass walks the whole queue in enrollment order, so one endpoint
    /// being down does not starve tasks aimed elsewhere.
    pub async fn run(&self, executor: Arc<dyn TaskExecutor>) {
        let mut backoff = Backoff::new(BACKOFF_BASE);
        loop {
            let tasks = match self.store.view::<_, StoreError>(|snap| snap.tasks()) {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!("task basket: reading queue: {e}");
                    tokio::time::sleep(backoff.next()).await;
                    continue;
                }
            };
            if tasks.is_empty() {
                // Idle; wait for a new enrollment (or re-check periodically in
                // case a notification was missed).
                let _ = tokio::time::timeout(Duration::from_millis(500), self.notify.notified()).await;
                continue;
            }
            let mut had_retriable = false;
            for record in tasks {
                match executor.execute(&record.task).await {
                    TaskOutcome::Done => {
                        debug!("task {} complete", record.id);
                        if let Err(e) = self.store.update::<_, StoreError>(|root| root.remove_task(record.id)) {
                            warn!("task basket: removing task {}: {e}", record.id);
                        }
                    }
                    TaskOutcome::Retry(reason) => {
                        warn!("task {}: {reason} (will retry)", record.id);
                        had_retriable = true;
                    }
                    TaskOutcome::Fail(reason) => {
                        warn!("task {}: permanent failure: {reason}", record.id);
                        executor.report_failure(&record.task, &reason);
                        if let Err(e) = self.store.update::<_, StoreError>(|root| root.remove_task(record.id)) {
                            warn!("task basket: removing failed task {}: {e}", record.id);
                        }
                    }
                }
            }
            if had_retriable {
                tokio::time::sleep(backoff.next()).await;
            } else {
                backoff.reset();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::amount::Amount;
    use crate::keys::KeySeed;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedExecutor {
        /// Number of retriable failures to serve before succeeding.
        retries_before_success: AtomicUsize,
        executed: AtomicUsize,
        failures: Mutex<Vec<String>>,
        fail_always: bool,
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute(&self, _task: &Task) -> TaskOutcome {
            self.executed.fetch_add(1, Ordering::SeqCst);
            if self.fail_always {
                return TaskOutcome::Fail("no".to_string());
            }
            if self.retries_before_success.load(Ordering::SeqCst) > 0 {
                self.retries_before_success.fetch_sub(1, Ordering::SeqCst);
                return TaskOutcome::Retry("flaky".to_string());
            }
            TaskOutcome::Done
        }

        fn report_failure(&self, _task: &Task, reason: &str) {
            self.failures.lock().unwrap().push(reason.to_string());
        }
    }

    fn send_tx_task() -> Task {
        let account = KeySeed::from_bytes([5u8; 32]).derive_account(0).account_id();
        Task::SendTx { channel_id: account.address(), envelope: TxEnvelope::new(account, 1, Amount::ZERO, vec![]) }
    }

    async fn queue_len(store: &Store) -> usize {
        store.view::<_, StoreError>(|snap| snap.tasks()).unwrap().len()
    }

    #[tokio::test]
    async fn retries_then_removes_on_success() {
        env_logger::try_init().ok();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("agent.db")).unwrap());
        store.update::<_, StoreError>(|root| root.add_task(&send_tx_task())).unwrap();

        let basket = TaskBasket::new(store.clone());
        let executor = Arc::new(ScriptedExecutor {
            retries_before_success: AtomicUsize::new(2),
            executed: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
            fail_always: false,
        });
        let runner = {
            let executor = executor.clone();
            tokio::spawn(async move { basket.run(executor).await })
        };
        tokio::time::sleep(Duration::from_millis(900)).await;
        runner.abort();

        assert!(executor.executed.load(Ordering::SeqCst) >= 3);
        assert_eq!(queue_len(&store).await, 0);
        assert!(executor.failures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_drops_task_and_reports() {
        env_logger::try_init().ok();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("agent.db")).unwrap());
        store.update::<_, StoreError>(|root| root.add_task(&send_tx_task())).unwrap();

        let basket = TaskBasket::new(store.clone());
        let executor = Arc::new(ScriptedExecutor {
            retries_before_success: AtomicUsize::new(0),
            executed: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
            fail_always: true,
        });
        let runner = {
            let executor = executor.clone();
            tokio::spawn(async move { basket.run(executor).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        runner.abort();

        assert_eq!(queue_len(&store).await, 0);
        assert_eq!(executor.failures.lock().unwrap().as_slice(), ["no"]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(200));
        assert_eq!(backoff.next(), Duration::from_millis(400));
        for _ in 0..20 {
            assert!(backoff.next() <= BACKOFF_CAP);
        }
    }
}
