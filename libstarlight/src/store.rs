//! The durable store: a single transactional database holding the agent
//! configuration, wallet, channels and task queue.
//!
//! All mutations happen inside [`Store::update`]; either every write commits or
//! none do. Post-commit hooks registered during an update run exactly once,
//! after the data is durable. Readers inside [`Store::view`] observe a
//! consistent snapshot.

use crate::config::AgentConfig;
use crate::fsm::Channel;
use crate::keys::{AccountId, SealedSeed};
use crate::taskbasket::{Task, TaskRecord};
use crate::wallet::WalletAcct;
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const CHANNELS: TableDefinition<&str, &[u8]> = TableDefinition::new("channels");
const TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("tasks");

const KEY_CONFIG: &str = "config";
const KEY_WALLET: &str = "wallet";
const KEY_ENCRYPTED_SEED: &str = "encrypted_seed";
const KEY_NEXT_KEY_INDEX: &str = "next_key_index";
const KEY_PRIMARY_ACCT: &str = "primary_acct";
const KEY_NEXT_TASK_ID: &str = "next_task_id";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

macro_rules! backend_from {
    ($($err:ty),*) => {
        $(impl From<$err> for StoreError {
            fn from(e: $err) -> Self {
                StoreError::Backend(e.to_string())
            }
        })*
    };
}

backend_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

pub struct Store {
    db: Database,
}

impl Store {
    /// Opens (or creates) the database at `path` and ensures all tables exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Store, StoreError> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        {
            txn.open_table(META)?;
            txn.open_table(CHANNELS)?;
            txn.open_table(TASKS)?;
        }
        txn.commit()?;
        Ok(Store { db })
    }

    /// Runs `f` against a consistent read-only snapshot.
    pub fn view<T, E>(&self, f: impl FnOnce(&Snapshot) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let txn = self.db.begin_read().map_err(StoreError::from)?;
        f(&Snapshot { txn })
    }

    /// Runs `f` inside a write transaction. Commits (and then runs any
    /// registered post-commit hooks) only when `f` returns `Ok`.
    pub fn update<T, E>(&self, f: impl FnOnce(&mut Root) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let txn = self.db.begin_write().map_err(StoreError::from)?;
        let mut root = Root { txn, hooks: Vec::new() };
        match f(&mut root) {
            Ok(value) => {
                let Root { txn, hooks } = root;
                txn.commit().map_err(StoreError::from)?;
                for hook in hooks {
                    hook();
                }
                Ok(value)
            }
            Err(e) => {
                let _ = root.txn.abort();
                Err(e)
            }
        }
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

//------------------------------------        Read-only scope        ------------------------------------------------//

pub struct Snapshot {
    txn: ReadTransaction,
}

macro_rules! read_accessors {
    ($ty:ty) => {
        impl $ty {
            fn meta_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
                let table = self.txn.open_table(META)?;
                let entry = table.get(key)?;
                match entry {
                    Some(value) => Ok(Some(decode(value.value())?)),
                    None => Ok(None),
                }
            }

            pub fn config(&self) -> Result<Option<AgentConfig>, StoreError> {
                self.meta_get(KEY_CONFIG)
            }

            pub fn wallet(&self) -> Result<WalletAcct, StoreError> {
                Ok(self.meta_get(KEY_WALLET)?.unwrap_or_default())
            }

            pub fn sealed_seed(&self) -> Result<Option<SealedSeed>, StoreError> {
                self.meta_get(KEY_ENCRYPTED_SEED)
            }

            pub fn next_key_index(&self) -> Result<u32, StoreError> {
                Ok(self.meta_get(KEY_NEXT_KEY_INDEX)?.unwrap_or(1))
            }

            pub fn primary_acct(&self) -> Result<Option<AccountId>, StoreError> {
                self.meta_get(KEY_PRIMARY_ACCT)
            }

            pub fn channel(&self, id: &str) -> Result<Option<Channel>, StoreError> {
                let table = self.txn.open_table(CHANNELS)?;
                let entry = table.get(id)?;
                match entry {
                    Some(value) => Ok(Some(decode(value.value())?)),
                    None => Ok(None),
                }
            }

            pub fn channels(&self) -> Result<Vec<Channel>, StoreError> {
                let table = self.txn.open_table(CHANNELS)?;
                let mut channels = Vec::new();
                for entry in table.iter()? {
                    let (_, value) = entry?;
                    channels.push(decode(value.value())?);
                }
                Ok(channels)
            }

            /// Pending tasks in enrollment order.
            pub fn tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
                let table = self.txn.open_table(TASKS)?;
                let mut tasks = Vec::new();
                for entry in table.iter()? {
                    let (key, value) = entry?;
                    tasks.push(TaskRecord { id: key.value(), task: decode(value.value())? });
                }
                Ok(tasks)
            }
        }
    };
}

read_accessors!(Snapshot);

//------------------------------------        Read-write scope       ------------------------------------------------//

pub struct Root {
    txn: WriteTransaction,
    hooks: Vec<Box<dyn FnOnce() + Send>>,
}

read_accessors!(Root);

impl Root {
    fn meta_put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = encode(value)?;
        let mut table = self.txn.open_table(META)?;
        table.insert(key, bytes.as_slice())?;
        Ok(())
    }

    pub fn put_config(&self, config: &AgentConfig) -> Result<(), StoreError> {
        self.meta_put(KEY_CONFIG, config)
    }

    pub fn put_wallet(&self, wallet: &WalletAcct) -> Result<(), StoreError> {
        self.meta_put(KEY_WALLET, wallet)
    }

    pub fn put_sealed_seed(&self, seed: &SealedSeed) -> Result<(), StoreError> {
        self.meta_put(KEY_ENCRYPTED_SEED, seed)
    }

    pub fn put_next_key_index(&self, index: u32) -> Result<(), StoreError> {
        self.meta_put(KEY_NEXT_KEY_INDEX, &index)
    }

    pub fn put_primary_acct(&self, account: &AccountId) -> Result<(), StoreError> {
        self.meta_put(KEY_PRIMARY_ACCT, account)
    }

    pub fn put_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        let bytes = encode(channel)?;
        let mut table = self.txn.open_table(CHANNELS)?;
        table.insert(channel.id.as_str(), bytes.as_slice())?;
        Ok(())
    }

    /// Enrolls a task; it becomes visible to the basket only on commit.
    pub fn add_task(&self, task: &Task) -> Result<u64, StoreError> {
        let id: u64 = self.meta_get(KEY_NEXT_TASK_ID)?.unwrap_or(1);
        self.meta_put(KEY_NEXT_TASK_ID, &(id + 1))?;
        let bytes = encode(task)?;
        let mut table = self.txn.open_table(TASKS)?;
        table.insert(id, bytes.as_slice())?;
        Ok(id)
    }

    pub fn remove_task(&self, id: u64) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(TASKS)?;
        table.remove(id)?;
        Ok(())
    }

    /// Registers a hook to run exactly once, after the transaction is durable.
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::amount::Amount;
    use crate::fsm::{Channel, ChannelAccounts, Role};
    use crate::keys::KeySeed;
    use crate::ledger::TxEnvelope;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::SystemTime;

    fn test_channel(id_byte: u8) -> Channel {
        let seed = KeySeed::from_bytes([id_byte; 32]);
        let accounts = ChannelAccounts {
            host: seed.derive_account(0).account_id(),
            guest: seed.derive_account(4).account_id(),
            escrow: seed.derive_account(1).account_id(),
            host_ratchet: seed.derive_account(2).account_id(),
            guest_ratchet: seed.derive_account(3).account_id(),
        };
        Channel::new(accounts.escrow.address(), Role::Host, accounts, SystemTime::UNIX_EPOCH)
    }

    #[test]
    fn update_commits_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("agent.db")).unwrap();

        let channel = test_channel(1);
        let id = channel.id.clone();
        store
            .update::<_, StoreError>(|root| {
                root.put_channel(&channel)?;
                let mut wallet = root.wallet()?;
                wallet.balance = Amount::from_lumens("7").unwrap();
                root.put_wallet(&wallet)?;
                Ok(())
            })
            .unwrap();

        store
            .view::<_, StoreError>(|snap| {
                assert!(snap.channel(&id)?.is_some());
                assert_eq!(snap.wallet()?.balance, Amount::from_lumens("7").unwrap());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn failed_update_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("agent.db")).unwrap();

        let channel = test_channel(2);
        let id = channel.id.clone();
        let result = store.update::<(), StoreError>(|root| {
            root.put_channel(&channel)?;
            Err(StoreError::Backend("boom".to_string()))
        });
        assert!(result.is_err());
        store
            .view::<_, StoreError>(|snap| {
                assert!(snap.channel(&id)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn hooks_run_only_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("agent.db")).unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        store
            .update::<_, StoreError>(move |root| {
                root.on_commit(move || f.store(true, Ordering::SeqCst));
                Ok(())
            })
            .unwrap();
        assert!(fired.load(Ordering::SeqCst));

        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let _ = store.update::<(), StoreError>(move |root| {
            root.on_commit(move || f.store(true, Ordering::SeqCst));
            Err(StoreError::Backend("rollback".to_string()))
        });
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn tasks_are_ordered_and_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.db");
        let channel = test_channel(3);
        {
            let store = Store::open(&path).unwrap();
            store
                .update::<_, StoreError>(|root| {
                    root.add_task(&Task::SendTx {
                        channel_id: channel.id.clone(),
                        envelope: TxEnvelope::new(channel.escrow_acct, 1, Amount::ZERO, vec![]),
                    })?;
                    root.add_task(&Task::SendMsg {
                        remote_url: "http://peer.example".to_string(),
                        message: crate::fsm::PeerMessage {
                            channel_id: channel.id.clone(),
                            body: crate::fsm::MessageBody::PaymentComplete(crate::fsm::PaymentCompleteMsg {
                                round_number: 1,
                            }),
                        },
                    })?;
                    Ok(())
                })
                .unwrap();
        }
        // Reopen: the queue is exactly what was committed.
        let store = Store::open(&path).unwrap();
        let tasks = store.view::<_, StoreError>(|snap| snap.tasks()).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].id < tasks[1].id);
        assert!(matches!(tasks[0].task, Task::SendTx { .. }));

        store.update::<_, StoreError>(|root| root.remove_task(tasks[0].id)).unwrap();
        let tasks = store.view::<_, StoreError>(|snap| snap.tasks()).unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(matches!(tasks[0].task, Task::SendMsg { .. }));
    }
}
