//! The agent core: one dispatcher owning the store, the ledger client, the
//! task basket and the per-channel workers. Every input — user command, peer
//! message, ledger event, timer — funnels through a single durable update that
//! runs the channel state machine, persists the result and enrolls the side
//! effects.

mod error;
mod executor;
mod watcher;

pub use error::AgentError;

use crate::config::{
    validate_username, AgentConfig, ConfigInput, DEFAULT_CHANNEL_FEERATE, DEFAULT_FINALITY_DELAY,
    DEFAULT_HOST_FEERATE, DEFAULT_MAX_ROUND_DURATION, MAX_PASSWORD_LEN,
};
use crate::amount::Amount;
use crate::fsm::{
    self, Channel, ChannelAccounts, ChannelState, Command, Input, MessageBody, Output, PeerMessage, Role, StepCtx,
    TimerKind,
};
use crate::keys::{hash_password, verify_password, AccountId, KeySeed, SealedSeed};
use crate::ledger::horizon::TESTNET_PASSPHRASE;
use crate::ledger::{Asset, Cursor, LedgerClient, Operation, OperationBody, TxEnvelope};
use crate::store::{Root, Store, StoreError};
use crate::taskbasket::{Task, TaskBasket};
use crate::update::{Update, UpdateType};
use crate::wallet::WalletAcct;
use executor::AgentExecutor;
use log::{debug, info, warn};
use rand_core::OsRng;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::SystemTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const DEFAULT_FAUCET_URL: &str = "https://friendbot.stellar.org";

pub struct Agent {
    /// Self-handle for the workers and post-commit hooks the agent spawns.
    weak: Weak<Agent>,
    store: Arc<Store>,
    ledger: Arc<dyn LedgerClient>,
    http: reqwest::Client,
    /// Decrypted entropy seed; write-once per process, absent until
    /// authentication (or `config_init`).
    seed: RwLock<Option<KeySeed>>,
    basket: Arc<TaskBasket>,
    updates_tx: broadcast::Sender<Update>,
    faucet_url: Option<String>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Per-channel worker handles, so closing a channel (or shutting down)
    /// cancels its watchers and timers.
    channel_workers: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl Agent {
    pub fn new(store: Arc<Store>, ledger: Arc<dyn LedgerClient>) -> Arc<Agent> {
        Agent::with_faucet(store, ledger, Some(DEFAULT_FAUCET_URL.to_string()))
    }

    /// Like [`Agent::new`] with an explicit faucet endpoint. `None` disables
    /// the faucet request on `config_init` (tests fund directly).
    pub fn with_faucet(store: Arc<Store>, ledger: Arc<dyn LedgerClient>, faucet_url: Option<String>) -> Arc<Agent> {
        let (updates_tx, _) = broadcast::channel(256);
        let basket = Arc::new(TaskBasket::new(store.clone()));
        Arc::new_cyclic(|weak| Agent {
            weak: weak.clone(),
            store,
            ledger,
            http: reqwest::Client::new(),
            seed: RwLock::new(None),
            basket,
            updates_tx,
            faucet_url,
            workers: Mutex::new(Vec::new()),
            channel_workers: Mutex::new(HashMap::new()),
        })
    }

    fn arc(&self) -> Arc<Agent> {
        self.weak.upgrade().expect("agent dropped while in use")
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerClient> {
        &self.ledger
    }

    /// Subscribe to the observable update log.
    pub fn updates(&self) -> broadcast::Receiver<Update> {
        self.updates_tx.subscribe()
    }

    /// Starts the task basket and, if the agent is configured, the wallet
    /// watcher and every channel's workers. Idempotent per process.
    pub fn start(&self) -> Result<(), AgentError> {
        let basket = self.basket.clone();
        let executor = Arc::new(AgentExecutor::new(self.arc()));
        self.track_worker(tokio::spawn(async move { basket.run(executor).await }));
        if self.configured() {
            self.start_running()?;
        }
        Ok(())
    }

    fn start_running(&self) -> Result<(), AgentError> {
        let channels = self.store.view::<_, AgentError>(|snap| Ok(snap.channels()?))?;
        for channel in &channels {
            if !channel.state.is_closed() {
                self.start_channel(channel);
                self.rearm_timers(channel);
            }
        }
        self.track_worker(watcher::spawn(self.arc()));
        info!("agent running with {} channel(s)", channels.len());
        Ok(())
    }

    /// Cancels every worker. In-flight tasks stay in the basket and resume on
    /// the next start.
    pub fn shutdown(&self) {
        for handle in self.workers.lock().expect("worker registry poisoned").iter() {
            handle.abort();
        }
        let channel_workers = self.channel_workers.lock().expect("worker registry poisoned");
        for handles in channel_workers.values() {
            for handle in handles {
                handle.abort();
            }
        }
    }

    /// Blocks until every worker has exited.
    pub async fn wait(&self) {
        let mut handles = Vec::new();
        handles.append(&mut self.workers.lock().expect("worker registry poisoned"));
        for (_, mut channel_handles) in self.channel_workers.lock().expect("worker registry poisoned").drain() {
            handles.append(&mut channel_handles);
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Cancels the workers of a single channel.
    fn stop_channel(&self, id: &str) {
        if let Some(handles) = self.channel_workers.lock().expect("worker registry poisoned").remove(id) {
            for handle in handles {
                handle.abort();
            }
        }
    }

    fn track_worker(&self, handle: JoinHandle<()>) {
        self.workers.lock().expect("worker registry poisoned").push(handle);
    }

    fn track_channel_worker(&self, id: &str, handle: JoinHandle<()>) {
        self.channel_workers
            .lock()
            .expect("worker registry poisoned")
            .entry(id.to_string())
            .or_default()
            .push(handle);
    }

    //------------------------------------      Configuration       --------------------------------------------------//

    pub fn configured(&self) -> bool {
        self.store.view::<_, StoreError>(|snap| Ok(snap.config()?.is_some())).unwrap_or(false)
    }

    fn is_funded(&self) -> Result<bool, AgentError> {
        Ok(self.store.view::<_, StoreError>(|snap| Ok(snap.wallet()?.is_funded()))?)
    }

    /// Sets the initial configuration, generates and seals the seed, derives
    /// the primary account and requests faucet funding. Errors if already
    /// configured.
    pub async fn config_init(&self, input: ConfigInput) -> Result<(), AgentError> {
        check_password(&input.password)?;
        if !validate_username(&input.username) {
            return Err(AgentError::InvalidUsername);
        }
        self.ledger.validate_testnet_url(&input.horizon_url).await?;

        let seed = KeySeed::generate(&mut OsRng);
        let primary = seed.derive_account(0).account_id();
        let sealed = SealedSeed::seal(&seed, &input.password)?;
        let pw_hash = hash_password(&input.password)?;
        let config = AgentConfig {
            username: input.username.clone(),
            pw_hash,
            horizon_url: input.horizon_url.clone(),
            max_round_duration: input.max_round_duration.unwrap_or(DEFAULT_MAX_ROUND_DURATION),
            finality_delay: input.finality_delay.unwrap_or(DEFAULT_FINALITY_DELAY),
            channel_feerate: input.channel_feerate.unwrap_or(DEFAULT_CHANNEL_FEERATE),
            host_feerate: input.host_feerate.unwrap_or(DEFAULT_HOST_FEERATE),
            keep_alive: input.keep_alive.unwrap_or(true),
        };
        self.store.update::<_, AgentError>(|root| {
            if root.config()?.is_some() {
                return Err(AgentError::AlreadyConfigured);
            }
            root.put_config(&config)?;
            root.put_sealed_seed(&sealed)?;
            root.put_primary_acct(&primary)?;
            root.put_next_key_index(1)?;
            root.put_wallet(&WalletAcct::default())?;
            let mut update = Update::new(UpdateType::Init);
            update.account = Some(crate::update::AccountUpdate { id: primary.address(), balance: Amount::ZERO });
            self.put_update(root, update);
            Ok(())
        })?;
        *self.seed.write().expect("seed lock poisoned") = Some(seed);
        info!("configured; primary account {primary}");

        if let Some(faucet) = self.faucet_url.clone() {
            let agent = self.arc();
            self.track_worker(tokio::spawn(async move { agent.get_testnet_faucet_funds(&faucet, primary).await }));
        }
        self.start_running()
    }

    /// Edits the configuration. Only the password and the Horizon URL may
    /// change; changing the password requires the old one.
    pub async fn config_edit(&self, input: ConfigInput) -> Result<(), AgentError> {
        if !input.username.is_empty()
            || input.max_round_duration.is_some()
            || input.finality_delay.is_some()
            || input.channel_feerate.is_some()
            || input.host_feerate.is_some()
            || input.keep_alive.is_some()
        {
            return Err(AgentError::InvalidEdit);
        }
        if input.password.is_empty() && input.horizon_url.is_empty() {
            return Ok(()); // nothing to do
        }
        if !input.password.is_empty() {
            check_password(&input.password)?;
        }
        if !input.horizon_url.is_empty() {
            self.ledger.validate_testnet_url(&input.horizon_url).await?;
        }
        let resealed = if input.password.is_empty() {
            None
        } else {
            let guard = self.seed.read().expect("seed lock poisoned");
            let seed = guard.as_ref().ok_or(AgentError::NotAuthenticated)?;
            Some((SealedSeed::seal(seed, &input.password)?, hash_password(&input.password)?))
        };
        self.store.update::<_, AgentError>(|root| {
            let mut config = root.config()?.ok_or(AgentError::NotConfigured)?;
            if let Some((sealed, pw_hash)) = resealed {
                if !verify_password(&input.old_password, &config.pw_hash) {
                    return Err(AgentError::PasswordsDontMatch);
                }
                config.pw_hash = pw_hash;
                root.put_sealed_seed(&sealed)?;
                self.put_update(root, Update::new(UpdateType::Config));
            }
            if !input.horizon_url.is_empty() {
                config.horizon_url = input.horizon_url.clone();
                self.put_update(root, Update::new(UpdateType::Config));
            }
            root.put_config(&config)?;
            Ok(())
        })
    }

    /// Validates the credentials and, on first success, decrypts the sealed
    /// seed so signing transitions can proceed.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<bool, AgentError> {
        if !validate_username(username) {
            return Ok(false);
        }
        let (ok, sealed) = self.store.view::<_, AgentError>(|snap| {
            let Some(config) = snap.config()? else {
                return Ok((false, None));
            };
            if username != config.username {
                return Ok((false, None));
            }
            Ok((verify_password(password, &config.pw_hash), snap.sealed_seed()?))
        })?;
        if ok && self.seed.read().expect("seed lock poisoned").is_none() {
            let sealed = sealed.ok_or(AgentError::NotConfigured)?;
            let seed = sealed.open(password)?;
            *self.seed.write().expect("seed lock poisoned") = Some(seed);
            debug!("seed decrypted");
        }
        Ok(ok)
    }

    async fn get_testnet_faucet_funds(&self, faucet_url: &str, primary: AccountId) {
        // The faucet is not fully reliable; try a few times before giving up.
        let mut backoff = crate::taskbasket::Backoff::new(crate::taskbasket::BACKOFF_BASE);
        for _ in 0..5 {
            let url = format!("{faucet_url}/?addr={}", primary.address());
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => {
                    let status = resp.status();
                    let detail = resp.text().await.unwrap_or_default();
                    self.record_warning(format!("faucet: {status} {detail}"));
                }
                Err(e) => warn!("requesting faucet funds for {primary}: {e}"),
            }
            tokio::time::sleep(backoff.next()).await;
        }
        self.record_warning("could not retrieve testnet faucet funds".to_string());
    }

    //------------------------------------     Channel commands     --------------------------------------------------//

    /// Opens a channel to the guest at `guest_fed_addr`, funded with
    /// `host_amount` from the local wallet. `host_url` is the public host name
    /// this agent is reachable at.
    pub async fn do_create_channel(
        &self,
        guest_fed_addr: &str,
        host_amount: Amount,
        host_url: &str,
    ) -> Result<Channel, AgentError> {
        if guest_fed_addr.is_empty() {
            return Err(AgentError::EmptyAddress);
        }
        if host_amount.is_zero() {
            return Err(AgentError::EmptyAmount);
        }
        let primary = self.primary_account()?;
        let (guest_acct, starlight_url) = self.find_account(guest_fed_addr).await?;
        if guest_acct == primary {
            return Err(AgentError::AcctsSame);
        }
        self.check_channel_unique(&primary, &guest_acct)?;
        if !self.is_funded()? {
            return Err(AgentError::NotFunded);
        }

        let channel = self.store.update::<_, AgentError>(|root| {
            let config = root.config()?.ok_or(AgentError::NotConfigured)?;
            let guard = self.seed.read().expect("seed lock poisoned");
            let seed = guard.as_ref().ok_or(AgentError::NotAuthenticated)?;

            // Each channel consumes three derivation indices.
            let key_index = root.next_key_index()?;
            root.put_next_key_index(key_index + 3)?;
            let escrow = seed.derive_account(key_index).account_id();
            let host_ratchet = seed.derive_account(key_index + 1).account_id();
            let guest_ratchet = seed.derive_account(key_index + 2).account_id();
            drop(guard);

            if root.channel(&escrow.address())?.is_some() {
                return Err(AgentError::ChannelExists);
            }
            let now = self.ledger.now();
            let accounts =
                ChannelAccounts { host: primary, guest: guest_acct, escrow, host_ratchet, guest_ratchet };
            let mut channel = Channel::new(escrow.address(), Role::Host, accounts, now);
            channel.key_index = key_index;
            channel.balances = crate::balance::ChannelBalances::new(host_amount, Amount::ZERO);
            channel.counterparty_address = guest_fed_addr.to_string();
            channel.remote_url = starlight_url;
            channel.max_round_duration = config.max_round_duration;
            channel.finality_delay = config.finality_delay;
            channel.channel_feerate = config.channel_feerate;
            channel.host_feerate = config.host_feerate;
            channel.passphrase = TESTNET_PASSPHRASE.to_string();

            let mut wallet = root.wallet()?;
            wallet.address = format!("{}*{host_url}", config.username);
            if !wallet.debit(channel.setup_and_funding_reserve()) {
                return Err(AgentError::InsufficientBalance);
            }
            root.put_wallet(&wallet)?;
            root.put_channel(&channel)?;

            let command = Command::CreateChannel {
                guest_federation_address: guest_fed_addr.to_string(),
                host_amount,
            };
            self.dispatch(root, &channel.id, Input::Command(command), None)?;
            root.channel(&channel.id)?.ok_or_else(|| AgentError::ChannelNotFound(channel.id.clone()))
        })?;
        self.start_channel(&channel);
        Ok(channel)
    }

    /// Executes `command` on the channel `channel_id`.
    pub fn do_command(&self, channel_id: &str, command: Command) -> Result<(), AgentError> {
        if channel_id.is_empty() {
            return Err(AgentError::NoChannelSpecified);
        }
        self.update_channel(channel_id, Input::Command(command))
    }

    /// Pays `amount` from the wallet to an arbitrary account, outside any channel.
    pub fn do_wallet_pay(&self, dest: &AccountId, amount: Amount) -> Result<(), AgentError> {
        if amount.is_zero() {
            return Err(AgentError::EmptyAmount);
        }
        self.store.update::<_, AgentError>(|root| {
            let config = root.config()?.ok_or(AgentError::NotConfigured)?;
            let guard = self.seed.read().expect("seed lock poisoned");
            let seed = guard.as_ref().ok_or(AgentError::NotAuthenticated)?;
            let primary = root.primary_acct()?.ok_or(AgentError::NotConfigured)?;
            let mut wallet = root.wallet()?;
            if !wallet.debit(amount + config.host_feerate) {
                return Err(AgentError::InsufficientBalance);
            }
            let mut envelope = TxEnvelope::new(
                primary,
                wallet.seqnum + 1,
                config.host_feerate,
                vec![Operation::new(OperationBody::Payment {
                    destination: *dest,
                    asset: Asset::Native,
                    amount,
                })],
            );
            wallet.seqnum += 1;
            envelope.sign_with(&seed.derive_account(0));
            root.put_wallet(&wallet)?;
            root.add_task(&Task::SendTx { channel_id: String::new(), envelope })?;
            let mut update = Update::account(primary.address(), wallet.balance);
            update.pending_sequence = Some(wallet.seqnum.to_string());
            self.put_update(root, update);
            self.notify_basket(root);
            Ok(())
        })
    }

    //------------------------------------     Peer message entry    -------------------------------------------------//

    /// Entry point for `POST /starlight/message`. Performs the proposal
    /// pre-checks (uniqueness, federation cross-check, sequence prefetch),
    /// creates the channel record when needed, then dispatches into the
    /// state machine.
    pub async fn receive_peer_message(&self, message: PeerMessage) -> Result<(), AgentError> {
        if message.channel_id.is_empty() {
            return Err(AgentError::NoChannelSpecified);
        }
        if let MessageBody::ChannelPropose(ref propose) = message.body {
            let escrow = AccountId::from_str(&message.channel_id)
                .map_err(|_| AgentError::Fsm(fsm::FsmError::InvalidProposal("invalid channel ID".to_string())))?;
            self.check_channel_unique(&propose.host_acct, &propose.guest_acct)?;

            let (host_account, starlight_url) = self.find_account(&propose.counterparty_address).await?;
            if host_account != propose.host_acct {
                return Err(AgentError::Fsm(fsm::FsmError::InvalidProposal(format!(
                    "host acct {} doesn't match acct {} from federation address {}",
                    propose.host_acct, host_account, propose.counterparty_address
                ))));
            }

            let base_seq = self.ledger.sequence_for_account(&escrow).await?;
            let host_ratchet_seq = self.ledger.sequence_for_account(&propose.host_ratchet_acct).await?;
            let guest_ratchet_seq = self.ledger.sequence_for_account(&propose.guest_ratchet_acct).await?;

            let primary = self.primary_account()?;
            let now = self.ledger.now();
            let id = message.channel_id.clone();
            let created = self.store.update::<_, AgentError>(|root| {
                let created = if root.channel(&id)?.is_none() {
                    let accounts = ChannelAccounts {
                        host: propose.host_acct,
                        guest: primary,
                        escrow,
                        host_ratchet: propose.host_ratchet_acct,
                        guest_ratchet: propose.guest_ratchet_acct,
                    };
                    let mut channel = Channel::new(id.clone(), Role::Guest, accounts, now);
                    channel.base_seq_num = base_seq;
                    channel.host_ratchet_seq_num = host_ratchet_seq;
                    channel.guest_ratchet_seq_num = guest_ratchet_seq;
                    channel.remote_url = starlight_url.clone();
                    channel.passphrase = TESTNET_PASSPHRASE.to_string();
                    root.put_channel(&channel)?;
                    true
                } else {
                    false
                };
                self.dispatch(root, &id, Input::Message(message.clone()), None)?;
                Ok(created)
            })?;
            if created {
                if let Some(channel) = self.store.view::<_, AgentError>(|snap| Ok(snap.channel(&id)?))? {
                    self.start_channel(&channel);
                }
            }
            return Ok(());
        }
        self.update_channel(&message.channel_id.clone(), Input::Message(message))
    }

    //------------------------------------        Dispatching        -------------------------------------------------//

    /// Opens a durable update, runs the state machine and persists the result.
    fn update_channel(&self, id: &str, input: Input) -> Result<(), AgentError> {
        self.store.update::<_, AgentError>(|root| self.dispatch(root, id, input, None))
    }

    /// Like [`Agent::update_channel`], but also advances the stream cursor for
    /// `account` inside the same transaction.
    fn deliver_channel_tx(
        &self,
        id: &str,
        account: AccountId,
        tx: crate::ledger::LedgerTx,
    ) -> Result<(), AgentError> {
        let cursor = tx.cursor.clone();
        self.store.update::<_, AgentError>(|root| self.dispatch(root, id, Input::Tx(tx), Some((account, cursor))))
    }

    /// The single transition path: must be called inside a durable update.
    fn dispatch(
        &self,
        root: &mut Root,
        id: &str,
        input: Input,
        cursor_update: Option<(AccountId, Cursor)>,
    ) -> Result<(), AgentError> {
        let mut channel = root.channel(id)?.ok_or_else(|| AgentError::ChannelNotFound(id.to_string()))?;
        if let Some((account, cursor)) = cursor_update {
            channel.cursors.insert(account.address(), cursor);
        }
        let mut wallet = root.wallet()?;
        let guard = self.seed.read().expect("seed lock poisoned");
        let mut ctx = StepCtx { now: self.ledger.now(), seed: guard.as_ref(), wallet: &mut wallet };
        let outputs = fsm::step(&mut channel, input.clone(), &mut ctx)?;
        drop(guard);
        root.put_channel(&channel)?;
        root.put_wallet(&wallet)?;

        let mut enrolled = false;
        for output in outputs {
            match output {
                Output::Send(message) => {
                    root.add_task(&Task::SendMsg { remote_url: channel.remote_url.clone(), message })?;
                    enrolled = true;
                }
                Output::Submit(envelope) => {
                    root.add_task(&Task::SendTx { channel_id: channel.id.clone(), envelope })?;
                    enrolled = true;
                }
                Output::SetTimer { kind, at } => {
                    let agent = self.arc();
                    let channel_id = channel.id.clone();
                    root.on_commit(move || agent.arm_timer(channel_id, kind, at));
                }
                Output::Warning(message) => {
                    self.put_update(root, Update::warning(message));
                }
            }
        }
        if enrolled {
            self.notify_basket(root);
        }

        let mut update = Update::channel(&channel);
        match input {
            Input::Command(command) => update.input_command = Some(command),
            Input::Message(message) => update.input_message = Some(Box::new(message)),
            Input::Tx(tx) => update.input_tx_id = Some(tx.id),
            Input::Timer(_) | Input::TxFailed { .. } => {}
        }
        self.put_update(root, update);
        if channel.state.is_closed() {
            let agent = self.arc();
            let channel_id = channel.id.clone();
            root.on_commit(move || agent.stop_channel(&channel_id));
        }
        Ok(())
    }

    /// Feeds a permanent submission failure back into the channel.
    pub(crate) fn report_tx_failed(&self, channel_id: &str, tx_id: String) {
        if let Err(e) = self.update_channel(channel_id, Input::TxFailed { tx_id }) {
            warn!("reporting failed tx on channel {channel_id}: {e}");
        }
    }

    fn arm_timer(&self, id: String, kind: TimerKind, at: SystemTime) {
        let agent = self.arc();
        let channel_id = id.clone();
        let handle = tokio::spawn(async move {
            let now = agent.ledger.now();
            if let Ok(delay) = at.duration_since(now) {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = agent.update_channel(&channel_id, Input::Timer(kind)) {
                warn!("timer {kind} on channel {channel_id}: {e}");
            }
        });
        self.track_channel_worker(&id, handle);
    }

    /// Spawns the transaction stream workers for the channel's three accounts.
    fn start_channel(&self, channel: &Channel) {
        for account in [channel.escrow_acct, channel.host_ratchet_acct, channel.guest_ratchet_acct] {
            let agent = self.arc();
            let id = channel.id.clone();
            let handle = tokio::spawn(async move {
                let mut backoff = crate::taskbasket::Backoff::new(crate::taskbasket::BACKOFF_BASE);
                loop {
                    let cursor: Cursor = agent
                        .store
                        .view::<_, StoreError>(|snap| {
                            Ok(snap
                                .channel(&id)?
                                .and_then(|c| c.cursors.get(&account.address()).cloned())
                                .unwrap_or_default())
                        })
                        .unwrap_or_default();
                    let (tx, mut rx) = mpsc::channel(64);
                    let streamer = {
                        let ledger = agent.ledger.clone();
                        tokio::spawn(async move { ledger.stream_txs(account, cursor, tx).await })
                    };
                    while let Some(ledger_tx) = rx.recv().await {
                        if let Err(e) = agent.deliver_channel_tx(&id, account, ledger_tx) {
                            warn!("channel {id}: applying observed tx: {e}");
                        }
                    }
                    streamer.abort();
                    tokio::time::sleep(backoff.next()).await;
                }
            });
            self.track_channel_worker(&channel.id, handle);
        }
    }

    /// Timers are not persisted; every state that depends on one re-arms it
    /// during the start routine.
    fn rearm_timers(&self, channel: &Channel) {
        let timer = match channel.state {
            ChannelState::SettingUp | ChannelState::AwaitingFunding => {
                Some((TimerKind::PreFund, channel.funding_deadline()))
            }
            ChannelState::ChannelProposed => Some((TimerKind::Round1, channel.funding_deadline())),
            ChannelState::PaymentProposed
            | ChannelState::PaymentAccepted
            | ChannelState::AwaitingPaymentMerge
            | ChannelState::AwaitingClose => Some((TimerKind::Round, channel.round_deadline())),
            ChannelState::AwaitingSettlementMintime => {
                Some((TimerKind::SettlementMintime, self.ledger.now() + channel.finality_delay))
            }
            _ => None,
        };
        if let Some((kind, at)) = timer {
            self.arm_timer(channel.id.clone(), kind, at);
        }
    }

    //------------------------------------          Helpers          -------------------------------------------------//

    pub fn primary_account(&self) -> Result<AccountId, AgentError> {
        self.store.view::<_, AgentError>(|snap| snap.primary_acct()?.ok_or(AgentError::NotConfigured))
    }

    /// Rejects a second channel between the same unordered pair of accounts.
    fn check_channel_unique(&self, a: &AccountId, b: &AccountId) -> Result<(), AgentError> {
        self.store.view::<_, AgentError>(|snap| {
            for channel in snap.channels()? {
                let (p, q) = (channel.host_acct, channel.guest_acct);
                if (*a == p && *b == q) || (*a == q && *b == p) {
                    return Err(AgentError::ChannelExists);
                }
            }
            Ok(())
        })
    }

    /// Resolves a federation address `name*domain` to the account ID and the
    /// counterparty's starlight base URL.
    pub async fn find_account(&self, fed_addr: &str) -> Result<(AccountId, String), AgentError> {
        let (_, domain) = fed_addr
            .split_once('*')
            .ok_or_else(|| AgentError::Federation(format!("{fed_addr} is not a federation address")))?;
        let scheme = if domain.starts_with("localhost") || domain.starts_with("127.0.0.1") { "http" } else { "https" };
        let toml_url = format!("{scheme}://{domain}/.well-known/stellar.toml");
        let descriptor = self
            .http
            .get(&toml_url)
            .send()
            .await
            .map_err(|e| AgentError::Federation(e.to_string()))?
            .text()
            .await
            .map_err(|e| AgentError::Federation(e.to_string()))?;
        let federation_server = toml_field(&descriptor, "FEDERATION_SERVER")
            .ok_or_else(|| AgentError::Federation(format!("no FEDERATION_SERVER in {toml_url}")))?;
        let starlight_server = toml_field(&descriptor, "STARLIGHT_SERVER")
            .ok_or_else(|| AgentError::Federation(format!("no STARLIGHT_SERVER in {toml_url}")))?;

        #[derive(Deserialize)]
        struct FedResponse {
            account_id: AccountId,
        }
        let response = self
            .http
            .get(&federation_server)
            .query(&[("type", "name"), ("q", fed_addr)])
            .send()
            .await
            .map_err(|e| AgentError::Federation(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AgentError::Federation(format!("federation server returned {}", response.status())));
        }
        let fed: FedResponse = response.json().await.map_err(|e| AgentError::Federation(e.to_string()))?;
        Ok((fed.account_id, starlight_server.trim_end_matches('/').to_string()))
    }

    pub(crate) fn record_warning(&self, message: String) {
        warn!("{message}");
        let result = self.store.update::<_, StoreError>(|root| {
            self.put_update(root, Update::warning(message.clone()));
            Ok(())
        });
        if let Err(e) = result {
            warn!("recording warning update: {e}");
        }
    }

    /// Publishes an update record after the surrounding transaction commits.
    fn put_update(&self, root: &mut Root, update: Update) {
        let sender = self.updates_tx.clone();
        root.on_commit(move || {
            let _ = sender.send(update);
        });
    }

    /// Wakes the task basket after the surrounding transaction commits.
    fn notify_basket(&self, root: &mut Root) {
        let notify = self.basket.notifier();
        root.on_commit(move || notify.notify_one());
    }
}

fn check_password(password: &str) -> Result<(), AgentError> {
    if password.is_empty() {
        return Err(AgentError::InvalidPassword("empty password"));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(AgentError::InvalidPassword("too long (max 72 chars)"));
    }
    Ok(())
}

/// Extracts `KEY="value"` from a stellar.toml descriptor.
fn toml_field(descriptor: &str, key: &str) -> Option<String> {
    descriptor.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim().trim_matches('"').to_string())
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn toml_field_extraction() {
        let descriptor = "\nFEDERATION_SERVER=\"https://example.com/federation\"\nSTARLIGHT_SERVER=\"https://example.com/\"\n";
        assert_eq!(toml_field(descriptor, "FEDERATION_SERVER"), Some("https://example.com/federation".to_string()));
        assert_eq!(toml_field(descriptor, "STARLIGHT_SERVER"), Some("https://example.com/".to_string()));
        assert_eq!(toml_field(descriptor, "MISSING"), None);
    }

    #[test]
    fn password_rules() {
        assert!(check_password("pw").is_ok());
        assert!(matches!(check_password(""), Err(AgentError::InvalidPassword(_))));
        let long = "x".repeat(73);
        assert!(matches!(check_password(&long), Err(AgentError::InvalidPassword(_))));
        assert!(check_password(&"x".repeat(72)).is_ok());
    }
}
