//! End-to-end scenarios: two agents in one process, wired together over real
//! HTTP (axum/reqwest) against the in-memory ledger.

use libstarlight::agent::Agent;
use libstarlight::amount::Amount;
use libstarlight::config::ConfigInput;
use libstarlight::fsm::{Channel, ChannelState, Command};
use libstarlight::ledger::mock::MockLedger;
use libstarlight::ledger::LedgerClient;
use libstarlight::peer;
use libstarlight::store::{Store, StoreError};
use libstarlight::update::UpdateType;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

fn lumens(s: &str) -> Amount {
    Amount::from_lumens(s).unwrap()
}

struct Node {
    agent: Arc<Agent>,
    store: Arc<Store>,
    /// `host:port` the node's peer surface listens on.
    addr: String,
    server: JoinHandle<()>,
}

impl Node {
    fn fed_addr(&self, name: &str) -> String {
        format!("{name}*{}", self.addr)
    }

    fn channel(&self, id: &str) -> Option<Channel> {
        self.store.view::<_, StoreError>(|snap| snap.channel(id)).unwrap()
    }

    fn channel_state(&self, id: &str) -> Option<ChannelState> {
        self.channel(id).map(|c| c.state)
    }

    fn wallet_balance(&self) -> Amount {
        self.store.view::<_, StoreError>(|snap| Ok(snap.wallet()?.balance)).unwrap()
    }
}

async fn serve(agent: Arc<Agent>, listener: tokio::net::TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _ = axum::serve(listener, peer::router(agent)).await;
    })
}

/// Starts a configured (but not yet funded) agent with its peer surface bound
/// to an ephemeral port.
async fn spawn_node(name: &str, ledger: &Arc<MockLedger>, dir: &Path, max_round: Option<Duration>) -> Node {
    let store = Arc::new(Store::open(dir.join(format!("{name}.db"))).unwrap());
    let ledger_dyn: Arc<dyn LedgerClient> = ledger.clone();
    let agent = Agent::with_faucet(store.clone(), ledger_dyn, None);
    agent.start().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    let server = serve(agent.clone(), listener).await;
    agent
        .config_init(ConfigInput {
            username: name.to_string(),
            password: "pw".to_string(),
            horizon_url: "https://horizon-testnet.example.org".to_string(),
            max_round_duration: max_round,
            finality_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        })
        .await
        .unwrap();
    Node { agent, store, addr, server }
}

/// Funds the node's primary account through the mock faucet and waits for the
/// wallet watcher to pick it up.
async fn fund_node(node: &Node, ledger: &Arc<MockLedger>, amount: Amount) {
    ledger.fund(node.agent.primary_account().unwrap(), amount);
    wait_for("wallet funding", || {
        node.store.view::<_, StoreError>(|snap| Ok(snap.wallet()?.is_funded())).unwrap()
    })
    .await;
}

async fn wait_for(what: &str, predicate: impl Fn() -> bool) {
    for _ in 0..300 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn cold_open_and_authentication() {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(MockLedger::new());
    let node = spawn_node("alice", &ledger, dir.path(), None).await;

    let mut updates = node.agent.updates();
    fund_node(&node, &ledger, lumens("10000")).await;

    // The watcher reported the created account with the faucet balance.
    let mut saw_account = false;
    while let Ok(update) = updates.try_recv() {
        if update.update_type == UpdateType::Account {
            assert_eq!(update.account.unwrap().balance, lumens("10000"));
            saw_account = true;
        }
    }
    assert!(saw_account);
    assert!(node.store.view::<_, StoreError>(|snap| Ok(snap.wallet()?.seqnum)).unwrap() > 0);

    assert!(node.agent.authenticate("alice", "pw").unwrap());
    assert!(!node.agent.authenticate("alice", "wrong").unwrap());
    assert!(!node.agent.authenticate("mallory", "pw").unwrap());

    // Reconfiguring is an error.
    let again = node
        .agent
        .config_init(ConfigInput {
            username: "alice".to_string(),
            password: "pw".to_string(),
            horizon_url: "https://horizon-testnet.example.org".to_string(),
            ..Default::default()
        })
        .await;
    assert!(again.is_err());
    node.server.abort();
    node.agent.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn full_channel_lifecycle() {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(MockLedger::new());
    let alice = spawn_node("alice", &ledger, dir.path(), None).await;
    let bob = spawn_node("bob", &ledger, dir.path(), None).await;
    fund_node(&alice, &ledger, lumens("10000")).await;
    fund_node(&bob, &ledger, lumens("10000")).await;
    let bob_primary = bob.agent.primary_account().unwrap();

    let channel = alice
        .agent
        .do_create_channel(&bob.fed_addr("bob"), lumens("100"), &alice.addr)
        .await
        .unwrap();
    let id = channel.id.clone();

    wait_for("both channels open", || {
        alice.channel_state(&id) == Some(ChannelState::Open) && bob.channel_state(&id) == Some(ChannelState::Open)
    })
    .await;

    alice.agent.do_command(&id, Command::Pay { amount: lumens("5") }).unwrap();
    wait_for("payment round complete", || {
        let done = |node: &Node| {
            node.channel(&id).is_some_and(|c| {
                c.state == ChannelState::Open
                    && c.round_number == 2
                    && c.host_amount() == lumens("95")
                    && c.guest_amount() == lumens("5")
            })
        };
        done(&alice) && done(&bob)
    })
    .await;

    alice.agent.do_command(&id, Command::Close).unwrap();
    wait_for("both channels closed", || {
        alice.channel_state(&id) == Some(ChannelState::Closed) && bob.channel_state(&id) == Some(ChannelState::Closed)
    })
    .await;

    // The settlement paid the guest its channel balance on-ledger.
    assert_eq!(ledger.balance_of(&bob_primary), Some(lumens("10005")));
    // The host got everything back except the payment and fees.
    wait_for("host wallet refund", || alice.wallet_balance() >= lumens("9990")).await;
    assert!(alice.wallet_balance() < lumens("9996"));

    alice.server.abort();
    bob.server.abort();
    alice.agent.shutdown();
    bob.agent.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn prefund_timeout_cleans_up() {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(MockLedger::new());
    // Short rounds so the funding deadline passes quickly.
    let alice = spawn_node("alice", &ledger, dir.path(), Some(Duration::from_millis(800))).await;
    let bob = spawn_node("bob", &ledger, dir.path(), None).await;
    fund_node(&alice, &ledger, lumens("10000")).await;
    fund_node(&bob, &ledger, lumens("10000")).await;

    // Restart bob's agent without authenticating: it serves federation lookups
    // but cannot sign, so every proposal is answered with a retriable error and
    // the channel never gets accepted.
    bob.server.abort();
    bob.agent.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let bob_addr: SocketAddr = bob.addr.parse().unwrap();
    let listener = rebind(bob_addr).await;
    let ledger_dyn: Arc<dyn LedgerClient> = ledger.clone();
    let sleepy_bob = Agent::with_faucet(bob.store.clone(), ledger_dyn, None);
    sleepy_bob.start().unwrap();
    let server = serve(sleepy_bob.clone(), listener).await;

    let channel = alice
        .agent
        .do_create_channel(&format!("bob*{}", bob.addr), lumens("100"), &alice.addr)
        .await
        .unwrap();
    let id = channel.id.clone();

    wait_for("host cleanup after funding deadline", || {
        alice.channel_state(&id) == Some(ChannelState::Closed)
    })
    .await;
    // The funding amount was returned and the account reserves merged back;
    // only fees are gone.
    wait_for("reserve refund", || alice.wallet_balance() >= lumens("9999")).await;
    assert!(sleepy_bob.store().view::<_, StoreError>(|snap| snap.channel(&id)).unwrap().is_none());

    server.abort();
    alice.server.abort();
    alice.agent.shutdown();
    sleepy_bob.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_preserves_state_and_liveness() {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(MockLedger::new());
    let alice = spawn_node("alice", &ledger, dir.path(), None).await;
    let bob = spawn_node("bob", &ledger, dir.path(), None).await;
    fund_node(&alice, &ledger, lumens("10000")).await;
    fund_node(&bob, &ledger, lumens("10000")).await;

    let channel = alice
        .agent
        .do_create_channel(&bob.fed_addr("bob"), lumens("100"), &alice.addr)
        .await
        .unwrap();
    let id = channel.id.clone();
    wait_for("both channels open", || {
        alice.channel_state(&id) == Some(ChannelState::Open) && bob.channel_state(&id) == Some(ChannelState::Open)
    })
    .await;

    // "Crash" alice: cancel every worker and the server, then bring up a fresh
    // agent instance over the same store, on the same address.
    let alice_addr: SocketAddr = alice.addr.parse().unwrap();
    alice.server.abort();
    alice.agent.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let listener = rebind(alice_addr).await;
    let ledger_dyn: Arc<dyn LedgerClient> = ledger.clone();
    let alice2 = Agent::with_faucet(alice.store.clone(), ledger_dyn, None);
    assert!(alice2.authenticate("alice", "pw").unwrap());
    alice2.start().unwrap();
    let server = serve(alice2.clone(), listener).await;

    // The channel state is exactly what the last committed update left behind.
    assert_eq!(alice.channel_state(&id), Some(ChannelState::Open));

    // And the channel still works end to end.
    alice2.do_command(&id, Command::Pay { amount: lumens("7") }).unwrap();
    wait_for("post-restart payment", || {
        let done = |node: &Node| {
            node.channel(&id).is_some_and(|c| {
                c.state == ChannelState::Open && c.round_number == 2 && c.guest_amount() == lumens("7")
            })
        };
        done(&alice) && done(&bob)
    })
    .await;

    server.abort();
    bob.server.abort();
    alice2.shutdown();
    bob.agent.shutdown();
}

/// Binds `addr`, retrying briefly while the previous listener drains.
async fn rebind(addr: SocketAddr) -> tokio::net::TcpListener {
    for _ in 0..40 {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => return listener,
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    panic!("could not rebind {addr}");
}
